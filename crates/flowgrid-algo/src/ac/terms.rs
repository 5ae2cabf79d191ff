//! AC equation terms.
//!
//! Branch flows follow the pi model with the ratio `ρ1` and phase shift
//! `α1` on side 1. With `y = 1/|z|` and `ξ = atan2(r, x)`:
//!
//! ```text
//! θ1 = ξ − α1 − φ1 + φ2
//! p1 =  g1 ρ1² v1² + y ρ1² v1² sin ξ − y ρ1 v1 v2 sin θ1
//! q1 = −b1 ρ1² v1² + y ρ1² v1² cos ξ − y ρ1 v1 v2 cos θ1
//!
//! θ2 = ξ + α1 + φ1 − φ2
//! p2 =  g2 v2² − y ρ1 v1 v2 sin θ2 + y v2² sin ξ
//! q2 = −b2 v2² − y ρ1 v1 v2 cos θ2 + y v2² cos ξ
//! ```
//!
//! Flows are counted leaving the bus, so a bus balance equation reads
//! `Σ flows = generation − load`.

use super::network::LfBranch;
use super::AcVariableType;
use crate::equations::{EquationTerm, StateView, Variable};
use num_complex::Complex64;

type AcVariable = Variable<AcVariableType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSide {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowQuantity {
    Active,
    Reactive,
}

/// Series and shunt admittance of a branch in the polar form used by the
/// flow formulas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchAdmittance {
    pub y: f64,
    pub ksi: f64,
    pub g1: f64,
    pub b1: f64,
    pub g2: f64,
    pub b2: f64,
}

impl BranchAdmittance {
    pub fn from_branch(branch: &LfBranch) -> Self {
        let z = Complex64::new(branch.r, branch.x);
        Self {
            y: z.inv().norm(),
            ksi: branch.r.atan2(branch.x),
            g1: branch.g1,
            b1: branch.b1,
            g2: branch.g2,
            b2: branch.b2,
        }
    }
}

/// The six quantities a branch flow depends on.
#[derive(Debug, Clone, Copy)]
pub struct BranchVariables {
    pub v1: AcVariable,
    pub v2: AcVariable,
    pub ph1: AcVariable,
    pub ph2: AcVariable,
    pub rho: AcVariable,
    pub alpha: AcVariable,
}

impl BranchVariables {
    pub fn new(branch: &LfBranch) -> Self {
        Self {
            v1: Variable::new(branch.bus1, AcVariableType::BusV),
            v2: Variable::new(branch.bus2, AcVariableType::BusV),
            ph1: Variable::new(branch.bus1, AcVariableType::BusPhi),
            ph2: Variable::new(branch.bus2, AcVariableType::BusPhi),
            rho: Variable::new(branch.num, AcVariableType::BranchRho1),
            alpha: Variable::new(branch.num, AcVariableType::BranchAlpha1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrt {
    V1,
    V2,
    Ph1,
    Ph2,
    Rho,
    Alpha,
}

/// P or Q flow at one side of a closed branch.
///
/// `ρ1` and `α1` are always read through the state view; they are only
/// declared as variables when a control solves for them.
#[derive(Debug, Clone)]
pub struct ClosedBranchFlowTerm {
    side: BranchSide,
    quantity: FlowQuantity,
    admittance: BranchAdmittance,
    vars: BranchVariables,
    variables: Vec<AcVariable>,
}

impl ClosedBranchFlowTerm {
    pub fn new(branch: &LfBranch, side: BranchSide, quantity: FlowQuantity) -> Self {
        let vars = BranchVariables::new(branch);
        let mut variables = vec![vars.v1, vars.v2, vars.ph1, vars.ph2];
        if branch.is_voltage_controller() {
            variables.push(vars.rho);
        }
        if branch.is_phase_controlled() {
            variables.push(vars.alpha);
        }
        Self {
            side,
            quantity,
            admittance: BranchAdmittance::from_branch(branch),
            vars,
            variables,
        }
    }

    fn wrt(&self, variable: AcVariable) -> Option<Wrt> {
        let v = &self.vars;
        if !self.variables.contains(&variable) {
            return None;
        }
        if variable == v.v1 {
            Some(Wrt::V1)
        } else if variable == v.v2 {
            Some(Wrt::V2)
        } else if variable == v.ph1 {
            Some(Wrt::Ph1)
        } else if variable == v.ph2 {
            Some(Wrt::Ph2)
        } else if variable == v.rho {
            Some(Wrt::Rho)
        } else if variable == v.alpha {
            Some(Wrt::Alpha)
        } else {
            None
        }
    }

    /// Flow value (`wrt = None`) or one partial derivative.
    fn compute(&self, state: &StateView<'_, AcVariableType>, wrt: Option<Wrt>) -> f64 {
        let a = &self.admittance;
        let v1 = state.value(self.vars.v1);
        let v2 = state.value(self.vars.v2);
        let ph1 = state.value(self.vars.ph1);
        let ph2 = state.value(self.vars.ph2);
        let r1 = state.value(self.vars.rho);
        let a1 = state.value(self.vars.alpha);
        let y = a.y;
        let (sin_ksi, cos_ksi) = a.ksi.sin_cos();

        match self.side {
            BranchSide::One => {
                let (s, c) = (a.ksi - a1 - ph1 + ph2).sin_cos();
                match self.quantity {
                    FlowQuantity::Active => match wrt {
                        None => {
                            a.g1 * r1 * r1 * v1 * v1 + y * r1 * r1 * v1 * v1 * sin_ksi
                                - y * r1 * v1 * v2 * s
                        }
                        Some(Wrt::V1) => {
                            2.0 * a.g1 * r1 * r1 * v1 + 2.0 * y * r1 * r1 * v1 * sin_ksi
                                - y * r1 * v2 * s
                        }
                        Some(Wrt::V2) => -y * r1 * v1 * s,
                        Some(Wrt::Ph1) | Some(Wrt::Alpha) => y * r1 * v1 * v2 * c,
                        Some(Wrt::Ph2) => -y * r1 * v1 * v2 * c,
                        Some(Wrt::Rho) => {
                            2.0 * a.g1 * r1 * v1 * v1 + 2.0 * y * r1 * v1 * v1 * sin_ksi
                                - y * v1 * v2 * s
                        }
                    },
                    FlowQuantity::Reactive => match wrt {
                        None => {
                            -a.b1 * r1 * r1 * v1 * v1 + y * r1 * r1 * v1 * v1 * cos_ksi
                                - y * r1 * v1 * v2 * c
                        }
                        Some(Wrt::V1) => {
                            -2.0 * a.b1 * r1 * r1 * v1 + 2.0 * y * r1 * r1 * v1 * cos_ksi
                                - y * r1 * v2 * c
                        }
                        Some(Wrt::V2) => -y * r1 * v1 * c,
                        Some(Wrt::Ph1) | Some(Wrt::Alpha) => -y * r1 * v1 * v2 * s,
                        Some(Wrt::Ph2) => y * r1 * v1 * v2 * s,
                        Some(Wrt::Rho) => {
                            -2.0 * a.b1 * r1 * v1 * v1 + 2.0 * y * r1 * v1 * v1 * cos_ksi
                                - y * v1 * v2 * c
                        }
                    },
                }
            }
            BranchSide::Two => {
                let (s, c) = (a.ksi + a1 + ph1 - ph2).sin_cos();
                match self.quantity {
                    FlowQuantity::Active => match wrt {
                        None => a.g2 * v2 * v2 - y * r1 * v1 * v2 * s + y * v2 * v2 * sin_ksi,
                        Some(Wrt::V1) => -y * r1 * v2 * s,
                        Some(Wrt::V2) => {
                            2.0 * a.g2 * v2 - y * r1 * v1 * s + 2.0 * y * v2 * sin_ksi
                        }
                        Some(Wrt::Ph1) | Some(Wrt::Alpha) => -y * r1 * v1 * v2 * c,
                        Some(Wrt::Ph2) => y * r1 * v1 * v2 * c,
                        Some(Wrt::Rho) => -y * v1 * v2 * s,
                    },
                    FlowQuantity::Reactive => match wrt {
                        None => -a.b2 * v2 * v2 - y * r1 * v1 * v2 * c + y * v2 * v2 * cos_ksi,
                        Some(Wrt::V1) => -y * r1 * v2 * c,
                        Some(Wrt::V2) => {
                            -2.0 * a.b2 * v2 - y * r1 * v1 * c + 2.0 * y * v2 * cos_ksi
                        }
                        Some(Wrt::Ph1) | Some(Wrt::Alpha) => y * r1 * v1 * v2 * s,
                        Some(Wrt::Ph2) => -y * r1 * v1 * v2 * s,
                        Some(Wrt::Rho) => -y * v1 * v2 * c,
                    },
                }
            }
        }
    }
}

impl EquationTerm<AcVariableType> for ClosedBranchFlowTerm {
    fn variables(&self) -> &[AcVariable] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, AcVariableType>) -> f64 {
        self.compute(state, None)
    }

    fn der(&self, variable: AcVariable, state: &StateView<'_, AcVariableType>) -> f64 {
        match self.wrt(variable) {
            Some(wrt) => self.compute(state, Some(wrt)),
            None => 0.0,
        }
    }

    fn name(&self) -> &'static str {
        match (self.side, self.quantity) {
            (BranchSide::One, FlowQuantity::Active) => "closed_branch_side1_p",
            (BranchSide::One, FlowQuantity::Reactive) => "closed_branch_side1_q",
            (BranchSide::Two, FlowQuantity::Active) => "closed_branch_side2_p",
            (BranchSide::Two, FlowQuantity::Reactive) => "closed_branch_side2_q",
        }
    }
}

/// Shunt flows: `p = g v²`, `q = −b v²`.
#[derive(Debug, Clone)]
pub struct ShuntFlowTerm {
    quantity: FlowQuantity,
    g: f64,
    v: AcVariable,
    b: AcVariable,
    variables: Vec<AcVariable>,
}

impl ShuntFlowTerm {
    /// `controlled` declares the susceptance as a variable.
    pub fn new(bus: usize, shunt: usize, g: f64, quantity: FlowQuantity, controlled: bool) -> Self {
        let v = Variable::new(bus, AcVariableType::BusV);
        let b = Variable::new(shunt, AcVariableType::ShuntB);
        let mut variables = vec![v];
        if controlled && quantity == FlowQuantity::Reactive {
            variables.push(b);
        }
        Self {
            quantity,
            g,
            v,
            b,
            variables,
        }
    }
}

impl EquationTerm<AcVariableType> for ShuntFlowTerm {
    fn variables(&self) -> &[AcVariable] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, AcVariableType>) -> f64 {
        let v = state.value(self.v);
        match self.quantity {
            FlowQuantity::Active => self.g * v * v,
            FlowQuantity::Reactive => -state.value(self.b) * v * v,
        }
    }

    fn der(&self, variable: AcVariable, state: &StateView<'_, AcVariableType>) -> f64 {
        let v = state.value(self.v);
        match self.quantity {
            FlowQuantity::Active if variable == self.v => 2.0 * self.g * v,
            FlowQuantity::Reactive if variable == self.v => -2.0 * state.value(self.b) * v,
            FlowQuantity::Reactive if self.variables.contains(&variable) => -v * v,
            _ => 0.0,
        }
    }

    fn name(&self) -> &'static str {
        match self.quantity {
            FlowQuantity::Active => "shunt_p",
            FlowQuantity::Reactive => "shunt_q",
        }
    }
}

/// Lossless HVDC in AC emulation: `p1 = P0 + k (φ1 − φ2)`, `p2 = −p1`.
#[derive(Debug, Clone)]
pub struct HvdcAcEmulationTerm {
    sign: f64,
    p0: f64,
    k: f64,
    variables: [AcVariable; 2],
}

impl HvdcAcEmulationTerm {
    pub fn new(bus1: usize, bus2: usize, p0: f64, k: f64, side: BranchSide) -> Self {
        Self {
            sign: match side {
                BranchSide::One => 1.0,
                BranchSide::Two => -1.0,
            },
            p0,
            k,
            variables: [
                Variable::new(bus1, AcVariableType::BusPhi),
                Variable::new(bus2, AcVariableType::BusPhi),
            ],
        }
    }
}

impl EquationTerm<AcVariableType> for HvdcAcEmulationTerm {
    fn variables(&self) -> &[AcVariable] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, AcVariableType>) -> f64 {
        let dphi = state.value(self.variables[0]) - state.value(self.variables[1]);
        self.sign * (self.p0 + self.k * dphi)
    }

    fn der(&self, variable: AcVariable, _state: &StateView<'_, AcVariableType>) -> f64 {
        if variable == self.variables[0] {
            self.sign * self.k
        } else if variable == self.variables[1] {
            -self.sign * self.k
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "hvdc_ac_emulation_p"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ac::network::{ControlMode, PhaseControl, TransformerVoltageControl};
    use flowgrid_core::{BranchId, PhaseRegulationMode};
    use std::collections::{BTreeMap, HashMap};

    fn branch() -> LfBranch {
        LfBranch {
            id: BranchId::new(1),
            name: "t".to_string(),
            num: 0,
            bus1: 0,
            bus2: 1,
            r: 0.02,
            x: 0.15,
            g1: 0.001,
            b1: 0.03,
            g2: 0.002,
            b2: 0.025,
            rho: 1.02,
            alpha: 0.05,
            disabled: false,
            non_impedant: false,
            phase_control: Some(PhaseControl {
                steps: vec![0.0, 0.05],
                position: 1,
                mode: PhaseRegulationMode::ActivePowerControl,
                target: 0.5,
                deadband: 0.01,
            }),
            voltage_control: Some(TransformerVoltageControl {
                regulated_bus: 1,
                target_v: 1.0,
                deadband: 0.01,
                steps: vec![1.0, 1.02],
                position: 1,
                mode: ControlMode::Discrete,
                enabled: true,
            }),
        }
    }

    struct Point {
        rows: HashMap<AcVariable, usize>,
        values: Vec<f64>,
        stored: BTreeMap<AcVariable, f64>,
    }

    impl Point {
        fn new(assignments: &[(AcVariable, f64)]) -> Self {
            Self {
                rows: assignments.iter().enumerate().map(|(i, (v, _))| (*v, i)).collect(),
                values: assignments.iter().map(|(_, x)| *x).collect(),
                stored: BTreeMap::new(),
            }
        }

        fn view(&self) -> StateView<'_, AcVariableType> {
            StateView::new(&self.values, &self.rows, &self.stored)
        }
    }

    fn assert_derivatives(term: &dyn EquationTerm<AcVariableType>, point: &mut Point) {
        let h = 1e-7;
        for variable in term.variables().to_vec() {
            let row = point.rows[&variable];
            let analytic = term.der(variable, &point.view());
            let base = point.values[row];
            point.values[row] = base + h;
            let plus = term.eval(&point.view());
            point.values[row] = base - h;
            let minus = term.eval(&point.view());
            point.values[row] = base;
            let numeric = (plus - minus) / (2.0 * h);
            assert!(
                (analytic - numeric).abs() < 1e-5,
                "{} d/d{:?}: analytic {} numeric {}",
                term.name(),
                variable,
                analytic,
                numeric
            );
        }
    }

    #[test]
    fn branch_derivatives_match_finite_differences() {
        let b = branch();
        let vars = BranchVariables::new(&b);
        let mut point = Point::new(&[
            (vars.v1, 1.03),
            (vars.v2, 0.97),
            (vars.ph1, 0.02),
            (vars.ph2, -0.08),
            (vars.rho, 1.02),
            (vars.alpha, 0.05),
        ]);
        for side in [BranchSide::One, BranchSide::Two] {
            for quantity in [FlowQuantity::Active, FlowQuantity::Reactive] {
                let term = ClosedBranchFlowTerm::new(&b, side, quantity);
                assert_eq!(term.variables().len(), 6);
                assert_derivatives(&term, &mut point);
            }
        }
    }

    #[test]
    fn uncontrolled_branch_reads_ratio_as_constant() {
        let mut b = branch();
        b.phase_control = None;
        b.voltage_control = None;
        let term = ClosedBranchFlowTerm::new(&b, BranchSide::One, FlowQuantity::Active);
        assert_eq!(term.variables().len(), 4);
        let vars = BranchVariables::new(&b);
        assert_eq!(term.der(vars.rho, &Point::new(&[]).view()), 0.0);
    }

    #[test]
    fn lossless_line_matches_textbook_flow() {
        let mut b = branch();
        b.r = 0.0;
        b.x = 0.1;
        b.g1 = 0.0;
        b.b1 = 0.0;
        b.g2 = 0.0;
        b.b2 = 0.0;
        b.phase_control = None;
        b.voltage_control = None;
        let vars = BranchVariables::new(&b);
        let point = Point::new(&[
            (vars.v1, 1.0),
            (vars.v2, 0.95),
            (vars.ph1, 0.0),
            (vars.ph2, -0.1),
            (vars.rho, 1.0),
            (vars.alpha, 0.0),
        ]);
        let p1 = ClosedBranchFlowTerm::new(&b, BranchSide::One, FlowQuantity::Active)
            .eval(&point.view());
        let p2 = ClosedBranchFlowTerm::new(&b, BranchSide::Two, FlowQuantity::Active)
            .eval(&point.view());
        let expected = 10.0 * 0.95 * 0.1f64.sin();
        assert!((p1 - expected).abs() < 1e-12);
        assert!((p1 + p2).abs() < 1e-12);
    }

    #[test]
    fn shunt_and_hvdc_derivatives() {
        let shunt = ShuntFlowTerm::new(0, 0, 0.01, FlowQuantity::Reactive, true);
        let hvdc = HvdcAcEmulationTerm::new(0, 1, 0.3, 2.0, BranchSide::Two);
        let mut point = Point::new(&[
            (Variable::new(0, AcVariableType::BusV), 1.04),
            (Variable::new(0, AcVariableType::ShuntB), 0.2),
            (Variable::new(0, AcVariableType::BusPhi), 0.1),
            (Variable::new(1, AcVariableType::BusPhi), -0.05),
        ]);
        assert_derivatives(&shunt, &mut point);
        assert_derivatives(&hvdc, &mut point);
        assert!((shunt.eval(&point.view()) + 0.2 * 1.04 * 1.04).abs() < 1e-12);
        assert!((hvdc.eval(&point.view()) + (0.3 + 2.0 * 0.15)).abs() < 1e-12);
    }
}
