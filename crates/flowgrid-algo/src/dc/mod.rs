//! DC approximation of the load flow.
//!
//! Flat voltages, lossless branches and small angle differences turn each
//! branch flow into `p1 = (φ1 − φ2 + α1) / x`. The DC system is linear, so
//! one Newton step solves it; its angles are the usual warm start of the
//! AC solve through [`DcValueInitializer`].

use crate::ac::{AcVariableType, HvdcMode, LfNetwork};
use crate::equations::{
    EquationId, EquationKind, EquationSystem, EquationTerm, MismatchCategory, StateView,
    TargetProvider, Variable, VariableKind, VariableTerm,
};
use crate::initializer::{StateInitializer, UniformValueInitializer};
use crate::jacobian::JacobianMatrix;
use crate::newton::{
    NewtonRaphson, NewtonRaphsonParameters, NoOpObserver, NonlinearSolver, SolverContext,
    SolverStatus,
};
use flowgrid_core::{FlowError, FlowResult, LinearSystemBackend};
use std::sync::Arc;
use tracing::debug;

/// Reactance used for branches below it, including non-impedant ones.
pub const MIN_REACTANCE: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DcVariableType {
    BusPhi,
}

impl VariableKind for DcVariableType {
    fn is_voltage_angle(self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DcEquationType {
    BusTargetP,
    BusTargetPhi,
}

impl EquationKind for DcEquationType {
    fn mismatch_category(self) -> MismatchCategory {
        match self {
            DcEquationType::BusTargetP => MismatchCategory::ActivePower,
            DcEquationType::BusTargetPhi => MismatchCategory::Angle,
        }
    }
}

/// Linearised active flow at one side of a branch.
#[derive(Debug, Clone)]
pub struct DcBranchFlowTerm {
    sign: f64,
    alpha: f64,
    susceptance: f64,
    variables: [Variable<DcVariableType>; 2],
}

impl DcBranchFlowTerm {
    pub fn new(bus1: usize, bus2: usize, x: f64, alpha: f64, side_one: bool) -> Self {
        let x = if x.abs() < MIN_REACTANCE {
            MIN_REACTANCE.copysign(x)
        } else {
            x
        };
        Self {
            sign: if side_one { 1.0 } else { -1.0 },
            alpha,
            susceptance: 1.0 / x,
            variables: [
                Variable::new(bus1, DcVariableType::BusPhi),
                Variable::new(bus2, DcVariableType::BusPhi),
            ],
        }
    }
}

impl EquationTerm<DcVariableType> for DcBranchFlowTerm {
    fn variables(&self) -> &[Variable<DcVariableType>] {
        &self.variables
    }

    fn eval(&self, state: &StateView<'_, DcVariableType>) -> f64 {
        let dphi = state.value(self.variables[0]) - state.value(self.variables[1]);
        self.sign * self.susceptance * (dphi + self.alpha)
    }

    fn der(&self, variable: Variable<DcVariableType>, _state: &StateView<'_, DcVariableType>) -> f64 {
        if variable == self.variables[0] {
            self.sign * self.susceptance
        } else if variable == self.variables[1] {
            -self.sign * self.susceptance
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "dc_branch_p"
    }
}

pub struct DcEquationSystem {
    system: EquationSystem<DcVariableType, DcEquationType>,
}

impl DcEquationSystem {
    pub fn build(network: &LfNetwork) -> Self {
        let mut system = EquationSystem::new();
        for bus in &network.buses {
            let phi = system.create_variable(bus.num, DcVariableType::BusPhi);
            system.set_variable_value(phi, bus.angle);
            let p = system.create_equation(bus.num, DcEquationType::BusTargetP);
            let reference = EquationId::new(bus.num, DcEquationType::BusTargetPhi);
            system.add_term(reference, Box::new(VariableTerm::new(phi)));
            system.set_equation_active(p, !bus.disabled && !bus.slack);
            system.set_equation_active(reference, !bus.disabled && bus.slack);
        }
        for branch in &network.branches {
            for (bus, side_one) in [(branch.bus1, true), (branch.bus2, false)] {
                let term = system.add_term(
                    EquationId::new(bus, DcEquationType::BusTargetP),
                    Box::new(DcBranchFlowTerm::new(
                        branch.bus1,
                        branch.bus2,
                        branch.x,
                        branch.alpha,
                        side_one,
                    )),
                );
                system.set_term_active(term, !branch.disabled);
            }
        }
        Self { system }
    }

    pub fn system(&self) -> &EquationSystem<DcVariableType, DcEquationType> {
        &self.system
    }
}

/// DC bus balance: generation − load, HVDC links at their scheduled transfer.
pub struct DcTargets<'a> {
    network: &'a LfNetwork,
}

impl TargetProvider<DcEquationType> for DcTargets<'_> {
    fn target(&self, equation: EquationId<DcEquationType>) -> f64 {
        let n = equation.element;
        match equation.kind {
            DcEquationType::BusTargetPhi => 0.0,
            DcEquationType::BusTargetP => {
                let mut target =
                    self.network.bus_generation_p(n) - self.network.buses[n].load_p;
                for hvdc in self.network.hvdcs.iter().filter(|h| !h.disabled) {
                    let transfer = match hvdc.mode {
                        HvdcMode::Linear => hvdc.p0,
                        HvdcMode::Saturated { p, .. } => p,
                    };
                    if hvdc.bus1 == n {
                        target -= transfer;
                    }
                    if hvdc.bus2 == n {
                        target += transfer;
                    }
                }
                target
            }
        }
    }
}

/// Warm start of the AC solve: |V| = 1 pu, angles from a DC load flow.
#[derive(Debug, Clone)]
pub struct DcValueInitializer {
    angles: Vec<f64>,
}

impl DcValueInitializer {
    pub fn new(network: &LfNetwork, backend: Arc<dyn LinearSystemBackend>) -> FlowResult<Self> {
        let dc = DcEquationSystem::build(network);
        let targets = DcTargets { network };
        let mut jacobian = JacobianMatrix::new(backend);
        let mut observer = NoOpObserver;
        let mut solver = NewtonRaphson::new(NewtonRaphsonParameters::default().with_max_iterations(3))?;
        let mut ctx = SolverContext {
            system: dc.system(),
            targets: &targets,
            jacobian: &mut jacobian,
            observer: &mut observer,
            slack_equation: None,
        };
        let outcome = solver.run(&mut ctx, &UniformValueInitializer);
        if outcome.result.status != SolverStatus::Converged {
            return Err(FlowError::Solver(format!(
                "DC load flow used for initialization ended with {}",
                outcome.result.status
            )));
        }

        let view = dc.system().view(&outcome.state);
        let angles = network
            .buses
            .iter()
            .map(|bus| view.value(Variable::new(bus.num, DcVariableType::BusPhi)))
            .collect();
        debug!(buses = network.buses.len(), "dc initial angles computed");
        Ok(Self { angles })
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }
}

impl StateInitializer<AcVariableType> for DcValueInitializer {
    fn initial_value(&self, variable: Variable<AcVariableType>, stored: f64) -> f64 {
        match variable.kind {
            AcVariableType::BusV => 1.0,
            AcVariableType::BusPhi => self.angles.get(variable.element).copied().unwrap_or(0.0),
            _ => stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ac::LfNetworkParameters;
    use flowgrid_core::{
        Branch, BranchId, Bus, BusId, Diagnostics, Gen, GenId, GaussSolver, Load, LoadId, Network,
    };

    fn network() -> LfNetwork {
        let mut network = Network::new();
        for i in 1..=3 {
            network.add_bus(Bus::new(BusId::new(i), &format!("b{i}")));
        }
        for (id, a, b) in [(1, 1, 2), (2, 2, 3), (3, 1, 3)] {
            network
                .add_branch(Branch::new(
                    BranchId::new(id),
                    format!("l{id}"),
                    BusId::new(a),
                    BusId::new(b),
                    0.0,
                    0.1,
                ))
                .unwrap();
        }
        network.add_gen(Gen::new(GenId::new(1), "g".into(), BusId::new(1)).with_voltage_setpoint(1.0));
        network.add_load(Load::new(LoadId::new(1), "l", BusId::new(3), 90.0, 0.0));
        let mut diag = Diagnostics::new();
        LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap()
    }

    #[test]
    fn dc_angles_balance_the_load() {
        let lf = network();
        let init = DcValueInitializer::new(&lf, Arc::new(GaussSolver)).unwrap();
        let angles = init.angles();
        assert_eq!(angles[0], 0.0);
        // 0.9 pu split 2/3 direct, 1/3 through bus 2 on equal reactances
        assert!((angles[2] + 0.06).abs() < 1e-9);
        assert!((angles[1] + 0.03).abs() < 1e-9);
    }

    #[test]
    fn initializer_uses_flat_magnitudes() {
        let lf = network();
        let init = DcValueInitializer::new(&lf, Arc::new(GaussSolver)).unwrap();
        assert_eq!(init.initial_value(Variable::new(2, AcVariableType::BusV), 0.7), 1.0);
        assert!(init.initial_value(Variable::new(2, AcVariableType::BusPhi), 0.0) < 0.0);
        assert_eq!(init.initial_value(Variable::new(0, AcVariableType::BranchRho1), 1.05), 1.05);
    }

    #[test]
    fn zero_reactance_is_clamped() {
        let term = DcBranchFlowTerm::new(0, 1, 0.0, 0.0, true);
        assert!((term.susceptance - 1.0 / MIN_REACTANCE).abs() < 1e-6);
    }
}
