//! AC equation system: construction from an [`LfNetwork`], activation
//! rules and equation targets.
//!
//! Every equation and term the network could ever need is created once by
//! [`AcEquationSystem::build`]. Control and topology changes afterwards only
//! flip activation flags through [`AcEquationSystem::refresh`], which keeps
//! the Jacobian rebuild decision on the structure version alone.

use super::network::{ControlMode, HvdcMode, LfNetwork};
use super::terms::{BranchSide, ClosedBranchFlowTerm, FlowQuantity, HvdcAcEmulationTerm, ShuntFlowTerm};
use super::{AcEquationType, AcVariableType};
use crate::equations::{
    DifferenceTerm, EquationId, EquationSystem, SignedVariableTerm, StateView, TargetProvider,
    TermId, Variable, VariableTerm,
};
use std::collections::HashSet;
use tracing::debug;

type AcSystem = EquationSystem<AcVariableType, AcEquationType>;

/// Terms contributed by one branch.
#[derive(Debug, Clone, Default)]
pub struct BranchTerms {
    pub p1: Option<TermId>,
    pub q1: Option<TermId>,
    pub p2: Option<TermId>,
    pub q2: Option<TermId>,
    /// Dummy flow terms of a non-impedant branch
    pub dummy: Vec<TermId>,
}

#[derive(Debug)]
pub struct AcEquationSystem {
    system: AcSystem,
    branch_terms: Vec<BranchTerms>,
    hvdc_terms: Vec<[TermId; 2]>,
}

fn bus_eq(bus: usize, kind: AcEquationType) -> EquationId<AcEquationType> {
    EquationId::new(bus, kind)
}

impl AcEquationSystem {
    pub fn build(network: &LfNetwork) -> Self {
        let mut system = AcSystem::new();

        for bus in &network.buses {
            let v = system.create_variable(bus.num, AcVariableType::BusV);
            let phi = system.create_variable(bus.num, AcVariableType::BusPhi);
            system.set_variable_value(v, bus.v);
            system.set_variable_value(phi, bus.angle);
            system.create_equation(bus.num, AcEquationType::BusTargetP);
            system.create_equation(bus.num, AcEquationType::BusTargetQ);
            system.add_term(
                bus_eq(bus.num, AcEquationType::BusTargetV),
                Box::new(VariableTerm::new(v)),
            );
            system.add_term(
                bus_eq(bus.num, AcEquationType::BusTargetPhi),
                Box::new(VariableTerm::new(phi)),
            );
        }

        let mut branch_terms = Vec::with_capacity(network.branches.len());
        for branch in &network.branches {
            let mut terms = BranchTerms::default();
            let (b1, b2) = (branch.bus1, branch.bus2);
            if branch.non_impedant {
                let dummy_p = system.create_variable(branch.num, AcVariableType::DummyP);
                let dummy_q = system.create_variable(branch.num, AcVariableType::DummyQ);
                for (bus, kind, variable, negate) in [
                    (b1, AcEquationType::BusTargetP, dummy_p, false),
                    (b2, AcEquationType::BusTargetP, dummy_p, true),
                    (b1, AcEquationType::BusTargetQ, dummy_q, false),
                    (b2, AcEquationType::BusTargetQ, dummy_q, true),
                ] {
                    let id = system.add_term(
                        bus_eq(bus, kind),
                        Box::new(SignedVariableTerm::new(variable, negate)),
                    );
                    terms.dummy.push(id);
                }
                system.add_term(
                    EquationId::new(branch.num, AcEquationType::ZeroV),
                    Box::new(DifferenceTerm::new(
                        Variable::new(b1, AcVariableType::BusV),
                        Variable::new(b2, AcVariableType::BusV),
                    )),
                );
                system.add_term(
                    EquationId::new(branch.num, AcEquationType::ZeroPhi),
                    Box::new(DifferenceTerm::new(
                        Variable::new(b1, AcVariableType::BusPhi),
                        Variable::new(b2, AcVariableType::BusPhi),
                    )),
                );
            } else {
                let rho = system.create_variable(branch.num, AcVariableType::BranchRho1);
                let alpha = system.create_variable(branch.num, AcVariableType::BranchAlpha1);
                system.set_variable_value(rho, branch.rho);
                system.set_variable_value(alpha, branch.alpha);

                let mut flow = |bus, kind, side, quantity| {
                    Some(system.add_term(
                        bus_eq(bus, kind),
                        Box::new(ClosedBranchFlowTerm::new(branch, side, quantity)),
                    ))
                };
                terms.p1 = flow(b1, AcEquationType::BusTargetP, BranchSide::One, FlowQuantity::Active);
                terms.q1 = flow(b1, AcEquationType::BusTargetQ, BranchSide::One, FlowQuantity::Reactive);
                terms.p2 = flow(b2, AcEquationType::BusTargetP, BranchSide::Two, FlowQuantity::Active);
                terms.q2 = flow(b2, AcEquationType::BusTargetQ, BranchSide::Two, FlowQuantity::Reactive);

                if branch.is_voltage_controller() {
                    system.add_term(
                        EquationId::new(branch.num, AcEquationType::BranchTargetRho1),
                        Box::new(VariableTerm::new(rho)),
                    );
                }
                if branch.is_phase_controlled() {
                    system.add_term(
                        EquationId::new(branch.num, AcEquationType::BranchTargetAlpha1),
                        Box::new(VariableTerm::new(alpha)),
                    );
                }
            }
            branch_terms.push(terms);
        }

        for shunt in &network.shunts {
            let b = system.create_variable(shunt.num, AcVariableType::ShuntB);
            system.set_variable_value(b, shunt.b);
            let controlled = shunt.is_voltage_controller();
            system.add_term(
                bus_eq(shunt.bus, AcEquationType::BusTargetQ),
                Box::new(ShuntFlowTerm::new(
                    shunt.bus,
                    shunt.num,
                    shunt.g,
                    FlowQuantity::Reactive,
                    controlled,
                )),
            );
            if shunt.g != 0.0 {
                system.add_term(
                    bus_eq(shunt.bus, AcEquationType::BusTargetP),
                    Box::new(ShuntFlowTerm::new(
                        shunt.bus,
                        shunt.num,
                        shunt.g,
                        FlowQuantity::Active,
                        false,
                    )),
                );
            }
            if controlled {
                system.add_term(
                    EquationId::new(shunt.num, AcEquationType::ShuntTargetB),
                    Box::new(VariableTerm::new(b)),
                );
            }
        }

        let mut hvdc_terms = Vec::with_capacity(network.hvdcs.len());
        for hvdc in &network.hvdcs {
            let side1 = system.add_term(
                bus_eq(hvdc.bus1, AcEquationType::BusTargetP),
                Box::new(HvdcAcEmulationTerm::new(hvdc.bus1, hvdc.bus2, hvdc.p0, hvdc.k, BranchSide::One)),
            );
            let side2 = system.add_term(
                bus_eq(hvdc.bus2, AcEquationType::BusTargetP),
                Box::new(HvdcAcEmulationTerm::new(hvdc.bus1, hvdc.bus2, hvdc.p0, hvdc.k, BranchSide::Two)),
            );
            hvdc_terms.push([side1, side2]);
        }

        let mut ac = Self {
            system,
            branch_terms,
            hvdc_terms,
        };
        ac.refresh(network);
        ac
    }

    /// Align activation flags with the network's control and topology
    /// state. Returns whether the structure changed.
    pub fn refresh(&mut self, network: &LfNetwork) -> bool {
        let before = self.system.structure_version();
        let continuous = continuously_regulated_buses(network);

        for bus in &network.buses {
            let n = bus.num;
            let enabled = !bus.disabled;
            let pv = bus.slack || bus.is_generator_voltage_controlled();
            let s = &mut self.system;
            s.set_equation_active(bus_eq(n, AcEquationType::BusTargetP), enabled && !bus.slack);
            s.set_equation_active(bus_eq(n, AcEquationType::BusTargetQ), enabled && !pv);
            s.set_equation_active(
                bus_eq(n, AcEquationType::BusTargetV),
                enabled && (pv || continuous.contains(&n)),
            );
            s.set_equation_active(bus_eq(n, AcEquationType::BusTargetPhi), enabled && bus.slack);
        }

        for (branch, terms) in network.branches.iter().zip(&self.branch_terms) {
            let enabled = !branch.disabled;
            for term in [terms.p1, terms.q1, terms.p2, terms.q2].into_iter().flatten() {
                self.system.set_term_active(term, enabled);
            }
            for term in &terms.dummy {
                self.system.set_term_active(*term, enabled);
            }
            if branch.non_impedant {
                let v_fixed = |bus: usize| {
                    self.system
                        .is_equation_active(bus_eq(bus, AcEquationType::BusTargetV))
                };
                let both_fixed = v_fixed(branch.bus1) && v_fixed(branch.bus2);
                self.system.set_equation_active(
                    EquationId::new(branch.num, AcEquationType::ZeroV),
                    enabled && !both_fixed,
                );
                self.system.set_equation_active(
                    EquationId::new(branch.num, AcEquationType::ZeroPhi),
                    enabled,
                );
            }
            if let Some(control) = branch.voltage_control.as_ref().filter(|c| c.enabled) {
                self.system.set_equation_active(
                    EquationId::new(branch.num, AcEquationType::BranchTargetRho1),
                    enabled && control.mode == ControlMode::Discrete,
                );
            }
            if branch.is_phase_controlled() {
                self.system.set_equation_active(
                    EquationId::new(branch.num, AcEquationType::BranchTargetAlpha1),
                    enabled,
                );
            }
        }

        for shunt in &network.shunts {
            if let Some(control) = shunt.voltage_control.as_ref().filter(|c| c.enabled) {
                self.system.set_equation_active(
                    EquationId::new(shunt.num, AcEquationType::ShuntTargetB),
                    !network.buses[shunt.bus].disabled && control.mode == ControlMode::Discrete,
                );
            }
        }

        for (hvdc, terms) in network.hvdcs.iter().zip(&self.hvdc_terms) {
            let active = !hvdc.disabled && hvdc.mode == HvdcMode::Linear;
            for term in terms {
                self.system.set_term_active(*term, active);
            }
        }

        let changed = self.system.structure_version() != before;
        if changed {
            let index = self.system.index();
            debug!(
                variables = index.row_count(),
                equations = index.column_count(),
                "ac equation system structure updated"
            );
        }
        changed
    }

    /// Recompute connectivity after branch status changes, then refresh.
    pub fn update_topology(&mut self, network: &mut LfNetwork) -> bool {
        let disconnected = network.update_connectivity();
        debug!(disconnected, "topology updated");
        self.refresh(network)
    }

    pub fn system(&self) -> &AcSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut AcSystem {
        &mut self.system
    }

    pub fn branch_terms(&self, branch: usize) -> Option<&BranchTerms> {
        self.branch_terms.get(branch)
    }

    /// Active power balance of the slack bus (inactive during solves).
    pub fn slack_equation(&self, network: &LfNetwork) -> EquationId<AcEquationType> {
        bus_eq(network.slack_bus(), AcEquationType::BusTargetP)
    }

    pub fn targets<'a>(&self, network: &'a LfNetwork) -> AcTargets<'a> {
        AcTargets { network }
    }

    pub fn bus_v(&self, bus: usize, view: &StateView<'_, AcVariableType>) -> f64 {
        view.value(Variable::new(bus, AcVariableType::BusV))
    }

    pub fn bus_phi(&self, bus: usize, view: &StateView<'_, AcVariableType>) -> f64 {
        view.value(Variable::new(bus, AcVariableType::BusPhi))
    }

    /// Reactive generation of a bus: flows leaving the bus plus its load.
    pub fn bus_generation_q(
        &self,
        network: &LfNetwork,
        bus: usize,
        view: &StateView<'_, AcVariableType>,
    ) -> f64 {
        self.system
            .evaluate_equation(bus_eq(bus, AcEquationType::BusTargetQ), view)
            + network.buses[bus].load_q
    }

    /// Active power entering side 1 of a closed branch.
    pub fn branch_p1(&self, branch: usize, view: &StateView<'_, AcVariableType>) -> Option<f64> {
        let term = self.branch_terms.get(branch)?.p1?;
        Some(self.system.evaluate_term(term, view))
    }

    /// Current magnitude at side 1 (pu): `√(p1² + q1²) / v1`.
    pub fn branch_i1(
        &self,
        network: &LfNetwork,
        branch: usize,
        view: &StateView<'_, AcVariableType>,
    ) -> Option<f64> {
        let terms = self.branch_terms.get(branch)?;
        let p = self.system.evaluate_term(terms.p1?, view);
        let q = self.system.evaluate_term(terms.q1?, view);
        let v1 = self.bus_v(network.branches[branch].bus1, view);
        Some(p.hypot(q) / v1)
    }

    /// Gradient of `p1` over its variables.
    pub fn branch_p1_gradient(
        &self,
        branch: usize,
        view: &StateView<'_, AcVariableType>,
    ) -> Vec<(Variable<AcVariableType>, f64)> {
        self.branch_terms
            .get(branch)
            .and_then(|t| t.p1)
            .map(|term| self.system.term_gradient(term, view))
            .unwrap_or_default()
    }

    /// Gradient of the side 1 current magnitude over its variables.
    pub fn branch_i1_gradient(
        &self,
        network: &LfNetwork,
        branch: usize,
        view: &StateView<'_, AcVariableType>,
    ) -> Vec<(Variable<AcVariableType>, f64)> {
        let Some(terms) = self.branch_terms.get(branch) else {
            return Vec::new();
        };
        let (Some(p_term), Some(q_term)) = (terms.p1, terms.q1) else {
            return Vec::new();
        };
        let p = self.system.evaluate_term(p_term, view);
        let q = self.system.evaluate_term(q_term, view);
        let s = p.hypot(q);
        let v1_var = Variable::new(network.branches[branch].bus1, AcVariableType::BusV);
        let v1 = view.value(v1_var);
        if s == 0.0 || v1 == 0.0 {
            return Vec::new();
        }
        let dq: Vec<_> = self.system.term_gradient(q_term, view);
        self.system
            .term_gradient(p_term, view)
            .into_iter()
            .zip(dq)
            .map(|((variable, dp), (_, dq))| {
                let mut d = (p * dp + q * dq) / (s * v1);
                if variable == v1_var {
                    d -= s / (v1 * v1);
                }
                (variable, d)
            })
            .collect()
    }

    /// Copy stored voltages back to the enabled buses of the network.
    pub fn write_back(&self, network: &mut LfNetwork) {
        let view = self.system.stored_view();
        for bus in network.buses.iter_mut().filter(|b| !b.disabled) {
            bus.v = view.value(Variable::new(bus.num, AcVariableType::BusV));
            bus.angle = view.value(Variable::new(bus.num, AcVariableType::BusPhi));
        }
    }
}

/// Buses whose voltage a transformer or shunt solves for continuously.
fn continuously_regulated_buses(network: &LfNetwork) -> HashSet<usize> {
    let transformers = network
        .branches
        .iter()
        .filter(|b| !b.disabled)
        .filter_map(|b| b.voltage_control.as_ref())
        .filter(|c| c.enabled && c.mode == ControlMode::Continuous)
        .map(|c| c.regulated_bus);
    let shunts = network
        .shunts
        .iter()
        .filter(|s| !network.buses[s.bus].disabled)
        .filter_map(|s| s.voltage_control.as_ref())
        .filter(|c| c.enabled && c.mode == ControlMode::Continuous)
        .map(|c| c.regulated_bus);
    transformers.chain(shunts).collect()
}

/// Equation targets read from the live network state.
///
/// | Equation          | Target                                          |
/// |-------------------|-------------------------------------------------|
/// | `BusTargetP`      | generation − load ∓ saturated HVDC transfer     |
/// | `BusTargetQ`      | generation (or pinned limit) − load             |
/// | `BusTargetV`      | voltage control target, input voltage for slack |
/// | `BusTargetPhi`    | 0                                               |
/// | `BranchTargetRho1`, `BranchTargetAlpha1`, `ShuntTargetB` | tap/section value |
#[derive(Debug, Clone, Copy)]
pub struct AcTargets<'a> {
    network: &'a LfNetwork,
}

impl<'a> AcTargets<'a> {
    pub fn new(network: &'a LfNetwork) -> Self {
        Self { network }
    }
}

impl TargetProvider<AcEquationType> for AcTargets<'_> {
    fn target(&self, equation: EquationId<AcEquationType>) -> f64 {
        let network = self.network;
        let n = equation.element;
        match equation.kind {
            AcEquationType::BusTargetP => {
                let mut target = network.bus_generation_p(n) - network.buses[n].load_p;
                for hvdc in network.hvdcs.iter().filter(|h| !h.disabled) {
                    if let HvdcMode::Saturated { p, .. } = hvdc.mode {
                        if hvdc.bus1 == n {
                            target -= p;
                        }
                        if hvdc.bus2 == n {
                            target += p;
                        }
                    }
                }
                target
            }
            AcEquationType::BusTargetQ => {
                let bus = &network.buses[n];
                let generation = match bus.pinned_q {
                    Some(q) => q,
                    None => bus
                        .generators
                        .iter()
                        .map(|g| network.generators[*g].target_q)
                        .sum(),
                };
                generation - bus.load_q
            }
            AcEquationType::BusTargetV => {
                let bus = &network.buses[n];
                bus.voltage_control
                    .as_ref()
                    .map(|c| c.target_v)
                    .unwrap_or(bus.initial_v)
            }
            AcEquationType::BusTargetPhi => 0.0,
            AcEquationType::BranchTargetRho1 => {
                let branch = &network.branches[n];
                branch
                    .voltage_control
                    .as_ref()
                    .and_then(|c| c.steps.get(c.position).copied())
                    .unwrap_or(branch.rho)
            }
            AcEquationType::BranchTargetAlpha1 => {
                let branch = &network.branches[n];
                branch
                    .phase_control
                    .as_ref()
                    .map(|c| c.alpha())
                    .unwrap_or(branch.alpha)
            }
            AcEquationType::ShuntTargetB => {
                let shunt = &network.shunts[n];
                shunt.sections.get(shunt.section).copied().unwrap_or(shunt.b)
            }
            AcEquationType::ZeroV | AcEquationType::ZeroPhi => 0.0,
        }
    }
}
