//! Solver-side network: numbered elements in per-unit with the mutable
//! discrete state the outer loops act on.

use flowgrid_core::{
    find_islands, is_bus_connected, BranchId, BusId, Diagnostics, Edge, FlowError, FlowResult,
    GenId, HvdcId, Network, Node, PhaseRegulationMode, ShuntId,
};
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfNetworkParameters {
    pub base_mva: f64,
    /// Forced reference bus; otherwise the bus of the largest voltage
    /// regulating generator is used
    pub slack_bus: Option<BusId>,
    /// Branches with |z| below this value (pu) are non-impedant
    pub min_impedance: f64,
}

impl Default for LfNetworkParameters {
    fn default() -> Self {
        Self {
            base_mva: 100.0,
            slack_bus: None,
            min_impedance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageControllerKind {
    Generator,
    Transformer,
    Shunt,
}

/// Discrete controls alternate between a continuous solve of their
/// variable and a fixed value on the tap/section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Discrete,
    Continuous,
}

/// The single controller owning the voltage of a bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusVoltageControl {
    pub kind: VoltageControllerKind,
    /// Generator, branch or shunt numbers
    pub controllers: Vec<usize>,
    pub target_v: f64,
}

#[derive(Debug, Clone)]
pub struct LfBus {
    pub id: BusId,
    pub name: String,
    pub num: usize,
    pub base_kv: f64,
    /// Last solved voltage magnitude (pu)
    pub v: f64,
    /// Last solved voltage angle (rad)
    pub angle: f64,
    /// Input voltage, also the slack target when no generator regulates it
    pub initial_v: f64,
    pub slack: bool,
    pub disabled: bool,
    pub load_p: f64,
    pub load_q: f64,
    pub generators: Vec<usize>,
    pub shunts: Vec<usize>,
    pub voltage_control: Option<BusVoltageControl>,
    /// Generator voltage control switched on (PV) or off (PQ)
    pub generator_voltage_control_enabled: bool,
    /// Reactive generation target pinned at a violated limit (pu)
    pub pinned_q: Option<f64>,
}

impl LfBus {
    pub fn has_generator_voltage_control(&self) -> bool {
        matches!(
            self.voltage_control,
            Some(BusVoltageControl {
                kind: VoltageControllerKind::Generator,
                ..
            })
        )
    }

    /// PV bus: voltage held by its generators.
    pub fn is_generator_voltage_controlled(&self) -> bool {
        self.has_generator_voltage_control() && self.generator_voltage_control_enabled
    }
}

#[derive(Debug, Clone)]
pub struct LfGenerator {
    pub id: GenId,
    pub name: String,
    pub num: usize,
    pub bus: usize,
    pub target_p: f64,
    pub initial_target_p: f64,
    pub target_q: f64,
    pub min_p: f64,
    pub max_p: f64,
    pub min_q: f64,
    pub max_q: f64,
    pub participation_factor: f64,
    pub target_v: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PhaseControl {
    /// Phase shift of each tap (rad)
    pub steps: Vec<f64>,
    pub position: usize,
    pub mode: PhaseRegulationMode,
    /// Per-unit active power or current at side 1
    pub target: f64,
    pub deadband: f64,
}

impl PhaseControl {
    pub fn alpha(&self) -> f64 {
        self.steps.get(self.position).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct TransformerVoltageControl {
    pub regulated_bus: usize,
    pub target_v: f64,
    pub deadband: f64,
    pub steps: Vec<f64>,
    pub position: usize,
    pub mode: ControlMode,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LfBranch {
    pub id: BranchId,
    pub name: String,
    pub num: usize,
    pub bus1: usize,
    pub bus2: usize,
    pub r: f64,
    pub x: f64,
    pub g1: f64,
    pub b1: f64,
    pub g2: f64,
    pub b2: f64,
    /// Ratio on side 1
    pub rho: f64,
    /// Phase shift on side 1 (rad)
    pub alpha: f64,
    pub disabled: bool,
    pub non_impedant: bool,
    pub phase_control: Option<PhaseControl>,
    pub voltage_control: Option<TransformerVoltageControl>,
}

impl LfBranch {
    pub fn is_phase_controlled(&self) -> bool {
        self.phase_control
            .as_ref()
            .map(|pc| pc.mode != PhaseRegulationMode::Fixed)
            .unwrap_or(false)
    }

    pub fn is_voltage_controller(&self) -> bool {
        self.voltage_control
            .as_ref()
            .map(|vc| vc.enabled)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ShuntVoltageControl {
    pub regulated_bus: usize,
    pub target_v: f64,
    pub deadband: f64,
    pub mode: ControlMode,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LfShunt {
    pub id: ShuntId,
    pub name: String,
    pub num: usize,
    pub bus: usize,
    pub g: f64,
    pub b: f64,
    /// Total susceptance per number of sections in service
    pub sections: Vec<f64>,
    pub section: usize,
    pub voltage_control: Option<ShuntVoltageControl>,
}

impl LfShunt {
    pub fn is_voltage_controller(&self) -> bool {
        self.voltage_control
            .as_ref()
            .map(|vc| vc.enabled)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HvdcMode {
    /// `P = P0 + k (θ1 − θ2)`
    Linear,
    /// Fixed transfer from side 1 to side 2 (pu), held at the limit of
    /// `direction`
    Saturated { p: f64, direction: HvdcDirection },
}

/// Transfer direction of a saturated HVDC link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvdcDirection {
    OneToTwo,
    TwoToOne,
}

#[derive(Debug, Clone)]
pub struct LfHvdc {
    pub id: HvdcId,
    pub name: String,
    pub num: usize,
    pub bus1: usize,
    pub bus2: usize,
    pub p0: f64,
    /// pu per radian
    pub k: f64,
    pub max_p_1_to_2: f64,
    pub max_p_2_to_1: f64,
    pub mode: HvdcMode,
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct LfZone {
    pub name: String,
    pub pilot_bus: usize,
    pub target_v: f64,
    pub generators: Vec<usize>,
}

/// Numbered, per-unit network the equation systems are built from.
#[derive(Debug, Clone)]
pub struct LfNetwork {
    base_mva: f64,
    slack_bus: usize,
    bus_index: HashMap<BusId, usize>,
    pub buses: Vec<LfBus>,
    pub generators: Vec<LfGenerator>,
    pub branches: Vec<LfBranch>,
    pub shunts: Vec<LfShunt>,
    pub hvdcs: Vec<LfHvdc>,
    pub zones: Vec<LfZone>,
}

impl LfNetwork {
    pub fn build(
        network: &Network,
        params: &LfNetworkParameters,
        diagnostics: &mut Diagnostics,
    ) -> FlowResult<Self> {
        if params.base_mva <= 0.0 {
            return Err(FlowError::Config(format!(
                "base_mva must be positive, got {}",
                params.base_mva
            )));
        }
        let base = params.base_mva;
        network.validate_into(diagnostics);

        let mut buses = Vec::new();
        let mut bus_index = HashMap::new();
        for bus in network.buses() {
            let num = buses.len();
            if bus_index.insert(bus.id, num).is_some() {
                return Err(FlowError::Network(format!("duplicate {}", bus.id)));
            }
            if !is_bus_connected(network, bus.id) && network.buses().len() > 1 {
                diagnostics.add_warning_with_entity("topology", "isolated bus", &bus.name);
            }
            buses.push(LfBus {
                id: bus.id,
                name: bus.name.clone(),
                num,
                base_kv: bus.base_kv.value(),
                v: bus.voltage_pu.value(),
                angle: bus.angle_rad.value(),
                initial_v: bus.voltage_pu.value(),
                slack: false,
                disabled: false,
                load_p: 0.0,
                load_q: 0.0,
                generators: Vec::new(),
                shunts: Vec::new(),
                voltage_control: None,
                generator_voltage_control_enabled: true,
                pinned_q: None,
            });
        }
        if buses.is_empty() {
            return Err(FlowError::Network("network has no buses".to_string()));
        }

        let lookup = |bus: BusId, owner: &str| -> FlowResult<usize> {
            bus_index.get(&bus).copied().ok_or_else(|| {
                FlowError::Network(format!("'{}' references unknown {}", owner, bus))
            })
        };

        let mut generators = Vec::new();
        let mut shunts = Vec::new();
        for node in network.graph.node_weights() {
            match node {
                Node::Load(load) => {
                    let bus = lookup(load.bus, &load.name)?;
                    buses[bus].load_p += load.active_power.to_per_unit(base);
                    buses[bus].load_q += load.reactive_power.to_per_unit(base);
                }
                Node::Gen(gen) if gen.status => {
                    let bus = lookup(gen.bus, &gen.name)?;
                    let num = generators.len();
                    let target_p = gen.active_power.to_per_unit(base);
                    buses[bus].generators.push(num);
                    generators.push(LfGenerator {
                        id: gen.id,
                        name: gen.name.clone(),
                        num,
                        bus,
                        target_p,
                        initial_target_p: target_p,
                        target_q: gen.reactive_power.to_per_unit(base),
                        min_p: gen.pmin.to_per_unit(base),
                        max_p: gen.pmax.to_per_unit(base),
                        min_q: gen.qmin.to_per_unit(base),
                        max_q: gen.qmax.to_per_unit(base),
                        participation_factor: gen.participation_factor.unwrap_or(0.0),
                        target_v: gen.voltage_setpoint.map(|v| v.value()),
                    });
                }
                Node::Shunt(shunt) if shunt.status => {
                    let bus = lookup(shunt.bus, &shunt.name)?;
                    if !shunt.section_susceptances.is_empty() {
                        check_tap_position(
                            &shunt.name,
                            "section count",
                            shunt.section_count,
                            shunt.section_susceptances.len(),
                        )?;
                    }
                    let num = shunts.len();
                    let voltage_control = match &shunt.voltage_regulation {
                        Some(reg) if !shunt.section_susceptances.is_empty() => {
                            Some(ShuntVoltageControl {
                                regulated_bus: lookup(reg.regulated_bus, &shunt.name)?,
                                target_v: reg.target_v.value(),
                                deadband: reg.deadband.value(),
                                mode: ControlMode::Discrete,
                                enabled: true,
                            })
                        }
                        _ => None,
                    };
                    buses[bus].shunts.push(num);
                    shunts.push(LfShunt {
                        id: shunt.id,
                        name: shunt.name.clone(),
                        num,
                        bus,
                        g: shunt.gs_pu,
                        b: shunt.susceptance(),
                        sections: shunt.section_susceptances.clone(),
                        section: shunt.section_count,
                        voltage_control,
                    });
                }
                _ => {}
            }
        }

        let mut branches = Vec::new();
        let mut hvdcs = Vec::new();
        for edge in network.graph.edge_weights() {
            match edge {
                Edge::Branch(branch) => {
                    let bus1 = lookup(branch.from_bus, &branch.name)?;
                    let bus2 = lookup(branch.to_bus, &branch.name)?;
                    if let Some(ptc) = &branch.phase_tap_changer {
                        check_tap_position(&branch.name, "phase tap", ptc.position, ptc.steps.len())?;
                    }
                    if let Some(rtc) = &branch.ratio_tap_changer {
                        check_tap_position(&branch.name, "ratio tap", rtc.position, rtc.steps.len())?;
                    }
                    let phase_control = branch.phase_tap_changer.as_ref().map(|ptc| PhaseControl {
                        steps: ptc.steps.iter().map(|d| d.to_radians().value()).collect(),
                        position: ptc.position,
                        mode: ptc.mode,
                        target: match ptc.mode {
                            PhaseRegulationMode::ActivePowerControl => ptc.target / base,
                            _ => ptc.target,
                        },
                        deadband: match ptc.mode {
                            PhaseRegulationMode::ActivePowerControl => ptc.deadband / base,
                            _ => ptc.deadband,
                        },
                    });
                    let voltage_control = match &branch.ratio_tap_changer {
                        Some(rtc) => match &rtc.regulation {
                            Some(reg) => Some(TransformerVoltageControl {
                                regulated_bus: lookup(reg.regulated_bus, &branch.name)?,
                                target_v: reg.target_v.value(),
                                deadband: reg.deadband.value(),
                                steps: rtc.steps.clone(),
                                position: rtc.position,
                                mode: ControlMode::Discrete,
                                enabled: true,
                            }),
                            None => None,
                        },
                        None => None,
                    };
                    let has_controls = phase_control.is_some() || voltage_control.is_some();
                    let half_b = branch.charging_b.value() / 2.0;
                    branches.push(LfBranch {
                        id: branch.id,
                        name: branch.name.clone(),
                        num: branches.len(),
                        bus1,
                        bus2,
                        r: branch.resistance,
                        x: branch.reactance,
                        g1: 0.0,
                        b1: half_b,
                        g2: 0.0,
                        b2: half_b,
                        rho: branch.effective_ratio(),
                        alpha: branch.effective_phase_shift().value(),
                        disabled: !branch.status,
                        non_impedant: !has_controls
                            && branch.resistance.hypot(branch.reactance) < params.min_impedance,
                        phase_control,
                        voltage_control,
                    });
                }
                Edge::Hvdc(link) if link.status => {
                    let k_pu_per_rad = link.droop_mw_per_deg * 180.0 / std::f64::consts::PI / base;
                    hvdcs.push(LfHvdc {
                        id: link.id,
                        name: link.name.clone(),
                        num: hvdcs.len(),
                        bus1: lookup(link.bus1, &link.name)?,
                        bus2: lookup(link.bus2, &link.name)?,
                        p0: link.p0.to_per_unit(base),
                        k: k_pu_per_rad,
                        max_p_1_to_2: link.max_p_1_to_2.to_per_unit(base),
                        max_p_2_to_1: link.max_p_2_to_1.to_per_unit(base),
                        mode: HvdcMode::Linear,
                        disabled: false,
                    });
                }
                Edge::Hvdc(_) => {}
            }
        }

        let mut zones = Vec::new();
        for zone in &network.voltage_zones {
            let pilot_bus = lookup(zone.pilot_bus, &zone.name)?;
            let members = zone
                .generators
                .iter()
                .filter_map(|id| generators.iter().find(|g| g.id == *id).map(|g| g.num))
                .collect();
            zones.push(LfZone {
                name: zone.name.clone(),
                pilot_bus,
                target_v: zone.target_v.value(),
                generators: members,
            });
        }

        check_non_impedant_loops(&buses, &branches)?;

        let mut lf = LfNetwork {
            base_mva: base,
            slack_bus: 0,
            bus_index,
            buses,
            generators,
            branches,
            shunts,
            hvdcs,
            zones,
        };
        lf.resolve_voltage_controls(diagnostics);
        lf.slack_bus = lf.select_slack(params.slack_bus)?;
        lf.buses[lf.slack_bus].slack = true;
        let disconnected = lf.update_connectivity();

        if let Ok(islands) = find_islands(network) {
            info!(
                buses = lf.buses.len(),
                branches = lf.branches.len(),
                generators = lf.generators.len(),
                islands = islands.islands.len(),
                disconnected,
                slack = %lf.buses[lf.slack_bus].id,
                "load flow network built"
            );
        }
        Ok(lf)
    }

    /// One voltage controller per bus: generators first, then the first
    /// transformer or shunt in input order.
    fn resolve_voltage_controls(&mut self, diagnostics: &mut Diagnostics) {
        for g in 0..self.generators.len() {
            let Some(target) = self.generators[g].target_v else {
                continue;
            };
            let bus = &mut self.buses[self.generators[g].bus];
            match &mut bus.voltage_control {
                None => {
                    bus.voltage_control = Some(BusVoltageControl {
                        kind: VoltageControllerKind::Generator,
                        controllers: vec![g],
                        target_v: target,
                    });
                }
                Some(control) => {
                    if (control.target_v - target).abs() > 1e-9 {
                        let message = format!(
                            "generator '{}' target {:.4} pu differs from {:.4} pu already set; keeping the first",
                            self.generators[g].name, target, control.target_v
                        );
                        warn!(bus = %bus.id, "{}", message);
                        diagnostics.add_warning_with_entity("voltage-control", &message, &bus.name);
                        self.generators[g].target_v = Some(control.target_v);
                    }
                    control.controllers.push(g);
                }
            }
        }

        for b in 0..self.branches.len() {
            let Some(regulated) = self.branches[b]
                .voltage_control
                .as_ref()
                .map(|vc| (vc.regulated_bus, vc.target_v))
            else {
                continue;
            };
            let name = self.branches[b].name.clone();
            if let Some(reason) = self.claim_voltage_control(
                regulated.0,
                VoltageControllerKind::Transformer,
                b,
                regulated.1,
            ) {
                if let Some(vc) = self.branches[b].voltage_control.as_mut() {
                    vc.enabled = false;
                }
                let message = format!("transformer '{}' voltage control disabled: {}", name, reason);
                warn!("{}", message);
                diagnostics.add_warning_with_entity("voltage-control", &message, &name);
            }
        }

        for s in 0..self.shunts.len() {
            let Some(regulated) = self.shunts[s]
                .voltage_control
                .as_ref()
                .map(|vc| (vc.regulated_bus, vc.target_v))
            else {
                continue;
            };
            let name = self.shunts[s].name.clone();
            if let Some(reason) =
                self.claim_voltage_control(regulated.0, VoltageControllerKind::Shunt, s, regulated.1)
            {
                if let Some(vc) = self.shunts[s].voltage_control.as_mut() {
                    vc.enabled = false;
                }
                let message = format!("shunt '{}' voltage control disabled: {}", name, reason);
                warn!("{}", message);
                diagnostics.add_warning_with_entity("voltage-control", &message, &name);
            }
        }
    }

    /// Returns why the claim is refused, if it is.
    fn claim_voltage_control(
        &mut self,
        bus: usize,
        kind: VoltageControllerKind,
        controller: usize,
        target_v: f64,
    ) -> Option<String> {
        let bus = &mut self.buses[bus];
        if let Some(existing) = &bus.voltage_control {
            let owner = if existing.kind == VoltageControllerKind::Generator {
                "a generator"
            } else {
                "another controller"
            };
            return Some(format!("bus '{}' is already regulated by {}", bus.name, owner));
        }
        bus.voltage_control = Some(BusVoltageControl {
            kind,
            controllers: vec![controller],
            target_v,
        });
        None
    }

    fn select_slack(&self, forced: Option<BusId>) -> FlowResult<usize> {
        if let Some(id) = forced {
            return self
                .bus_index
                .get(&id)
                .copied()
                .ok_or_else(|| FlowError::Network(format!("slack {} not found", id)));
        }
        self.generators
            .iter()
            .filter(|g| g.target_v.is_some())
            .max_by(|a, b| a.max_p.total_cmp(&b.max_p).then(b.bus.cmp(&a.bus)))
            .map(|g| g.bus)
            .ok_or_else(|| {
                FlowError::Network(
                    "no slack bus candidate: no generator regulates voltage".to_string(),
                )
            })
    }

    pub fn base_mva(&self) -> f64 {
        self.base_mva
    }

    pub fn slack_bus(&self) -> usize {
        self.slack_bus
    }

    pub fn bus_num(&self, id: BusId) -> Option<usize> {
        self.bus_index.get(&id).copied()
    }

    pub fn branch_num(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    /// Generator active power target of a bus (pu).
    pub fn bus_generation_p(&self, bus: usize) -> f64 {
        self.buses[bus]
            .generators
            .iter()
            .map(|g| self.generators[*g].target_p)
            .sum()
    }

    pub fn set_branch_disabled(&mut self, branch: usize, disabled: bool) -> FlowResult<()> {
        let b = self
            .branches
            .get_mut(branch)
            .ok_or_else(|| FlowError::Network(format!("unknown branch number {}", branch)))?;
        b.disabled = disabled;
        Ok(())
    }

    /// Disable buses (and HVDC links touching them) that cannot reach the
    /// slack bus through enabled branches. Returns the disabled bus count.
    pub fn update_connectivity(&mut self) -> usize {
        let n = self.buses.len();
        let mut adjacency = vec![Vec::new(); n];
        for branch in self.branches.iter().filter(|b| !b.disabled) {
            adjacency[branch.bus1].push(branch.bus2);
            adjacency[branch.bus2].push(branch.bus1);
        }
        let mut reached = vec![false; n];
        let mut queue = VecDeque::from([self.slack_bus]);
        reached[self.slack_bus] = true;
        while let Some(bus) = queue.pop_front() {
            for &next in &adjacency[bus] {
                if !reached[next] {
                    reached[next] = true;
                    queue.push_back(next);
                }
            }
        }
        for (bus, reachable) in self.buses.iter_mut().zip(&reached) {
            bus.disabled = !reachable;
        }
        for hvdc in &mut self.hvdcs {
            hvdc.disabled = !reached[hvdc.bus1] || !reached[hvdc.bus2];
        }
        reached.iter().filter(|r| !**r).count()
    }
}

/// Non-impedant branches must form a forest: a loop leaves the dummy flows
/// undetermined.
fn check_tap_position(owner: &str, what: &str, position: usize, len: usize) -> FlowResult<()> {
    if position < len {
        return Ok(());
    }
    Err(FlowError::Network(format!(
        "'{}' {} {} is outside its table of {} entries",
        owner, what, position, len
    )))
}

fn check_non_impedant_loops(buses: &[LfBus], branches: &[LfBranch]) -> FlowResult<()> {
    let mut sets = UnionFind::<usize>::new(buses.len());
    for branch in branches.iter().filter(|b| b.non_impedant && !b.disabled) {
        if !sets.union(branch.bus1, branch.bus2) {
            return Err(FlowError::Network(format!(
                "non-impedant branch '{}' closes a loop of non-impedant branches",
                branch.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_core::{
        Branch, Bus, Degrees, Gen, Load, LoadId, PerUnit, PhaseTapChanger, RatioTapChanger, Shunt,
        VoltageRegulation,
    };

    fn two_bus() -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "slack"));
        network.add_bus(Bus::new(BusId::new(2), "load"));
        network
            .add_branch(Branch::new(
                BranchId::new(1),
                "line".to_string(),
                BusId::new(1),
                BusId::new(2),
                0.0,
                0.1,
            ))
            .unwrap();
        network.add_gen(
            Gen::new(GenId::new(1), "g1".to_string(), BusId::new(1))
                .with_voltage_setpoint(1.0)
                .with_p_limits(0.0, 500.0),
        );
        network.add_load(Load::new(LoadId::new(1), "l2", BusId::new(2), 100.0, 50.0));
        network
    }

    #[test]
    fn builds_per_unit_network_and_picks_slack() {
        let mut diag = Diagnostics::new();
        let lf = LfNetwork::build(&two_bus(), &LfNetworkParameters::default(), &mut diag).unwrap();
        assert_eq!(lf.buses.len(), 2);
        assert_eq!(lf.slack_bus(), 0);
        assert!(lf.buses[0].slack);
        assert!((lf.buses[1].load_p - 1.0).abs() < 1e-12);
        assert!((lf.buses[1].load_q - 0.5).abs() < 1e-12);
        assert!(lf.buses[0].is_generator_voltage_controlled());
    }

    #[test]
    fn empty_network_fails_fast() {
        let mut diag = Diagnostics::new();
        let err = LfNetwork::build(&Network::new(), &LfNetworkParameters::default(), &mut diag)
            .unwrap_err();
        assert!(matches!(err, FlowError::Network(_)));
    }

    #[test]
    fn missing_slack_candidate_fails_fast() {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "a"));
        let mut diag = Diagnostics::new();
        let err =
            LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap_err();
        assert!(err.to_string().contains("slack"));
    }

    #[test]
    fn non_impedant_loop_is_rejected() {
        let mut network = two_bus();
        network.add_bus(Bus::new(BusId::new(3), "c"));
        for (id, a, b) in [(10, 1, 3), (11, 3, 2), (12, 2, 1)] {
            network
                .add_branch(Branch::new(
                    BranchId::new(id),
                    format!("z{}", id),
                    BusId::new(a),
                    BusId::new(b),
                    0.0,
                    0.0,
                ))
                .unwrap();
        }
        let mut diag = Diagnostics::new();
        let err =
            LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap_err();
        assert!(err.to_string().contains("loop"));
    }

    #[test]
    fn generator_wins_over_transformer_and_shunt() {
        let mut network = two_bus();
        let regulation = VoltageRegulation {
            regulated_bus: BusId::new(1),
            target_v: PerUnit(1.02),
            deadband: PerUnit(0.01),
        };
        network
            .add_branch(
                Branch::new(
                    BranchId::new(2),
                    "tfo".to_string(),
                    BusId::new(2),
                    BusId::new(1),
                    0.0,
                    0.05,
                )
                .with_ratio_tap_changer(RatioTapChanger {
                    steps: vec![0.95, 1.0, 1.05],
                    position: 1,
                    regulation: Some(regulation.clone()),
                }),
            )
            .unwrap();
        network.add_shunt(Shunt {
            id: ShuntId::new(1),
            name: "sh".to_string(),
            bus: BusId::new(2),
            section_susceptances: vec![0.0, 0.1],
            voltage_regulation: Some(regulation),
            ..Shunt::default()
        });

        let mut diag = Diagnostics::new();
        let lf = LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap();
        assert!(!lf.branches[1].is_voltage_controller());
        assert!(!lf.shunts[0].is_voltage_controller());
        assert_eq!(diag.issues_by_category("voltage-control").count(), 2);
    }

    #[test]
    fn first_generator_target_wins() {
        let mut network = two_bus();
        network.add_gen(
            Gen::new(GenId::new(2), "g2".to_string(), BusId::new(1)).with_voltage_setpoint(1.05),
        );
        let mut diag = Diagnostics::new();
        let lf = LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap();
        let control = lf.buses[0].voltage_control.as_ref().unwrap();
        assert_eq!(control.controllers.len(), 2);
        assert!((control.target_v - 1.0).abs() < 1e-12);
        assert_eq!(lf.generators[1].target_v, Some(1.0));
        assert!(diag.has_warnings());
    }

    #[test]
    fn disabling_the_only_branch_disconnects_the_load_bus() {
        let mut diag = Diagnostics::new();
        let mut lf =
            LfNetwork::build(&two_bus(), &LfNetworkParameters::default(), &mut diag).unwrap();
        lf.set_branch_disabled(0, true).unwrap();
        assert_eq!(lf.update_connectivity(), 1);
        assert!(lf.buses[1].disabled);
        lf.set_branch_disabled(0, false).unwrap();
        assert_eq!(lf.update_connectivity(), 0);
        assert!(lf.set_branch_disabled(7, true).is_err());
    }

    #[test]
    fn tap_position_outside_its_table_fails_fast() {
        let mut network = two_bus();
        network
            .add_branch(
                Branch::new(BranchId::new(2), "pst".to_string(), BusId::new(1), BusId::new(2), 0.0, 0.1)
                    .with_phase_tap_changer(PhaseTapChanger {
                        steps: vec![Degrees(-5.0), Degrees(0.0), Degrees(5.0)],
                        position: 3,
                        mode: PhaseRegulationMode::ActivePowerControl,
                        target: 50.0,
                        deadband: 5.0,
                    }),
            )
            .unwrap();
        let mut diag = Diagnostics::new();
        let err = LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap_err();
        assert!(matches!(err, FlowError::Network(ref m) if m.contains("'pst' phase tap 3")));

        let mut network = two_bus();
        network.add_shunt(Shunt {
            id: ShuntId::new(1),
            name: "sh".to_string(),
            bus: BusId::new(2),
            section_susceptances: vec![0.0, 0.1],
            section_count: 2,
            ..Shunt::default()
        });
        let err = LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap_err();
        assert!(matches!(err, FlowError::Network(_)));
    }
}
