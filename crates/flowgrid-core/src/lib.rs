//! # flowgrid-core: Network Model for the Load-Flow Engine
//!
//! Provides the input data structures consumed by `flowgrid-algo`: a graph of
//! buses, injections and branches, together with the discrete control devices
//! (tap changers, switched shunts, HVDC links in AC emulation) whose state the
//! load flow adjusts.
//!
//! ## Design Philosophy
//!
//! Networks are modeled as **undirected multigraphs** where:
//! - **Nodes**: Buses, Generators, Loads, Shunts
//! - **Edges**: Branches (lines and transformers) and HVDC links
//!
//! Injections are stored as standalone nodes referencing their bus by id, so
//! the edge set only carries electrical connections. This keeps topological
//! queries (islands, connectivity from the slack bus) trivial.
//!
//! ## Quick Start
//!
//! ```rust
//! use flowgrid_core::*;
//!
//! let mut network = Network::new();
//! network.add_bus(Bus::new(BusId::new(1), "Slack"));
//! network.add_bus(Bus::new(BusId::new(2), "Load bus"));
//!
//! network.add_gen(
//!     Gen::new(GenId::new(1), "G1".to_string(), BusId::new(1))
//!         .with_p_limits(0.0, 200.0)
//!         .with_voltage_setpoint(1.0),
//! );
//! network.add_load(Load::new(LoadId::new(1), "L1", BusId::new(2), 100.0, 50.0));
//! network
//!     .add_branch(Branch::new(
//!         BranchId::new(1),
//!         "Line 1-2".to_string(),
//!         BusId::new(1),
//!         BusId::new(2),
//!         0.0,
//!         0.1,
//!     ))
//!     .unwrap();
//!
//! assert_eq!(network.stats().num_buses, 2);
//! ```
//!
//! ## Modules
//!
//! - [`diagnostics`] - Issues recorded while preparing and running a load flow
//! - [`error`] - [`FlowError`] and [`FlowResult`]
//! - [`graph_utils`] - Island detection
//! - [`solver`] - Dense LU backends used to factorize the Jacobian
//! - [`units`] - Unit newtypes (MW, Mvar, pu, degrees)

use petgraph::{prelude::*, Undirected};
use serde::{Deserialize, Serialize};

pub mod diagnostics;
pub mod error;
pub mod graph_utils;
pub mod solver;
pub mod units;

pub use diagnostics::{DiagnosticIssue, Diagnostics, Severity};
pub use error::{FlowError, FlowResult};
pub use graph_utils::*;
pub use petgraph::graph::NodeIndex;
pub use solver::*;
pub use units::{Degrees, Kilovolts, Megavars, Megawatts, PerUnit, Radians};

macro_rules! id_type {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub fn new(value: usize) -> Self {
                $name(value)
            }
            #[inline]
            pub fn value(&self) -> usize {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} {}", $label, self.0)
            }
        }
    };
}

id_type!(BusId, "Bus");
id_type!(BranchId, "Branch");
id_type!(GenId, "Gen");
id_type!(LoadId, "Load");
id_type!(ShuntId, "Shunt");
id_type!(HvdcId, "Hvdc");

#[derive(Debug, Clone)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Base voltage in kilovolts (for per-unit conversions)
    pub base_kv: Kilovolts,
    /// Voltage magnitude in per-unit, used as starting point and slack target
    pub voltage_pu: PerUnit,
    /// Voltage angle in radians
    pub angle_rad: Radians,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            base_kv: Kilovolts(0.0),
            voltage_pu: PerUnit(1.0),
            angle_rad: Radians(0.0),
        }
    }
}

impl Bus {
    pub fn new(id: BusId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Remote or local voltage regulation carried by a transformer or a shunt.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageRegulation {
    pub regulated_bus: BusId,
    pub target_v: PerUnit,
    /// Full width of the acceptable band around the target
    pub deadband: PerUnit,
}

/// What a phase tap changer regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRegulationMode {
    /// Tap stays where it is
    #[default]
    Fixed,
    /// Keep the active power entering side 1 at `target` (MW)
    ActivePowerControl,
    /// Keep the side 1 current below `target` (per-unit)
    CurrentLimiter,
}

/// Phase-shifting transformer tap changer.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTapChanger {
    /// Phase shift at each tap position
    pub steps: Vec<Degrees>,
    pub position: usize,
    pub mode: PhaseRegulationMode,
    /// MW for active power control, per-unit current for the limiter
    pub target: f64,
    /// Full width of the acceptable band around the target (same unit)
    pub deadband: f64,
}

/// Ratio tap changer, optionally regulating a bus voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioTapChanger {
    /// Off-nominal ratio at each tap position
    pub steps: Vec<f64>,
    pub position: usize,
    pub regulation: Option<VoltageRegulation>,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Series resistance (per-unit)
    pub resistance: f64,
    /// Series reactance (per-unit)
    pub reactance: f64,
    /// Multiplicative tap magnitude applied from from_bus to to_bus
    pub tap_ratio: f64,
    /// Phase shift applied from from_bus to to_bus
    pub phase_shift: Radians,
    /// Total line charging susceptance (per-unit, split half/half)
    pub charging_b: PerUnit,
    /// Operational status flag
    pub status: bool,
    pub phase_tap_changer: Option<PhaseTapChanger>,
    pub ratio_tap_changer: Option<RatioTapChanger>,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            from_bus: BusId(0),
            to_bus: BusId(0),
            resistance: 0.0,
            reactance: 0.0,
            tap_ratio: 1.0,
            phase_shift: Radians(0.0),
            charging_b: PerUnit(0.0),
            status: true,
            phase_tap_changer: None,
            ratio_tap_changer: None,
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: String,
        from_bus: BusId,
        to_bus: BusId,
        resistance: f64,
        reactance: f64,
    ) -> Self {
        Self {
            id,
            name,
            from_bus,
            to_bus,
            resistance,
            reactance,
            ..Self::default()
        }
    }

    pub fn with_charging(mut self, charging_b: f64) -> Self {
        self.charging_b = PerUnit(charging_b);
        self
    }

    pub fn with_phase_tap_changer(mut self, ptc: PhaseTapChanger) -> Self {
        self.phase_tap_changer = Some(ptc);
        self
    }

    pub fn with_ratio_tap_changer(mut self, rtc: RatioTapChanger) -> Self {
        self.ratio_tap_changer = Some(rtc);
        self
    }

    /// Effective ratio: the tap changer position wins over the fixed ratio.
    pub fn effective_ratio(&self) -> f64 {
        self.ratio_tap_changer
            .as_ref()
            .and_then(|rtc| rtc.steps.get(rtc.position).copied())
            .unwrap_or(self.tap_ratio)
    }

    /// Effective phase shift: the tap changer position wins over the fixed shift.
    pub fn effective_phase_shift(&self) -> Radians {
        self.phase_tap_changer
            .as_ref()
            .and_then(|ptc| ptc.steps.get(ptc.position).map(|d| d.to_radians()))
            .unwrap_or(self.phase_shift)
    }
}

#[derive(Debug, Clone)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Active power output (MW)
    pub active_power: Megawatts,
    /// Reactive power output (Mvar), used when not regulating voltage
    pub reactive_power: Megavars,
    pub pmin: Megawatts,
    pub pmax: Megawatts,
    pub qmin: Megavars,
    pub qmax: Megavars,
    /// In-service status
    pub status: bool,
    /// Voltage setpoint (per-unit); `Some` means the generator regulates its bus
    pub voltage_setpoint: Option<PerUnit>,
    /// Weight used when distributing slack by participation factor
    pub participation_factor: Option<f64>,
}

impl Default for Gen {
    fn default() -> Self {
        Self {
            id: GenId(0),
            name: String::new(),
            bus: BusId(0),
            active_power: Megawatts(0.0),
            reactive_power: Megavars(0.0),
            pmin: Megawatts(0.0),
            pmax: Megawatts(f64::INFINITY),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            status: true,
            voltage_setpoint: None,
            participation_factor: None,
        }
    }
}

impl Gen {
    /// Create a new generator with default limits (no constraints)
    pub fn new(id: GenId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            ..Self::default()
        }
    }

    pub fn with_active_power(mut self, p_mw: f64) -> Self {
        self.active_power = Megawatts(p_mw);
        self
    }

    pub fn with_reactive_power(mut self, q_mvar: f64) -> Self {
        self.reactive_power = Megavars(q_mvar);
        self
    }

    /// Set active power limits (in MW)
    pub fn with_p_limits(mut self, pmin: f64, pmax: f64) -> Self {
        self.pmin = Megawatts(pmin);
        self.pmax = Megawatts(pmax);
        self
    }

    /// Set reactive power limits (in Mvar)
    pub fn with_q_limits(mut self, qmin: f64, qmax: f64) -> Self {
        self.qmin = Megavars(qmin);
        self.qmax = Megavars(qmax);
        self
    }

    pub fn with_voltage_setpoint(mut self, v_pu: f64) -> Self {
        self.voltage_setpoint = Some(PerUnit(v_pu));
        self
    }

    pub fn with_participation_factor(mut self, factor: f64) -> Self {
        self.participation_factor = Some(factor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
    /// Active power demand (MW)
    pub active_power: Megawatts,
    /// Reactive power demand (Mvar)
    pub reactive_power: Megavars,
}

impl Load {
    pub fn new(id: LoadId, name: &str, bus: BusId, p_mw: f64, q_mvar: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            bus,
            active_power: Megawatts(p_mw),
            reactive_power: Megavars(q_mvar),
        }
    }
}

/// Shunt element (capacitor or reactor) connected to a bus
///
/// Either fixed (`bs_pu`) or sectioned: `section_susceptances[k]` is the
/// total susceptance with `k` sections in service, so index 0 is usually 0.
#[derive(Debug, Clone)]
pub struct Shunt {
    pub id: ShuntId,
    pub name: String,
    pub bus: BusId,
    /// Shunt conductance in per-unit
    pub gs_pu: f64,
    /// Shunt susceptance in per-unit (positive = capacitor, negative = reactor)
    pub bs_pu: f64,
    pub status: bool,
    pub section_susceptances: Vec<f64>,
    pub section_count: usize,
    pub voltage_regulation: Option<VoltageRegulation>,
}

impl Default for Shunt {
    fn default() -> Self {
        Self {
            id: ShuntId(0),
            name: String::new(),
            bus: BusId(0),
            gs_pu: 0.0,
            bs_pu: 0.0,
            status: true,
            section_susceptances: Vec::new(),
            section_count: 0,
            voltage_regulation: None,
        }
    }
}

impl Shunt {
    /// Susceptance currently in service.
    pub fn susceptance(&self) -> f64 {
        self.section_susceptances
            .get(self.section_count)
            .copied()
            .unwrap_or(self.bs_pu)
    }
}

/// HVDC link operated in AC emulation: `P = P0 + k (θ1 − θ2)`.
#[derive(Debug, Clone)]
pub struct HvdcLink {
    pub id: HvdcId,
    pub name: String,
    pub bus1: BusId,
    pub bus2: BusId,
    /// Active power set point from side 1 to side 2
    pub p0: Megawatts,
    /// Droop in MW per degree of angle difference
    pub droop_mw_per_deg: f64,
    pub max_p_1_to_2: Megawatts,
    pub max_p_2_to_1: Megawatts,
    pub status: bool,
}

/// Secondary voltage control zone: generators of the zone shift their
/// voltage targets together to hold the pilot bus voltage.
#[derive(Debug, Clone)]
pub struct VoltageControlZone {
    pub name: String,
    pub pilot_bus: BusId,
    pub target_v: PerUnit,
    pub generators: Vec<GenId>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Load(Load),
    Shunt(Shunt),
}

#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
    Hvdc(HvdcLink),
}

/// The input power network graph
#[derive(Debug, Default)]
pub struct Network {
    pub graph: Graph<Node, Edge, Undirected>,
    pub voltage_zones: Vec<VoltageControlZone>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            graph: Graph::new_undirected(),
            voltage_zones: Vec::new(),
        }
    }

    pub fn add_bus(&mut self, bus: Bus) -> NodeIndex {
        self.graph.add_node(Node::Bus(bus))
    }

    pub fn add_gen(&mut self, gen: Gen) -> NodeIndex {
        self.graph.add_node(Node::Gen(gen))
    }

    pub fn add_load(&mut self, load: Load) -> NodeIndex {
        self.graph.add_node(Node::Load(load))
    }

    pub fn add_shunt(&mut self, shunt: Shunt) -> NodeIndex {
        self.graph.add_node(Node::Shunt(shunt))
    }

    /// Connect two existing buses with a branch.
    pub fn add_branch(&mut self, branch: Branch) -> FlowResult<EdgeIndex> {
        let from = self.require_bus(branch.from_bus, &branch.name)?;
        let to = self.require_bus(branch.to_bus, &branch.name)?;
        Ok(self.graph.add_edge(from, to, Edge::Branch(branch)))
    }

    pub fn add_hvdc(&mut self, link: HvdcLink) -> FlowResult<EdgeIndex> {
        let from = self.require_bus(link.bus1, &link.name)?;
        let to = self.require_bus(link.bus2, &link.name)?;
        Ok(self.graph.add_edge(from, to, Edge::Hvdc(link)))
    }

    fn require_bus(&self, bus: BusId, owner: &str) -> FlowResult<NodeIndex> {
        self.bus_node(bus).ok_or_else(|| {
            FlowError::Network(format!("'{}' references unknown {}", owner, bus))
        })
    }

    /// Graph index of the bus node with the given id
    pub fn bus_node(&self, bus: BusId) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&idx| match &self.graph[idx] {
            Node::Bus(b) => b.id == bus,
            _ => false,
        })
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();

        for node in self.graph.node_weights() {
            match node {
                Node::Bus(_) => stats.num_buses += 1,
                Node::Gen(g) => {
                    stats.num_gens += 1;
                    if g.status {
                        stats.total_generation_mw += g.active_power.value();
                    }
                }
                Node::Load(l) => {
                    stats.num_loads += 1;
                    stats.total_load_mw += l.active_power.value();
                }
                Node::Shunt(_) => stats.num_shunts += 1,
            }
        }
        for edge in self.graph.edge_weights() {
            match edge {
                Edge::Branch(_) => stats.num_branches += 1,
                Edge::Hvdc(_) => stats.num_hvdc_links += 1,
            }
        }

        stats
    }

    /// Validate network data for common issues that make the load flow fail.
    ///
    /// Populates the provided `Diagnostics` with any warnings/errors found.
    pub fn validate_into(&self, diag: &mut Diagnostics) {
        let stats = self.stats();

        if stats.num_buses == 0 {
            diag.add_error("structure", "Network has no buses");
            return;
        }

        if stats.num_gens == 0 {
            diag.add_error("structure", "Network has no generators");
        }

        if stats.num_branches == 0 && stats.num_buses > 1 {
            diag.add_error("structure", "Network has multiple buses but no branches");
        }

        for branch in self.branches() {
            if let Some(ptc) = &branch.phase_tap_changer {
                if ptc.position >= ptc.steps.len() {
                    diag.add_error_with_entity(
                        "tap-changer",
                        "phase tap position outside of the step table",
                        &branch.name,
                    );
                }
            }
            if let Some(rtc) = &branch.ratio_tap_changer {
                if rtc.position >= rtc.steps.len() {
                    diag.add_error_with_entity(
                        "tap-changer",
                        "ratio tap position outside of the step table",
                        &branch.name,
                    );
                }
            }
        }

        if let Ok(analysis) = find_islands(self) {
            if analysis.islands.len() > 1 {
                diag.add_warning(
                    "topology",
                    &format!(
                        "Network splits into {} islands; only the slack bus island is solved",
                        analysis.islands.len()
                    ),
                );
            }
        }
    }

    pub fn total_generation_mw(&self) -> f64 {
        self.stats().total_generation_mw
    }

    pub fn total_load_mw(&self) -> f64 {
        self.stats().total_load_mw
    }

    pub fn buses(&self) -> Vec<&Bus> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Bus(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn generators(&self) -> Vec<&Gen> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Gen(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    pub fn loads(&self) -> Vec<&Load> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Load(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn shunts(&self) -> Vec<&Shunt> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Shunt(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn branches(&self) -> Vec<&Branch> {
        self.graph
            .edge_weights()
            .filter_map(|e| match e {
                Edge::Branch(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn hvdc_links(&self) -> Vec<&HvdcLink> {
        self.graph
            .edge_weights()
            .filter_map(|e| match e {
                Edge::Hvdc(h) => Some(h),
                _ => None,
            })
            .collect()
    }
}

/// Statistics about a network's size
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub num_buses: usize,
    pub num_gens: usize,
    pub num_loads: usize,
    pub num_shunts: usize,
    pub num_branches: usize,
    pub num_hvdc_links: usize,
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} buses, {} branches, {} hvdc, {} gens ({:.0} MW), {} loads ({:.0} MW)",
            self.num_buses,
            self.num_branches,
            self.num_hvdc_links,
            self.num_gens,
            self.total_generation_mw,
            self.num_loads,
            self.total_load_mw
        )
    }
}

impl Node {
    pub fn label(&self) -> &str {
        match self {
            Node::Bus(bus) => &bus.name,
            Node::Gen(gen) => &gen.name,
            Node::Load(load) => &load.name,
            Node::Shunt(shunt) => &shunt.name,
        }
    }
}

impl Edge {
    pub fn label(&self) -> &str {
        match self {
            Edge::Branch(branch) => &branch.name,
            Edge::Hvdc(link) => &link.name,
        }
    }

    /// Whether the edge carries AC current between its buses.
    pub fn is_ac_connection(&self) -> bool {
        matches!(self, Edge::Branch(b) if b.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus() -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "Bus 1"));
        network.add_bus(Bus::new(BusId::new(2), "Bus 2"));
        network.add_gen(Gen::new(GenId::new(1), "Gen 1".into(), BusId::new(1)).with_active_power(80.0));
        network.add_load(Load::new(LoadId::new(1), "Load 1", BusId::new(2), 50.0, 10.0));
        network
            .add_branch(Branch::new(
                BranchId::new(1),
                "Branch 1-2".to_string(),
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            ))
            .unwrap();
        network
    }

    #[test]
    fn test_network_creation() {
        let network = two_bus();
        assert_eq!(network.graph.node_count(), 4);
        assert_eq!(network.graph.edge_count(), 1);
        assert!(network.bus_node(BusId::new(2)).is_some());
        assert!(network.bus_node(BusId::new(3)).is_none());
    }

    #[test]
    fn test_branch_to_unknown_bus_is_rejected() {
        let mut network = two_bus();
        let err = network
            .add_branch(Branch::new(
                BranchId::new(2),
                "dangling".to_string(),
                BusId::new(1),
                BusId::new(9),
                0.0,
                0.1,
            ))
            .unwrap_err();
        assert!(matches!(err, FlowError::Network(_)));
    }

    #[test]
    fn test_network_validation_empty() {
        let network = Network::new();
        let mut diag = Diagnostics::new();
        network.validate_into(&mut diag);
        assert!(diag.has_errors());
        assert!(diag.errors().any(|i| i.message.contains("no buses")));
    }

    #[test]
    fn test_network_stats() {
        let network = two_bus();
        let stats = network.stats();
        assert_eq!(stats.num_buses, 2);
        assert_eq!(stats.num_gens, 1);
        assert_eq!(stats.num_loads, 1);
        assert_eq!(stats.num_branches, 1);
        assert!((network.total_load_mw() - 50.0).abs() < 1e-9);
        assert!((network.total_generation_mw() - 80.0).abs() < 1e-9);

        let mut diag = Diagnostics::new();
        network.validate_into(&mut diag);
        assert!(!diag.has_errors());
    }

    #[test]
    fn test_tap_position_out_of_range_is_reported() {
        let mut network = two_bus();
        network
            .add_branch(
                Branch::new(
                    BranchId::new(2),
                    "PST".to_string(),
                    BusId::new(1),
                    BusId::new(2),
                    0.0,
                    0.2,
                )
                .with_phase_tap_changer(PhaseTapChanger {
                    steps: vec![Degrees(-5.0), Degrees(0.0), Degrees(5.0)],
                    position: 3,
                    mode: PhaseRegulationMode::Fixed,
                    target: 0.0,
                    deadband: 0.0,
                }),
            )
            .unwrap();
        let mut diag = Diagnostics::new();
        network.validate_into(&mut diag);
        assert_eq!(diag.issues_by_category("tap-changer").count(), 1);
    }

    #[test]
    fn test_effective_tap_values() {
        let branch = Branch::default()
            .with_ratio_tap_changer(RatioTapChanger {
                steps: vec![0.95, 1.0, 1.05],
                position: 2,
                regulation: None,
            })
            .with_phase_tap_changer(PhaseTapChanger {
                steps: vec![Degrees(-10.0), Degrees(0.0)],
                position: 0,
                mode: PhaseRegulationMode::Fixed,
                target: 0.0,
                deadband: 0.0,
            });
        assert!((branch.effective_ratio() - 1.05).abs() < 1e-12);
        assert!((branch.effective_phase_shift().value() + 10f64.to_radians()).abs() < 1e-12);
    }

    #[test]
    fn test_shunt_susceptance_uses_sections() {
        let shunt = Shunt {
            section_susceptances: vec![0.0, 0.1, 0.2],
            section_count: 2,
            bs_pu: 5.0,
            ..Shunt::default()
        };
        assert!((shunt.susceptance() - 0.2).abs() < 1e-12);
        assert!((Shunt { bs_pu: 0.3, ..Shunt::default() }.susceptance() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_multiple_islands_warn() {
        let mut network = two_bus();
        network.add_bus(Bus::new(BusId::new(3), "Island"));
        let mut diag = Diagnostics::new();
        network.validate_into(&mut diag);
        assert!(diag.warnings().any(|i| i.category == "topology"));
    }
}
