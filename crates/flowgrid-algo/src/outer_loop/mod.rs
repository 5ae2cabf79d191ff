//! # Outer Loops
//!
//! Discrete controls the Newton iteration cannot express directly (tap
//! positions, generator bus types, converter modes) are adjusted between
//! inner solves by outer loops.
//!
//! ```text
//!   initialize(all loops)
//!          │
//!          ▼
//!   ┌─► inner solve ── not converged ──► stop with solver status
//!   │      │
//!   │      ▼
//!   │   loop 1 check ── Unstable ─┐
//!   │      │ Stable               │
//!   │   loop 2 check ── Unstable ─┤
//!   │      │ ...                  │
//!   │      ▼                      ▼
//!   │    all Stable ──► done   refresh system, outer += 1
//!   └─────────────────────────────┘  (cap reached ──► Unstable)
//! ```
//!
//! Each loop keeps its per-run state in a typed slot of the
//! [`LoopDataStore`], created on first use and discarded with the run.
//! Hunting guards (phase tap reversals, HVDC mode switches, PQ→PV switches)
//! freeze the offending controller and log it; they never fail the run.

pub mod distributed_slack;
pub mod hvdc;
pub mod phase_control;
pub mod reactive_limits;
pub mod secondary_voltage;
pub mod shunt_voltage;
pub mod transformer_voltage;

pub use distributed_slack::{
    distribute_active_power, participation_factors, BalanceType, DistributedSlackData,
    DistributedSlackOuterLoop, SlackDistributionFailureBehavior,
};
pub use hvdc::{HvdcAcEmulationOuterLoop, HvdcData};
pub use phase_control::{DirectionLimiter, PhaseControlData, PhaseControlOuterLoop};
pub use reactive_limits::{ReactiveLimitsData, ReactiveLimitsOuterLoop};
pub use secondary_voltage::{SecondaryVoltageData, SecondaryVoltageOuterLoop};
pub use shunt_voltage::{ShuntVoltageData, ShuntVoltageOuterLoop};
pub use transformer_voltage::{TransformerVoltageData, TransformerVoltageOuterLoop};

use crate::ac::{AcEquationSystem, AcEquationType, AcVariableType, LfNetwork};
use crate::equations::{EquationId, StateView, Variable};
use crate::jacobian::JacobianMatrix;
use crate::newton::SolverResult;
use anyhow::anyhow;
use flowgrid_core::{Diagnostics, FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OuterLoopStatus {
    Stable,
    Unstable,
    /// Unrecoverable control failure; the best effort state is returned
    Failed,
}

impl std::fmt::Display for OuterLoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OuterLoopStatus::Stable => "STABLE",
            OuterLoopStatus::Unstable => "UNSTABLE",
            OuterLoopStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OuterLoopKind {
    DistributedSlack,
    SecondaryVoltageControl,
    ReactiveLimits,
    PhaseControl,
    TransformerVoltageControl,
    ShuntVoltageControl,
    HvdcAcEmulation,
}

impl OuterLoopKind {
    /// Order used when no explicit list is configured.
    pub const DEFAULT_ORDER: [OuterLoopKind; 7] = [
        OuterLoopKind::DistributedSlack,
        OuterLoopKind::SecondaryVoltageControl,
        OuterLoopKind::ReactiveLimits,
        OuterLoopKind::PhaseControl,
        OuterLoopKind::TransformerVoltageControl,
        OuterLoopKind::ShuntVoltageControl,
        OuterLoopKind::HvdcAcEmulation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OuterLoopKind::DistributedSlack => "distributed_slack",
            OuterLoopKind::SecondaryVoltageControl => "secondary_voltage_control",
            OuterLoopKind::ReactiveLimits => "reactive_limits",
            OuterLoopKind::PhaseControl => "phase_control",
            OuterLoopKind::TransformerVoltageControl => "transformer_voltage_control",
            OuterLoopKind::ShuntVoltageControl => "shunt_voltage_control",
            OuterLoopKind::HvdcAcEmulation => "hvdc_ac_emulation",
        }
    }

    pub fn from_str(input: &str) -> anyhow::Result<Self> {
        let normalized = input.trim().to_ascii_lowercase().replace('-', "_");
        Self::DEFAULT_ORDER
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| {
                let names: Vec<_> = Self::DEFAULT_ORDER.iter().map(|k| k.name()).collect();
                anyhow!(
                    "unknown outer loop '{}'; supported values: {}",
                    input,
                    names.join(", ")
                )
            })
    }
}

/// Per-run state of one loop kind.
pub trait LoopData: Default {
    const KIND: OuterLoopKind;

    fn wrap(self) -> OuterLoopData;

    fn unwrap_mut(data: &mut OuterLoopData) -> Option<&mut Self>;
}

macro_rules! loop_data {
    ($($kind:ident => $data:ty),* $(,)?) => {
        /// Typed data slot, one variant per loop kind.
        #[derive(Debug, Clone)]
        pub enum OuterLoopData {
            $($kind($data)),*
        }

        $(
            impl LoopData for $data {
                const KIND: OuterLoopKind = OuterLoopKind::$kind;

                fn wrap(self) -> OuterLoopData {
                    OuterLoopData::$kind(self)
                }

                fn unwrap_mut(data: &mut OuterLoopData) -> Option<&mut Self> {
                    match data {
                        OuterLoopData::$kind(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

loop_data! {
    DistributedSlack => DistributedSlackData,
    SecondaryVoltageControl => SecondaryVoltageData,
    ReactiveLimits => ReactiveLimitsData,
    PhaseControl => PhaseControlData,
    TransformerVoltageControl => TransformerVoltageData,
    ShuntVoltageControl => ShuntVoltageData,
    HvdcAcEmulation => HvdcData,
}

/// Loop data of one run, keyed by loop kind.
#[derive(Debug, Clone, Default)]
pub struct LoopDataStore {
    slots: HashMap<OuterLoopKind, OuterLoopData>,
}

impl LoopDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot of `T`, created with its default value on first access.
    pub fn get_or_default<T: LoopData>(&mut self) -> &mut T {
        let slot = self
            .slots
            .entry(T::KIND)
            .or_insert_with(|| T::default().wrap());
        if T::unwrap_mut(slot).is_none() {
            *slot = T::default().wrap();
        }
        T::unwrap_mut(slot).unwrap_or_else(|| unreachable!("slot {:?} holds foreign data", T::KIND))
    }

    pub fn get<T: LoopData>(&mut self) -> Option<&mut T> {
        self.slots.get_mut(&T::KIND).and_then(T::unwrap_mut)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// What a loop sees after a converged inner solve.
pub struct OuterLoopContext<'a> {
    pub network: &'a mut LfNetwork,
    pub system: &'a AcEquationSystem,
    /// Factorized at the converged state
    pub jacobian: &'a JacobianMatrix,
    pub solver_result: SolverResult,
    pub outer_iteration: usize,
    pub data: &'a mut LoopDataStore,
    pub diagnostics: &'a mut Diagnostics,
}

impl<'a> OuterLoopContext<'a> {
    /// Stored (converged) values of every variable.
    pub fn view(&self) -> StateView<'a, AcVariableType> {
        let system: &'a AcEquationSystem = self.system;
        system.system().stored_view()
    }

    /// Solve `M z = g` for a quantity with gradient `g`. `z[column(eq)]` is
    /// the derivative of the quantity with respect to the target of `eq`.
    pub fn sensitivities(&self, gradient: &[(Variable<AcVariableType>, f64)]) -> FlowResult<Vec<f64>> {
        let index = self.system.system().index();
        let mut rhs = vec![0.0; index.row_count()];
        for (variable, derivative) in gradient {
            if let Some(row) = index.row(*variable) {
                rhs[row] += derivative;
            }
        }
        self.jacobian.solve(&mut rhs)?;
        Ok(rhs)
    }

    pub fn column(&self, equation: EquationId<AcEquationType>) -> Option<usize> {
        self.system.system().index().column(equation)
    }

    /// Derivative of a quantity with respect to the target of one equation.
    pub fn sensitivity(
        &self,
        gradient: &[(Variable<AcVariableType>, f64)],
        equation: EquationId<AcEquationType>,
    ) -> FlowResult<Option<f64>> {
        let Some(column) = self.column(equation) else {
            return Ok(None);
        };
        Ok(self.sensitivities(gradient)?.get(column).copied())
    }
}

/// One discrete control coordinated around the inner solve.
pub trait AcOuterLoop {
    fn kind(&self) -> OuterLoopKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Called once per run before the first solve.
    fn initialize(&mut self, _network: &mut LfNetwork, _data: &mut LoopDataStore) -> FlowResult<()> {
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus>;
}

/// Outer loop selection and settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OuterLoopParameters {
    /// Explicit ordered loop names; when set the feature flags are ignored
    pub loops: Option<Vec<String>>,
    pub distributed_slack: bool,
    pub balance_type: BalanceType,
    /// Slack mismatch below which distribution stops (MW)
    pub slack_bus_p_max_mismatch: f64,
    pub slack_distribution_failure_behavior: SlackDistributionFailureBehavior,
    pub secondary_voltage_control: bool,
    pub use_reactive_limits: bool,
    pub max_pq_pv_switches: usize,
    pub phase_control: bool,
    pub phase_control_max_direction_changes: usize,
    pub transformer_voltage_control: bool,
    pub shunt_voltage_control: bool,
    pub hvdc_ac_emulation: bool,
    pub hvdc_max_mode_switches: usize,
}

impl Default for OuterLoopParameters {
    fn default() -> Self {
        Self {
            loops: None,
            distributed_slack: true,
            balance_type: BalanceType::default(),
            slack_bus_p_max_mismatch: 1.0,
            slack_distribution_failure_behavior: SlackDistributionFailureBehavior::default(),
            secondary_voltage_control: false,
            use_reactive_limits: true,
            max_pq_pv_switches: 3,
            phase_control: false,
            phase_control_max_direction_changes: 2,
            transformer_voltage_control: false,
            shunt_voltage_control: false,
            hvdc_ac_emulation: true,
            hvdc_max_mode_switches: 2,
        }
    }
}

impl OuterLoopParameters {
    pub fn with_loops(mut self, names: &[&str]) -> Self {
        self.loops = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_distributed_slack(mut self, enabled: bool, balance_type: BalanceType) -> Self {
        self.distributed_slack = enabled;
        self.balance_type = balance_type;
        self
    }

    pub fn with_slack_distribution_failure_behavior(
        mut self,
        behavior: SlackDistributionFailureBehavior,
    ) -> Self {
        self.slack_distribution_failure_behavior = behavior;
        self
    }

    pub fn with_reactive_limits(mut self, enabled: bool) -> Self {
        self.use_reactive_limits = enabled;
        self
    }

    pub fn with_phase_control(mut self, enabled: bool) -> Self {
        self.phase_control = enabled;
        self
    }

    pub fn with_phase_control_max_direction_changes(mut self, max: usize) -> Self {
        self.phase_control_max_direction_changes = max;
        self
    }

    pub fn with_transformer_voltage_control(mut self, enabled: bool) -> Self {
        self.transformer_voltage_control = enabled;
        self
    }

    pub fn with_shunt_voltage_control(mut self, enabled: bool) -> Self {
        self.shunt_voltage_control = enabled;
        self
    }

    pub fn with_secondary_voltage_control(mut self, enabled: bool) -> Self {
        self.secondary_voltage_control = enabled;
        self
    }

    pub fn with_hvdc_ac_emulation(mut self, enabled: bool) -> Self {
        self.hvdc_ac_emulation = enabled;
        self
    }

    pub fn with_hvdc_max_mode_switches(mut self, max: usize) -> Self {
        self.hvdc_max_mode_switches = max;
        self
    }

    /// Loop kinds in execution order.
    pub fn resolve_order(&self) -> FlowResult<Vec<OuterLoopKind>> {
        match &self.loops {
            Some(names) => {
                let mut seen = HashSet::new();
                let mut kinds = Vec::with_capacity(names.len());
                for name in names {
                    let kind = OuterLoopKind::from_str(name)
                        .map_err(|e| FlowError::Config(e.to_string()))?;
                    if !seen.insert(kind) {
                        return Err(FlowError::Config(format!(
                            "outer loop '{}' is listed twice",
                            kind.name()
                        )));
                    }
                    kinds.push(kind);
                }
                Ok(kinds)
            }
            None => Ok(OuterLoopKind::DEFAULT_ORDER
                .into_iter()
                .filter(|kind| match kind {
                    OuterLoopKind::DistributedSlack => self.distributed_slack,
                    OuterLoopKind::SecondaryVoltageControl => self.secondary_voltage_control,
                    OuterLoopKind::ReactiveLimits => self.use_reactive_limits,
                    OuterLoopKind::PhaseControl => self.phase_control,
                    OuterLoopKind::TransformerVoltageControl => self.transformer_voltage_control,
                    OuterLoopKind::ShuntVoltageControl => self.shunt_voltage_control,
                    OuterLoopKind::HvdcAcEmulation => self.hvdc_ac_emulation,
                })
                .collect()),
        }
    }

    pub fn validate(&self) -> FlowResult<()> {
        if !(self.slack_bus_p_max_mismatch > 0.0) {
            return Err(FlowError::Config(format!(
                "slack_bus_p_max_mismatch must be positive, got {}",
                self.slack_bus_p_max_mismatch
            )));
        }
        self.resolve_order().map(|_| ())
    }
}

/// Build the configured loops, in order.
pub fn create_outer_loops(params: &OuterLoopParameters) -> FlowResult<Vec<Box<dyn AcOuterLoop>>> {
    params.validate()?;
    Ok(params
        .resolve_order()?
        .into_iter()
        .map(|kind| create_outer_loop(kind, params))
        .collect())
}

fn create_outer_loop(kind: OuterLoopKind, params: &OuterLoopParameters) -> Box<dyn AcOuterLoop> {
    match kind {
        OuterLoopKind::DistributedSlack => Box::new(DistributedSlackOuterLoop::new(
            params.balance_type,
            params.slack_bus_p_max_mismatch,
            params.slack_distribution_failure_behavior,
        )),
        OuterLoopKind::SecondaryVoltageControl => Box::new(SecondaryVoltageOuterLoop::default()),
        OuterLoopKind::ReactiveLimits => {
            Box::new(ReactiveLimitsOuterLoop::new(params.max_pq_pv_switches))
        }
        OuterLoopKind::PhaseControl => Box::new(PhaseControlOuterLoop::new(
            params.phase_control_max_direction_changes,
        )),
        OuterLoopKind::TransformerVoltageControl => Box::new(TransformerVoltageOuterLoop),
        OuterLoopKind::ShuntVoltageControl => Box::new(ShuntVoltageOuterLoop),
        OuterLoopKind::HvdcAcEmulation => {
            Box::new(HvdcAcEmulationOuterLoop::new(params.hvdc_max_mode_switches))
        }
    }
}

/// Index of the table entry closest to `value`.
pub(crate) fn nearest_step(steps: &[f64], value: f64) -> Option<usize> {
    steps
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - value).abs().total_cmp(&(b.1 - value).abs()))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_follows_flags() {
        let params = OuterLoopParameters::default();
        let order = params.resolve_order().unwrap();
        assert_eq!(
            order,
            vec![
                OuterLoopKind::DistributedSlack,
                OuterLoopKind::ReactiveLimits,
                OuterLoopKind::HvdcAcEmulation
            ]
        );
    }

    #[test]
    fn explicit_order_is_kept() {
        let params = OuterLoopParameters::default().with_loops(&["phase_control", "distributed-slack"]);
        let loops = create_outer_loops(&params).unwrap();
        let names: Vec<_> = loops.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["phase_control", "distributed_slack"]);
    }

    #[test]
    fn unknown_or_duplicate_loops_fail_at_setup() {
        let unknown = OuterLoopParameters::default().with_loops(&["voltage_magic"]);
        assert!(matches!(create_outer_loops(&unknown), Err(FlowError::Config(_))));
        let twice = OuterLoopParameters::default().with_loops(&["hvdc_ac_emulation", "hvdc_ac_emulation"]);
        let err = create_outer_loops(&twice).err().unwrap();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn data_store_slots_are_typed_and_persistent() {
        let mut store = LoopDataStore::new();
        assert!(store.get::<HvdcData>().is_none());
        store.get_or_default::<HvdcData>().switches.insert(3, 1);
        assert_eq!(store.get_or_default::<HvdcData>().switches[&3], 1);
        store.get_or_default::<ReactiveLimitsData>();
        assert!(store.get::<PhaseControlData>().is_none());
        store.clear();
        assert!(store.get::<HvdcData>().is_none());
    }

    #[test]
    fn nearest_step_picks_closest_entry() {
        assert_eq!(nearest_step(&[0.9, 1.0, 1.1], 1.04), Some(1));
        assert_eq!(nearest_step(&[0.9, 1.0, 1.1], 1.3), Some(2));
        assert_eq!(nearest_step(&[], 1.0), None);
    }

    #[test]
    fn parameters_round_trip_through_json() {
        let params: OuterLoopParameters = serde_json::from_str(
            r#"{"balance_type": "proportional_to_load", "slack_distribution_failure_behavior": "fail"}"#,
        )
        .unwrap();
        assert_eq!(params.balance_type, BalanceType::ProportionalToLoad);
        assert_eq!(
            params.slack_distribution_failure_behavior,
            SlackDistributionFailureBehavior::Fail
        );
        assert!(params.use_reactive_limits);
    }
}
