//! Distributed slack: spread the slack bus active power mismatch over
//! participating generators (or loads) instead of leaving it on the slack.

use super::{AcOuterLoop, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::LfNetwork;
use anyhow::anyhow;
use flowgrid_core::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Amount (pu) considered fully distributed.
const DISTRIBUTION_EPS: f64 = 1e-9;

/// How participation factors are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    #[default]
    ProportionalToGenerationPMax,
    ProportionalToGenerationP,
    ProportionalToGenerationParticipationFactor,
    ProportionalToLoad,
}

impl BalanceType {
    pub fn from_str(input: &str) -> anyhow::Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "proportional_to_generation_p_max" | "pmax" => Ok(Self::ProportionalToGenerationPMax),
            "proportional_to_generation_p" | "p" => Ok(Self::ProportionalToGenerationP),
            "proportional_to_generation_participation_factor" | "participation_factor" => {
                Ok(Self::ProportionalToGenerationParticipationFactor)
            }
            "proportional_to_load" | "load" => Ok(Self::ProportionalToLoad),
            other => Err(anyhow!("unknown balance type '{}'", other)),
        }
    }

    fn on_loads(self) -> bool {
        self == BalanceType::ProportionalToLoad
    }
}

/// What happens when the mismatch cannot be fully distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlackDistributionFailureBehavior {
    /// Abort the run with [`FlowError::SlackDistribution`]
    Throw,
    /// Keep the remainder on the slack bus
    #[default]
    LeaveOnSlackBus,
    /// Stop with outer loop status Failed
    Fail,
}

impl SlackDistributionFailureBehavior {
    pub fn from_str(input: &str) -> anyhow::Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "throw" => Ok(Self::Throw),
            "leave_on_slack_bus" => Ok(Self::LeaveOnSlackBus),
            "fail" => Ok(Self::Fail),
            other => Err(anyhow!("unknown slack distribution failure behavior '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DistributedSlackData {
    /// Active power moved off the slack bus so far (pu)
    pub distributed_p: f64,
    pub rounds: usize,
}

fn generator_weight(network: &LfNetwork, gen: usize, balance: BalanceType) -> f64 {
    let g = &network.generators[gen];
    let weight = match balance {
        BalanceType::ProportionalToGenerationPMax => g.max_p,
        BalanceType::ProportionalToGenerationP => g.target_p,
        BalanceType::ProportionalToGenerationParticipationFactor => g.participation_factor,
        BalanceType::ProportionalToLoad => 0.0,
    };
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Normalized factors `(element, factor)` summing to 1. Elements are
/// generator numbers, or bus numbers for [`BalanceType::ProportionalToLoad`].
pub fn participation_factors(network: &LfNetwork, balance: BalanceType) -> Vec<(usize, f64)> {
    participation_excluding(network, balance, &HashSet::new())
}

fn participation_excluding(
    network: &LfNetwork,
    balance: BalanceType,
    excluded: &HashSet<usize>,
) -> Vec<(usize, f64)> {
    let weights: Vec<(usize, f64)> = if balance.on_loads() {
        network
            .buses
            .iter()
            .filter(|b| !b.disabled && b.load_p > 0.0)
            .map(|b| (b.num, b.load_p))
            .collect()
    } else {
        network
            .generators
            .iter()
            .filter(|g| !network.buses[g.bus].disabled && !excluded.contains(&g.num))
            .map(|g| (g.num, generator_weight(network, g.num, balance)))
            .filter(|(_, w)| *w > 0.0)
            .collect()
    };
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return Vec::new();
    }
    weights.into_iter().map(|(e, w)| (e, w / total)).collect()
}

/// Move `amount` (pu) of active power off the slack bus. Generators stop
/// participating once they hit a P limit; what they could not take is
/// redistributed over the others. Returns the part left undistributed.
pub fn distribute_active_power(network: &mut LfNetwork, balance: BalanceType, amount: f64) -> f64 {
    if balance.on_loads() {
        let factors = participation_factors(network, balance);
        if factors.is_empty() {
            return amount;
        }
        for (bus, factor) in factors {
            network.buses[bus].load_p -= factor * amount;
        }
        return 0.0;
    }

    let mut remaining = amount;
    let mut excluded = HashSet::new();
    for _ in 0..=network.generators.len() {
        if remaining.abs() < DISTRIBUTION_EPS {
            break;
        }
        let factors = participation_excluding(network, balance, &excluded);
        if factors.is_empty() {
            break;
        }
        let mut done = 0.0;
        for (gen, factor) in factors {
            let g = &mut network.generators[gen];
            let wanted = g.target_p + factor * remaining;
            let clamped = wanted.clamp(g.min_p, g.max_p.max(g.min_p));
            if clamped != wanted {
                excluded.insert(gen);
            }
            done += clamped - g.target_p;
            g.target_p = clamped;
        }
        remaining -= done;
    }
    remaining
}

pub struct DistributedSlackOuterLoop {
    balance_type: BalanceType,
    /// MW
    max_mismatch: f64,
    failure: SlackDistributionFailureBehavior,
}

impl DistributedSlackOuterLoop {
    pub fn new(
        balance_type: BalanceType,
        max_mismatch: f64,
        failure: SlackDistributionFailureBehavior,
    ) -> Self {
        Self {
            balance_type,
            max_mismatch,
            failure,
        }
    }
}

impl AcOuterLoop for DistributedSlackOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::DistributedSlack
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let base = ctx.network.base_mva();
        let mismatch = ctx.solver_result.slack_bus_active_power_mismatch;
        if (mismatch * base).abs() < self.max_mismatch {
            debug!(mismatch_mw = mismatch * base, "slack mismatch within tolerance");
            return Ok(OuterLoopStatus::Stable);
        }

        let remaining = distribute_active_power(ctx.network, self.balance_type, mismatch);
        let distributed = mismatch - remaining;
        let data = ctx.data.get_or_default::<DistributedSlackData>();
        data.distributed_p += distributed;
        data.rounds += 1;
        info!(
            mismatch_mw = mismatch * base,
            distributed_mw = distributed * base,
            balance = ?self.balance_type,
            "slack mismatch distributed"
        );

        if (remaining * base).abs() < self.max_mismatch {
            return Ok(OuterLoopStatus::Unstable);
        }

        let message = format!(
            "{:.3} MW of slack mismatch could not be distributed",
            remaining * base
        );
        match self.failure {
            SlackDistributionFailureBehavior::Throw => Err(FlowError::SlackDistribution(message)),
            SlackDistributionFailureBehavior::Fail => {
                warn!("{}", message);
                ctx.diagnostics.add_error("slack-distribution", &message);
                Ok(OuterLoopStatus::Failed)
            }
            SlackDistributionFailureBehavior::LeaveOnSlackBus => {
                warn!("{}; leaving it on the slack bus", message);
                ctx.diagnostics.add_warning("slack-distribution", &message);
                if distributed.abs() > DISTRIBUTION_EPS {
                    Ok(OuterLoopStatus::Unstable)
                } else {
                    Ok(OuterLoopStatus::Stable)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ac::LfNetworkParameters;
    use flowgrid_core::{Branch, BranchId, Bus, BusId, Diagnostics, Gen, GenId, Load, LoadId, Network};

    fn network() -> LfNetwork {
        let mut network = Network::new();
        for i in 1..=3 {
            network.add_bus(Bus::new(BusId::new(i), &format!("b{i}")));
        }
        for (id, a, b) in [(1, 1, 2), (2, 2, 3)] {
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
        network.add_gen(
            Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
                .with_active_power(50.0)
                .with_p_limits(0.0, 200.0)
                .with_voltage_setpoint(1.0),
        );
        network.add_gen(
            Gen::new(GenId::new(2), "g2".into(), BusId::new(2))
                .with_active_power(30.0)
                .with_p_limits(0.0, 100.0)
                .with_participation_factor(3.0),
        );
        network.add_gen(
            Gen::new(GenId::new(3), "g3".into(), BusId::new(3))
                .with_active_power(20.0)
                .with_p_limits(10.0, 40.0)
                .with_participation_factor(1.0),
        );
        network.add_load(Load::new(LoadId::new(1), "l", BusId::new(3), 60.0, 0.0));
        network.add_load(Load::new(LoadId::new(2), "l2", BusId::new(2), 40.0, 0.0));
        let mut diag = Diagnostics::new();
        LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diag).unwrap()
    }

    fn total_p(network: &LfNetwork) -> f64 {
        network.generators.iter().map(|g| g.target_p).sum()
    }

    #[test]
    fn factors_are_normalized() {
        let lf = network();
        for balance in [
            BalanceType::ProportionalToGenerationPMax,
            BalanceType::ProportionalToGenerationP,
            BalanceType::ProportionalToGenerationParticipationFactor,
            BalanceType::ProportionalToLoad,
        ] {
            let sum: f64 = participation_factors(&lf, balance).iter().map(|(_, f)| f).sum();
            assert!((sum - 1.0).abs() < 1e-12, "{:?}", balance);
        }
        let pmax = participation_factors(&lf, BalanceType::ProportionalToGenerationPMax);
        assert!((pmax[0].1 - 200.0 / 340.0).abs() < 1e-12);
    }

    #[test]
    fn distribution_conserves_the_mismatch() {
        let mut lf = network();
        let before = total_p(&lf);
        let remaining = distribute_active_power(&mut lf, BalanceType::ProportionalToGenerationP, 0.3);
        assert!(remaining.abs() < 1e-9);
        assert!((total_p(&lf) - before - 0.3).abs() < 1e-6);
    }

    #[test]
    fn limits_push_the_remainder_to_other_generators() {
        let mut lf = network();
        let before = total_p(&lf);
        // g3 can only take 0.2 pu more, g2 takes the rest
        let remaining = distribute_active_power(
            &mut lf,
            BalanceType::ProportionalToGenerationParticipationFactor,
            0.85,
        );
        assert!(remaining.abs() < 1e-9);
        assert!((lf.generators[2].target_p - 0.4).abs() < 1e-12);
        assert!((lf.generators[1].target_p - 0.95).abs() < 1e-9);
        assert!((total_p(&lf) - before - 0.85).abs() < 1e-6);
    }

    #[test]
    fn exhausted_generators_leave_a_remainder() {
        let mut lf = network();
        let remaining = distribute_active_power(
            &mut lf,
            BalanceType::ProportionalToGenerationParticipationFactor,
            2.0,
        );
        // g2 up to 1.0 pu (+0.7), g3 up to 0.4 pu (+0.2)
        assert!((remaining - 1.1).abs() < 1e-9);
    }

    #[test]
    fn load_balancing_reduces_loads() {
        let mut lf = network();
        let remaining = distribute_active_power(&mut lf, BalanceType::ProportionalToLoad, 0.1);
        assert_eq!(remaining, 0.0);
        let total_load: f64 = lf.buses.iter().map(|b| b.load_p).sum();
        assert!((total_load - 0.9).abs() < 1e-12);
    }

    #[test]
    fn parsing_rejects_unknown_values() {
        assert_eq!(BalanceType::from_str("load").unwrap(), BalanceType::ProportionalToLoad);
        assert!(BalanceType::from_str("random").is_err());
        assert_eq!(
            SlackDistributionFailureBehavior::from_str("FAIL").unwrap(),
            SlackDistributionFailureBehavior::Fail
        );
    }
}
