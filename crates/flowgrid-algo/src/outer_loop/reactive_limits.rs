//! Generator reactive power limits.
//!
//! A PV bus whose generators would leave `[Qmin, Qmax]` becomes PQ with its
//! reactive generation pinned at the violated limit. It goes back to PV
//! once its voltage crosses the target on the side that frees the limit,
//! at most `max_pq_pv_switches` times per bus and run.

use super::{AcOuterLoop, LoopDataStore, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::LfNetwork;
use flowgrid_core::FlowResult;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Reactive power tolerance on limits (pu).
const Q_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Default)]
pub struct ReactiveLimitsData {
    pub pv_pq_switches: usize,
    /// PQ→PV switches per bus
    pub pq_pv_switches: HashMap<usize, usize>,
    /// Buses kept PQ after exhausting their switch budget
    pub blocked: HashSet<usize>,
}

#[derive(Debug, Clone)]
pub struct ReactiveLimitsOuterLoop {
    max_pq_pv_switches: usize,
}

impl ReactiveLimitsOuterLoop {
    pub fn new(max_pq_pv_switches: usize) -> Self {
        Self { max_pq_pv_switches }
    }
}

fn q_limits(network: &LfNetwork, bus: usize) -> (f64, f64) {
    network.buses[bus]
        .generators
        .iter()
        .map(|g| &network.generators[*g])
        .fold((0.0, 0.0), |(min, max), g| (min + g.min_q, max + g.max_q))
}

impl AcOuterLoop for ReactiveLimitsOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::ReactiveLimits
    }

    fn initialize(&mut self, network: &mut LfNetwork, _data: &mut LoopDataStore) -> FlowResult<()> {
        for bus in network.buses.iter_mut().filter(|b| b.has_generator_voltage_control()) {
            bus.generator_voltage_control_enabled = true;
            bus.pinned_q = None;
        }
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let mut pv_to_pq = Vec::new();
        let mut pq_to_pv = Vec::new();

        for bus in ctx.network.buses.iter() {
            if bus.slack || bus.disabled || !bus.has_generator_voltage_control() {
                continue;
            }
            let (q_min, q_max) = q_limits(ctx.network, bus.num);
            if bus.generator_voltage_control_enabled {
                let q = ctx.system.bus_generation_q(ctx.network, bus.num, &view);
                if q > q_max + Q_EPS {
                    pv_to_pq.push((bus.num, q, q_max));
                } else if q < q_min - Q_EPS {
                    pv_to_pq.push((bus.num, q, q_min));
                }
            } else if let (Some(pinned), Some(control)) = (bus.pinned_q, &bus.voltage_control) {
                let v = ctx.system.bus_v(bus.num, &view);
                let at_max = (pinned - q_max).abs() <= (pinned - q_min).abs();
                // at Qmax the voltage sags below target, at Qmin it rises above
                let recovered = if at_max {
                    v > control.target_v
                } else {
                    v < control.target_v
                };
                if recovered {
                    pq_to_pv.push(bus.num);
                }
            }
        }

        let data = ctx.data.get_or_default::<ReactiveLimitsData>();
        let mut changed = false;
        for (bus, q, limit) in pv_to_pq {
            let b = &mut ctx.network.buses[bus];
            b.generator_voltage_control_enabled = false;
            b.pinned_q = Some(limit);
            data.pv_pq_switches += 1;
            changed = true;
            debug!(bus = %b.id, q, limit, "PV -> PQ");
        }
        for bus in pq_to_pv {
            let count = data.pq_pv_switches.entry(bus).or_insert(0);
            let b = &mut ctx.network.buses[bus];
            if *count >= self.max_pq_pv_switches {
                if data.blocked.insert(bus) {
                    warn!(bus = %b.id, switches = *count, "PQ -> PV switch budget exhausted, bus stays PQ");
                    ctx.diagnostics.add_warning_with_entity(
                        "reactive-limits",
                        "PQ to PV switch budget exhausted",
                        &b.name,
                    );
                }
                continue;
            }
            *count += 1;
            b.generator_voltage_control_enabled = true;
            b.pinned_q = None;
            changed = true;
            debug!(bus = %b.id, "PQ -> PV");
        }

        if changed {
            info!(
                pv_pq = data.pv_pq_switches,
                "reactive limits changed bus types"
            );
            Ok(OuterLoopStatus::Unstable)
        } else {
            Ok(OuterLoopStatus::Stable)
        }
    }
}
