//! Phase shifter taps driven by the flow or current at side 1.
//!
//! The tap move comes from the Jacobian sensitivity of the controlled
//! quantity to the phase shift, `dα = (target − value) / (dvalue/dα)`,
//! rounded to the tap table. A controller still outside its deadband moves
//! at least one tap, so a table too coarse for the deadband makes it hunt
//! until the [`DirectionLimiter`] freezes it.

use super::{nearest_step, AcOuterLoop, LoopDataStore, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::{AcEquationType, LfNetwork};
use crate::equations::EquationId;
use flowgrid_core::{FlowResult, PhaseRegulationMode};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Counts direction reversals per controller and freezes a controller once
/// it reverses more than `budget` times.
#[derive(Debug, Clone, Default)]
pub struct DirectionLimiter {
    budget: usize,
    last: HashMap<usize, i8>,
    changes: HashMap<usize, usize>,
    frozen: HashSet<usize>,
}

impl DirectionLimiter {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Record a move of `controller` in `direction` (sign only). Returns
    /// false if the controller is, or just became, frozen.
    pub fn allow(&mut self, controller: usize, direction: i8) -> bool {
        if self.frozen.contains(&controller) {
            return false;
        }
        let direction = direction.signum();
        if let Some(previous) = self.last.get(&controller) {
            if *previous != direction {
                let changes = self.changes.entry(controller).or_insert(0);
                *changes += 1;
                if *changes > self.budget {
                    self.frozen.insert(controller);
                    return false;
                }
            }
        }
        self.last.insert(controller, direction);
        true
    }

    pub fn is_frozen(&self, controller: usize) -> bool {
        self.frozen.contains(&controller)
    }

    pub fn direction_changes(&self, controller: usize) -> usize {
        self.changes.get(&controller).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseControlData {
    pub limiter: DirectionLimiter,
    /// Tap moves applied so far
    pub moves: usize,
}

#[derive(Debug, Clone)]
pub struct PhaseControlOuterLoop {
    max_direction_changes: usize,
}

impl PhaseControlOuterLoop {
    pub fn new(max_direction_changes: usize) -> Self {
        Self { max_direction_changes }
    }
}

struct TapMove {
    branch: usize,
    position: usize,
    direction: i8,
}

/// Tap position reaching `desired`, at least one step away from `current`
/// when `force` is set.
fn next_position(steps: &[f64], current: usize, desired: f64, force: bool) -> Option<usize> {
    let nearest = nearest_step(steps, desired)?;
    if nearest != current || !force {
        return Some(nearest);
    }
    let alpha = *steps.get(current)?;
    let toward = desired > alpha;
    [current.checked_add(1), current.checked_sub(1)]
        .into_iter()
        .flatten()
        .find(|i| steps.get(*i).is_some_and(|a| (*a > alpha) == toward))
}

impl AcOuterLoop for PhaseControlOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::PhaseControl
    }

    fn initialize(&mut self, _network: &mut LfNetwork, data: &mut LoopDataStore) -> FlowResult<()> {
        data.get_or_default::<PhaseControlData>().limiter =
            DirectionLimiter::new(self.max_direction_changes);
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let mut moves = Vec::new();

        for branch in ctx.network.branches.iter() {
            if branch.disabled || !branch.is_phase_controlled() {
                continue;
            }
            let Some(pc) = &branch.phase_control else {
                continue;
            };
            let (value, gradient, force) = match pc.mode {
                PhaseRegulationMode::ActivePowerControl => {
                    let Some(p1) = ctx.system.branch_p1(branch.num, &view) else {
                        continue;
                    };
                    if (p1 - pc.target).abs() <= pc.deadband / 2.0 {
                        continue;
                    }
                    (p1, ctx.system.branch_p1_gradient(branch.num, &view), true)
                }
                PhaseRegulationMode::CurrentLimiter => {
                    let Some(i1) = ctx.system.branch_i1(ctx.network, branch.num, &view) else {
                        continue;
                    };
                    if i1 <= pc.target {
                        continue;
                    }
                    (i1, ctx.system.branch_i1_gradient(ctx.network, branch.num, &view), true)
                }
                PhaseRegulationMode::Fixed => continue,
            };

            let equation = EquationId::new(branch.num, AcEquationType::BranchTargetAlpha1);
            let sensitivity = match ctx.sensitivity(&gradient, equation)? {
                Some(s) if s.abs() > 1e-9 => s,
                _ => {
                    debug!(branch = %branch.id, "phase shifter has no influence on its controlled quantity");
                    continue;
                }
            };
            let desired = pc.alpha() + (pc.target - value) / sensitivity;
            let Some(position) = next_position(&pc.steps, pc.position, desired, force) else {
                continue;
            };
            if position == pc.position {
                continue;
            }
            let direction = if pc.steps[position] > pc.alpha() { 1 } else { -1 };
            moves.push(TapMove {
                branch: branch.num,
                position,
                direction,
            });
        }

        let data = ctx.data.get_or_default::<PhaseControlData>();
        let mut status = OuterLoopStatus::Stable;
        for tap in moves {
            let branch = &mut ctx.network.branches[tap.branch];
            let was_frozen = data.limiter.is_frozen(tap.branch);
            if !data.limiter.allow(tap.branch, tap.direction) {
                if !was_frozen {
                    warn!(
                        branch = %branch.id,
                        changes = data.limiter.direction_changes(tap.branch),
                        "phase shifter keeps reversing, tap frozen"
                    );
                    ctx.diagnostics.add_warning_with_entity(
                        "phase-control",
                        "tap frozen after too many direction changes",
                        &branch.name,
                    );
                }
                continue;
            }
            let Some(pc) = branch.phase_control.as_mut() else {
                continue;
            };
            debug!(branch = %branch.id, from = pc.position, to = tap.position, "phase tap move");
            pc.position = tap.position;
            branch.alpha = pc.alpha();
            data.moves += 1;
            status = OuterLoopStatus::Unstable;
        }
        if status == OuterLoopStatus::Unstable {
            info!(moves = data.moves, "phase shifter taps moved");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_direction_moves_are_free() {
        let mut limiter = DirectionLimiter::new(0);
        assert!(limiter.allow(4, 1));
        assert!(limiter.allow(4, 1));
        assert!(limiter.allow(4, 1));
        assert_eq!(limiter.direction_changes(4), 0);
    }

    #[test]
    fn hunting_controller_is_frozen_after_budget() {
        let mut limiter = DirectionLimiter::new(2);
        assert!(limiter.allow(0, 1));
        assert!(limiter.allow(0, -1));
        assert!(limiter.allow(0, 1));
        assert!(!limiter.allow(0, -1));
        assert!(limiter.is_frozen(0));
        // frozen for good, whatever the direction
        assert!(!limiter.allow(0, -1));
        assert!(!limiter.allow(0, 1));
        // other controllers are unaffected
        assert!(limiter.allow(1, -1));
    }

    #[test]
    fn forced_move_leaves_current_tap() {
        let steps = [-0.1, 0.0, 0.1];
        assert_eq!(next_position(&steps, 1, 0.02, false), Some(1));
        assert_eq!(next_position(&steps, 1, 0.02, true), Some(2));
        assert_eq!(next_position(&steps, 1, -0.02, true), Some(0));
        assert_eq!(next_position(&steps, 2, 0.3, true), None);
    }
}
