//! Transformer voltage control: the ratio is first solved as a continuous
//! variable holding the regulated bus voltage, then rounded to the nearest
//! tap and frozen there.

use super::{nearest_step, AcOuterLoop, LoopDataStore, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::{AcVariableType, ControlMode, LfNetwork};
use crate::equations::Variable;
use flowgrid_core::FlowResult;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct TransformerVoltageData {
    /// Controllers rounded to their tap table so far
    pub discretized: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformerVoltageOuterLoop;

impl AcOuterLoop for TransformerVoltageOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::TransformerVoltageControl
    }

    fn initialize(&mut self, network: &mut LfNetwork, _data: &mut LoopDataStore) -> FlowResult<()> {
        for control in network
            .branches
            .iter_mut()
            .filter_map(|b| b.voltage_control.as_mut())
            .filter(|c| c.enabled)
        {
            control.mode = ControlMode::Continuous;
        }
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let mut rounded = 0;
        for branch in ctx.network.branches.iter_mut().filter(|b| !b.disabled) {
            let Some(control) = branch.voltage_control.as_mut() else {
                continue;
            };
            if !control.enabled || control.mode != ControlMode::Continuous {
                continue;
            }
            let rho = view.value(Variable::new(branch.num, AcVariableType::BranchRho1));
            let Some(position) = nearest_step(&control.steps, rho) else {
                continue;
            };
            control.position = position;
            control.mode = ControlMode::Discrete;
            branch.rho = control.steps[position];
            rounded += 1;
            debug!(branch = %branch.id, rho, position, "ratio rounded to tap");
        }
        if rounded == 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        ctx.data.get_or_default::<TransformerVoltageData>().discretized += rounded;
        info!(transformers = rounded, "transformer ratios rounded to taps");
        Ok(OuterLoopStatus::Unstable)
    }
}
