//! Shunt voltage control: susceptance solved continuously against the
//! regulated bus voltage, then rounded to the nearest section count.

use super::{nearest_step, AcOuterLoop, LoopDataStore, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::{AcVariableType, ControlMode, LfNetwork};
use crate::equations::Variable;
use flowgrid_core::FlowResult;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ShuntVoltageData {
    pub discretized: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShuntVoltageOuterLoop;

impl AcOuterLoop for ShuntVoltageOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::ShuntVoltageControl
    }

    fn initialize(&mut self, network: &mut LfNetwork, _data: &mut LoopDataStore) -> FlowResult<()> {
        for control in network
            .shunts
            .iter_mut()
            .filter_map(|s| s.voltage_control.as_mut())
            .filter(|c| c.enabled)
        {
            control.mode = ControlMode::Continuous;
        }
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let mut rounded = 0;
        for shunt in ctx.network.shunts.iter_mut() {
            let Some(control) = shunt.voltage_control.as_mut() else {
                continue;
            };
            if !control.enabled || control.mode != ControlMode::Continuous {
                continue;
            }
            let b = view.value(Variable::new(shunt.num, AcVariableType::ShuntB));
            let Some(section) = nearest_step(&shunt.sections, b) else {
                continue;
            };
            control.mode = ControlMode::Discrete;
            shunt.section = section;
            shunt.b = shunt.sections[section];
            rounded += 1;
            debug!(shunt = %shunt.id, b, section, "susceptance rounded to section");
        }
        if rounded == 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        ctx.data.get_or_default::<ShuntVoltageData>().discretized += rounded;
        info!(shunts = rounded, "shunt susceptances rounded to sections");
        Ok(OuterLoopStatus::Unstable)
    }
}
