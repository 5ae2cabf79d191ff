//! Secondary voltage control: each zone holds its pilot bus voltage by
//! shifting the voltage targets of its generators together.

use super::{AcOuterLoop, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::{AcEquationType, AcVariableType};
use crate::equations::{EquationId, Variable};
use flowgrid_core::FlowResult;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct SecondaryVoltageData {
    /// Target shifts applied so far, all zones together
    pub adjustments: usize,
}

#[derive(Debug, Clone)]
pub struct SecondaryVoltageOuterLoop {
    /// Pilot voltage deviation tolerated (pu)
    pub tolerance: f64,
    pub min_target_v: f64,
    pub max_target_v: f64,
}

impl Default for SecondaryVoltageOuterLoop {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            min_target_v: 0.8,
            max_target_v: 1.2,
        }
    }
}

impl AcOuterLoop for SecondaryVoltageOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::SecondaryVoltageControl
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let mut status = OuterLoopStatus::Stable;

        for z in 0..ctx.network.zones.len() {
            let zone = &ctx.network.zones[z];
            if ctx.network.buses[zone.pilot_bus].disabled {
                continue;
            }
            let pilot_v = ctx.system.bus_v(zone.pilot_bus, &view);
            let deviation = zone.target_v - pilot_v;
            if deviation.abs() <= self.tolerance {
                continue;
            }

            let mut controlled: Vec<usize> = zone
                .generators
                .iter()
                .map(|g| ctx.network.generators[*g].bus)
                .filter(|b| ctx.network.buses[*b].is_generator_voltage_controlled())
                .collect();
            controlled.sort_unstable();
            controlled.dedup();
            if controlled.is_empty() {
                debug!(zone = %zone.name, "no generator left to control the pilot bus");
                continue;
            }

            let pilot = Variable::new(zone.pilot_bus, AcVariableType::BusV);
            let z_vec = ctx.sensitivities(&[(pilot, 1.0)])?;
            let sensitivity: f64 = controlled
                .iter()
                .filter_map(|b| ctx.column(EquationId::new(*b, AcEquationType::BusTargetV)))
                .map(|column| z_vec[column])
                .sum();
            if sensitivity.abs() < 1e-9 {
                continue;
            }
            let shift = deviation / sensitivity;
            let zone_name = zone.name.clone();

            let mut moved = false;
            for bus in controlled {
                let Some(control) = ctx.network.buses[bus].voltage_control.as_mut() else {
                    continue;
                };
                let new_target =
                    (control.target_v + shift).clamp(self.min_target_v, self.max_target_v);
                if (new_target - control.target_v).abs() > 1e-9 {
                    control.target_v = new_target;
                    moved = true;
                    let generators = control.controllers.clone();
                    for g in generators {
                        ctx.network.generators[g].target_v = Some(new_target);
                    }
                }
            }
            if moved {
                info!(
                    zone = %zone_name,
                    pilot_v,
                    shift,
                    "secondary voltage control shifted generator targets"
                );
                ctx.data.get_or_default::<SecondaryVoltageData>().adjustments += 1;
                status = OuterLoopStatus::Unstable;
            }
        }
        Ok(status)
    }
}
