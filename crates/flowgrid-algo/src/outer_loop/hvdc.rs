//! HVDC AC emulation: a link follows `P = P0 + k (θ1 − θ2)` until the
//! emulated transfer exceeds its directional limit, then it is held at that
//! limit until the angle difference brings it back inside.

use super::{AcOuterLoop, LoopDataStore, OuterLoopContext, OuterLoopKind, OuterLoopStatus};
use crate::ac::{HvdcDirection, HvdcMode, LfHvdc, LfNetwork};
use flowgrid_core::FlowResult;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct HvdcData {
    /// Mode switches per link
    pub switches: HashMap<usize, usize>,
    /// Links kept in their last mode
    pub frozen: HashSet<usize>,
}

#[derive(Debug, Clone)]
pub struct HvdcAcEmulationOuterLoop {
    max_mode_switches: usize,
}

impl HvdcAcEmulationOuterLoop {
    pub fn new(max_mode_switches: usize) -> Self {
        Self { max_mode_switches }
    }
}

/// Mode the link should be in given its emulated transfer `p_linear`.
fn next_mode(hvdc: &LfHvdc, p_linear: f64) -> HvdcMode {
    match hvdc.mode {
        HvdcMode::Linear if p_linear > hvdc.max_p_1_to_2 => HvdcMode::Saturated {
            p: hvdc.max_p_1_to_2,
            direction: HvdcDirection::OneToTwo,
        },
        HvdcMode::Linear if p_linear < -hvdc.max_p_2_to_1 => HvdcMode::Saturated {
            p: -hvdc.max_p_2_to_1,
            direction: HvdcDirection::TwoToOne,
        },
        HvdcMode::Saturated {
            direction: HvdcDirection::OneToTwo,
            ..
        } if p_linear < hvdc.max_p_1_to_2 => HvdcMode::Linear,
        HvdcMode::Saturated {
            direction: HvdcDirection::TwoToOne,
            ..
        } if p_linear > -hvdc.max_p_2_to_1 => HvdcMode::Linear,
        mode => mode,
    }
}

impl AcOuterLoop for HvdcAcEmulationOuterLoop {
    fn kind(&self) -> OuterLoopKind {
        OuterLoopKind::HvdcAcEmulation
    }

    fn initialize(&mut self, network: &mut LfNetwork, _data: &mut LoopDataStore) -> FlowResult<()> {
        for hvdc in network.hvdcs.iter_mut() {
            hvdc.mode = HvdcMode::Linear;
        }
        Ok(())
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> FlowResult<OuterLoopStatus> {
        let view = ctx.view();
        let data = ctx.data.get_or_default::<HvdcData>();
        let mut status = OuterLoopStatus::Stable;

        for hvdc in ctx.network.hvdcs.iter_mut().filter(|h| !h.disabled) {
            if data.frozen.contains(&hvdc.num) {
                continue;
            }
            let dphi = ctx.system.bus_phi(hvdc.bus1, &view) - ctx.system.bus_phi(hvdc.bus2, &view);
            let p_linear = hvdc.p0 + hvdc.k * dphi;
            let mode = next_mode(hvdc, p_linear);
            if mode == hvdc.mode {
                continue;
            }
            let switches = data.switches.entry(hvdc.num).or_insert(0);
            if *switches >= self.max_mode_switches {
                data.frozen.insert(hvdc.num);
                warn!(
                    hvdc = %hvdc.id,
                    switches = *switches,
                    mode = ?hvdc.mode,
                    "HVDC link keeps switching mode, frozen"
                );
                ctx.diagnostics.add_warning_with_entity(
                    "hvdc",
                    "mode frozen after too many switches",
                    &hvdc.name,
                );
                continue;
            }
            *switches += 1;
            debug!(hvdc = %hvdc.id, p_linear, from = ?hvdc.mode, to = ?mode, "HVDC mode switch");
            hvdc.mode = mode;
            status = OuterLoopStatus::Unstable;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_core::HvdcId;

    fn link(mode: HvdcMode) -> LfHvdc {
        LfHvdc {
            id: HvdcId::new(1),
            name: "dc".into(),
            num: 0,
            bus1: 0,
            bus2: 1,
            p0: 0.5,
            k: 10.0,
            max_p_1_to_2: 1.0,
            max_p_2_to_1: 0.8,
            mode,
            disabled: false,
        }
    }

    fn saturated(p: f64, direction: HvdcDirection) -> HvdcMode {
        HvdcMode::Saturated { p, direction }
    }

    #[test]
    fn linear_link_saturates_in_both_directions() {
        let hvdc = link(HvdcMode::Linear);
        assert_eq!(next_mode(&hvdc, 1.2), saturated(1.0, HvdcDirection::OneToTwo));
        assert_eq!(next_mode(&hvdc, -0.9), saturated(-0.8, HvdcDirection::TwoToOne));
        assert_eq!(next_mode(&hvdc, 0.7), HvdcMode::Linear);
    }

    #[test]
    fn saturated_link_returns_to_linear_inside_limits() {
        let hvdc = link(saturated(1.0, HvdcDirection::OneToTwo));
        assert_eq!(next_mode(&hvdc, 1.5), hvdc.mode);
        assert_eq!(next_mode(&hvdc, 0.9), HvdcMode::Linear);
        let hvdc = link(saturated(-0.8, HvdcDirection::TwoToOne));
        assert_eq!(next_mode(&hvdc, -1.0), hvdc.mode);
        assert_eq!(next_mode(&hvdc, 0.0), HvdcMode::Linear);
    }

    #[test]
    fn zero_limit_saturation_can_be_left() {
        let mut hvdc = link(saturated(0.0, HvdcDirection::OneToTwo));
        hvdc.max_p_1_to_2 = 0.0;
        assert_eq!(next_mode(&hvdc, 0.3), hvdc.mode);
        assert_eq!(next_mode(&hvdc, -0.3), HvdcMode::Linear);

        let mut hvdc = link(saturated(0.0, HvdcDirection::TwoToOne));
        hvdc.max_p_2_to_1 = 0.0;
        assert_eq!(next_mode(&hvdc, -0.3), hvdc.mode);
        assert_eq!(next_mode(&hvdc, 0.3), HvdcMode::Linear);
    }
}
