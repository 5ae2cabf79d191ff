//! Convergence tests on the mismatch vector.

use crate::equations::{EquationId, EquationKind, MismatchCategory};
use flowgrid_core::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};

/// Outcome of a stopping test: the L2 norm is always reported for logging
/// and for the line search, whatever the criterion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoppingTest {
    pub stop: bool,
    pub norm: f64,
}

/// Per-equation-type bounds. Power bounds are in MW/MVar and converted with
/// the base MVA at test time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerEquationTypeBounds {
    pub max_active_power_mismatch_mw: f64,
    pub max_reactive_power_mismatch_mvar: f64,
    pub max_voltage_mismatch: f64,
    pub max_angle_mismatch: f64,
    pub max_ratio_mismatch: f64,
    pub max_susceptance_mismatch: f64,
}

impl Default for PerEquationTypeBounds {
    fn default() -> Self {
        Self {
            max_active_power_mismatch_mw: 1e-2,
            max_reactive_power_mismatch_mvar: 1e-2,
            max_voltage_mismatch: 1e-4,
            max_angle_mismatch: 1e-5,
            max_ratio_mismatch: 1e-5,
            max_susceptance_mismatch: 1e-4,
        }
    }
}

impl PerEquationTypeBounds {
    fn bound(&self, category: MismatchCategory, base_mva: f64) -> f64 {
        match category {
            MismatchCategory::ActivePower => self.max_active_power_mismatch_mw / base_mva,
            MismatchCategory::ReactivePower => self.max_reactive_power_mismatch_mvar / base_mva,
            MismatchCategory::Voltage => self.max_voltage_mismatch,
            MismatchCategory::Angle => self.max_angle_mismatch,
            MismatchCategory::Ratio => self.max_ratio_mismatch,
            MismatchCategory::Susceptance => self.max_susceptance_mismatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoppingCriteria {
    /// Stop when `‖mismatch‖₂ < conv_eps_per_eq · sqrt(n)` (strict).
    Uniform { conv_eps_per_eq: f64 },
    /// Stop when every mismatch is within the bound of its type.
    PerEquationType(PerEquationTypeBounds),
}

impl Default for StoppingCriteria {
    fn default() -> Self {
        StoppingCriteria::Uniform {
            conv_eps_per_eq: 1e-4,
        }
    }
}

impl StoppingCriteria {
    pub fn validate(&self) -> FlowResult<()> {
        let positive = match self {
            StoppingCriteria::Uniform { conv_eps_per_eq } => *conv_eps_per_eq > 0.0,
            StoppingCriteria::PerEquationType(b) => [
                b.max_active_power_mismatch_mw,
                b.max_reactive_power_mismatch_mvar,
                b.max_voltage_mismatch,
                b.max_angle_mismatch,
                b.max_ratio_mismatch,
                b.max_susceptance_mismatch,
            ]
            .iter()
            .all(|v| *v > 0.0),
        };
        if positive {
            Ok(())
        } else {
            Err(FlowError::Config(
                "stopping criteria thresholds must be positive".to_string(),
            ))
        }
    }

    /// `equations` gives the equation of each mismatch column.
    pub fn test<E: EquationKind>(
        &self,
        mismatch: &[f64],
        equations: &[EquationId<E>],
        base_mva: f64,
    ) -> StoppingTest {
        let norm = mismatch.iter().map(|m| m * m).sum::<f64>().sqrt();
        let stop = match self {
            StoppingCriteria::Uniform { conv_eps_per_eq } => {
                mismatch.is_empty() || norm < conv_eps_per_eq * (mismatch.len() as f64).sqrt()
            }
            StoppingCriteria::PerEquationType(bounds) => {
                norm.is_finite()
                    && mismatch.iter().zip(equations).all(|(m, eq)| {
                        m.abs() < bounds.bound(eq.kind.mismatch_category(), base_mva)
                    })
            }
        };
        StoppingTest { stop, norm }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Kind {
        P,
        V,
    }

    impl EquationKind for Kind {
        fn mismatch_category(self) -> MismatchCategory {
            match self {
                Kind::P => MismatchCategory::ActivePower,
                Kind::V => MismatchCategory::Voltage,
            }
        }
    }

    fn equations() -> Vec<EquationId<Kind>> {
        vec![EquationId::new(0, Kind::P), EquationId::new(0, Kind::V)]
    }

    #[test]
    fn uniform_boundary_is_not_converged() {
        let criteria = StoppingCriteria::Uniform {
            conv_eps_per_eq: 0.5,
        };
        // norm = sqrt(0.25 + 0.25) = 0.5 * sqrt(2) exactly at the bound
        let at_bound = criteria.test(&[0.5, 0.5], &equations(), 100.0);
        assert!(!at_bound.stop);

        let below = criteria.test(&[0.5, 0.49], &equations(), 100.0);
        assert!(below.stop);
    }

    #[test]
    fn uniform_on_empty_system_stops() {
        let test = StoppingCriteria::default().test::<Kind>(&[], &[], 100.0);
        assert!(test.stop);
        assert_eq!(test.norm, 0.0);
    }

    #[test]
    fn per_type_converts_power_bounds_with_base() {
        let criteria = StoppingCriteria::PerEquationType(PerEquationTypeBounds::default());
        // 0.005 MW on a 100 MVA base is 5e-5 pu < 1e-4 pu
        let ok = criteria.test(&[5e-5, 5e-5], &equations(), 100.0);
        assert!(ok.stop);
        // 0.02 MW is above the 0.01 MW bound
        let power_off = criteria.test(&[2e-4, 0.0], &equations(), 100.0);
        assert!(!power_off.stop);
        let voltage_off = criteria.test(&[0.0, 2e-4], &equations(), 100.0);
        assert!(!voltage_off.stop);
    }

    #[test]
    fn non_positive_thresholds_are_rejected() {
        let criteria = StoppingCriteria::Uniform {
            conv_eps_per_eq: 0.0,
        };
        assert!(matches!(criteria.validate(), Err(FlowError::Config(_))));
    }

    #[test]
    fn criteria_deserializes_from_tagged_json() {
        let json = r#"{"type":"uniform","conv_eps_per_eq":1e-6}"#;
        let criteria: StoppingCriteria = serde_json::from_str(json).unwrap();
        assert_eq!(
            criteria,
            StoppingCriteria::Uniform {
                conv_eps_per_eq: 1e-6
            }
        );
    }
}
