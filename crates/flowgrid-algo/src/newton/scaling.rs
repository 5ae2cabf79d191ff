//! Step scaling strategies applied to each Newton step `Δx`.
//!
//! The solver applies `x ← x − Δx` after [`StateVectorScaling::scale_step`],
//! then gives the strategy a chance to pull the candidate back along the
//! same direction in [`StateVectorScaling::update_state`].

use super::stopping::StoppingTest;
use crate::equations::{StateVector, Variable, VariableKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateVectorScalingMode {
    /// Full Newton step
    #[default]
    None,
    LineSearch,
    MaxVoltageChange,
}

impl StateVectorScalingMode {
    pub fn from_str(input: &str) -> anyhow::Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "line_search" | "linesearch" => Ok(Self::LineSearch),
            "max_voltage_change" => Ok(Self::MaxVoltageChange),
            other => Err(anyhow::anyhow!("unknown state vector scaling '{}'", other)),
        }
    }
}

pub trait StateVectorScaling<V: VariableKind> {
    fn mode(&self) -> StateVectorScalingMode;

    /// Called once with the test of the initial state.
    fn start(&mut self, _initial: &StoppingTest) {}

    /// Rescale the raw Newton step before it is applied.
    fn scale_step(&mut self, _step: &mut [f64], _variables: &[Variable<V>]) {}

    /// Accept or shrink the applied step. `evaluate` recomputes the stopping
    /// test at a state. Returns the test of the state finally kept.
    fn update_state(
        &mut self,
        _state: &mut StateVector,
        _step: &[f64],
        test: StoppingTest,
        _evaluate: &mut dyn FnMut(&[f64]) -> StoppingTest,
    ) -> StoppingTest {
        test
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoScaling;

impl<V: VariableKind> StateVectorScaling<V> for NoScaling {
    fn mode(&self) -> StateVectorScalingMode {
        StateVectorScalingMode::None
    }
}

/// Backtracking on the mismatch norm.
///
/// While the candidate norm exceeds the last accepted norm, the step length
/// is divided by `fold`, at most `max_steps` times.
#[derive(Debug, Clone)]
pub struct LineSearchScaling {
    max_steps: usize,
    fold: f64,
    last_norm: f64,
}

impl LineSearchScaling {
    pub fn new(max_steps: usize, fold: f64) -> Self {
        Self {
            max_steps,
            fold,
            last_norm: f64::INFINITY,
        }
    }
}

impl<V: VariableKind> StateVectorScaling<V> for LineSearchScaling {
    fn mode(&self) -> StateVectorScalingMode {
        StateVectorScalingMode::LineSearch
    }

    fn start(&mut self, initial: &StoppingTest) {
        self.last_norm = initial.norm;
    }

    fn update_state(
        &mut self,
        state: &mut StateVector,
        step: &[f64],
        test: StoppingTest,
        evaluate: &mut dyn FnMut(&[f64]) -> StoppingTest,
    ) -> StoppingTest {
        let mut test = test;
        let mut mu = 1.0;
        let mut reductions = 0;
        // non-finite norms compare false, so they are shrunk as well
        while !(test.norm <= self.last_norm) && reductions < self.max_steps {
            let next_mu = mu / self.fold;
            // x0 − mu·Δx  →  x0 − next_mu·Δx
            state.add_scaled(mu - next_mu, step);
            mu = next_mu;
            reductions += 1;
            test = evaluate(&state[..]);
            debug!(mu, norm = test.norm, "line search step reduction");
        }
        self.last_norm = test.norm;
        test
    }
}

/// Uniform step scaling bounding the largest voltage magnitude and angle
/// changes of one iteration.
#[derive(Debug, Clone)]
pub struct MaxVoltageChangeScaling {
    max_dv: f64,
    max_dphi: f64,
}

impl MaxVoltageChangeScaling {
    pub fn new(max_dv: f64, max_dphi: f64) -> Self {
        Self { max_dv, max_dphi }
    }
}

impl<V: VariableKind> StateVectorScaling<V> for MaxVoltageChangeScaling {
    fn mode(&self) -> StateVectorScalingMode {
        StateVectorScalingMode::MaxVoltageChange
    }

    fn scale_step(&mut self, step: &mut [f64], variables: &[Variable<V>]) {
        let mut factor: f64 = 1.0;
        for (dx, variable) in step.iter().zip(variables) {
            let bound = if variable.kind.is_voltage_magnitude() {
                self.max_dv
            } else if variable.kind.is_voltage_angle() {
                self.max_dphi
            } else {
                continue;
            };
            if dx.abs() > bound {
                factor = factor.min(bound / dx.abs());
            }
        }
        if factor < 1.0 {
            debug!(factor, "voltage change limited");
            step.iter_mut().for_each(|dx| *dx *= factor);
        }
    }
}
