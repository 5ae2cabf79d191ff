//! Starting values for the Newton iterations.
//!
//! | Mode       | Voltage magnitude | Voltage angle        | Other variables |
//! |------------|-------------------|----------------------|-----------------|
//! | Uniform    | 1.0 pu            | 0 rad                | stored value    |
//! | Previous   | stored value      | stored value         | stored value    |
//! | DC values  | 1.0 pu            | DC power flow angle  | stored value    |
//!
//! The DC initializer lives in [`crate::dc`] because it needs a full DC solve.

use crate::equations::{Variable, VariableKind};

/// Chooses the initial value of every active variable.
pub trait StateInitializer<V: VariableKind> {
    /// `stored` is the value currently kept by the equation system.
    fn initial_value(&self, variable: Variable<V>, stored: f64) -> f64;
}

/// Flat start: |V| = 1 pu, θ = 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformValueInitializer;

impl<V: VariableKind> StateInitializer<V> for UniformValueInitializer {
    fn initial_value(&self, variable: Variable<V>, stored: f64) -> f64 {
        if variable.kind.is_voltage_magnitude() {
            1.0
        } else if variable.kind.is_voltage_angle() {
            0.0
        } else {
            stored
        }
    }
}

/// Warm start from the values stored by the last converged solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousValueInitializer;

impl<V: VariableKind> StateInitializer<V> for PreviousValueInitializer {
    fn initial_value(&self, _variable: Variable<V>, stored: f64) -> f64 {
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Kind {
        Magnitude,
        Angle,
        Ratio,
    }

    impl VariableKind for Kind {
        fn is_voltage_magnitude(self) -> bool {
            self == Kind::Magnitude
        }

        fn is_voltage_angle(self) -> bool {
            self == Kind::Angle
        }
    }

    #[test]
    fn uniform_start_keeps_control_variables() {
        let init = UniformValueInitializer;
        assert_eq!(init.initial_value(Variable::new(0, Kind::Magnitude), 0.97), 1.0);
        assert_eq!(init.initial_value(Variable::new(0, Kind::Angle), -0.2), 0.0);
        assert_eq!(init.initial_value(Variable::new(0, Kind::Ratio), 1.05), 1.05);
    }

    #[test]
    fn previous_start_returns_stored() {
        let init = PreviousValueInitializer;
        assert_eq!(init.initial_value(Variable::new(3, Kind::Angle), -0.2), -0.2);
    }
}
