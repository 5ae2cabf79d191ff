//! Unit newtypes for the input network model.
//!
//! The input model speaks engineering units (MW, Mvar, kV, degrees) while the
//! solver works exclusively in per-unit on a system MVA base. Keeping the two
//! apart at the type level means a megawatt figure cannot silently end up in
//! an equation target: it has to go through [`Megawatts::to_per_unit`].
//!
//! ```
//! use flowgrid_core::units::{Degrees, Megawatts};
//!
//! let p = Megawatts(50.0) + Megawatts(20.0);
//! assert!((p.to_per_unit(100.0) - 0.7).abs() < 1e-12);
//!
//! let shift = Degrees(30.0).to_radians();
//! assert!((shift.sin() - 0.5).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Mul, Neg, Sub};

/// Declares a transparent `f64` quantity with its symbol, linear arithmetic
/// and display.
macro_rules! quantity {
    ($(#[$doc:meta])* $name:ident, $symbol:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub f64);

        impl $name {
            pub const SYMBOL: &'static str = $symbol;

            #[inline]
            pub const fn value(self) -> f64 {
                self.0
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                $name(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                $name(self.0 - rhs.0)
            }
        }

        impl Neg for $name {
            type Output = Self;
            fn neg(self) -> Self {
                $name(-self.0)
            }
        }

        impl Mul<f64> for $name {
            type Output = Self;
            fn mul(self, k: f64) -> Self {
                $name(self.0 * k)
            }
        }

        impl Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                $name(iter.fold(0.0, |acc, q| acc + q.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} {}", self.0, $symbol)
            }
        }
    };
}

quantity!(
    /// Active power (MW)
    Megawatts,
    "MW"
);
quantity!(
    /// Reactive power (Mvar)
    Megavars,
    "Mvar"
);
quantity!(
    /// Voltage relative to the bus nominal voltage
    PerUnit,
    "pu"
);
quantity!(
    /// Nominal voltage (kV)
    Kilovolts,
    "kV"
);
quantity!(Radians, "rad");
quantity!(
    /// Angle as found on tap changer nameplates
    Degrees,
    "deg"
);

macro_rules! power_on_base {
    ($($name:ident),*) => {$(
        impl $name {
            /// Per-unit value on the given system base.
            #[inline]
            pub fn to_per_unit(self, base_mva: f64) -> f64 {
                self.0 / base_mva
            }
        }
    )*};
}

power_on_base!(Megawatts, Megavars);

impl Radians {
    #[inline]
    pub fn sin(self) -> f64 {
        self.0.sin()
    }

    #[inline]
    pub fn cos(self) -> f64 {
        self.0.cos()
    }
}

impl Degrees {
    #[inline]
    pub fn to_radians(self) -> Radians {
        Radians(self.0.to_radians())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_adds_up_on_system_base() {
        let units = [Megawatts(120.0), Megawatts(-20.0), Megawatts(40.0)];
        let total: Megawatts = units.into_iter().sum();
        assert_eq!(total, Megawatts(140.0));
        assert!((total.to_per_unit(100.0) - 1.4).abs() < 1e-12);
        assert_eq!((-total * 0.5).value(), -70.0);
    }

    #[test]
    fn absorbed_reactive_power_is_negative_per_unit() {
        let q = Megavars(10.0) - Megavars(45.0);
        assert!((q.to_per_unit(100.0) + 0.35).abs() < 1e-12);
    }

    #[test]
    fn nameplate_degrees_become_radians() {
        let half_turn = Degrees(180.0).to_radians();
        assert!((half_turn.value() - std::f64::consts::PI).abs() < 1e-12);
        assert!((half_turn.cos() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn display_carries_the_symbol() {
        assert_eq!(Kilovolts(400.0).to_string(), "400 kV");
        assert_eq!(PerUnit(1.05).to_string(), "1.05 pu");
        assert_eq!(Degrees::SYMBOL, "deg");
    }
}
