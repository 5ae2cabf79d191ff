//! # Generic Equation System
//!
//! The solver never sees buses or branches. It sees a set of *variables*
//! (unknowns such as a bus voltage magnitude), a set of *equations* (one
//! scalar constraint each, such as "active power leaving bus 3 equals its
//! scheduled injection") and, inside each equation, a list of *terms* that
//! know how to evaluate themselves and their partial derivatives.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  EquationSystem<V, E>                                                │
//! │                                                                      │
//! │   equation (element, E) ──► [ term, term, term ]                     │
//! │                                 │                                    │
//! │                                 └── variables: (element, V) ...      │
//! │                                                                      │
//! │   active equations  ──►  columns 0..m   (ordered by element, type)   │
//! │   active variables  ──►  rows    0..n   (ordered by element, type)   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A variable is *active* when at least one active term of an active
//! equation references it. Only active variables own a row of the state
//! vector; the others read their last stored value and behave as constants.
//!
//! Row/column assignment lives in a [`SystemIndex`] that is rebuilt lazily
//! after any structural change (activation of an equation or a term, or a
//! new registration). Each structural change also bumps the
//! [`EquationSystem::structure_version`], which is how the Jacobian knows it
//! must rebuild its sparsity pattern. Value-only changes (targets, stored
//! values) never touch the index.

mod system;
mod term;
mod vector;

pub use system::{EquationSystem, SystemIndex, TermId};
pub use term::{DifferenceTerm, EquationTerm, SignedVariableTerm, VariableTerm};
pub use vector::{StateVector, StateView};

use std::fmt::Debug;
use std::hash::Hash;

/// Closed set of variable quantity types for one physical domain.
pub trait VariableKind: Copy + Ord + Eq + Hash + Debug + 'static {
    /// Variable is a bus voltage magnitude (bounded by max voltage change)
    fn is_voltage_magnitude(self) -> bool {
        false
    }

    /// Variable is a bus voltage angle (bounded by max angle change)
    fn is_voltage_angle(self) -> bool {
        false
    }
}

/// Closed set of equation (constraint) types for one physical domain.
pub trait EquationKind: Copy + Ord + Eq + Hash + Debug + 'static {
    fn mismatch_category(self) -> MismatchCategory;
}

/// Physical nature of an equation mismatch, used by per-type stopping criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchCategory {
    ActivePower,
    ReactivePower,
    Voltage,
    Angle,
    Ratio,
    Susceptance,
}

/// Unknown of the system: (element number, quantity type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable<V> {
    pub element: usize,
    pub kind: V,
}

impl<V> Variable<V> {
    pub fn new(element: usize, kind: V) -> Self {
        Self { element, kind }
    }
}

/// Scalar constraint of the system: (element number, constraint type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EquationId<E> {
    pub element: usize,
    pub kind: E,
}

impl<E> EquationId<E> {
    pub fn new(element: usize, kind: E) -> Self {
        Self { element, kind }
    }
}

/// Supplies the target (right-hand side) of each equation.
///
/// Targets are read from the live network state every time a target vector
/// is built, so discrete control changes never need to touch the system.
pub trait TargetProvider<E> {
    fn target(&self, equation: EquationId<E>) -> f64;
}
