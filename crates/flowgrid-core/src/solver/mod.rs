//! Dense linear-algebra backends used to factorize the Newton Jacobian.

pub mod backend;
pub mod registry;

pub use backend::{FaerSolver, GaussSolver, LinearSystemBackend, LuFactors};
pub use registry::LinearSolverKind;
