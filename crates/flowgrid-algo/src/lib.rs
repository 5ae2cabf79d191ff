//! # flowgrid-algo: Nonlinear Load Flow Engine
//!
//! Solves the steady state of an electrical network as a sparse system of
//! nonlinear power balance equations, with discrete controls coordinated
//! around the Newton iteration.
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`equations`] | Variables, equations, terms and their row/column index |
//! | [`jacobian`] | Sparse Jacobian image and LU factorization through a [`flowgrid_core::LinearSystemBackend`] |
//! | [`newton`] | Newton-Raphson and Newton-Krylov behind [`newton::NonlinearSolver`] |
//! | [`initializer`] | Flat start and previous-solution state vectors |
//! | [`ac`], [`dc`] | Physical term libraries and the solver-side network |
//! | [`outer_loop`] | Discrete control state machines |
//! | [`loadflow`] | [`AcLoadFlowEngine`], the entry point |
//!
//! The generic layers know nothing about power systems: terms are black
//! boxes evaluated at a state vector, and any closed enum of quantity types
//! can index them.
//!
//! ## Example
//!
//! ```ignore
//! use flowgrid_algo::{AcLoadFlowEngine, AcLoadFlowParameters, LfNetwork, LfNetworkParameters};
//! use flowgrid_core::Diagnostics;
//!
//! let mut diagnostics = Diagnostics::new();
//! let mut lf = LfNetwork::build(&network, &LfNetworkParameters::default(), &mut diagnostics)?;
//! let result = AcLoadFlowEngine::new(&mut lf, AcLoadFlowParameters::default())?.run()?;
//! assert!(result.is_ok());
//! ```

pub mod ac;
pub mod dc;
pub mod equations;
pub mod initializer;
pub mod jacobian;
pub mod loadflow;
pub mod newton;
pub mod outer_loop;

pub use ac::{AcEquationSystem, AcEquationType, AcVariableType, LfNetwork, LfNetworkParameters};
pub use dc::{DcEquationSystem, DcValueInitializer};
pub use equations::{EquationId, EquationSystem, EquationTerm, StateVector, Variable};
pub use initializer::{PreviousValueInitializer, StateInitializer, UniformValueInitializer};
pub use jacobian::JacobianMatrix;
pub use loadflow::{
    AcLoadFlowEngine, AcLoadFlowParameters, AcLoadFlowResult, NonlinearSolverKind, VoltageInitMode,
};
pub use newton::{
    KrylovParameters, NewtonKrylov, NewtonRaphson, NewtonRaphsonParameters, NonlinearSolver,
    SolverObserver, SolverStatus,
};
pub use outer_loop::{AcOuterLoop, OuterLoopKind, OuterLoopParameters, OuterLoopStatus};
