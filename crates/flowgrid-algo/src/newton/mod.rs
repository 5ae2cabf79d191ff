//! # Newton-type Solvers
//!
//! Both backends solve `F(x) = Equation(x) − Target = 0` over the active
//! rows of an [`EquationSystem`] and share one contract,
//! [`NonlinearSolver::run`].
//!
//! ```text
//!            ┌────────────────────────────────────────────┐
//!            │ x ← initializer                            │
//!            │ F ← Equation(x) − Target                   │
//!            └──────────────────────┬─────────────────────┘
//!                                   ▼
//!   ┌──────────────► stopping test on F ──── stop ───► CONVERGED
//!   │                               │
//!   │                  iterations ≥ max ─────────────► MAX_ITERATION_REACHED
//!   │                               │
//!   │              factorize J, solve J·Δx = F ─ err ► SOLVER_FAILED
//!   │                               │
//!   │              scale Δx, x ← x − Δx
//!   │              F ← Equation(x) − Target
//!   │              line search may shrink the step
//!   └───────────────────────────────┘
//! ```
//!
//! * [`NewtonRaphson`]: direct LU solve of each step on the shared
//!   [`JacobianMatrix`].
//! * [`krylov::NewtonKrylov`]: argmin-driven iteration, each step solved by
//!   restarted GMRES on the sparse Jacobian image.
//!
//! Non-convergence is a status, not an error. A failed linear solve ends the
//! run with [`SolverStatus::SolverFailed`] and is never retried.

pub mod krylov;
pub mod observer;
pub mod scaling;
pub mod stopping;

pub use krylov::{KrylovParameters, NewtonKrylov};
pub use observer::{NoOpObserver, SolverObserver};
pub use scaling::{
    LineSearchScaling, MaxVoltageChangeScaling, NoScaling, StateVectorScaling,
    StateVectorScalingMode,
};
pub use stopping::{PerEquationTypeBounds, StoppingCriteria, StoppingTest};

use crate::equations::{
    EquationId, EquationKind, EquationSystem, StateVector, TargetProvider, VariableKind,
};
use crate::initializer::StateInitializer;
use crate::jacobian::JacobianMatrix;
use flowgrid_core::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Newton-Raphson configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonRaphsonParameters {
    pub max_iterations: usize,
    pub stopping_criteria: StoppingCriteria,
    pub state_vector_scaling: StateVectorScalingMode,
    /// Maximum number of step reductions of the line search
    pub line_search_max_steps: usize,
    /// Step length divisor of the line search
    pub line_search_fold: f64,
    /// Largest voltage magnitude change per iteration (pu)
    pub max_voltage_change: f64,
    /// Largest voltage angle change per iteration (rad)
    pub max_angle_change: f64,
    /// Base used to convert MW/MVar stopping bounds
    pub base_mva: f64,
}

impl Default for NewtonRaphsonParameters {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            stopping_criteria: StoppingCriteria::default(),
            state_vector_scaling: StateVectorScalingMode::None,
            line_search_max_steps: 10,
            line_search_fold: 2.0,
            max_voltage_change: 0.1,
            max_angle_change: 10f64.to_radians(),
            base_mva: 100.0,
        }
    }
}

impl NewtonRaphsonParameters {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_stopping_criteria(mut self, criteria: StoppingCriteria) -> Self {
        self.stopping_criteria = criteria;
        self
    }

    pub fn with_state_vector_scaling(mut self, mode: StateVectorScalingMode) -> Self {
        self.state_vector_scaling = mode;
        self
    }

    pub fn with_max_voltage_change(mut self, max_dv: f64, max_dphi: f64) -> Self {
        self.max_voltage_change = max_dv;
        self.max_angle_change = max_dphi;
        self
    }

    pub fn with_base_mva(mut self, base_mva: f64) -> Self {
        self.base_mva = base_mva;
        self
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.max_iterations == 0 {
            return Err(FlowError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.line_search_fold <= 1.0 {
            return Err(FlowError::Config(format!(
                "line_search_fold must be > 1, got {}",
                self.line_search_fold
            )));
        }
        if self.max_voltage_change <= 0.0 || self.max_angle_change <= 0.0 {
            return Err(FlowError::Config(
                "max voltage and angle changes must be positive".to_string(),
            ));
        }
        if self.base_mva <= 0.0 {
            return Err(FlowError::Config(format!(
                "base_mva must be positive, got {}",
                self.base_mva
            )));
        }
        self.stopping_criteria.validate()
    }

    /// Fresh scaling strategy for one run.
    pub fn create_scaling<V: VariableKind>(&self) -> Box<dyn StateVectorScaling<V>> {
        match self.state_vector_scaling {
            StateVectorScalingMode::None => Box::new(NoScaling),
            StateVectorScalingMode::LineSearch => Box::new(LineSearchScaling::new(
                self.line_search_max_steps,
                self.line_search_fold,
            )),
            StateVectorScalingMode::MaxVoltageChange => Box::new(MaxVoltageChangeScaling::new(
                self.max_voltage_change,
                self.max_angle_change,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolverStatus {
    Converged,
    MaxIterationReached,
    SolverFailed,
    NoCalculation,
}

impl SolverStatus {
    pub fn is_ok(self) -> bool {
        self == SolverStatus::Converged
    }
}

impl std::fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SolverStatus::Converged => "CONVERGED",
            SolverStatus::MaxIterationReached => "MAX_ITERATION_REACHED",
            SolverStatus::SolverFailed => "SOLVER_FAILED",
            SolverStatus::NoCalculation => "NO_CALCULATION",
        };
        f.write_str(label)
    }
}

/// Outcome of one inner solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverResult {
    pub status: SolverStatus,
    pub iterations: usize,
    /// `eval(slack P balance) − target` at the final state (pu)
    pub slack_bus_active_power_mismatch: f64,
}

/// Result plus the final state vector (valid for every status).
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub result: SolverResult,
    pub state: StateVector,
}

/// Everything one inner solve borrows.
pub struct SolverContext<'a, V: VariableKind, E: EquationKind> {
    pub system: &'a EquationSystem<V, E>,
    pub targets: &'a dyn TargetProvider<E>,
    pub jacobian: &'a mut JacobianMatrix,
    pub observer: &'a mut dyn SolverObserver,
    /// Active power balance of the slack bus, usually inactive
    pub slack_equation: Option<EquationId<E>>,
}

impl<'a, V: VariableKind, E: EquationKind> SolverContext<'a, V, E> {
    pub(crate) fn slack_mismatch(&self, state: &[f64]) -> f64 {
        match self.slack_equation {
            Some(eq) => {
                let view = self.system.view(state);
                self.system.evaluate_equation(eq, &view) - self.targets.target(eq)
            }
            None => 0.0,
        }
    }
}

/// Common contract of the Newton-type backends.
pub trait NonlinearSolver<V: VariableKind, E: EquationKind> {
    fn name(&self) -> &'static str;

    fn run(
        &mut self,
        ctx: &mut SolverContext<'_, V, E>,
        initializer: &dyn StateInitializer<V>,
    ) -> SolverOutcome;
}

/// Classic Newton-Raphson with LU-factorized steps.
#[derive(Debug, Clone)]
pub struct NewtonRaphson {
    params: NewtonRaphsonParameters,
}

impl NewtonRaphson {
    pub fn new(params: NewtonRaphsonParameters) -> FlowResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn parameters(&self) -> &NewtonRaphsonParameters {
        &self.params
    }
}

impl<V: VariableKind, E: EquationKind> NonlinearSolver<V, E> for NewtonRaphson {
    fn name(&self) -> &'static str {
        "newton-raphson"
    }

    fn run(
        &mut self,
        ctx: &mut SolverContext<'_, V, E>,
        initializer: &dyn StateInitializer<V>,
    ) -> SolverOutcome {
        let system = ctx.system;
        let index = system.index();
        let variables = index.variables().to_vec();
        let equations = index.equations().to_vec();
        let criteria = self.params.stopping_criteria;
        let base_mva = self.params.base_mva;

        let mut state = system.create_state_vector(initializer);
        let targets = system.create_target_vector(ctx.targets);
        let mut scaling = self.params.create_scaling::<V>();

        ctx.observer.before_equations_update(0);
        let mut mismatch = system.mismatch(&state, &targets);
        ctx.observer.after_equations_update(0, &mismatch);
        let mut test = criteria.test(&mismatch, &equations, base_mva);
        scaling.start(&test);
        debug!(
            variables = variables.len(),
            equations = equations.len(),
            norm = test.norm,
            "newton-raphson start"
        );

        let mut iteration = 0;
        let status = loop {
            if test.stop {
                break SolverStatus::Converged;
            }
            if iteration >= self.params.max_iterations {
                break SolverStatus::MaxIterationReached;
            }

            ctx.observer.before_linear_solve(iteration);
            if let Err(e) = ctx.jacobian.update(system, &state) {
                warn!(iteration, error = %e, "jacobian factorization failed");
                break SolverStatus::SolverFailed;
            }
            let mut step = mismatch.clone();
            if let Err(e) = ctx.jacobian.solve_transposed(&mut step) {
                warn!(iteration, error = %e, "newton step solve failed");
                break SolverStatus::SolverFailed;
            }
            ctx.observer.after_linear_solve(iteration, &step);

            scaling.scale_step(&mut step, &variables);
            state.add_scaled(-1.0, &step);
            iteration += 1;

            ctx.observer.before_equations_update(iteration);
            mismatch = system.mismatch(&state, &targets);
            test = criteria.test(&mismatch, &equations, base_mva);
            test = scaling.update_state(&mut state, &step, test, &mut |x: &[f64]| {
                mismatch = system.mismatch(x, &targets);
                criteria.test(&mismatch, &equations, base_mva)
            });
            ctx.observer.after_equations_update(iteration, &mismatch);

            debug!(iteration, norm = test.norm, "newton-raphson iteration");
            if !test.norm.is_finite() {
                warn!(iteration, "mismatch is not finite");
                break SolverStatus::SolverFailed;
            }
        };

        let slack_mismatch = ctx.slack_mismatch(&state);
        debug!(%status, iterations = iteration, "newton-raphson end");
        if status == SolverStatus::MaxIterationReached {
            for (eq, value) in system.find_largest_mismatches(&mismatch, 3) {
                debug!(element = eq.element, kind = ?eq.kind, mismatch = value, "largest mismatch");
            }
        }

        SolverOutcome {
            result: SolverResult {
                status,
                iterations: iteration,
                slack_bus_active_power_mismatch: slack_mismatch,
            },
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{EquationTerm, MismatchCategory, StateView, Variable, VariableTerm};
    use crate::initializer::PreviousValueInitializer;
    use flowgrid_core::GaussSolver;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Var {
        X,
    }

    impl VariableKind for Var {}

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Constraint {
        Square,
        Pin,
    }

    impl EquationKind for Constraint {
        fn mismatch_category(self) -> MismatchCategory {
            MismatchCategory::Voltage
        }
    }

    struct SquareTerm([Variable<Var>; 1]);

    impl EquationTerm<Var> for SquareTerm {
        fn variables(&self) -> &[Variable<Var>] {
            &self.0
        }

        fn eval(&self, state: &StateView<'_, Var>) -> f64 {
            state.value(self.0[0]).powi(2)
        }

        fn der(&self, _variable: Variable<Var>, state: &StateView<'_, Var>) -> f64 {
            2.0 * state.value(self.0[0])
        }

        fn name(&self) -> &'static str {
            "square"
        }
    }

    struct Targets {
        square: f64,
    }

    impl TargetProvider<Constraint> for Targets {
        fn target(&self, equation: EquationId<Constraint>) -> f64 {
            match equation.kind {
                Constraint::Square => self.square,
                Constraint::Pin => 0.0,
            }
        }
    }

    /// x² = target, starting from stored x = 1
    fn system() -> EquationSystem<Var, Constraint> {
        let mut system = EquationSystem::new();
        let x = system.create_variable(0, Var::X);
        system.set_variable_value(x, 1.0);
        system.add_term(EquationId::new(0, Constraint::Square), Box::new(SquareTerm([x])));
        system
    }

    #[derive(Default)]
    struct Counting {
        solves: usize,
        updates: usize,
    }

    impl SolverObserver for Counting {
        fn after_linear_solve(&mut self, _iteration: usize, _step: &[f64]) {
            self.solves += 1;
        }

        fn after_equations_update(&mut self, _iteration: usize, _mismatch: &[f64]) {
            self.updates += 1;
        }
    }

    fn run(
        params: NewtonRaphsonParameters,
        system: &EquationSystem<Var, Constraint>,
        target: f64,
        observer: &mut dyn SolverObserver,
    ) -> SolverOutcome {
        let mut solver = NewtonRaphson::new(params).unwrap();
        let mut jacobian = JacobianMatrix::new(Arc::new(GaussSolver));
        let targets = Targets { square: target };
        let mut ctx = SolverContext {
            system,
            targets: &targets,
            jacobian: &mut jacobian,
            observer,
            slack_equation: None,
        };
        solver.run(&mut ctx, &PreviousValueInitializer)
    }

    #[test]
    fn converges_quadratically_to_square_root() {
        let system = system();
        let mut observer = Counting::default();
        let outcome = run(NewtonRaphsonParameters::default(), &system, 2.0, &mut observer);
        assert_eq!(outcome.result.status, SolverStatus::Converged);
        assert!(outcome.result.iterations <= 5);
        assert!((outcome.state[0] - 2f64.sqrt()).abs() < 1e-4);
        assert_eq!(observer.solves, outcome.result.iterations);
        assert_eq!(observer.updates, outcome.result.iterations + 1);
    }

    #[test]
    fn iteration_cap_is_a_status() {
        let system = system();
        let params = NewtonRaphsonParameters::default().with_max_iterations(1);
        let outcome = run(params, &system, 2.0, &mut NoOpObserver);
        assert_eq!(outcome.result.status, SolverStatus::MaxIterationReached);
        assert_eq!(outcome.result.iterations, 1);
    }

    #[test]
    fn singular_jacobian_fails_without_retry() {
        let mut system = system();
        system.set_variable_value(Variable::new(0, Var::X), 0.0);
        let mut observer = Counting::default();
        let outcome = run(NewtonRaphsonParameters::default(), &system, 2.0, &mut observer);
        assert_eq!(outcome.result.status, SolverStatus::SolverFailed);
        assert_eq!(outcome.result.iterations, 0);
        assert_eq!(observer.solves, 0);
    }

    #[test]
    fn already_converged_state_needs_no_iteration() {
        let system = system();
        let outcome = run(NewtonRaphsonParameters::default(), &system, 1.0, &mut NoOpObserver);
        assert_eq!(outcome.result.status, SolverStatus::Converged);
        assert_eq!(outcome.result.iterations, 0);
    }

    #[test]
    fn scaling_modes_reach_the_same_root() {
        for mode in [
            StateVectorScalingMode::None,
            StateVectorScalingMode::LineSearch,
            StateVectorScalingMode::MaxVoltageChange,
        ] {
            let system = system();
            let params = NewtonRaphsonParameters::default()
                .with_state_vector_scaling(mode)
                .with_max_iterations(30);
            let outcome = run(params, &system, 9.0, &mut NoOpObserver);
            assert_eq!(outcome.result.status, SolverStatus::Converged, "{:?}", mode);
            assert!((outcome.state[0] - 3.0).abs() < 1e-4, "{:?}", mode);
        }
    }

    #[test]
    fn slack_mismatch_evaluates_inactive_equation() {
        let mut system = system();
        let x = Variable::new(0, Var::X);
        let pin = EquationId::new(0, Constraint::Pin);
        system.add_term(pin, Box::new(VariableTerm::new(x)));
        system.set_equation_active(pin, false);

        let mut solver = NewtonRaphson::new(NewtonRaphsonParameters::default()).unwrap();
        let mut jacobian = JacobianMatrix::new(Arc::new(GaussSolver));
        let targets = Targets { square: 4.0 };
        let mut observer = NoOpObserver;
        let mut ctx = SolverContext {
            system: &system,
            targets: &targets,
            jacobian: &mut jacobian,
            observer: &mut observer,
            slack_equation: Some(pin),
        };
        let outcome = solver.run(&mut ctx, &PreviousValueInitializer);
        assert_eq!(outcome.result.status, SolverStatus::Converged);
        assert!((outcome.result.slack_bus_active_power_mismatch - 2.0).abs() < 1e-4);
    }

    #[test]
    fn invalid_parameters_fail_at_setup() {
        let params = NewtonRaphsonParameters {
            line_search_fold: 1.0,
            ..Default::default()
        };
        assert!(matches!(NewtonRaphson::new(params), Err(FlowError::Config(_))));
        let params = NewtonRaphsonParameters::default().with_max_iterations(0);
        assert!(NewtonRaphson::new(params).is_err());
    }
}
