//! Newton-Krylov backend.
//!
//! The outer Newton iteration is an argmin [`Solver`] driven by argmin's
//! [`Executor`]; the residual and the Jacobian are exposed through argmin's
//! [`Operator`] and [`Jacobian`] traits. The Jacobian image is only used
//! through matrix-vector products: each step solves `J·Δx = F` with
//! restarted GMRES (Arnoldi with modified Gram-Schmidt, Givens rotations)
//! written on argmin-math vector operations.

use super::{
    NewtonRaphsonParameters, NonlinearSolver, SolverContext, SolverObserver, SolverOutcome,
    SolverResult, SolverStatus, StateVectorScaling, StoppingCriteria, StoppingTest,
};
use crate::equations::{
    EquationId, EquationKind, EquationSystem, StateVector, Variable, VariableKind,
};
use crate::initializer::StateInitializer;
use crate::jacobian::{assemble_sparse, jacobian_product};
use argmin::core::{
    Error, Executor, IterState, Jacobian, Operator, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin_math::{ArgminDot, ArgminL2Norm, ArgminMul, ArgminScaledAdd, ArgminScaledSub, ArgminSub};
use flowgrid_core::FlowResult;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use thiserror::Error;
use tracing::{debug, warn};

type KrylovState = IterState<Vec<f64>, (), (), (), (), f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KrylovParameters {
    /// Iteration cap, stopping criteria and step scaling
    pub newton: NewtonRaphsonParameters,
    /// Krylov subspace size before restart
    pub gmres_restart: usize,
    /// Relative residual `‖J·Δx − F‖ / ‖F‖` accepted by GMRES
    pub gmres_tolerance: f64,
    pub gmres_max_iterations: usize,
}

impl Default for KrylovParameters {
    fn default() -> Self {
        Self {
            newton: NewtonRaphsonParameters::default(),
            gmres_restart: 30,
            gmres_tolerance: 1e-10,
            gmres_max_iterations: 1000,
        }
    }
}

impl KrylovParameters {
    pub fn with_newton(mut self, newton: NewtonRaphsonParameters) -> Self {
        self.newton = newton;
        self
    }

    pub fn validate(&self) -> FlowResult<()> {
        self.newton.validate()?;
        if self.gmres_restart == 0 || self.gmres_max_iterations == 0 {
            return Err(flowgrid_core::FlowError::Config(
                "GMRES restart and iteration cap must be at least 1".to_string(),
            ));
        }
        if !(self.gmres_tolerance > 0.0) {
            return Err(flowgrid_core::FlowError::Config(format!(
                "GMRES tolerance must be positive, got {}",
                self.gmres_tolerance
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GmresError {
    #[error("jacobian is {rows}x{cols}, expected a square system")]
    NotSquare { rows: usize, cols: usize },
    #[error("GMRES stalled at relative residual {residual:e} after {iterations} iterations")]
    NotConverged { iterations: usize, residual: f64 },
    #[error("GMRES produced a non-finite step")]
    NonFinite,
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    if b.abs() < 1e-30 {
        return (1.0, 0.0);
    }
    let r = a.hypot(b);
    (a / r, b / r)
}

/// Solve `J x = rhs` where `matrix` is the variable-by-equation image `Jᵀ`.
pub fn gmres(
    matrix: &CsMat<f64>,
    rhs: &[f64],
    restart: usize,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Vec<f64>, GmresError> {
    let n = rhs.len();
    if matrix.rows() != matrix.cols() || matrix.cols() != n {
        return Err(GmresError::NotSquare {
            rows: matrix.rows(),
            cols: matrix.cols(),
        });
    }

    let b = rhs.to_vec();
    let b_norm: f64 = b.l2_norm();
    let mut x = vec![0.0; n];
    if b_norm == 0.0 {
        return Ok(x);
    }

    let mut total = 0;
    loop {
        let r: Vec<f64> = b.sub(&jacobian_product(matrix, &x));
        let r_norm: f64 = r.l2_norm();
        let residual = r_norm / b_norm;
        if residual < tolerance {
            return Ok(x);
        }
        if total >= max_iterations {
            return Err(GmresError::NotConverged {
                iterations: total,
                residual,
            });
        }

        let m = restart.min(n);
        let mut basis: Vec<Vec<f64>> = vec![r.mul(&(1.0 / r_norm))];
        let mut h: Vec<Vec<f64>> = Vec::with_capacity(m);
        let mut g = vec![0.0; m + 1];
        g[0] = r_norm;
        let mut cs = vec![0.0; m];
        let mut sn = vec![0.0; m];

        let mut k = 0;
        while k < m && total < max_iterations {
            total += 1;
            let mut w = jacobian_product(matrix, &basis[k]);
            let mut column = vec![0.0; m + 1];
            for (j, v) in basis.iter().enumerate() {
                let hjk: f64 = v.dot(&w);
                column[j] = hjk;
                w = w.scaled_sub(&hjk, v);
            }
            let w_norm: f64 = w.l2_norm();
            column[k + 1] = w_norm;

            for j in 0..k {
                let rotated = cs[j] * column[j] + sn[j] * column[j + 1];
                column[j + 1] = -sn[j] * column[j] + cs[j] * column[j + 1];
                column[j] = rotated;
            }
            let (c, s) = givens(column[k], column[k + 1]);
            cs[k] = c;
            sn[k] = s;
            column[k] = c * column[k] + s * column[k + 1];
            column[k + 1] = 0.0;
            g[k + 1] = -s * g[k];
            g[k] *= c;
            h.push(column);
            k += 1;

            if g[k].abs() / b_norm < tolerance || w_norm < 1e-30 {
                break;
            }
            basis.push(w.mul(&(1.0 / w_norm)));
        }

        // H y = g, upper triangular after rotations
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut sum = g[i];
            for j in i + 1..k {
                sum -= h[j][i] * y[j];
            }
            if h[i][i].abs() > 1e-30 {
                y[i] = sum / h[i][i];
            }
        }
        for (yi, v) in y.iter().zip(&basis) {
            x = x.scaled_add(yi, v);
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(GmresError::NonFinite);
        }
    }
}

/// Residual `F(x)` and its Jacobian image, as seen by argmin.
struct ResidualProblem<'a, V: VariableKind, E: EquationKind> {
    system: &'a EquationSystem<V, E>,
    targets: &'a [f64],
}

impl<'a, V: VariableKind, E: EquationKind> Operator for ResidualProblem<'a, V, E> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.system.mismatch(param, self.targets))
    }
}

impl<'a, V: VariableKind, E: EquationKind> Jacobian for ResidualProblem<'a, V, E> {
    type Param = Vec<f64>;
    type Jacobian = CsMat<f64>;

    fn jacobian(&self, param: &Self::Param) -> Result<Self::Jacobian, Error> {
        Ok(assemble_sparse(self.system, param))
    }
}

/// Last accepted iterate, kept outside the executor so that a failed run
/// still reports where it stopped.
#[derive(Debug, Default)]
struct Progress {
    iterations: usize,
    state: Vec<f64>,
    mismatch: Vec<f64>,
}

struct NewtonKrylovStep<'a, V: VariableKind, E: EquationKind> {
    criteria: StoppingCriteria,
    base_mva: f64,
    equations: &'a [EquationId<E>],
    variables: &'a [Variable<V>],
    scaling: Box<dyn StateVectorScaling<V>>,
    observer: &'a mut dyn SolverObserver,
    progress: &'a mut Progress,
    restart: usize,
    tolerance: f64,
    max_linear_iterations: usize,
    last: StoppingTest,
}

impl<'a, V: VariableKind, E: EquationKind> Solver<ResidualProblem<'a, V, E>, KrylovState>
    for NewtonKrylovStep<'a, V, E>
{
    const NAME: &'static str = "Newton-Krylov";

    fn init(
        &mut self,
        problem: &mut Problem<ResidualProblem<'a, V, E>>,
        state: KrylovState,
    ) -> Result<(KrylovState, Option<KV>), Error> {
        let x = state
            .get_param()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("initial state vector missing"))?;
        self.observer.before_equations_update(0);
        let mismatch = problem.apply(&x)?;
        self.observer.after_equations_update(0, &mismatch);
        self.last = self.criteria.test(&mismatch, self.equations, self.base_mva);
        self.scaling.start(&self.last);
        self.progress.state = x;
        self.progress.mismatch = mismatch;
        Ok((state.cost(self.last.norm), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<ResidualProblem<'a, V, E>>,
        state: KrylovState,
    ) -> Result<(KrylovState, Option<KV>), Error> {
        let iteration = state.get_iter() as usize;
        let mut x = StateVector::new(self.progress.state.clone());

        self.observer.before_linear_solve(iteration);
        let jacobian = problem.jacobian(&self.progress.state)?;
        let mut step = gmres(
            &jacobian,
            &self.progress.mismatch,
            self.restart,
            self.tolerance,
            self.max_linear_iterations,
        )?;
        self.observer.after_linear_solve(iteration, &step);

        self.scaling.scale_step(&mut step, self.variables);
        x.add_scaled(-1.0, &step);

        self.observer.before_equations_update(iteration + 1);
        let (criteria, equations, base_mva) = (self.criteria, self.equations, self.base_mva);
        let mut mismatch = problem.apply(&x.to_vec())?;
        let test = criteria.test(&mismatch, equations, base_mva);
        let test = self
            .scaling
            .update_state(&mut x, &step, test, &mut |candidate: &[f64]| {
                match problem.apply(&candidate.to_vec()) {
                    Ok(f) => {
                        let t = criteria.test(&f, equations, base_mva);
                        mismatch = f;
                        t
                    }
                    Err(_) => StoppingTest {
                        stop: false,
                        norm: f64::INFINITY,
                    },
                }
            });
        self.observer.after_equations_update(iteration + 1, &mismatch);

        debug!(iteration = iteration + 1, norm = test.norm, "newton-krylov iteration");
        if !test.norm.is_finite() {
            return Err(anyhow::anyhow!("mismatch is not finite"));
        }

        self.last = test;
        self.progress.iterations = iteration + 1;
        self.progress.state = x.to_vec();
        self.progress.mismatch = mismatch;
        Ok((state.param(x.into_inner()).cost(test.norm), None))
    }

    fn terminate(&mut self, _state: &KrylovState) -> TerminationStatus {
        if self.last.stop {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        } else {
            TerminationStatus::NotTerminated
        }
    }
}

/// Newton-Krylov solver with the same contract as
/// [`NewtonRaphson`](super::NewtonRaphson).
#[derive(Debug, Clone)]
pub struct NewtonKrylov {
    params: KrylovParameters,
}

impl NewtonKrylov {
    pub fn new(params: KrylovParameters) -> FlowResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }
}

impl<V: VariableKind, E: EquationKind> NonlinearSolver<V, E> for NewtonKrylov {
    fn name(&self) -> &'static str {
        "newton-krylov"
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
        let x0 = system.create_state_vector(initializer).into_inner();
        let targets = system.create_target_vector(ctx.targets);
        let newton = &self.params.newton;

        let mut progress = Progress {
            iterations: 0,
            state: x0.clone(),
            mismatch: Vec::new(),
        };
        let step = NewtonKrylovStep {
            criteria: newton.stopping_criteria,
            base_mva: newton.base_mva,
            equations: &equations,
            variables: &variables,
            scaling: newton.create_scaling::<V>(),
            observer: &mut *ctx.observer,
            progress: &mut progress,
            restart: self.params.gmres_restart,
            tolerance: self.params.gmres_tolerance,
            max_linear_iterations: self.params.gmres_max_iterations,
            last: StoppingTest {
                stop: false,
                norm: f64::INFINITY,
            },
        };
        let problem = ResidualProblem {
            system,
            targets: &targets,
        };

        let max_iters = newton.max_iterations as u64;
        let run = Executor::new(problem, step)
            .configure(|state| state.param(x0).max_iters(max_iters))
            .run();

        let status = match run {
            Ok(result) => match result.state().get_termination_reason() {
                Some(TerminationReason::SolverConverged) => SolverStatus::Converged,
                _ => SolverStatus::MaxIterationReached,
            },
            Err(e) => {
                warn!(error = %e, "newton-krylov failed");
                SolverStatus::SolverFailed
            }
        };

        let state = StateVector::new(progress.state);
        debug!(%status, iterations = progress.iterations, "newton-krylov end");
        SolverOutcome {
            result: SolverResult {
                status,
                iterations: progress.iterations,
                slack_bus_active_power_mismatch: ctx.slack_mismatch(&state),
            },
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn matrix(entries: &[(usize, usize, f64)], n: usize) -> CsMat<f64> {
        let mut triplets = TriMat::new((n, n));
        for &(r, c, v) in entries {
            triplets.add_triplet(r, c, v);
        }
        triplets.to_csc()
    }

    #[test]
    fn gmres_solves_nonsymmetric_system() {
        // M = [[4, 1], [2, 3]] stores J = Mᵀ = [[4, 2], [1, 3]]
        let m = matrix(&[(0, 0, 4.0), (0, 1, 1.0), (1, 0, 2.0), (1, 1, 3.0)], 2);
        let x = gmres(&m, &[1.0, 2.0], 30, 1e-12, 100).unwrap();
        assert!((x[0] + 0.1).abs() < 1e-10);
        assert!((x[1] - 0.7).abs() < 1e-10);
    }

    #[test]
    fn gmres_restarts_on_small_subspace() {
        let n = 6;
        let mut entries = Vec::new();
        for i in 0..n {
            entries.push((i, i, 4.0));
            if i + 1 < n {
                entries.push((i, i + 1, -1.0));
                entries.push((i + 1, i, -2.0));
            }
        }
        let m = matrix(&entries, n);
        let b: Vec<f64> = (0..n).map(|i| i as f64 + 1.0).collect();
        let x = gmres(&m, &b, 2, 1e-12, 500).unwrap();
        let back = jacobian_product(&m, &x);
        for (lhs, rhs) in back.iter().zip(&b) {
            assert!((lhs - rhs).abs() < 1e-9);
        }
    }

    #[test]
    fn gmres_zero_rhs_is_zero_step() {
        let m = matrix(&[(0, 0, 2.0)], 1);
        assert_eq!(gmres(&m, &[0.0], 30, 1e-10, 10).unwrap(), vec![0.0]);
    }

    #[test]
    fn gmres_singular_system_reports_failure() {
        let m = matrix(&[(0, 0, 1.0), (1, 0, 1.0)], 2);
        assert!(gmres(&m, &[1.0, 1.0], 30, 1e-10, 20).is_err());
    }

    #[test]
    fn invalid_gmres_settings_are_config_errors() {
        let params = KrylovParameters {
            gmres_restart: 0,
            ..Default::default()
        };
        assert!(NewtonKrylov::new(params).is_err());
    }
}
