//! AC load flow entry point.
//!
//! [`AcLoadFlowEngine`] runs the inner Newton solve and the configured outer
//! loops on an [`LfNetwork`] until every loop is stable, the inner solver
//! fails, or the outer iteration cap is reached.
//!
//! ```ignore
//! use flowgrid_algo::loadflow::{AcLoadFlowEngine, AcLoadFlowParameters};
//!
//! let params = AcLoadFlowParameters::default().with_max_outer_loop_iterations(10);
//! let result = AcLoadFlowEngine::new(&mut lf_network, params)?.run()?;
//! println!("{} after {} iterations", result.solver_status, result.iterations);
//! ```

use crate::ac::{AcEquationSystem, AcEquationType, AcVariableType, LfNetwork};
use crate::dc::DcValueInitializer;
use crate::initializer::{PreviousValueInitializer, StateInitializer, UniformValueInitializer};
use crate::jacobian::JacobianMatrix;
use crate::newton::{
    KrylovParameters, NewtonKrylov, NewtonRaphson, NewtonRaphsonParameters, NoOpObserver,
    NonlinearSolver, SolverContext, SolverObserver, SolverResult, SolverStatus,
};
use crate::outer_loop::{
    create_outer_loops, DistributedSlackData, LoopDataStore, OuterLoopContext,
    OuterLoopParameters, OuterLoopStatus,
};
use flowgrid_core::{BusId, Diagnostics, FlowError, FlowResult, LinearSolverKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Newton-type backend used for inner solves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonlinearSolverKind {
    #[default]
    NewtonRaphson,
    NewtonKrylov,
}

impl NonlinearSolverKind {
    pub fn from_str(input: &str) -> anyhow::Result<Self> {
        match input.to_ascii_lowercase().replace('-', "_").as_str() {
            "newton_raphson" | "nr" => Ok(NonlinearSolverKind::NewtonRaphson),
            "newton_krylov" | "krylov" => Ok(NonlinearSolverKind::NewtonKrylov),
            other => Err(anyhow::anyhow!(
                "unknown nonlinear solver '{}', expected newton_raphson or newton_krylov",
                other
            )),
        }
    }
}

/// Starting point of the first inner solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageInitMode {
    /// |V| = 1 pu, θ = 0
    Uniform,
    /// Voltages currently held by the network
    Previous,
    /// |V| = 1 pu, θ from a DC load flow
    #[default]
    DcValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcLoadFlowParameters {
    pub solver: NonlinearSolverKind,
    pub newton_raphson: NewtonRaphsonParameters,
    /// Used when `solver` is Newton-Krylov; its `newton` field is replaced
    /// by `newton_raphson`
    pub krylov: KrylovParameters,
    pub linear_solver: LinearSolverKind,
    pub voltage_init_mode: VoltageInitMode,
    pub max_outer_loop_iterations: usize,
    pub outer_loops: OuterLoopParameters,
}

impl Default for AcLoadFlowParameters {
    fn default() -> Self {
        Self {
            solver: NonlinearSolverKind::NewtonRaphson,
            newton_raphson: NewtonRaphsonParameters::default(),
            krylov: KrylovParameters::default(),
            linear_solver: LinearSolverKind::default(),
            voltage_init_mode: VoltageInitMode::DcValues,
            max_outer_loop_iterations: 20,
            outer_loops: OuterLoopParameters::default(),
        }
    }
}

impl AcLoadFlowParameters {
    pub fn with_solver(mut self, solver: NonlinearSolverKind) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_newton_raphson(mut self, params: NewtonRaphsonParameters) -> Self {
        self.newton_raphson = params;
        self
    }

    pub fn with_linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.linear_solver = kind;
        self
    }

    pub fn with_voltage_init_mode(mut self, mode: VoltageInitMode) -> Self {
        self.voltage_init_mode = mode;
        self
    }

    pub fn with_max_outer_loop_iterations(mut self, max: usize) -> Self {
        self.max_outer_loop_iterations = max;
        self
    }

    pub fn with_outer_loops(mut self, outer_loops: OuterLoopParameters) -> Self {
        self.outer_loops = outer_loops;
        self
    }

    /// Parse parameters from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> FlowResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FlowError::Parse(format!("invalid load flow parameters: {}", e)))
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.max_outer_loop_iterations == 0 {
            return Err(FlowError::Config(
                "max_outer_loop_iterations must be at least 1".into(),
            ));
        }
        self.newton_raphson.validate()?;
        if self.solver == NonlinearSolverKind::NewtonKrylov {
            self.krylov.validate()?;
        }
        self.outer_loops.validate()
    }

    fn create_solver(
        &self,
        base_mva: f64,
    ) -> FlowResult<Box<dyn NonlinearSolver<AcVariableType, AcEquationType>>> {
        let newton = self.newton_raphson.clone().with_base_mva(base_mva);
        Ok(match self.solver {
            NonlinearSolverKind::NewtonRaphson => Box::new(NewtonRaphson::new(newton)?),
            NonlinearSolverKind::NewtonKrylov => {
                Box::new(NewtonKrylov::new(self.krylov.clone().with_newton(newton))?)
            }
        })
    }
}

/// Outcome of a load flow run.
#[derive(Debug, Clone)]
pub struct AcLoadFlowResult {
    pub solver_status: SolverStatus,
    /// Inner iterations over all solves
    pub iterations: usize,
    pub outer_iterations: usize,
    pub outer_loop_status: OuterLoopStatus,
    /// Last status reported by each loop, in run order
    pub loop_statuses: Vec<(String, OuterLoopStatus)>,
    /// Slack bus active power balance at the final state (MW)
    pub slack_bus_active_power_mismatch: f64,
    /// Active power moved off the slack bus by slack distribution (MW)
    pub distributed_active_power: f64,
    /// Bus voltage magnitudes (p.u.)
    pub bus_voltage_magnitude: HashMap<BusId, f64>,
    /// Bus voltage angles (radians)
    pub bus_voltage_angle: HashMap<BusId, f64>,
    pub diagnostics: Diagnostics,
    pub elapsed: Duration,
}

impl AcLoadFlowResult {
    /// Converged inner solve and stable outer loops.
    pub fn is_ok(&self) -> bool {
        self.solver_status == SolverStatus::Converged
            && self.outer_loop_status == OuterLoopStatus::Stable
    }

    pub fn loop_status(&self, name: &str) -> Option<OuterLoopStatus> {
        self.loop_statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

pub struct AcLoadFlowEngine<'a> {
    network: &'a mut LfNetwork,
    params: AcLoadFlowParameters,
    observer: Option<&'a mut dyn SolverObserver>,
}

impl<'a> AcLoadFlowEngine<'a> {
    pub fn new(network: &'a mut LfNetwork, params: AcLoadFlowParameters) -> FlowResult<Self> {
        params.validate()?;
        Ok(Self {
            network,
            params,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: &'a mut dyn SolverObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the equation system from the network and run.
    pub fn run(&mut self) -> FlowResult<AcLoadFlowResult> {
        let mut system = AcEquationSystem::build(self.network);
        self.run_with(&mut system)
    }

    /// Run on an equation system kept across runs, e.g. to apply topology
    /// changes with [`AcEquationSystem::update_topology`] in between.
    pub fn run_with(&mut self, ac: &mut AcEquationSystem) -> FlowResult<AcLoadFlowResult> {
        let start = Instant::now();
        let base = self.network.base_mva();
        let mut diagnostics = Diagnostics::new();
        let mut loops = create_outer_loops(&self.params.outer_loops)?;
        let mut solver = self.params.create_solver(base)?;
        let backend = self.params.linear_solver.build_solver();

        let mut data = LoopDataStore::new();
        for outer_loop in loops.iter_mut() {
            outer_loop.initialize(self.network, &mut data)?;
        }
        ac.refresh(self.network);

        let mut loop_statuses: Vec<(String, OuterLoopStatus)> = loops
            .iter()
            .map(|l| (l.name().to_string(), OuterLoopStatus::Stable))
            .collect();

        let slack_disabled = self.network.buses[self.network.slack_bus()].disabled;
        if slack_disabled || ac.system().index().row_count() == 0 {
            warn!(slack_disabled, "nothing to solve");
            return Ok(self.result(
                SolverStatus::NoCalculation,
                0,
                0,
                OuterLoopStatus::Stable,
                loop_statuses,
                0.0,
                &mut data,
                diagnostics,
                start,
            ));
        }

        let initializer: Box<dyn StateInitializer<AcVariableType>> =
            match self.params.voltage_init_mode {
                VoltageInitMode::Uniform => Box::new(UniformValueInitializer),
                VoltageInitMode::Previous => Box::new(PreviousValueInitializer),
                VoltageInitMode::DcValues => {
                    Box::new(DcValueInitializer::new(self.network, backend.clone())?)
                }
            };

        let mut jacobian = JacobianMatrix::new(backend);
        let mut no_op = NoOpObserver;
        let observer: &mut dyn SolverObserver = match self.observer.as_deref_mut() {
            Some(observer) => observer,
            None => &mut no_op,
        };

        info!(
            solver = solver.name(),
            linear_solver = self.params.linear_solver.as_str(),
            loops = loops.len(),
            "starting AC load flow"
        );

        let mut outer = 0;
        let mut iterations = 0;
        let mut outer_status = OuterLoopStatus::Stable;
        let mut loop_error = None;
        let final_result = loop {
            let outcome = {
                let targets = ac.targets(self.network);
                let init: &dyn StateInitializer<AcVariableType> = if outer == 0 {
                    initializer.as_ref()
                } else {
                    &PreviousValueInitializer
                };
                let mut ctx = SolverContext {
                    system: ac.system(),
                    targets: &targets,
                    jacobian: &mut jacobian,
                    observer: &mut *observer,
                    slack_equation: Some(ac.slack_equation(self.network)),
                };
                solver.run(&mut ctx, init)
            };
            iterations += outcome.result.iterations;
            if outcome.result.status != SolverStatus::Converged {
                warn!(
                    status = %outcome.result.status,
                    outer,
                    "inner solve did not converge"
                );
                break outcome.result;
            }

            ac.system_mut().store_state(&outcome.state);
            ac.write_back(self.network);
            if let Err(e) = jacobian.update(ac.system(), &outcome.state) {
                warn!(error = %e, "jacobian factorization failed at the converged state");
                break SolverResult {
                    status: SolverStatus::SolverFailed,
                    ..outcome.result
                };
            }

            let mut unstable = false;
            for (i, outer_loop) in loops.iter_mut().enumerate() {
                let mut ctx = OuterLoopContext {
                    network: &mut *self.network,
                    system: &*ac,
                    jacobian: &jacobian,
                    solver_result: outcome.result,
                    outer_iteration: outer,
                    data: &mut data,
                    diagnostics: &mut diagnostics,
                };
                let status = match outer_loop.check(&mut ctx) {
                    Ok(status) => status,
                    Err(e) => {
                        loop_error = Some(e);
                        break;
                    }
                };
                observer.outer_loop_iteration(outer, outer_loop.name(), status);
                loop_statuses[i].1 = status;
                match status {
                    OuterLoopStatus::Stable => {}
                    OuterLoopStatus::Unstable => {
                        unstable = true;
                        break;
                    }
                    OuterLoopStatus::Failed => {
                        outer_status = OuterLoopStatus::Failed;
                        break;
                    }
                }
            }
            if loop_error.is_some() || outer_status == OuterLoopStatus::Failed || !unstable {
                break outcome.result;
            }
            if outer + 1 >= self.params.max_outer_loop_iterations {
                warn!(
                    outer_iterations = outer + 1,
                    "outer loops still unstable at the iteration cap"
                );
                outer_status = OuterLoopStatus::Unstable;
                break outcome.result;
            }
            outer += 1;
            let rebuilt = ac.refresh(self.network);
            debug!(outer, rebuilt, "re-solving after outer loop changes");
        };
        jacobian.release();
        if let Some(e) = loop_error {
            warn!(error = %e, outer, "outer loop aborted the run");
            return Err(e);
        }

        Ok(self.result(
            final_result.status,
            iterations,
            outer,
            outer_status,
            loop_statuses,
            final_result.slack_bus_active_power_mismatch * base,
            &mut data,
            diagnostics,
            start,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        solver_status: SolverStatus,
        iterations: usize,
        outer_iterations: usize,
        outer_loop_status: OuterLoopStatus,
        loop_statuses: Vec<(String, OuterLoopStatus)>,
        slack_bus_active_power_mismatch: f64,
        data: &mut LoopDataStore,
        diagnostics: Diagnostics,
        start: Instant,
    ) -> AcLoadFlowResult {
        let base = self.network.base_mva();
        let distributed_active_power = data
            .get::<DistributedSlackData>()
            .map(|d| d.distributed_p * base)
            .unwrap_or(0.0);
        let live = self.network.buses.iter().filter(|b| !b.disabled);
        let bus_voltage_magnitude = live.clone().map(|b| (b.id, b.v)).collect();
        let bus_voltage_angle = live.map(|b| (b.id, b.angle)).collect();
        let elapsed = start.elapsed();
        info!(
            status = %solver_status,
            iterations,
            outer_iterations,
            outer_status = %outer_loop_status,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "AC load flow finished"
        );
        AcLoadFlowResult {
            solver_status,
            iterations,
            outer_iterations,
            outer_loop_status,
            loop_statuses,
            slack_bus_active_power_mismatch,
            distributed_active_power,
            bus_voltage_magnitude,
            bus_voltage_angle,
            diagnostics,
            elapsed,
        }
    }
}
