use crate::outer_loop::OuterLoopStatus;

/// Read-only hooks into a solve run.
///
/// Every hook defaults to a no-op. Observers receive copies or shared
/// borrows only, so they cannot alter the iteration.
pub trait SolverObserver {
    fn before_equations_update(&mut self, _iteration: usize) {}

    fn after_equations_update(&mut self, _iteration: usize, _mismatch: &[f64]) {}

    fn before_linear_solve(&mut self, _iteration: usize) {}

    fn after_linear_solve(&mut self, _iteration: usize, _step: &[f64]) {}

    fn outer_loop_iteration(
        &mut self,
        _outer_iteration: usize,
        _loop_name: &str,
        _status: OuterLoopStatus,
    ) {
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl SolverObserver for NoOpObserver {}
