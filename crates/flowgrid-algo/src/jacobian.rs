//! Jacobian of an [`EquationSystem`] and its LU factorization.
//!
//! The stored matrix `M` has one **row per variable** and one **column per
//! equation**: `M[r][c] = ∂eq_c/∂var_r`. That is the transpose of the usual
//! Newton Jacobian `J`, which keeps sensitivity solves (`M z = g`) and
//! Newton steps (`Mᵀ Δx = −f`) on the same factors.
//!
//! Assembly goes through sprs triplets (duplicates are summed when the
//! triplet matrix is compressed). Factorization is delegated to a dense
//! [`LinearSystemBackend`] from `flowgrid-core`.

use crate::equations::{EquationKind, EquationSystem, VariableKind};
use flowgrid_core::{FlowError, FlowResult, LinearSystemBackend, LuFactors};
use sprs::{CsMat, TriMat};
use std::sync::Arc;
use tracing::debug;

/// Assemble `M` (variables × equations) at `state`.
pub fn assemble_sparse<V: VariableKind, E: EquationKind>(
    system: &EquationSystem<V, E>,
    state: &[f64],
) -> CsMat<f64> {
    let index = system.index();
    let mut triplets = TriMat::new((index.row_count(), index.column_count()));
    for (row, column, value) in system.jacobian_triplets(state) {
        triplets.add_triplet(row, column, value);
    }
    triplets.to_csc()
}

/// `J x = Mᵀ x`: directional derivative of the equations along `x`.
pub fn jacobian_product(matrix: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; matrix.cols()];
    for (value, (row, column)) in matrix.iter() {
        if let Some(xr) = x.get(row) {
            y[column] += value * xr;
        }
    }
    y
}

/// Reusable Jacobian for one equation system.
///
/// The dense buffer is only reallocated when the system's structure version
/// moves; value updates refill it in place.
pub struct JacobianMatrix {
    backend: Arc<dyn LinearSystemBackend>,
    structure_version: Option<u64>,
    matrix: Option<CsMat<f64>>,
    dense: Vec<Vec<f64>>,
    factors: Option<Box<dyn LuFactors>>,
    rebuilds: usize,
}

impl JacobianMatrix {
    pub fn new(backend: Arc<dyn LinearSystemBackend>) -> Self {
        Self {
            backend,
            structure_version: None,
            matrix: None,
            dense: Vec::new(),
            factors: None,
            rebuilds: 0,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of times the pattern was rebuilt after a structural change.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    pub fn matrix(&self) -> Option<&CsMat<f64>> {
        self.matrix.as_ref()
    }

    pub fn is_factorized(&self) -> bool {
        self.factors.is_some()
    }

    /// Recompute derivatives at `state` and refactorize.
    pub fn update<V: VariableKind, E: EquationKind>(
        &mut self,
        system: &EquationSystem<V, E>,
        state: &[f64],
    ) -> FlowResult<()> {
        let index = system.index();
        let (rows, columns) = (index.row_count(), index.column_count());
        if rows != columns {
            self.factors = None;
            return Err(FlowError::LinearSolve(format!(
                "equation system is not square: {} variables, {} equations",
                rows, columns
            )));
        }

        let version = system.structure_version();
        if self.structure_version != Some(version) || self.dense.len() != rows {
            debug!(
                variables = rows,
                version, "rebuilding jacobian structure"
            );
            self.dense = vec![vec![0.0; rows]; rows];
            self.structure_version = Some(version);
            self.rebuilds += 1;
        } else {
            for row in &mut self.dense {
                row.iter_mut().for_each(|v| *v = 0.0);
            }
        }

        let matrix = assemble_sparse(system, state);
        for (value, (row, column)) in matrix.iter() {
            self.dense[row][column] = *value;
        }
        self.matrix = Some(matrix);

        if rows == 0 {
            self.factors = None;
            return Ok(());
        }
        match self.backend.factorize(&self.dense) {
            Ok(factors) => {
                self.factors = Some(factors);
                Ok(())
            }
            Err(e) => {
                self.factors = None;
                Err(FlowError::LinearSolve(e.to_string()))
            }
        }
    }

    /// Overwrite `rhs` with the solution of `M z = rhs` (sensitivities).
    pub fn solve(&self, rhs: &mut [f64]) -> FlowResult<()> {
        self.with_factors(rhs, |f, b| f.solve_in_place(b))
    }

    /// Overwrite `rhs` with the solution of `Mᵀ Δx = rhs` (Newton step).
    pub fn solve_transposed(&self, rhs: &mut [f64]) -> FlowResult<()> {
        self.with_factors(rhs, |f, b| f.solve_transposed_in_place(b))
    }

    fn with_factors(
        &self,
        rhs: &mut [f64],
        op: impl FnOnce(&dyn LuFactors, &mut [f64]) -> anyhow::Result<()>,
    ) -> FlowResult<()> {
        if rhs.is_empty() && self.dense.is_empty() {
            return Ok(());
        }
        let factors = self
            .factors
            .as_deref()
            .ok_or_else(|| FlowError::LinearSolve("jacobian is not factorized".to_string()))?;
        op(factors, rhs).map_err(|e| FlowError::LinearSolve(e.to_string()))
    }

    /// `J x` with the last assembled matrix (zeros if none).
    pub fn apply_transposed(&self, x: &[f64]) -> Vec<f64> {
        self.matrix
            .as_ref()
            .map(|m| jacobian_product(m, x))
            .unwrap_or_else(|| vec![0.0; x.len()])
    }

    /// Drop the matrix and its factorization.
    pub fn release(&mut self) {
        self.factors = None;
        self.matrix = None;
        self.dense.clear();
        self.structure_version = None;
    }
}

impl std::fmt::Debug for JacobianMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JacobianMatrix")
            .field("backend", &self.backend.name())
            .field("dimension", &self.dense.len())
            .field("structure_version", &self.structure_version)
            .field("factorized", &self.factors.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{
        EquationId, EquationTerm, MismatchCategory, StateView, Variable, VariableTerm,
    };
    use flowgrid_core::{FaerSolver, GaussSolver};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Var {
        X,
    }

    impl VariableKind for Var {}

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Constraint {
        Product,
        Square,
    }

    impl EquationKind for Constraint {
        fn mismatch_category(self) -> MismatchCategory {
            MismatchCategory::ActivePower
        }
    }

    /// `x_a * x_b + x_b`
    struct ProductTerm {
        variables: [Variable<Var>; 2],
    }

    impl EquationTerm<Var> for ProductTerm {
        fn variables(&self) -> &[Variable<Var>] {
            &self.variables
        }

        fn eval(&self, state: &StateView<'_, Var>) -> f64 {
            let (a, b) = (state.value(self.variables[0]), state.value(self.variables[1]));
            a * b + b
        }

        fn der(&self, variable: Variable<Var>, state: &StateView<'_, Var>) -> f64 {
            let (a, b) = (state.value(self.variables[0]), state.value(self.variables[1]));
            if variable == self.variables[0] {
                b
            } else {
                a + 1.0
            }
        }

        fn name(&self) -> &'static str {
            "product"
        }
    }

    /// `x²`
    struct SquareTerm {
        variables: [Variable<Var>; 1],
    }

    impl EquationTerm<Var> for SquareTerm {
        fn variables(&self) -> &[Variable<Var>] {
            &self.variables
        }

        fn eval(&self, state: &StateView<'_, Var>) -> f64 {
            state.value(self.variables[0]).powi(2)
        }

        fn der(&self, _variable: Variable<Var>, state: &StateView<'_, Var>) -> f64 {
            2.0 * state.value(self.variables[0])
        }

        fn name(&self) -> &'static str {
            "square"
        }
    }

    fn system() -> EquationSystem<Var, Constraint> {
        let mut system = EquationSystem::new();
        let a = Variable::new(0, Var::X);
        let b = Variable::new(1, Var::X);
        system.add_term(
            EquationId::new(0, Constraint::Product),
            Box::new(ProductTerm { variables: [a, b] }),
        );
        system.add_term(
            EquationId::new(1, Constraint::Square),
            Box::new(SquareTerm { variables: [a] }),
        );
        system.add_term(
            EquationId::new(1, Constraint::Square),
            Box::new(VariableTerm::new(b)),
        );
        system
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let system = system();
        let state = vec![0.7, -1.3];
        let matrix = assemble_sparse(&system, &state);
        let h = 1e-7;

        for row in 0..2 {
            let mut plus = state.clone();
            let mut minus = state.clone();
            plus[row] += h;
            minus[row] -= h;
            let f_plus = system.update_equations(&plus);
            let f_minus = system.update_equations(&minus);
            for column in 0..2 {
                let numeric = (f_plus[column] - f_minus[column]) / (2.0 * h);
                let analytic = matrix.get(row, column).copied().unwrap_or(0.0);
                assert!(
                    (numeric - analytic).abs() < 1e-6,
                    "M[{}][{}]: analytic {} numeric {}",
                    row,
                    column,
                    analytic,
                    numeric
                );
            }
        }
    }

    #[test]
    fn newton_step_and_sensitivity_share_factors() {
        let system = system();
        let state = vec![0.5, 2.0];
        let mut jacobian = JacobianMatrix::new(Arc::new(GaussSolver));
        jacobian.update(&system, &state).unwrap();
        let matrix = jacobian.matrix().unwrap().clone();

        // Mᵀ x = r
        let mut x = vec![1.0, -2.0];
        jacobian.solve_transposed(&mut x).unwrap();
        let back = jacobian_product(&matrix, &x);
        assert!((back[0] - 1.0).abs() < 1e-12);
        assert!((back[1] + 2.0).abs() < 1e-12);

        // M z = g
        let mut z = vec![3.0, 1.0];
        jacobian.solve(&mut z).unwrap();
        let m = matrix.to_dense();
        for row in 0..2 {
            let value: f64 = (0..2).map(|c| m[[row, c]] * z[c]).sum();
            let expected = [3.0, 1.0][row];
            assert!((value - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn structure_is_rebuilt_only_after_structural_change() {
        let mut system = system();
        let mut jacobian = JacobianMatrix::new(Arc::new(FaerSolver));
        jacobian.update(&system, &[0.5, 2.0]).unwrap();
        jacobian.update(&system, &[0.6, 2.1]).unwrap();
        assert_eq!(jacobian.rebuild_count(), 1);

        system.set_equation_active(EquationId::new(1, Constraint::Square), false);
        system.set_equation_active(EquationId::new(1, Constraint::Square), true);
        jacobian.update(&system, &[0.6, 2.1]).unwrap();
        assert_eq!(jacobian.rebuild_count(), 2);
    }

    #[test]
    fn non_square_system_is_rejected() {
        let mut system = system();
        system.set_equation_active(EquationId::new(1, Constraint::Square), false);
        let mut jacobian = JacobianMatrix::new(Arc::new(GaussSolver));
        let err = jacobian.update(&system, &[0.5, 2.0]).unwrap_err();
        assert!(matches!(err, FlowError::LinearSolve(_)));
        assert!(!jacobian.is_factorized());
    }

    #[test]
    fn solving_before_update_fails() {
        let jacobian = JacobianMatrix::new(Arc::new(GaussSolver));
        let mut rhs = vec![1.0];
        assert!(jacobian.solve(&mut rhs).is_err());
    }
}
