use super::backend::{FaerSolver, GaussSolver, LinearSystemBackend};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registry of the dense linear solvers the Jacobian can be factorized with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearSolverKind {
    #[default]
    Gauss,
    Faer,
}

impl LinearSolverKind {
    pub fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "gauss" | "default" => Ok(LinearSolverKind::Gauss),
            "faer" => Ok(LinearSolverKind::Faer),
            other => Err(anyhow!(
                "unknown linear solver '{}'; supported values: {}",
                other,
                Self::available().join(", ")
            )),
        }
    }

    pub fn build_solver(self) -> Arc<dyn LinearSystemBackend> {
        match self {
            LinearSolverKind::Gauss => Arc::new(GaussSolver),
            LinearSolverKind::Faer => Arc::new(FaerSolver),
        }
    }

    pub fn available() -> &'static [&'static str] {
        &["gauss", "faer"]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinearSolverKind::Gauss => "gauss",
            LinearSolverKind::Faer => "faer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_kind_parsing_supports_all_engines() {
        assert_eq!(LinearSolverKind::from_str("gauss").unwrap(), LinearSolverKind::Gauss);
        assert_eq!(LinearSolverKind::from_str("FAER").unwrap(), LinearSolverKind::Faer);
        assert!(LinearSolverKind::from_str("klu").is_err());
    }

    #[test]
    fn built_solvers_report_their_name() {
        for name in LinearSolverKind::available() {
            let kind = LinearSolverKind::from_str(name).unwrap();
            assert_eq!(kind.build_solver().name(), kind.as_str());
        }
    }

    #[test]
    fn solver_backend_options_solve_diagonal_system() {
        let matrix = vec![vec![2.0, 0.0], vec![0.0, 3.0]];
        let rhs = vec![4.0, 6.0];

        for kind in [LinearSolverKind::Gauss, LinearSolverKind::Faer] {
            let x = kind.build_solver().solve(&matrix, &rhs).unwrap();
            assert!((x[0] - 2.0).abs() < 1e-12);
            assert!((x[1] - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn kind_deserializes_from_lowercase() {
        let kind: LinearSolverKind = serde_json::from_str("\"faer\"").unwrap();
        assert_eq!(kind, LinearSolverKind::Faer);
    }
}
