//! Error type shared by network construction and the load flow engine.
//!
//! Non-convergence of the Newton iteration is *not* an error: it is reported
//! as a solver status. Only conditions that make the run meaningless surface
//! as [`FlowError`]: a network that cannot be built, parameters that do not
//! validate, a matrix that cannot be factorized.
//!
//! Backend internals (linear solvers, the argmin glue) report through
//! `anyhow::Error` and are converted at the API boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    /// Parameters or JSON input that could not be read
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Solver error: {0}")]
    Solver(String),

    /// Factorization or triangular solve failed (singular or non-finite matrix)
    #[error("Linear solve error: {0}")]
    LinearSolve(String),

    /// Raised by parameter validation, before any iteration runs
    #[error("Configuration error: {0}")]
    Config(String),

    /// No slack candidate, unknown bus reference, empty connected component
    #[error("Network error: {0}")]
    Network(String),

    /// Slack mismatch could not be distributed and the failure policy is to throw
    #[error("Slack distribution error: {0}")]
    SlackDistribution(String),

    #[error("{0}")]
    Other(String),
}

pub type FlowResult<T> = Result<T, FlowError>;

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        FlowError::Other(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Parse(err.to_string())
    }
}

impl From<String> for FlowError {
    fn from(message: String) -> Self {
        FlowError::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_solve_message_is_prefixed() {
        let err = FlowError::LinearSolve("pivot 0 at column 3".into());
        assert_eq!(err.to_string(), "Linear solve error: pivot 0 at column 3");
    }

    #[test]
    fn backend_errors_keep_their_context() {
        let err: FlowError = anyhow::anyhow!("singular matrix")
            .context("jacobian factorization")
            .into();
        assert!(matches!(err, FlowError::Other(ref m) if m == "jacobian factorization: singular matrix"));
    }

    #[test]
    fn malformed_parameters_are_parse_errors() {
        let err: FlowError = serde_json::from_str::<f64>("{").unwrap_err().into();
        assert!(matches!(err, FlowError::Parse(_)));
        assert!(err.to_string().starts_with("Parse error"));
    }
}
