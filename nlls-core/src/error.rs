use nlls_linalg::SolverError;

/// All errors the optimizer core can report.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum OptimizerError {
    /// A public entry point was called with arguments that can never form a
    /// valid problem (e.g. a design variable's parameter vector didn't
    /// match its declared minimal dimension).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `optimize` (or a method that needs it) was called before
    /// `check_setup` succeeded, or before any active design variables or
    /// error terms were registered.
    #[error("problem is not initialized: {0}")]
    NotInitialized(String),

    /// A value produced during assembly or the linear solve was NaN or
    /// infinite.
    #[error("numeric failure during {stage}: {detail}")]
    NumericFailure { stage: &'static str, detail: String },

    /// `check_setup` found an inconsistency between the problem's
    /// declared structure and what it actually evaluates to (e.g. an
    /// analytic Jacobian disagreeing with its finite-difference check, or
    /// a design variable referenced by an error term but never activated).
    #[error("problem setup check failed: {0}")]
    SetupCheckFailed(String),

    /// The linear system solver backend failed to produce a step.
    #[error("linear solver failed: {0}")]
    LinearSolverFailed(#[from] error_stack::Report<SolverError>),
}

/// Convenience alias used throughout the crate's public API.
pub type OptimizerResult<T> = Result<T, OptimizerError>;
