/// The result type used across the optimization crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by parameters, optimizers and closures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two buffers that must have the same length don't.
    #[error("size mismatch for {what}: got {got}, expected {expected}")]
    SizeMismatch {
        /// Human-readable context for the mismatch (e.g. "grad").
        what: &'static str,
        /// Observed length.
        got: usize,
        /// Expected length.
        expected: usize,
    },

    /// A parameter group lacks an option its optimizer requires.
    #[error("parameter group is missing option `{key}`")]
    MissingOption {
        /// The option name.
        key: String,
    },

    /// A user closure failed while computing the loss or its gradients.
    #[error("closure failed: {reason}")]
    Closure {
        /// Description of what went wrong.
        reason: String,
    },

    /// Gradients could not be reduced across replicas.
    #[error("gradient reduction failed: {reason}")]
    Reduce {
        /// Description of what went wrong.
        reason: String,
    },
}

impl Error {
    /// Builds a `Closure` error from anything printable.
    pub fn closure(reason: impl ToString) -> Self {
        Self::Closure {
            reason: reason.to_string(),
        }
    }
}
