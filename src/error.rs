/// The result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur while wrapping and stepping an optimizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The accumulation window is not a positive integer.
    #[error("accumulate_grad_batches parameter {value} should be >= 1")]
    InvalidAccumulation { value: i64 },

    /// Invalid configuration, caught before training starts.
    #[error("misconfiguration: {reason}")]
    Misconfiguration { reason: String },

    /// `step` was called before `attach_context`.
    #[error("no execution context attached, call `attach_context` before stepping")]
    ContextNotAttached,

    /// The attached execution context was dropped while the optimizer was still in use.
    #[error("the attached execution context no longer exists")]
    ContextDropped,

    /// The wrapped optimizer doesn't synchronize gradients on its own.
    #[error("optimizer `{optimizer}` does not expose synchronization hooks")]
    SyncHooksUnavailable { optimizer: String },

    /// A closure, optimizer or backend failed while stepping.
    #[error(transparent)]
    Optimization(#[from] optimization::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn misconfiguration(reason: impl Into<String>) -> Self {
        Self::Misconfiguration {
            reason: reason.into(),
        }
    }
}
