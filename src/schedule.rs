use std::num::NonZeroUsize;

use crate::error::{Error, Result};

/// Where an optimizer's accumulation window comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationWindow {
    /// Fixed when the optimizer was wrapped.
    Fixed(NonZeroUsize),
    /// Read from the execution context on every decision, so it may change during a run.
    Live,
}

impl AccumulationWindow {
    /// Builds the window from an optional, user-provided count.
    ///
    /// # Arguments
    /// * `accumulate_grad_batches` - `None` defers to the execution context.
    ///
    /// # Errors
    /// Returns `Error::InvalidAccumulation` when the count is smaller than 1.
    pub fn new(accumulate_grad_batches: Option<i64>) -> Result<Self> {
        match accumulate_grad_batches {
            Some(value) => validate_accumulation(value).map(Self::Fixed),
            None => Ok(Self::Live),
        }
    }

    /// Whether the window is deferred to the execution context.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Returns the fixed window, or the one produced by `live`.
    #[inline]
    pub fn resolve<F>(&self, live: F) -> NonZeroUsize
    where
        F: FnOnce() -> NonZeroUsize,
    {
        match *self {
            Self::Fixed(window) => window,
            Self::Live => live(),
        }
    }
}

/// Checks that an accumulation count is a positive integer.
///
/// # Errors
/// Returns `Error::InvalidAccumulation` naming `value` when it is smaller than 1.
pub fn validate_accumulation(value: i64) -> Result<NonZeroUsize> {
    usize::try_from(value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(Error::InvalidAccumulation { value })
}

/// Returns true if this batch ends an accumulation window.
#[inline]
pub fn accumulated_batches_reached(batch_idx: usize, window: NonZeroUsize) -> bool {
    batch_idx % window.get() == window.get() - 1
}

/// Returns true if the step should be deferred.
///
/// A window is cut short on the final batch of a loop so the last partial window still gets
/// applied.
#[inline]
pub fn should_accumulate(accumulation_done: bool, is_final_batch: bool) -> bool {
    !(accumulation_done || is_final_batch)
}
