use std::{
    num::NonZeroUsize,
    sync::{Arc, Barrier},
};

use log::trace;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Averages gradient buffers across every replica taking part in training.
pub trait GradientReducer: Send + Sync {
    /// The amount of replicas contributing to each reduction.
    fn world_size(&self) -> usize;

    /// Replaces `grad` with the element-wise mean of every replica's buffer.
    ///
    /// # Errors
    /// Returns `Error::Reduce` when the replicas can't be reached or disagree on the length.
    fn all_reduce_mean(&self, grad: &mut [f32]) -> Result<()>;
}

/// A reducer for a single process: the mean of one buffer is itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl GradientReducer for LocalReducer {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _grad: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReduceRound {
    sum: Vec<f32>,
    len: Option<usize>,
    mismatch: Option<(usize, usize)>,
}

#[derive(Debug)]
struct SharedRound {
    round: Mutex<ReduceRound>,
    barrier: Barrier,
}

/// One replica's handle on an in-process all-reduce.
///
/// Every handle of a world must call `all_reduce_mean` the same number of times with buffers of
/// the same length, each from its own thread; a call blocks until the whole world has
/// contributed.
#[derive(Debug, Clone)]
pub struct ReplicaReducer {
    rank: usize,
    world_size: NonZeroUsize,
    shared: Arc<SharedRound>,
}

impl ReplicaReducer {
    /// Creates the handles of a world of `world_size` replicas, ordered by rank.
    pub fn create_world(world_size: NonZeroUsize) -> Vec<Self> {
        let shared = Arc::new(SharedRound {
            round: Mutex::new(ReduceRound::default()),
            barrier: Barrier::new(world_size.get()),
        });

        (0..world_size.get())
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl GradientReducer for ReplicaReducer {
    fn world_size(&self) -> usize {
        self.world_size.get()
    }

    fn all_reduce_mean(&self, grad: &mut [f32]) -> Result<()> {
        {
            let mut round = self.shared.round.lock();
            let len = round.len;
            match len {
                None => {
                    round.len = Some(grad.len());
                    round.sum = grad.to_vec();
                }
                Some(len) if len == grad.len() => {
                    round.sum.iter_mut().zip(&*grad).for_each(|(s, g)| *s += g);
                }
                Some(len) => round.mismatch = Some((grad.len(), len)),
            }
        }

        // Every contribution is in.
        self.shared.barrier.wait();

        let outcome = {
            let round = self.shared.round.lock();
            match round.mismatch {
                Some((got, expected)) => Err(Error::Reduce {
                    reason: format!("replicas disagree on length: got {got}, expected {expected}"),
                }),
                None => {
                    let n = self.world_size.get() as f32;
                    grad.iter_mut().zip(&round.sum).for_each(|(g, s)| *g = s / n);
                    Ok(())
                }
            }
        };

        // Every replica has read the result.
        if self.shared.barrier.wait().is_leader() {
            *self.shared.round.lock() = ReduceRound::default();
        }
        self.shared.barrier.wait();

        trace!(rank = self.rank; "all-reduce round done");
        outcome
    }
}

impl<R: GradientReducer + ?Sized> GradientReducer for Arc<R> {
    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_mean(&self, grad: &mut [f32]) -> Result<()> {
        (**self).all_reduce_mean(grad)
    }
}
