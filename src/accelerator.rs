use log::debug;
use optimization::{do_nothing_closure, Closure, GradientReducer, Optimizer, ParamGroup, StepArgs};

use crate::error::Result;

/// A device runtime that owns the optimizer step primitive.
pub trait AcceleratorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Steps `optimizer` through the device runtime.
    ///
    /// Only keyword arguments reach this primitive: `StepStrategy` drops the positional
    /// arguments given to `ManagedOptimizer::step` on this path.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer to step.
    /// * `closure` - Recomputes the loss and gradients. Called exactly once.
    /// * `kwargs` - Keyword arguments for `Optimizer::step`.
    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        kwargs: &StepArgs,
    ) -> Result<Option<f32>>;
}

/// Runs a replica of the model per device and averages gradients across them before stepping.
///
/// Every replica takes part in the reduction of every parameter. A parameter the closure left
/// without a gradient contributes zeros, so replicas whose batches skipped it stay in lockstep.
pub struct ReplicatedAccelerator<R> {
    reducer: R,
}

impl<R: GradientReducer> ReplicatedAccelerator<R> {
    pub fn new(reducer: R) -> Self {
        Self { reducer }
    }

    pub fn world_size(&self) -> usize {
        self.reducer.world_size()
    }
}

impl<R: GradientReducer> AcceleratorBackend for ReplicatedAccelerator<R> {
    fn name(&self) -> &str {
        "replicated"
    }

    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        kwargs: &StepArgs,
    ) -> Result<Option<f32>> {
        let loss = closure()?;

        debug!(world_size = self.reducer.world_size(); "reducing gradients across replicas");
        for p in optimizer.param_groups().iter().flat_map(ParamGroup::params) {
            if !p.has_grad() {
                p.accumulate_grad(&vec![0.; p.len()])?;
            }
            p.map_grad(|grad| self.reducer.all_reduce_mean(grad))?;
        }

        optimizer.step(&mut do_nothing_closure, kwargs)?;
        Ok(loss)
    }
}
