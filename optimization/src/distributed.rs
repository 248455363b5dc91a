use log::debug;

use crate::{
    error::Result,
    optimizer::{Closure, Optimizer, StepArgs, SyncHooks},
    param_group::ParamGroup,
    reduce::GradientReducer,
};

/// Wraps an optimizer so its gradients are averaged across replicas before every update.
///
/// Synchronization happens implicitly at the start of `step`, after the closure ran. Callers that
/// need to synchronize earlier (e.g. to clip the reduced gradients) call `synchronize` themselves
/// and then step with `set_skip_synchronize(true)`.
pub struct DistributedOptimizer<O, R> {
    inner: O,
    reducer: R,
    skip_synchronize: bool,
}

impl<O: Optimizer, R: GradientReducer> DistributedOptimizer<O, R> {
    /// Creates a new `DistributedOptimizer`.
    ///
    /// # Arguments
    /// * `inner` - The optimizer applying the update rule.
    /// * `reducer` - How gradients are averaged across replicas.
    pub fn new(inner: O, reducer: R) -> Self {
        Self {
            inner,
            reducer,
            skip_synchronize: false,
        }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }

    fn reduce_grads(&self) -> Result<()> {
        for p in self.inner.param_groups().iter().flat_map(ParamGroup::params) {
            p.map_grad(|grad| self.reducer.all_reduce_mean(grad))?;
        }

        Ok(())
    }
}

impl<O: Optimizer, R: GradientReducer> SyncHooks for DistributedOptimizer<O, R> {
    fn synchronize(&mut self) -> Result<()> {
        debug!(world_size = self.reducer.world_size(); "synchronizing gradients");
        self.reduce_grads()
    }

    fn set_skip_synchronize(&mut self, skip: bool) {
        self.skip_synchronize = skip;
    }

    fn skip_synchronize(&self) -> bool {
        self.skip_synchronize
    }
}

impl<O: Optimizer, R: GradientReducer> Optimizer for DistributedOptimizer<O, R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn param_groups(&self) -> &[ParamGroup] {
        self.inner.param_groups()
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        self.inner.param_groups_mut()
    }

    fn step(&mut self, closure: &mut Closure<'_>, args: &StepArgs) -> Result<Option<f32>> {
        let loss = closure()?;

        if !self.skip_synchronize {
            self.synchronize()?;
        }

        let mut done = move || -> Result<Option<f32>> { Ok(loss) };
        self.inner.step(&mut done, args)
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad()
    }

    fn sync_hooks(&mut self) -> Option<&mut dyn SyncHooks> {
        Some(self)
    }
}
