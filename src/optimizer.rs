use std::{
    fmt,
    num::NonZeroUsize,
    sync::{Arc, Weak},
};

use log::{debug, info, warn};
use optimization::{do_nothing_closure, Closure, Optimizer, ParamGroup, StepArgs, SyncHooks};

use crate::{
    context::ExecutionContext,
    dispatch::StepStrategy,
    error::{Error, Result},
    schedule::{self, AccumulationWindow},
};

const STEP_ACTION: &str = "optimizer_step";
const STEP_AND_CLOSURE_ACTION: &str = "optimizer_step_and_closure";
const CLOSURE_ACTION: &str = "closure";

/// Significant decimal digits kept when rendering group options.
const REPR_DIGITS: i32 = 12;

/// The arguments of a single `ManagedOptimizer::step` call.
#[derive(Default)]
pub struct StepInvocation<'a> {
    closure: Option<Box<Closure<'a>>>,
    make_optimizer_step: Option<bool>,
    args: StepArgs,
}

impl<'a> StepInvocation<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the closure computing the forward and backward passes.
    ///
    /// Anything callable with no arguments is accepted. Other values are rejected when the
    /// call is compiled:
    ///
    /// ```compile_fail
    /// use optimizer_orchestration::StepInvocation;
    ///
    /// let invocation = StepInvocation::new().closure(42);
    /// ```
    pub fn closure<F>(mut self, closure: F) -> Self
    where
        F: FnMut() -> optimization::Result<Option<f32>> + 'a,
    {
        self.closure = Some(Box::new(closure));
        self
    }

    /// Overrides the accumulation policy for this call.
    pub fn make_optimizer_step(mut self, make_optimizer_step: bool) -> Self {
        self.make_optimizer_step = Some(make_optimizer_step);
        self
    }

    /// Arguments forwarded to the optimizer's `step`.
    pub fn args(mut self, args: StepArgs) -> Self {
        self.args = args;
        self
    }
}

impl fmt::Debug for StepInvocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInvocation")
            .field("has_closure", &self.closure.is_some())
            .field("make_optimizer_step", &self.make_optimizer_step)
            .field("args", &self.args)
            .finish()
    }
}

/// What a `step` call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// The optimizer stepped and gradients were reset.
    Stepped { loss: Option<f32> },
    /// Only the closure ran; gradients keep accumulating.
    Accumulated,
}

impl StepOutcome {
    pub fn is_stepped(&self) -> bool {
        matches!(self, Self::Stepped { .. })
    }

    pub fn loss(&self) -> Option<f32> {
        match *self {
            Self::Stepped { loss } => loss,
            Self::Accumulated => None,
        }
    }
}

/// Wraps an optimizer and decides, on every `step`, whether to update the parameters or keep
/// accumulating gradients.
///
/// The accumulation window either comes from the constructor or is read from the attached
/// `ExecutionContext` on every decision. Updates go through the context's accelerator, its
/// precision backend, or the optimizer itself, in that order of preference, and are always
/// followed by exactly one `zero_grad`.
pub struct ManagedOptimizer<O> {
    optimizer: O,
    window: AccumulationWindow,
    context: Option<Weak<dyn ExecutionContext>>,
    has_sync_hooks: bool,
}

impl<O: Optimizer> ManagedOptimizer<O> {
    /// Creates a new `ManagedOptimizer`.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer to wrap.
    /// * `accumulate_grad_batches` - How many batches to accumulate before each update, or
    ///   `None` to read it from the execution context at every step.
    ///
    /// # Errors
    /// Returns `Error::InvalidAccumulation` if `accumulate_grad_batches` is smaller than 1.
    pub fn new(mut optimizer: O, accumulate_grad_batches: Option<i64>) -> Result<Self> {
        let window = AccumulationWindow::new(accumulate_grad_batches)?;
        let has_sync_hooks = optimizer.sync_hooks().is_some();

        Ok(Self {
            optimizer,
            window,
            context: None,
            has_sync_hooks,
        })
    }

    /// Attaches the execution context read by every later `step`.
    ///
    /// Only a weak handle is kept: the caller stays responsible for keeping `ctx` alive.
    pub fn attach_context<C>(&mut self, ctx: &Arc<C>)
    where
        C: ExecutionContext + 'static,
    {
        if self.context.is_some() {
            warn!(optimizer = self.optimizer.name(); "replacing an attached execution context");
        }

        let weak: Weak<C> = Arc::downgrade(ctx);
        self.context = Some(weak);
        info!(optimizer = self.optimizer.name(); "execution context attached");
    }

    pub fn is_attached(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    fn context(&self) -> Result<Arc<dyn ExecutionContext>> {
        self.context
            .as_ref()
            .ok_or(Error::ContextNotAttached)?
            .upgrade()
            .ok_or(Error::ContextDropped)
    }

    /// The fixed accumulation window, or `None` when it is read from the context.
    pub fn accumulate_grad_batches(&self) -> Option<NonZeroUsize> {
        match self.window {
            AccumulationWindow::Fixed(window) => Some(window),
            AccumulationWindow::Live => None,
        }
    }

    /// Whether the current batch closes an accumulation window.
    ///
    /// # Errors
    /// Fails if no live context is attached.
    pub fn accumulated_batches_reached(&self) -> Result<bool> {
        let ctx = self.context()?;
        Ok(self.reached_in(&*ctx))
    }

    /// Whether a `step` without an override would only accumulate.
    ///
    /// Recomputed on every call, from the context's current batch.
    ///
    /// # Errors
    /// Fails if no live context is attached.
    pub fn should_accumulate(&self) -> Result<bool> {
        let ctx = self.context()?;
        Ok(self.should_accumulate_in(&*ctx))
    }

    fn reached_in(&self, ctx: &dyn ExecutionContext) -> bool {
        let window = self.window.resolve(|| ctx.accumulate_grad_batches());
        schedule::accumulated_batches_reached(ctx.batch_idx(), window)
    }

    fn should_accumulate_in(&self, ctx: &dyn ExecutionContext) -> bool {
        schedule::should_accumulate(self.reached_in(ctx), ctx.is_final_batch())
    }

    /// Either steps the optimizer or only runs the closure.
    ///
    /// When stepping, the closure runs through the strategy selected from the context and
    /// gradients are reset afterwards. When accumulating, the closure runs once with
    /// distributed synchronization suspended, and neither `step` nor `zero_grad` is called.
    ///
    /// # Arguments
    /// * `invocation` - The closure, the optional policy override, and extra step arguments.
    ///
    /// # Errors
    /// Fails if no live context is attached, before running anything. Closure, backend and
    /// optimizer errors are returned unchanged, and gradients are left as they are.
    pub fn step(&mut self, invocation: StepInvocation<'_>) -> Result<StepOutcome> {
        let ctx = self.context()?;

        let StepInvocation {
            closure,
            make_optimizer_step,
            args,
        } = invocation;

        let make_optimizer_step =
            make_optimizer_step.unwrap_or_else(|| !self.should_accumulate_in(&*ctx));

        let action = if closure.is_some() {
            STEP_AND_CLOSURE_ACTION
        } else {
            STEP_ACTION
        };
        let mut closure: Box<Closure<'_>> = match closure {
            Some(closure) => closure,
            None => Box::new(do_nothing_closure),
        };

        if !make_optimizer_step {
            debug!(batch_idx = ctx.batch_idx(); "accumulating gradients");

            let _suspension = ctx.suspend_distributed_sync();
            let _scope = ctx.profiler().profile(CLOSURE_ACTION);
            closure()?;

            return Ok(StepOutcome::Accumulated);
        }

        let strategy = StepStrategy::select(&*ctx);
        debug!(batch_idx = ctx.batch_idx(), strategy = strategy.name(); "stepping optimizer");

        let loss = {
            let _scope = ctx.profiler().profile(action);
            strategy.execute(&mut self.optimizer, &mut *closure, &args)?
        };

        self.optimizer.zero_grad();

        Ok(StepOutcome::Stepped { loss })
    }

    /// Resets the gradients of every parameter.
    pub fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        self.optimizer.param_groups()
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        self.optimizer.param_groups_mut()
    }

    pub fn name(&self) -> &str {
        self.optimizer.name()
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn into_inner(self) -> O {
        self.optimizer
    }

    /// Whether the wrapped optimizer synchronizes gradients on its own.
    pub fn has_sync_hooks(&self) -> bool {
        self.has_sync_hooks
    }

    fn hooks(&mut self) -> Result<&mut dyn SyncHooks> {
        let unavailable = || Error::SyncHooksUnavailable {
            optimizer: self.optimizer.name().to_string(),
        };

        if !self.has_sync_hooks {
            return Err(unavailable());
        }

        let err = unavailable();
        self.optimizer.sync_hooks().ok_or(err)
    }

    /// Reduces pending gradients across processes right away.
    ///
    /// # Errors
    /// `Error::SyncHooksUnavailable` when the optimizer has no synchronization hooks.
    pub fn synchronize(&mut self) -> Result<()> {
        Ok(self.hooks()?.synchronize()?)
    }

    /// Runs `f` with the optimizer's implicit synchronization turned off.
    ///
    /// Meant to be paired with an explicit `synchronize`, so gradients are reduced once.
    /// The previous setting is restored even if `f` fails.
    ///
    /// # Errors
    /// `Error::SyncHooksUnavailable` when the optimizer has no synchronization hooks, or
    /// whatever `f` fails with.
    pub fn skip_synchronize<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let hooks = self.hooks()?;
        let previous = hooks.skip_synchronize();
        hooks.set_skip_synchronize(true);

        let result = f(self);

        self.hooks()?.set_skip_synchronize(previous);
        result
    }
}

fn round_digits(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    let rounded = (value * factor).round() / factor;

    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

impl<O: Optimizer> fmt::Display for ManagedOptimizer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedOptimizer(optim={}, groups=[", self.optimizer.name())?;

        for (i, group) in self.optimizer.param_groups().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }

            f.write_str("(")?;
            for (j, (key, value)) in group.options().iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}={:?}", round_digits(*value, REPR_DIGITS))?;
            }
            f.write_str(")")?;
        }

        f.write_str("])")
    }
}

impl<O: Optimizer> fmt::Debug for ManagedOptimizer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedOptimizer")
            .field("optimizer", &self.optimizer.name())
            .field("window", &self.window)
            .field("attached", &self.is_attached())
            .field("has_sync_hooks", &self.has_sync_hooks)
            .finish()
    }
}
