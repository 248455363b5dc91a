use std::collections::BTreeMap;

use crate::{error::Result, param_group::ParamGroup};

/// A zero-argument callable that runs a forward and backward pass.
///
/// It accumulates gradients into the parameters it captured and may report the loss it computed.
pub type Closure<'a> = dyn FnMut() -> Result<Option<f32>> + 'a;

/// A closure that does nothing, used when a step is requested without one.
pub fn do_nothing_closure() -> Result<Option<f32>> {
    Ok(None)
}

/// Extra positional and keyword arguments forwarded to `Optimizer::step`.
///
/// The orchestration layer never interprets them; optimizers may read whichever they understand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs {
    positional: Vec<f64>,
    keyword: BTreeMap<String, f64>,
}

impl StepArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: appends a positional argument.
    pub fn arg(mut self, value: f64) -> Self {
        self.positional.push(value);
        self
    }

    /// Builder: sets a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: f64) -> Self {
        self.keyword.insert(key.into(), value);
        self
    }

    pub fn positional(&self) -> &[f64] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, f64> {
        &self.keyword
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.keyword.get(key).copied()
    }

    /// Returns a copy holding only the keyword arguments.
    pub fn keyword_only(&self) -> Self {
        Self {
            positional: Vec::new(),
            keyword: self.keyword.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// Hooks exposed by optimizers that synchronize gradients across processes themselves.
pub trait SyncHooks {
    /// Reduces the pending gradients across all processes right away.
    fn synchronize(&mut self) -> Result<()>;

    /// Enables or disables the implicit synchronization performed by `step`.
    fn set_skip_synchronize(&mut self, skip: bool);

    /// Whether `step` currently skips its implicit synchronization.
    fn skip_synchronize(&self) -> bool;
}

/// Defines the strategy for updating parameters based on their accumulated gradients.
pub trait Optimizer {
    /// Short type name used in diagnostics.
    fn name(&self) -> &str;

    /// The parameter groups this optimizer updates, in order.
    fn param_groups(&self) -> &[ParamGroup];

    /// Mutable access to the groups, mostly for schedulers adjusting options.
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Runs `closure` and then updates every parameter that holds a gradient.
    ///
    /// # Arguments
    /// * `closure` - Recomputes the loss and accumulates gradients.
    /// * `args` - Extra arguments from the caller.
    ///
    /// # Returns
    /// The loss reported by the closure, if any.
    ///
    /// # Errors
    /// Propagates closure failures and missing group options. Parameters are left untouched
    /// when the closure fails.
    fn step(&mut self, closure: &mut Closure<'_>, args: &StepArgs) -> Result<Option<f32>>;

    /// Resets the gradient of every parameter to zero.
    fn zero_grad(&mut self) {
        self.param_groups()
            .iter()
            .flat_map(ParamGroup::params)
            .for_each(|p| p.zero_grad());
    }

    /// Synchronization hooks, for optimizers that reduce gradients on their own.
    fn sync_hooks(&mut self) -> Option<&mut dyn SyncHooks> {
        None
    }
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn param_groups(&self) -> &[ParamGroup] {
        (**self).param_groups()
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        (**self).param_groups_mut()
    }

    fn step(&mut self, closure: &mut Closure<'_>, args: &StepArgs) -> Result<Option<f32>> {
        (**self).step(closure, args)
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad()
    }

    fn sync_hooks(&mut self) -> Option<&mut dyn SyncHooks> {
        (**self).sync_hooks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_only_drops_positionals() {
        let args = StepArgs::new().arg(1.).arg(2.).kwarg("scale", 0.5);
        let kw = args.keyword_only();

        assert!(kw.positional().is_empty());
        assert_eq!(kw.get("scale"), Some(0.5));
        assert!(!kw.is_empty());
        assert!(StepArgs::new().is_empty());
    }
}
