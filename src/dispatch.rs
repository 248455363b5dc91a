use std::fmt;

use optimization::{Closure, Optimizer, StepArgs};

use crate::{
    accelerator::AcceleratorBackend, context::ExecutionContext, error::Result,
    precision::PrecisionBackend,
};

/// The path an optimizer step takes.
#[derive(Clone, Copy)]
pub enum StepStrategy<'a> {
    /// Through the accelerator's own step primitive.
    Accelerator(&'a dyn AcceleratorBackend),
    /// Through the mixed-precision backend, which scales gradients.
    Precision(&'a dyn PrecisionBackend),
    /// The optimizer's own `step`.
    Local,
}

impl<'a> StepStrategy<'a> {
    /// Picks the strategy for the context's current state.
    ///
    /// An accelerator takes precedence over a precision backend when both are present.
    pub fn select<C>(ctx: &'a C) -> Self
    where
        C: ExecutionContext + ?Sized,
    {
        if let Some(accelerator) = ctx.accelerator() {
            Self::Accelerator(accelerator)
        } else if let Some(precision) = ctx.precision() {
            Self::Precision(precision)
        } else {
            Self::Local
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Accelerator(accelerator) => accelerator.name(),
            Self::Precision(precision) => precision.name(),
            Self::Local => "local",
        }
    }

    /// Steps `optimizer` along this path.
    ///
    /// # Errors
    /// Whatever the closure, the backend or the optimizer fail with, unchanged.
    pub fn execute(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        args: &StepArgs,
    ) -> Result<Option<f32>> {
        match self {
            Self::Accelerator(accelerator) => {
                accelerator.optimizer_step(optimizer, closure, &args.keyword_only())
            }
            Self::Precision(precision) => precision.optimizer_step(optimizer, closure, args),
            Self::Local => Ok(optimizer.step(closure, args)?),
        }
    }
}

impl fmt::Debug for StepStrategy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerator(a) => f.debug_tuple("Accelerator").field(&a.name()).finish(),
            Self::Precision(p) => f.debug_tuple("Precision").field(&p.name()).finish(),
            Self::Local => f.write_str("Local"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimization::{GradientDescent, Parameter};

    #[test]
    fn local_steps_the_optimizer_directly() {
        let p = Parameter::new(vec![1.]);
        let mut opt = GradientDescent::new(vec![p.clone()], 0.1);

        let grad_param = p.clone();
        let mut closure = move || -> optimization::Result<Option<f32>> {
            grad_param.accumulate_grad(&[10.])?;
            Ok(Some(3.))
        };

        let strategy = StepStrategy::Local;
        let loss = strategy
            .execute(&mut opt, &mut closure, &StepArgs::new())
            .unwrap();

        assert_eq!(loss, Some(3.));
        assert_eq!(p.value(), vec![0.]);
        assert_eq!(strategy.name(), "local");
    }

    #[test]
    fn closure_errors_propagate() {
        let mut opt = GradientDescent::new(vec![], 0.1);
        let mut closure = || -> optimization::Result<Option<f32>> {
            Err(optimization::Error::closure("backward failed"))
        };

        let err = StepStrategy::Local
            .execute(&mut opt, &mut closure, &StepArgs::new())
            .unwrap_err();

        assert!(err.to_string().contains("backward failed"));
    }
}
