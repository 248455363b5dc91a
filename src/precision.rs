use log::{debug, warn};
use optimization::{do_nothing_closure, Closure, Optimizer, ParamGroup, StepArgs};
use parking_lot::Mutex;

use crate::error::Result;

/// A mixed-precision execution path for optimizer steps.
pub trait PrecisionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// The factor closures should multiply their loss by before computing gradients.
    fn loss_scale(&self) -> f32 {
        1.
    }

    /// Runs `closure` and steps `optimizer`, applying whatever loss scaling the backend uses.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer to step.
    /// * `closure` - Recomputes the loss and gradients. Called exactly once.
    /// * `args` - Forwarded to `Optimizer::step` unchanged.
    ///
    /// # Returns
    /// The loss reported by the closure.
    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        args: &StepArgs,
    ) -> Result<Option<f32>>;
}

/// Dynamic loss scaling, to keep low-precision gradients from underflowing.
///
/// Gradients are produced from a loss multiplied by `scale`. Before the update they are divided
/// back, and if any of them overflowed the update is skipped and the scale backs off.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    enabled: bool,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl GradScaler {
    /// Initial scale 2^16, growth 2.0, backoff 0.5, growth interval 2000 steps.
    pub fn new() -> Self {
        Self {
            scale: 65536.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            found_inf: false,
            enabled: true,
        }
    }

    pub fn with_scale(init_scale: f32) -> Self {
        Self {
            scale: init_scale,
            ..Self::new()
        }
    }

    pub fn growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval;
        self
    }

    pub fn growth_factor(mut self, factor: f32) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn backoff_factor(mut self, factor: f32) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The current scale, or 1 when disabled.
    pub fn scale(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale_loss(&self, loss: f32) -> f32 {
        loss * self.scale()
    }

    /// Whether a non-finite gradient was seen since the last `update`.
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Divides `grads` by the scale in place, remembering whether any of them overflowed.
    pub fn unscale_grads(&mut self, grads: &mut [f32]) {
        if !self.enabled {
            return;
        }

        let inv_scale = 1. / self.scale;
        for g in grads.iter_mut() {
            if !g.is_finite() {
                self.found_inf = true;
            }
            *g *= inv_scale;
        }
    }

    /// Adjusts the scale after a step and clears the overflow flag.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }

        if self.found_inf {
            self.scale = (self.scale * self.backoff_factor).max(1.);
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale = (self.scale * self.growth_factor).min(f32::MAX / 2.);
                self.growth_tracker = 0;
            }
        }

        self.found_inf = false;
    }
}

/// Native automatic mixed precision: unscales gradients and skips steps that overflowed.
#[derive(Debug, Default)]
pub struct NativeAmp {
    scaler: Mutex<GradScaler>,
}

impl NativeAmp {
    pub fn new(scaler: GradScaler) -> Self {
        Self {
            scaler: Mutex::new(scaler),
        }
    }

    /// The scale closures should multiply their losses by.
    pub fn scale(&self) -> f32 {
        self.scaler.lock().scale()
    }

    pub fn scale_loss(&self, loss: f32) -> f32 {
        self.scaler.lock().scale_loss(loss)
    }
}

impl PrecisionBackend for NativeAmp {
    fn name(&self) -> &str {
        "native_amp"
    }

    fn loss_scale(&self) -> f32 {
        self.scale()
    }

    fn optimizer_step(
        &self,
        optimizer: &mut dyn Optimizer,
        closure: &mut Closure<'_>,
        args: &StepArgs,
    ) -> Result<Option<f32>> {
        let loss = closure()?;

        let mut scaler = self.scaler.lock();
        for p in optimizer.param_groups().iter().flat_map(ParamGroup::params) {
            p.map_grad(|grad| {
                scaler.unscale_grads(grad);
                Ok(())
            })?;
        }

        if scaler.found_inf() {
            warn!(scale = scaler.scale(); "non-finite gradients found, skipping optimizer step");
        } else {
            optimizer.step(&mut do_nothing_closure, args)?;
        }

        scaler.update();
        debug!(scale = scaler.scale(); "loss scale updated");

        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimization::{GradientDescent, Parameter};

    #[test]
    fn scaler_defaults() {
        let scaler = GradScaler::new();
        assert_eq!(scaler.scale(), 65536.);
        assert_eq!(scaler.scale_loss(2.), 131072.);
        assert!(!scaler.found_inf());
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let mut scaler = GradScaler::with_scale(8.).enabled(false);
        let mut grads = [4., f32::INFINITY];
        scaler.unscale_grads(&mut grads);

        assert_eq!(scaler.scale(), 1.);
        assert_eq!(grads[0], 4.);
        assert!(!scaler.found_inf());
    }

    #[test]
    fn scale_backs_off_on_overflow() {
        let mut scaler = GradScaler::with_scale(1024.);
        let mut grads = [1., f32::NAN];
        scaler.unscale_grads(&mut grads);
        assert!(scaler.found_inf());

        scaler.update();
        assert_eq!(scaler.scale(), 512.);
        assert!(!scaler.found_inf());
    }

    #[test]
    fn scale_grows_after_interval() {
        let mut scaler = GradScaler::with_scale(4.).growth_interval(3);
        for _ in 0..2 {
            scaler.update();
            assert_eq!(scaler.scale(), 4.);
        }

        scaler.update();
        assert_eq!(scaler.scale(), 8.);
    }

    #[test]
    fn native_amp_unscales_before_stepping() {
        let p = Parameter::new(vec![1.]);
        let mut opt = GradientDescent::new(vec![p.clone()], 1.);
        let amp = NativeAmp::new(GradScaler::with_scale(4.));

        let scale = amp.scale();
        let grad_param = p.clone();
        let mut closure = move || -> optimization::Result<Option<f32>> {
            grad_param.accumulate_grad(&[2. * scale])?;
            Ok(Some(0.25))
        };

        let loss = amp
            .optimizer_step(&mut opt, &mut closure, &StepArgs::new())
            .unwrap();

        assert_eq!(loss, Some(0.25));
        assert_eq!(p.value(), vec![-1.]);
    }

    #[test]
    fn native_amp_skips_overflowed_step() {
        let p = Parameter::new(vec![1.]);
        let mut opt = GradientDescent::new(vec![p.clone()], 1.);
        let amp = NativeAmp::new(GradScaler::with_scale(4.));

        let grad_param = p.clone();
        let mut closure = move || -> optimization::Result<Option<f32>> {
            grad_param.accumulate_grad(&[f32::INFINITY])?;
            Ok(None)
        };

        amp.optimizer_step(&mut opt, &mut closure, &StepArgs::new())
            .unwrap();

        assert_eq!(p.value(), vec![1.]);
        assert_eq!(amp.scale(), 2.);
    }
}
