use crate::{
    error::Result,
    optimizer::{Closure, Optimizer, StepArgs},
    param_group::ParamGroup,
    parameter::Parameter,
};

/// Gradient descent optimization algorithm.
#[derive(Debug)]
pub struct GradientDescent {
    groups: Vec<ParamGroup>,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer over a single parameter group.
    ///
    /// # Arguments
    /// * `params` - The parameters to optimize.
    /// * `learning_rate` - The *length* of the steps taken on `step`.
    pub fn new(params: Vec<Parameter>, learning_rate: f32) -> Self {
        let group = ParamGroup::new(params).with_option("lr", learning_rate as f64);
        Self::with_groups(vec![group])
    }

    /// Creates a new `GradientDescent` optimizer over several groups.
    ///
    /// Every group must define `lr`.
    pub fn with_groups(groups: Vec<ParamGroup>) -> Self {
        Self { groups }
    }
}

impl Optimizer for GradientDescent {
    fn name(&self) -> &str {
        "GradientDescent"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Makes a step in the opposite direction of the gradient, with a length of `lr`.
    fn step(&mut self, closure: &mut Closure<'_>, _args: &StepArgs) -> Result<Option<f32>> {
        let loss = closure()?;

        for group in &self.groups {
            let lr = group.require("lr")? as f32;

            for p in group.params() {
                p.update(|w, g| {
                    for (w, g) in w.iter_mut().zip(g) {
                        *w -= lr * g;
                    }
                });
            }
        }

        Ok(loss)
    }
}
