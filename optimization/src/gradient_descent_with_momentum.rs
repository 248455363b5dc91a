use crate::{
    error::Result,
    optimizer::{Closure, Optimizer, StepArgs},
    param_group::ParamGroup,
    parameter::Parameter,
};

/// Gradient descent with a velocity term.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    groups: Vec<ParamGroup>,
    // velocity[group][param], allocated on the first update of each parameter.
    velocity: Vec<Vec<Option<Box<[f32]>>>>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer over a single parameter group.
    ///
    /// # Arguments
    /// * `params` - The parameters to optimize.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    pub fn new(params: Vec<Parameter>, learning_rate: f32, momentum: f32) -> Self {
        let group = ParamGroup::new(params)
            .with_option("lr", learning_rate as f64)
            .with_option("momentum", momentum as f64);

        Self::with_groups(vec![group])
    }

    /// Creates the optimizer over several groups, each defining `lr` and `momentum`.
    pub fn with_groups(groups: Vec<ParamGroup>) -> Self {
        let velocity = groups
            .iter()
            .map(|g| vec![None; g.params().len()])
            .collect();

        Self { groups, velocity }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn name(&self) -> &str {
        "GradientDescentWithMomentum"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, closure: &mut Closure<'_>, _args: &StepArgs) -> Result<Option<f32>> {
        let loss = closure()?;

        for (group, velocities) in self.groups.iter().zip(self.velocity.iter_mut()) {
            let lr = group.require("lr")? as f32;
            let mu = group.require("momentum")? as f32;

            for (p, velocity) in group.params().iter().zip(velocities.iter_mut()) {
                p.update(|w, g| {
                    let v = velocity.get_or_insert_with(|| vec![0.; w.len()].into_boxed_slice());

                    w.iter_mut()
                        .zip(g)
                        .zip(v.iter_mut())
                        .for_each(|((w, g), v)| {
                            *v = (mu * *v) + g;
                            *w -= lr * *v;
                        });
                });
            }
        }

        Ok(loss)
    }
}
