use crate::{
    error::Result,
    optimizer::{Closure, Optimizer, StepArgs},
    param_group::ParamGroup,
    parameter::Parameter,
};

#[derive(Debug)]
struct Moments {
    v: Box<[f32]>,
    s: Box<[f32]>,
    beta1_t: f32,
    beta2_t: f32,
}

impl Moments {
    fn new(len: usize) -> Self {
        Self {
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            beta1_t: 1.,
            beta2_t: 1.,
        }
    }
}

#[derive(Debug)]
pub struct Adam {
    groups: Vec<ParamGroup>,
    moments: Vec<Vec<Option<Moments>>>,
}

impl Adam {
    /// Creates a new `Adam` optimizer over a single parameter group.
    ///
    /// # Arguments
    /// * `params` - The parameters to optimize.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(
        params: Vec<Parameter>,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        let group = ParamGroup::new(params)
            .with_option("lr", learning_rate as f64)
            .with_option("beta1", beta1 as f64)
            .with_option("beta2", beta2 as f64)
            .with_option("eps", epsilon as f64);

        Self::with_groups(vec![group])
    }

    /// Creates the optimizer over several groups. Missing betas and epsilon take the usual
    /// defaults (0.9, 0.999, 1e-8); `lr` is required.
    pub fn with_groups(groups: Vec<ParamGroup>) -> Self {
        let groups: Vec<_> = groups
            .into_iter()
            .map(|g| {
                g.with_default("beta1", 0.9)
                    .with_default("beta2", 0.999)
                    .with_default("eps", 1e-8)
            })
            .collect();

        let moments = groups
            .iter()
            .map(|g| g.params().iter().map(|_| None).collect())
            .collect();

        Self { groups, moments }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "Adam"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, closure: &mut Closure<'_>, _args: &StepArgs) -> Result<Option<f32>> {
        let loss = closure()?;

        for (group, moments) in self.groups.iter().zip(self.moments.iter_mut()) {
            let lr = group.require("lr")? as f32;
            let b1 = group.require("beta1")? as f32;
            let b2 = group.require("beta2")? as f32;
            let eps = group.require("eps")? as f32;

            for (p, slot) in group.params().iter().zip(moments.iter_mut()) {
                p.update(|params, grad| {
                    let m = slot.get_or_insert_with(|| Moments::new(params.len()));

                    m.beta1_t *= b1;
                    m.beta2_t *= b2;

                    let bc1 = 1. - m.beta1_t;
                    let bc2 = 1. - m.beta2_t;
                    let step_size = lr * (bc2.sqrt() / bc1);

                    params
                        .iter_mut()
                        .zip(grad)
                        .zip(m.v.iter_mut())
                        .zip(m.s.iter_mut())
                        .for_each(|(((p, g), v), s)| {
                            *v = b1 * *v + (1. - b1) * g;
                            *s = b2 * *s + (1. - b2) * g.powi(2);
                            *p -= step_size * *v / (s.sqrt() + eps);
                        });
                });
            }
        }

        Ok(loss)
    }
}
