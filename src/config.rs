use std::{collections::BTreeMap, fs, num::NonZeroUsize, path::Path};

use optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer, Parameter};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    schedule::validate_accumulation,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        lr: f32,
        #[serde(default = "default_b1")]
        b1: f32,
        #[serde(default = "default_b2")]
        b2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
    },
    GradientDescent {
        lr: f32,
    },
    GradientDescentWithMomentum {
        lr: f32,
        mu: f32,
    },
}

fn default_b1() -> f32 {
    0.9
}

fn default_b2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

impl OptimizerConfig {
    fn learning_rate(&self) -> f32 {
        match *self {
            Self::Adam { lr, .. }
            | Self::GradientDescent { lr }
            | Self::GradientDescentWithMomentum { lr, .. } => lr,
        }
    }

    /// Builds the configured optimizer over `params`.
    pub fn build(&self, params: Vec<Parameter>) -> Box<dyn Optimizer> {
        match *self {
            Self::Adam { lr, b1, b2, eps } => Box::new(Adam::new(params, lr, b1, b2, eps)),
            Self::GradientDescent { lr } => Box::new(GradientDescent::new(params, lr)),
            Self::GradientDescentWithMomentum { lr, mu } => {
                Box::new(GradientDescentWithMomentum::new(params, lr, mu))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionConfig {
    #[default]
    Full,
    Native {
        #[serde(default = "default_init_scale")]
        init_scale: f32,
        #[serde(default = "default_growth_interval")]
        growth_interval: usize,
    },
}

fn default_init_scale() -> f32 {
    65536.
}

fn default_growth_interval() -> usize {
    2000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorConfig {
    #[default]
    Local,
    /// `world_size` in-process replicas averaging their gradients on every step.
    Replicated {
        world_size: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerConfig {
    Passthrough,
    #[default]
    Simple,
}

/// Everything needed to set up a training run, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_num_training_batches")]
    pub num_training_batches: usize,
    #[serde(default = "default_accumulate_grad_batches")]
    pub accumulate_grad_batches: i64,
    /// Starting epoch to accumulation factor. Replaces `accumulate_grad_batches` when present.
    #[serde(default)]
    pub accumulation_schedule: Option<BTreeMap<usize, i64>>,
    #[serde(default)]
    pub precision: PrecisionConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_epochs() -> usize {
    20
}

fn default_num_training_batches() -> usize {
    8
}

fn default_accumulate_grad_batches() -> i64 {
    1
}

fn default_optimizer() -> OptimizerConfig {
    OptimizerConfig::GradientDescent { lr: 0.05 }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            num_training_batches: default_num_training_batches(),
            accumulate_grad_batches: default_accumulate_grad_batches(),
            accumulation_schedule: None,
            precision: PrecisionConfig::default(),
            accelerator: AcceleratorConfig::default(),
            profiler: ProfilerConfig::default(),
            optimizer: default_optimizer(),
            seed: None,
        }
    }
}

impl TrainerConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    /// Fails if the file can't be read, isn't valid JSON for this type, or doesn't validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every count before anything is built from this configuration.
    ///
    /// # Errors
    /// `Error::InvalidAccumulation` for a bad accumulation factor, `Error::Misconfiguration`
    /// for anything else.
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(Error::misconfiguration("max_epochs should be >= 1"));
        }

        if self.num_training_batches == 0 {
            return Err(Error::misconfiguration("num_training_batches should be >= 1"));
        }

        validate_accumulation(self.accumulate_grad_batches)?;

        if let Some(schedule) = &self.accumulation_schedule {
            if schedule.is_empty() {
                return Err(Error::misconfiguration(
                    "accumulation_schedule should define at least one epoch",
                ));
            }

            if self.accumulate_grad_batches != 1 {
                return Err(Error::misconfiguration(
                    "accumulate_grad_batches and accumulation_schedule are mutually exclusive",
                ));
            }

            for &factor in schedule.values() {
                validate_accumulation(factor)?;
            }
        }

        if let PrecisionConfig::Native {
            init_scale,
            growth_interval,
        } = self.precision
        {
            if !(init_scale.is_finite() && init_scale > 0.) {
                return Err(Error::misconfiguration(format!(
                    "init_scale should be a positive number, got {init_scale}"
                )));
            }

            if growth_interval == 0 {
                return Err(Error::misconfiguration("growth_interval should be >= 1"));
            }
        }

        if let AcceleratorConfig::Replicated { world_size: 0 } = self.accelerator {
            return Err(Error::misconfiguration("world_size should be >= 1"));
        }

        let lr = self.optimizer.learning_rate();
        if !(lr.is_finite() && lr > 0.) {
            return Err(Error::misconfiguration(format!(
                "learning rate should be a positive number, got {lr}"
            )));
        }

        Ok(())
    }

    /// The accumulation factor per starting epoch.
    pub fn accumulation_factors(&self) -> Result<BTreeMap<usize, NonZeroUsize>> {
        match &self.accumulation_schedule {
            Some(schedule) => schedule
                .iter()
                .map(|(&epoch, &factor)| Ok((epoch, validate_accumulation(factor)?)))
                .collect(),
            None => Ok(BTreeMap::from([(
                0,
                validate_accumulation(self.accumulate_grad_batches)?,
            )])),
        }
    }
}
