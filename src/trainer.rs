use std::{collections::BTreeMap, num::NonZeroUsize, sync::Arc};

use log::info;
use optimization::ReplicaReducer;
use parking_lot::RwLock;

use crate::{
    accelerator::{AcceleratorBackend, ReplicatedAccelerator},
    config::{AcceleratorConfig, PrecisionConfig, ProfilerConfig, TrainerConfig},
    context::ExecutionContext,
    error::{Error, Result},
    precision::{GradScaler, NativeAmp, PrecisionBackend},
    profiler::{PassThroughProfiler, Profiler, SimpleProfiler},
    schedule::validate_accumulation,
    sync::{SyncController, SyncSuspension},
};

/// Changes the accumulation window at given epochs.
///
/// The factor of the greatest starting epoch not after the current one applies. Epochs before
/// the first entry accumulate nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationScheduler {
    factors: BTreeMap<usize, NonZeroUsize>,
}

impl AccumulationScheduler {
    /// # Errors
    /// `Error::Misconfiguration` for an empty schedule, `Error::InvalidAccumulation` for a
    /// factor smaller than 1.
    pub fn new(scheduling: BTreeMap<usize, i64>) -> Result<Self> {
        if scheduling.is_empty() {
            return Err(Error::misconfiguration(
                "an accumulation schedule needs at least one epoch",
            ));
        }

        let factors = scheduling
            .into_iter()
            .map(|(epoch, factor)| Ok((epoch, validate_accumulation(factor)?)))
            .collect::<Result<_>>()?;

        Ok(Self { factors })
    }

    /// The same factor for every epoch.
    pub fn constant(factor: NonZeroUsize) -> Self {
        Self {
            factors: BTreeMap::from([(0, factor)]),
        }
    }

    pub fn factor(&self, epoch: usize) -> NonZeroUsize {
        self.factors
            .range(..=epoch)
            .next_back()
            .map_or(NonZeroUsize::MIN, |(_, &factor)| factor)
    }
}

impl Default for AccumulationScheduler {
    fn default() -> Self {
        Self::constant(NonZeroUsize::MIN)
    }
}

#[derive(Debug)]
struct LoopState {
    epoch: usize,
    batch_idx: usize,
    num_training_batches: Option<usize>,
    last_batch_marked: bool,
    accumulate_grad_batches: NonZeroUsize,
}

/// The execution context of a simple epoch/batch training loop.
///
/// The loop advances it through `on_epoch_start` and `on_batch_start`; optimizers read it
/// through `ExecutionContext`.
pub struct TrainerContext {
    state: RwLock<LoopState>,
    scheduler: AccumulationScheduler,
    accelerator: Option<Box<dyn AcceleratorBackend>>,
    precision: Option<Box<dyn PrecisionBackend>>,
    profiler: Arc<dyn Profiler>,
    sync: Option<SyncController>,
}

impl TrainerContext {
    pub fn builder() -> TrainerContextBuilder {
        TrainerContextBuilder::default()
    }

    /// Builds a context with the backends named by `config`.
    ///
    /// # Errors
    /// Fails if `config` doesn't validate, or if it asks for more than one replica: use
    /// `replicas` to get one context per replica instead.
    pub fn from_config(config: &TrainerConfig) -> Result<Self> {
        let mut replicas = Self::replicas(config)?;
        match replicas.len() {
            1 => Ok(replicas.remove(0)),
            n => Err(Error::misconfiguration(format!(
                "{n} replicas need a context each, use TrainerContext::replicas"
            ))),
        }
    }

    /// Builds one context per replica named by `config`, ordered by rank.
    ///
    /// Replicated contexts share an all-reduce over their gradients, so each must be driven from
    /// its own thread through the same amount of steps. They also suspend distributed sync while
    /// accumulating.
    ///
    /// # Errors
    /// Fails if `config` doesn't validate.
    pub fn replicas(config: &TrainerConfig) -> Result<Vec<Self>> {
        config.validate()?;

        match config.accelerator {
            AcceleratorConfig::Local => Ok(vec![Self::configured(config)?.build()]),
            AcceleratorConfig::Replicated { world_size } => {
                let world_size = NonZeroUsize::new(world_size)
                    .ok_or_else(|| Error::misconfiguration("world_size should be >= 1"))?;

                ReplicaReducer::create_world(world_size)
                    .into_iter()
                    .map(|reducer| {
                        Ok(Self::configured(config)?
                            .accelerator(ReplicatedAccelerator::new(reducer))
                            .distributed(true)
                            .build())
                    })
                    .collect()
            }
        }
    }

    fn configured(config: &TrainerConfig) -> Result<TrainerContextBuilder> {
        let mut builder = Self::builder()
            .num_training_batches(config.num_training_batches)
            .scheduler(AccumulationScheduler {
                factors: config.accumulation_factors()?,
            });

        if let PrecisionConfig::Native {
            init_scale,
            growth_interval,
        } = config.precision
        {
            let scaler = GradScaler::with_scale(init_scale).growth_interval(growth_interval);
            builder = builder.precision(NativeAmp::new(scaler));
        }

        builder = match config.profiler {
            ProfilerConfig::Passthrough => builder.profiler(Arc::new(PassThroughProfiler)),
            ProfilerConfig::Simple => builder.profiler(Arc::new(SimpleProfiler::new())),
        };

        Ok(builder)
    }

    /// Moves to `epoch`, rewinding the batch index and applying its accumulation factor.
    pub fn on_epoch_start(&self, epoch: usize) {
        let factor = self.scheduler.factor(epoch);
        let mut state = self.state.write();

        if factor != state.accumulate_grad_batches {
            info!(
                epoch = epoch, accumulate_grad_batches = factor.get();
                "accumulation factor changed"
            );
        }

        state.epoch = epoch;
        state.batch_idx = 0;
        state.last_batch_marked = false;
        state.accumulate_grad_batches = factor;
    }

    pub fn on_batch_start(&self, batch_idx: usize) {
        self.state.write().batch_idx = batch_idx;
    }

    /// Marks the current batch as the last one, for loaders of unknown length.
    pub fn mark_last_batch(&self) {
        self.state.write().last_batch_marked = true;
    }

    pub fn epoch(&self) -> usize {
        self.state.read().epoch
    }

    pub fn num_training_batches(&self) -> Option<usize> {
        self.state.read().num_training_batches
    }

    /// The profiler, shared so the caller can read its results.
    pub fn shared_profiler(&self) -> Arc<dyn Profiler> {
        Arc::clone(&self.profiler)
    }

    /// Whether gradients would be synchronized right now. Always true when not distributed.
    pub fn is_sync_enabled(&self) -> bool {
        self.sync.as_ref().map_or(true, SyncController::is_sync_enabled)
    }
}

impl ExecutionContext for TrainerContext {
    fn batch_idx(&self) -> usize {
        self.state.read().batch_idx
    }

    fn accumulate_grad_batches(&self) -> NonZeroUsize {
        self.state.read().accumulate_grad_batches
    }

    fn is_final_batch(&self) -> bool {
        let state = self.state.read();
        state.last_batch_marked
            || state
                .num_training_batches
                .is_some_and(|n| n.checked_sub(1) == Some(state.batch_idx))
    }

    fn accelerator(&self) -> Option<&dyn AcceleratorBackend> {
        self.accelerator.as_deref()
    }

    fn precision(&self) -> Option<&dyn PrecisionBackend> {
        self.precision.as_deref()
    }

    fn profiler(&self) -> &dyn Profiler {
        &*self.profiler
    }

    fn suspend_distributed_sync(&self) -> SyncSuspension<'_> {
        match &self.sync {
            Some(sync) => sync.suspend(),
            None => SyncSuspension::inert(),
        }
    }
}

#[derive(Default)]
pub struct TrainerContextBuilder {
    num_training_batches: Option<usize>,
    scheduler: AccumulationScheduler,
    accelerator: Option<Box<dyn AcceleratorBackend>>,
    precision: Option<Box<dyn PrecisionBackend>>,
    profiler: Option<Arc<dyn Profiler>>,
    distributed: bool,
}

impl TrainerContextBuilder {
    pub fn num_training_batches(mut self, num_training_batches: usize) -> Self {
        self.num_training_batches = Some(num_training_batches);
        self
    }

    /// Accumulates the same amount of batches on every epoch.
    pub fn accumulate_grad_batches(mut self, factor: NonZeroUsize) -> Self {
        self.scheduler = AccumulationScheduler::constant(factor);
        self
    }

    pub fn scheduler(mut self, scheduler: AccumulationScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn accelerator<A: AcceleratorBackend + 'static>(mut self, accelerator: A) -> Self {
        self.accelerator = Some(Box::new(accelerator));
        self
    }

    pub fn precision<P: PrecisionBackend + 'static>(mut self, precision: P) -> Self {
        self.precision = Some(Box::new(precision));
        self
    }

    pub fn profiler(mut self, profiler: Arc<dyn Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Whether gradients are synchronized across processes, enabling sync suspension.
    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    /// Builds the context, positioned at the first batch of epoch 0.
    pub fn build(self) -> TrainerContext {
        let accumulate_grad_batches = self.scheduler.factor(0);

        TrainerContext {
            state: RwLock::new(LoopState {
                epoch: 0,
                batch_idx: 0,
                num_training_batches: self.num_training_batches,
                last_batch_marked: false,
                accumulate_grad_batches,
            }),
            scheduler: self.scheduler,
            accelerator: self.accelerator,
            precision: self.precision,
            profiler: self
                .profiler
                .unwrap_or_else(|| Arc::new(PassThroughProfiler)),
            sync: self.distributed.then(SyncController::new),
        }
    }
}
