use std::num::NonZeroUsize;

use crate::{
    accelerator::AcceleratorBackend, precision::PrecisionBackend, profiler::Profiler,
    sync::SyncSuspension,
};

/// The facts about the running loop that a `ManagedOptimizer` reads at step time.
///
/// Implementors own their state; optimizers only hold a weak handle to them and never mutate
/// them. Several optimizers may share one context.
pub trait ExecutionContext: Send + Sync {
    /// Index of the current batch within the epoch, starting at 0.
    fn batch_idx(&self) -> usize;

    /// The accumulation window currently in effect.
    fn accumulate_grad_batches(&self) -> NonZeroUsize;

    /// Whether the current batch is the last one of the loop.
    fn is_final_batch(&self) -> bool;

    /// The accelerator, when steps must go through a device-native primitive.
    fn accelerator(&self) -> Option<&dyn AcceleratorBackend>;

    /// The mixed-precision backend, if any.
    fn precision(&self) -> Option<&dyn PrecisionBackend>;

    fn profiler(&self) -> &dyn Profiler;

    /// Withholds cross-process gradient synchronization until the guard is dropped.
    fn suspend_distributed_sync(&self) -> SyncSuspension<'_>;

    fn on_native_accelerator(&self) -> bool {
        self.accelerator().is_some()
    }

    fn precision_backend_name(&self) -> Option<&str> {
        self.precision().map(|p| p.name())
    }
}
