//! Orchestrates optimizer steps during training.
//!
//! `ManagedOptimizer` wraps any `optimization::Optimizer` and decides, on every `step`, whether
//! the current batch closes a gradient accumulation window. Closing steps run through the
//! accelerator, the precision backend or the optimizer itself, and reset gradients afterwards;
//! the rest only run the closure while distributed synchronization is suspended.

pub mod accelerator;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod optimizer;
pub mod precision;
pub mod profiler;
pub mod schedule;
pub mod sync;
pub mod trainer;

pub use optimization;

pub use accelerator::{AcceleratorBackend, ReplicatedAccelerator};
pub use config::TrainerConfig;
pub use context::ExecutionContext;
pub use dispatch::StepStrategy;
pub use error::{Error, Result};
pub use optimizer::{ManagedOptimizer, StepInvocation, StepOutcome};
pub use precision::{GradScaler, NativeAmp, PrecisionBackend};
pub use profiler::{PassThroughProfiler, ProfileScope, Profiler, SimpleProfiler};
pub use sync::{SyncController, SyncSuspension};
pub use trainer::{AccumulationScheduler, TrainerContext, TrainerContextBuilder};
