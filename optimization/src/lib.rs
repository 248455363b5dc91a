//! Parameters, parameter groups and the optimizers that update them.
//!
//! Everything here is driven by a caller-supplied closure: `Optimizer::step` runs it to obtain
//! fresh gradients and then applies its update rule to every parameter holding a gradient.

mod adam;
mod distributed;
mod error;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;
mod param_group;
mod parameter;
mod reduce;

pub use adam::Adam;
pub use distributed::DistributedOptimizer;
pub use error::{Error, Result};
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::{do_nothing_closure, Closure, Optimizer, StepArgs, SyncHooks};
pub use param_group::ParamGroup;
pub use parameter::Parameter;
pub use reduce::{GradientReducer, LocalReducer, ReplicaReducer};
