//! `handlers` crate — the contracts every step and action handler fulfils.
//!
//! The engine dispatches step execution through [`StepHandler`] trait
//! objects and automation actions through [`ActionHandler`]. Host code
//! implements these to send email, call APIs, write to storage and so on;
//! the engine never knows what a handler actually does.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod traits;

pub use error::HandlerError;
pub use traits::{ActionHandler, ExecutionContext, StepHandler};
