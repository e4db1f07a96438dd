//! Request lifecycle for admitted batches
//!
//! A [`Backend`] owns the requests admitted to one shard. Each step it builds
//! the executor input, samples, updates per-request state and publishes the
//! shared record in write order.

pub mod backend;
pub mod request;

pub use backend::Backend;
pub use ember_interfaces::{RequestStepResult, StepReport};
pub use request::InferReq;
