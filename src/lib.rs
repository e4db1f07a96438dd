//! # Ember
//!
//! Serving core for continuous-batching LLM inference: token-granular KV cache
//! pools with prefix sharing, an admission scheduler, per-shard step workers,
//! and cache relocation between prefill and decode instances.
//!
//! ## Crates
//!
//! - [`ember_types`]: ids, requests, configuration, errors, shared request records
//! - [`ember_kv`]: memory pools, prefix cache, handles
//! - [`ember_interfaces`]: batch wire types and the executor/sampler seams
//! - [`ember_scheduler`]: admission and batch planning
//! - [`ember_backend`]: per-shard request lifecycle
//! - [`ember_transfer`]: export and import fan-out of cache vectors
//!
//! This crate wires them together into a [`ServingEngine`] and, for split
//! deployments, a [`DisaggregatedEngine`].

pub mod config;
pub mod disaggregated;
pub mod engine;
pub mod logging;

pub use config::EmberConfig;
pub use disaggregated::{DisaggregatedEngine, DisaggregatedSummary};
pub use engine::{CycleSummary, RequestOutcome, ServingEngine, WorkerCommand};
pub use logging::{init_logging, init_test_logging};

pub use ember_backend;
pub use ember_interfaces;
pub use ember_kv;
pub use ember_scheduler;
pub use ember_transfer;
pub use ember_types;

pub use ember_types::{EmberError, Result};
