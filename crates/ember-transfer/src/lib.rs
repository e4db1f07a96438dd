//! KV cache relocation for disaggregated prefill/decode serving
//!
//! [`TransferEngine::export`] gathers token vectors from prefill-side shard
//! pools into one contiguous pool; [`TransferEngine::import_fanout`] scatters
//! them from one pool into every card of the addressed decode shard. Both run
//! on a fixed number of copy workers so relocation never takes more than a
//! bounded share of the device.

mod engine;
mod kernel;

pub use engine::{TransferEngine, TransferLayout, TransferStats};
