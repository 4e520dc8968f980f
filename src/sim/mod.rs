//! Simulation support
//!
//! Fault-injecting stand-ins for the object source and the delivery sink,
//! and a seed-driven harness that runs the coordinator against them.

pub mod dst;
pub mod rng;
pub mod sink;
pub mod source;

pub use dst::{
    run_dst_batch, summarize_batch, BatchDSTConfig, BatchDSTHarness, BatchDSTResult, BatchWorkload,
    Upload,
};
pub use rng::DeterministicRng;
pub use sink::{RecordedDelivery, SimulatedSink, SimulatedSinkConfig, SinkResponse};
pub use source::{SimulatedObjectSource, SimulatedSourceConfig, SimulatedSourceStats};
