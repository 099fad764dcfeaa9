//! Host-resident telemetry agent.
//!
//! hostpipe collects host metrics and application logs, cuts their volume
//! on-host (pattern deduplication, counter-to-rate conversion, windowed
//! aggregation, priority sampling, cardinality bounding) and delivers the
//! remainder through a retrying, disk-buffered exporter. The [`agent`]
//! module wires everything together; the other modules are usable on their
//! own.

pub mod agent;
pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod logs;
pub mod metrics;
pub mod pipeline;
pub mod telemetry;

pub use agent::Agent;
pub use config::Config;
pub use error::AgentError;
