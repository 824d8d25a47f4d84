//! Session counters and throughput sampling

pub mod metrics;

pub use metrics::{SessionCounters, SessionStats, ThroughputMeter, ThroughputSample};
