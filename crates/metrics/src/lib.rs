//! Metrics collection and export for switchboard.
//!
//! Call sites record through the `metrics` facade macros re-exported here,
//! using the names in the definition modules. With the `prometheus` feature
//! the recorder renders them for the `/metrics` endpoint; without it every
//! call is a no-op.
//!
//! ```rust,ignore
//! use switchboard_metrics::{counter, labels, outbound};
//!
//! counter!(outbound::MESSAGES_TOTAL, labels::STATUS => "sent").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
