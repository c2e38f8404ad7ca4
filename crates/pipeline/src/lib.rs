//! Job execution shared by the local and remote transports.
//!
//! * [`executor`]: submit a graph and poll it to a terminal status.
//! * [`tracker`]: monotonicity guard over observed statuses.
//! * [`collector`]: materialize and order a job's artifacts.
//! * [`cleanup`]: age-based sweep of the output directory.

pub mod cleanup;
pub mod collector;
pub mod executor;
pub mod tracker;
