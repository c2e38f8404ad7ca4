//! Domain types and pure logic shared by every comfyrun crate.
//!
//! Nothing in here performs network I/O. The graph resolver, job status
//! model, and pre-submission validation live here so that transports,
//! the supervisor, and the HTTP boundary can all depend on one place.

pub mod error;
pub mod graph;
pub mod job;
pub mod types;
pub mod validation;
