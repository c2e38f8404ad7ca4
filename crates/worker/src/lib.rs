//! Supervision of the long-running ComfyUI engine process.
//!
//! [`Supervisor`](supervisor::Supervisor) starts the engine, waits for it
//! to answer its liveness endpoint, detects crashes and restarts it.
//! Engine output is captured line by line into a bounded
//! [`LogBuffer`](logs::LogBuffer) so error responses can include the
//! most recent lines.

pub mod logs;
pub mod supervisor;
