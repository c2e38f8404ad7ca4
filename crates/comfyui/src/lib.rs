//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper (prompt submission, history retrieval,
//! liveness), typed parsing of history records into job statuses, and
//! the [`LocalTransport`](transport::LocalTransport) that lets the
//! shared executor drive a local ComfyUI engine.

pub mod api;
pub mod history;
pub mod transport;
