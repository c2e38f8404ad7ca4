//! comfyrun HTTP service library.
//!
//! Exposes configuration, state, error handling and routes so the binary
//! entrypoint and the integration tests build the same application.

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod routes;
pub mod state;
