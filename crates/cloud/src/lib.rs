//! RunPod serverless queue client.
//!
//! Submits workflows to a RunPod endpoint running the worker image and
//! maps the queue's job statuses onto the shared [`JobStatus`] model so
//! the same executor can drive remote jobs.
//!
//! [`JobStatus`]: comfyrun_core::job::JobStatus

pub mod client;
pub mod config;
pub mod status;
pub mod transport;
