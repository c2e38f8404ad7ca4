/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Node identifier inside a workflow graph (the JSON object key).
pub type NodeId = String;

/// Opaque job identifier assigned by a transport (ComfyUI `prompt_id`,
/// RunPod job `id`).
pub type JobId = String;
