use serde::{Deserialize, Serialize};

/// One-shot command request posted to the exec endpoint.
///
/// Wire field names are PascalCase for compatibility with existing callers.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecRequest {
    /// Opaque correlation value, echoed back untouched.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Exec response: the request echoed back plus the captured streams.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecResponse {
    #[serde(flatten)]
    pub request: ExecRequest,
    /// Captured stdout.
    pub output1: String,
    /// Captured stderr.
    pub output2: String,
    /// Empty on success; otherwise a human-readable failure description.
    pub error: String,
}
