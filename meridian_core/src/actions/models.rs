use serde::{Deserialize, Serialize};

/// Run lifecycle as seen by the remote run source.
///
/// Runs arrive `InProgress`, move to `Acknowledged` when exactly one worker
/// claims execution, and end in `Success` or `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Acknowledged,
    Success,
    Failure,
}

/// One self-service action invocation pulled from the run source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRun {
    pub id: String,
    #[serde(rename = "action")]
    pub action_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    pub status: RunStatus,
}

/// Partial update sent back to the run source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl RunPatch {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Success),
            summary: Some(summary.into()),
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failure),
            summary: Some(summary.into()),
        }
    }
}
