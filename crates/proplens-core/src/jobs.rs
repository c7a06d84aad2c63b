//! Job wire types.
//!
//! Field names match the GraphQL schema (camelCase, status values in
//! SCREAMING_SNAKE_CASE). Timestamps stay opaque ISO-8601 strings: they are
//! only compared for equality when de-duplicating update history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of an analysis job.
///
/// The API reports both `COMPLETED` and `COMPLETE` (and both `FAILED` and
/// `ERROR`) depending on the worker that processed the job; both spellings are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet picked up.
    Pending,
    /// Picked up by a worker.
    Processing,
    /// Worker is producing results.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished successfully (legacy spelling).
    Complete,
    /// Finished with a failure.
    Failed,
    /// Finished with an error.
    Error,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Processing,
        Self::InProgress,
        Self::Completed,
        Self::Complete,
        Self::Failed,
        Self::Error,
    ];

    /// Whether no further updates are expected after this status.
    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// Terminal success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Complete)
    }

    /// Terminal failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// A snapshot of a job as reported by the API or a subscription update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job id assigned by the API.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
    /// Latest result payload (JSON text).
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<String>,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last-modified timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl JobRecord {
    /// Create a record with only an id and a status.
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            result: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Set the result payload.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Set the last-modified timestamp.
    #[must_use]
    pub fn with_updated_at(mut self, updated_at: impl Into<String>) -> Self {
        self.updated_at = Some(updated_at.into());
        self
    }

    /// Parse a record out of a JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Accepts either a JSON string or any other JSON value (re-encoded as text).
///
/// `AWSJSON` fields arrive as strings, but some resolvers return the object.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Input
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduling priority for a submitted job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Interactive requests.
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Input to the job-creation mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    /// Free-text analysis request.
    pub request: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Property the analysis is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<String>,
    /// Extra caller metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl JobInput {
    /// Input with the default priority.
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            priority: Priority::default(),
            property_id: None,
            metadata: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a property id.
    #[must_use]
    pub fn with_property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    /// Whether the request text is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.request.trim().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Completed,
                JobStatus::Complete,
                JobStatus::Failed,
                JobStatus::Error
            ]
        );
    }

    #[test]
    fn success_and_failure_are_disjoint() {
        for status in JobStatus::ALL {
            assert!(!(status.is_success() && status.is_failure()), "{status}");
        }
    }

    #[test]
    fn status_wire_spelling() {
        assert_eq!(
            serde_json::to_value(JobStatus::InProgress).unwrap(),
            json!("IN_PROGRESS")
        );
        let parsed: JobStatus = serde_json::from_value(json!("COMPLETE")).unwrap();
        assert_eq!(parsed, JobStatus::Complete);
    }

    #[test]
    fn status_from_str_roundtrips_display() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert_matches!("DONE".parse::<JobStatus>(), Err(_));
    }

    #[test]
    fn record_minimal_frame() {
        let record = JobRecord::from_value(json!({"id": "job-1", "status": "PROCESSING"})).unwrap();
        assert_eq!(record, JobRecord::new("job-1", JobStatus::Processing));
    }

    #[test]
    fn record_full_frame() {
        let record = JobRecord::from_value(json!({
            "id": "job-1",
            "status": "COMPLETED",
            "result": "{\"score\":7}",
            "createdAt": "2026-01-01T00:00:00.000Z",
            "updatedAt": "2026-01-01T00:01:00.000Z"
        }))
        .unwrap();
        assert_eq!(record.result.as_deref(), Some("{\"score\":7}"));
        assert_eq!(record.updated_at.as_deref(), Some("2026-01-01T00:01:00.000Z"));
    }

    #[test]
    fn record_result_object_is_reencoded() {
        let record = JobRecord::from_value(json!({
            "id": "job-1",
            "status": "COMPLETED",
            "result": {"score": 7}
        }))
        .unwrap();
        assert_eq!(record.result.as_deref(), Some(r#"{"score":7}"#));
    }

    #[test]
    fn record_null_result() {
        let record =
            JobRecord::from_value(json!({"id": "j", "status": "PENDING", "result": null})).unwrap();
        assert!(record.result.is_none());
    }

    #[test]
    fn record_unknown_status_rejected() {
        assert!(JobRecord::from_value(json!({"id": "j", "status": "PAUSED"})).is_err());
    }

    #[test]
    fn input_blank_detection() {
        assert!(JobInput::new("").is_blank());
        assert!(JobInput::new("  \n\t").is_blank());
        assert!(!JobInput::new("Summarize X").is_blank());
    }

    #[test]
    fn input_serializes_camel_case() {
        let input = JobInput::new("Summarize X")
            .with_priority(Priority::High)
            .with_property("prop-9");
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(
            json,
            json!({"request": "Summarize X", "priority": "HIGH", "propertyId": "prop-9"})
        );
    }

    #[test]
    fn priority_parse_case_insensitive() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
