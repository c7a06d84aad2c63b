//! Job-creation RPC.
//!
//! [`JobApi`] is the seam the monitor submits through; [`GraphqlJobApi`]
//! posts the create mutation to the GraphQL endpoint with `reqwest`.
//! Failures are classified once, here: transport and server-side faults are
//! retryable, auth rejections and malformed success payloads are not.

use std::time::Duration;

use async_trait::async_trait;
use proplens_core::errors::codes;
use proplens_core::{JobInput, JobRecord};
use proplens_realtime::Credential;
use proplens_settings::ProplensSettings;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Default create mutation. Returns the new job under `createJob`.
pub const CREATE_JOB_MUTATION: &str = "mutation CreateJob($input: CreateJobInput!) { \
     createJob(input: $input) { id status result createdAt updatedAt } }";

/// Field of `data` holding the created job.
pub const CREATE_JOB_FIELD: &str = "createJob";

/// Errors from the job API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request never produced a response (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response.
    #[error("API error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// 2xx response with a non-empty `errors` array.
    #[error("GraphQL error: {message}")]
    Graphql {
        /// Joined error messages.
        message: String,
        /// `errorType` of the first error that carries one.
        error_type: Option<String>,
    },

    /// 2xx response without a usable job.
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// What was wrong.
        reason: String,
    },

    /// Client could not be configured.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            // Resolver errors repeat on resubmission; only throttling clears.
            Self::Graphql { error_type, .. } => error_type.as_deref().is_some_and(is_throttling),
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            Self::InvalidResponse { .. } | Self::Config(_) => false,
        }
    }

    /// Error code reported when this error ends a submission.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Status { status: 401 | 403, .. } => codes::AUTH_REQUIRED,
            Self::Graphql {
                error_type: Some(kind),
                ..
            } if is_unauthorized(kind) => codes::AUTH_REQUIRED,
            Self::InvalidResponse { .. } => codes::INVALID_RESPONSE,
            Self::Config(_) => codes::UNKNOWN_ERROR,
            Self::Http(_) | Self::Status { .. } | Self::Graphql { .. } => codes::SUBMISSION_FAILED,
        }
    }
}

/// Creates jobs.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit `input` once. No retries at this level.
    async fn create_job(
        &self,
        input: &JobInput,
        credential: &Credential,
    ) -> Result<JobRecord, ApiError>;
}

/// [`JobApi`] over GraphQL-over-HTTP.
#[derive(Clone, Debug)]
pub struct GraphqlJobApi {
    client: reqwest::Client,
    endpoint: Url,
    mutation: String,
    result_field: String,
}

impl GraphqlJobApi {
    /// Client for `endpoint` using the default mutation.
    pub fn new(endpoint: Url, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            mutation: CREATE_JOB_MUTATION.to_string(),
            result_field: CREATE_JOB_FIELD.to_string(),
        })
    }

    /// Client configured from settings.
    pub fn from_settings(settings: &ProplensSettings) -> Result<Self, ApiError> {
        let endpoint = settings
            .endpoint
            .graphql_endpoint()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Self::new(endpoint, settings.rpc.request_timeout())
    }

    /// Use a different mutation document whose result sits under
    /// `data.<result_field>`.
    #[must_use]
    pub fn with_mutation(mut self, mutation: impl Into<String>, result_field: impl Into<String>) -> Self {
        self.mutation = mutation.into();
        self.result_field = result_field.into();
        self
    }
}

#[async_trait]
impl JobApi for GraphqlJobApi {
    async fn create_job(
        &self,
        input: &JobInput,
        credential: &Credential,
    ) -> Result<JobRecord, ApiError> {
        let body = json!({
            "query": self.mutation,
            "variables": { "input": input },
        });
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(credential.header_name(), credential.secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!(status = status.as_u16(), bytes = text.len(), "create job response");
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: truncate(&text),
            });
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse {
            reason: format!("body is not JSON: {e}"),
        })?;
        parse_create_response(value, &self.result_field)
    }
}

/// Interpret a `{data, errors?}` envelope.
pub fn parse_create_response(mut body: Value, field: &str) -> Result<JobRecord, ApiError> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error"))
                .collect::<Vec<_>>()
                .join("; ");
            let error_type = errors
                .iter()
                .find_map(|e| e.get("errorType").and_then(Value::as_str))
                .map(str::to_string);
            return Err(ApiError::Graphql {
                message,
                error_type,
            });
        }
    }

    let job = body
        .get_mut("data")
        .and_then(|data| data.get_mut(field))
        .map(Value::take)
        .filter(|job| !job.is_null())
        .ok_or_else(|| ApiError::InvalidResponse {
            reason: format!("missing data.{field}"),
        })?;
    let record = JobRecord::from_value(job).map_err(|e| ApiError::InvalidResponse {
        reason: e.to_string(),
    })?;
    if record.id.trim().is_empty() {
        return Err(ApiError::InvalidResponse {
            reason: "job id is empty".into(),
        });
    }
    Ok(record)
}

fn is_throttling(error_type: &str) -> bool {
    let kind = error_type.to_ascii_lowercase();
    kind.contains("throttl") || kind.contains("limitexceeded") || kind.contains("toomanyrequests")
}

fn is_unauthorized(error_type: &str) -> bool {
    let kind = error_type.to_ascii_lowercase();
    kind.starts_with("unauthorized") || kind.starts_with("unauthenticated")
}

fn truncate(text: &str) -> String {
    const MAX: usize = 512;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
