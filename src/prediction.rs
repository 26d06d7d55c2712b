//! Prediction wire types and the in-memory job record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Model input: an arbitrary JSON object passed through to the service.
pub type Input = Map<String, Value>;

/// Key added to the submitted body when sync mode is requested.
pub const SYNC_MODE_FLAG: &str = "enable_sync_mode";

/// Error text used when the service reports a failure without a reason.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Envelope wrapping every API response.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Service-reported prediction status.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[serde(alias = "created")]
    Pending,
    Processing,
    Completed,
    Failed,
    /// Missing or unrecognised; treated as still running.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Status::Unknown => 0,
            Status::Pending => 1,
            Status::Processing => 2,
            Status::Completed | Status::Failed => 3,
        }
    }
}

/// The `data` object of submit and result responses.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Prediction {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Model-specific fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn nullable_vec<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The `data` object of an upload response.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UploadData {
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Result of a completed run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub outputs: Vec<Value>,
}

/// One inference request as tracked by the orchestrator.
///
/// Only the orchestrator mutates a job, through [`Job::record`], which keeps
/// the id stable and the status moving forward.
#[derive(Debug, Clone)]
pub struct Job {
    model: String,
    input: Input,
    id: Option<String>,
    status: Status,
    outputs: Vec<Value>,
    error: Option<String>,
}

impl Job {
    /// Snapshots the caller's input. In sync mode the copy carries the sync
    /// flag; the caller's map is left untouched.
    pub fn new(model: &str, input: &Input, sync_mode: bool) -> Self {
        let mut input = input.clone();
        if sync_mode {
            input.insert(SYNC_MODE_FLAG.to_string(), Value::Bool(true));
        }
        Self {
            model: model.to_string(),
            input,
            id: None,
            status: Status::Pending,
            outputs: Vec::new(),
            error: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn input(&self) -> &Input {
        &self.input
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Applies a service report to the job.
    pub fn record(&mut self, prediction: Prediction) -> Result<(), ApiError> {
        if let Some(reported) = prediction.id {
            match &self.id {
                None => self.id = Some(reported),
                Some(current) if *current == reported => {}
                Some(current) => {
                    return Err(ApiError::InvalidResponse(format!(
                        "prediction id changed from {} to {}",
                        current, reported
                    )));
                }
            }
        }

        if self.status.is_terminal() {
            if prediction.status != self.status {
                return Err(ApiError::InvalidResponse(format!(
                    "prediction {} reported {:?} after reaching {:?}",
                    self.id().unwrap_or("unknown"),
                    prediction.status,
                    self.status
                )));
            }
            return Ok(());
        }

        if prediction.status.rank() <= self.status.rank() {
            return Ok(());
        }

        self.status = prediction.status;
        match self.status {
            Status::Completed => self.outputs = prediction.outputs,
            Status::Failed => {
                self.error = Some(
                    prediction
                        .error
                        .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                )
            }
            _ => {}
        }
        Ok(())
    }

    /// The failure to raise for a job that did not complete.
    pub fn failure(&self) -> ApiError {
        ApiError::PredictionFailed {
            id: self.id().unwrap_or("unknown").to_string(),
            error: self.error().unwrap_or(UNKNOWN_ERROR).to_string(),
        }
    }

    pub fn into_output(self) -> RunOutput {
        RunOutput {
            outputs: self.outputs,
        }
    }
}
