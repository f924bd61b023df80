//! Progress events emitted on a job's live stream

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event discriminator, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Output,
    Progress,
    Result,
    Error,
    Finished,
}

/// One event of a job's append-only stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    /// Structured payload of `progress` and `result` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProgressEvent {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            line: None,
            message: None,
            return_code: None,
            data: None,
        }
    }

    /// Free-form worker output or a coordinator notice
    pub fn output(line: impl Into<String>) -> Self {
        Self {
            line: Some(line.into()),
            message: Some("output".to_string()),
            ..Self::new(EventKind::Output)
        }
    }

    pub fn progress(data: Value) -> Self {
        Self {
            message: Some(format!("progress: {}", data)),
            data: Some(data),
            ..Self::new(EventKind::Progress)
        }
    }

    pub fn result(data: Value) -> Self {
        Self {
            message: Some(format!("result: {}", data)),
            data: Some(data),
            ..Self::new(EventKind::Result)
        }
    }

    /// Worker diagnostics or a coordinator-side failure
    pub fn error(line: impl Into<String>) -> Self {
        Self {
            line: Some(line.into()),
            message: Some("error".to_string()),
            ..Self::new(EventKind::Error)
        }
    }

    /// Terminal event, always the last one of a job
    pub fn finished(return_code: i32) -> Self {
        Self {
            return_code: Some(return_code),
            ..Self::new(EventKind::Finished)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Finished
    }

    /// Encode as one NDJSON line, newline included
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
