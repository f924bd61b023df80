//! Worker output classification
//!
//! A stdout line that is a JSON object with an object-valued `progress` or
//! `result` key becomes a typed event; everything else, malformed JSON
//! included, is passed through as `output`. Classification never fails.

use serde_json::Value;

use crate::events::ProgressEvent;

/// Which worker stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

pub fn classify_line(source: OutputSource, line: &str) -> ProgressEvent {
    match source {
        OutputSource::Stdout => classify_stdout(line),
        OutputSource::Stderr => ProgressEvent::error(line),
    }
}

pub fn classify_stdout(line: &str) -> ProgressEvent {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return ProgressEvent::output(line);
    }

    let mut object = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(object)) => object,
        _ => return ProgressEvent::output(line),
    };

    if matches!(object.get("progress"), Some(Value::Object(_))) {
        if let Some(progress) = object.remove("progress") {
            return ProgressEvent::progress(progress);
        }
    }
    if matches!(object.get("result"), Some(Value::Object(_))) {
        if let Some(result) = object.remove("result") {
            return ProgressEvent::result(result);
        }
    }
    ProgressEvent::output(line)
}
