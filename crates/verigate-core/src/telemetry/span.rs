//! Tracing span types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// The traced operation completed normally.
    Ok,
    /// The traced operation failed.
    Error,
}

impl SpanStatus {
    /// Lowercase label used when tagging derived metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// One timestamped log entry attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLog {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form message.
    pub message: String,
}

/// One timed unit of work, optionally nested under a parent span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Operation name.
    pub name: String,
    /// Trace this span belongs to.
    pub trace_id: String,
    /// Unique span identifier within the trace.
    pub span_id: String,
    /// Parent span identifier, if nested.
    pub parent_id: Option<String>,
    /// When the span was started.
    pub start_time: DateTime<Utc>,
    /// When the span was finished. `None` while active.
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration, set on finish.
    pub duration: Option<Duration>,
    /// Caller-supplied tags.
    pub tags: BTreeMap<String, String>,
    /// Ordered log entries.
    pub logs: Vec<SpanLog>,
    /// Terminal status, set on finish.
    pub status: Option<SpanStatus>,
}

impl Span {
    pub(crate) fn new(
        name: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_id: Option<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_id,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            tags,
            logs: Vec::new(),
            status: None,
        }
    }

    /// Append a log entry to the span.
    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(SpanLog {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    /// Set or overwrite a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }
}
