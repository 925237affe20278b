//! Log entry type for the JSONL files.
//!
//! Each entry is one self-contained JSON object per line, so a partial write
//! can only ever damage the last line of a file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a JSONL log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Node that produced the entry; empty until the node id is known
    #[serde(default)]
    pub node: String,

    /// Module path of the event
    pub target: String,

    /// Human-readable message
    pub msg: String,

    /// Structured fields of the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, root first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(level: impl Into<String>, target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: String::new(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_line_shape() {
        let mut entry = LogEntry::new("info", "treecast_core::node", "Installed neighbor row")
            .with_fields(serde_json::json!({ "neighbors": 2 }));
        entry.node = "n1".into();

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"node\":\"n1\""));
        assert!(json.contains("\"neighbors\":2"));
        assert!(!json.contains("\"span\""));

        let parsed = LogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed.msg, "Installed neighbor row");
    }
}
