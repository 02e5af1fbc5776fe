//! Session file records.
//!
//! Claude stores sessions as JSONL with various record types:
//! - "user": User messages
//! - "assistant": Claude responses
//! - "summary": Session summary/title
//! - "system" with subtype "compact_boundary": context compaction point
//! - "file-history-snapshot": file backups (ignored)
//!
//! A [`Record`] keeps the raw JSON object so it can be re-emitted to clients
//! unchanged, and exposes typed accessors for the few fields the server
//! itself needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Record discriminator, from the `type` (and `subtype`) fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Assistant,
    /// Persisted session title line
    Summary,
    CompactBoundary,
    FileSnapshot,
    Unknown,
}

impl RecordKind {
    fn classify(raw: &Value) -> Self {
        match raw.get("type").and_then(|v| v.as_str()) {
            Some("user") => RecordKind::User,
            Some("assistant") => RecordKind::Assistant,
            Some("summary") => RecordKind::Summary,
            Some("file-history-snapshot") => RecordKind::FileSnapshot,
            Some("system")
                if raw.get("subtype").and_then(|v| v.as_str()) == Some("compact_boundary") =>
            {
                RecordKind::CompactBoundary
            }
            _ => RecordKind::Unknown,
        }
    }

    /// User or assistant turn
    pub fn is_turn(self) -> bool {
        matches!(self, RecordKind::User | RecordKind::Assistant)
    }
}

/// One parsed line of a session file.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordKind,
    raw: Value,
}

/// The conversation was compacted right after the turn `logical_parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionBoundary {
    #[serde(rename = "logicalParentUuid")]
    pub logical_parent_id: String,
    pub timestamp: String,
}

impl Record {
    /// Wrap a parsed JSON line. Only objects are records.
    pub fn from_value(raw: Value) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        Some(Self {
            kind: RecordKind::classify(&raw),
            raw,
        })
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str::<Value>(line.trim())
            .ok()
            .and_then(Self::from_value)
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Record id: `uuid`, falling back to the API message id.
    pub fn id(&self) -> Option<&str> {
        self.str_field("uuid").or_else(|| {
            self.raw
                .get("message")
                .and_then(|m| m.get("id"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
        })
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.str_field("timestamp")
    }

    /// Absolute instant for ordering; missing or unparseable timestamps sort
    /// as the Unix epoch.
    pub fn instant(&self) -> DateTime<Utc> {
        self.timestamp()
            .and_then(parse_instant)
            .unwrap_or_default()
    }

    /// The boundary this record declares, if it is a well-formed compaction record.
    pub fn boundary(&self) -> Option<CompactionBoundary> {
        if self.kind != RecordKind::CompactBoundary {
            return None;
        }
        Some(CompactionBoundary {
            logical_parent_id: self.str_field("logicalParentUuid")?.to_string(),
            timestamp: self.timestamp()?.to_string(),
        })
    }

    /// Title text of a `summary` line
    pub fn summary_text(&self) -> Option<&str> {
        if self.kind != RecordKind::Summary {
            return None;
        }
        self.str_field("summary")
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

/// Parse an RFC 3339 timestamp ("2025-01-15T10:30:00.123Z").
pub fn parse_instant(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_kinds() {
        let cases = [
            (json!({"type": "user"}), RecordKind::User),
            (json!({"type": "assistant"}), RecordKind::Assistant),
            (json!({"type": "summary", "summary": "t"}), RecordKind::Summary),
            (json!({"type": "file-history-snapshot"}), RecordKind::FileSnapshot),
            (json!({"type": "system", "subtype": "compact_boundary"}), RecordKind::CompactBoundary),
            (json!({"type": "system", "subtype": "informational"}), RecordKind::Unknown),
            (json!({"type": "progress"}), RecordKind::Unknown),
            (json!({}), RecordKind::Unknown),
        ];
        for (raw, kind) in cases {
            assert_eq!(Record::from_value(raw).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_non_objects_are_not_records() {
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::parse_line("42").is_none());
        assert!(Record::parse_line("{oops").is_none());
    }

    #[test]
    fn test_id_falls_back_to_message_id() {
        let record = Record::from_value(json!({
            "type": "assistant",
            "message": {"id": "msg_01", "role": "assistant"}
        }))
        .unwrap();
        assert_eq!(record.id(), Some("msg_01"));

        let record = Record::from_value(json!({"type": "user", "uuid": "u1", "message": {"id": "m"}})).unwrap();
        assert_eq!(record.id(), Some("u1"));
    }

    #[test]
    fn test_instant_defaults_to_epoch() {
        let record = Record::from_value(json!({"type": "user", "timestamp": "not a time"})).unwrap();
        assert_eq!(record.instant().timestamp(), 0);

        let record = Record::from_value(json!({"type": "user", "timestamp": "2025-01-15T10:30:00.500Z"})).unwrap();
        assert_eq!(record.instant().timestamp_millis(), 1_736_937_000_500);
    }

    #[test]
    fn test_boundary_requires_parent_and_timestamp() {
        let record = Record::from_value(json!({
            "type": "system",
            "subtype": "compact_boundary",
            "uuid": "sys1",
            "logicalParentUuid": "u9",
            "timestamp": "2025-01-15T10:30:00Z"
        }))
        .unwrap();
        assert_eq!(
            record.boundary(),
            Some(CompactionBoundary {
                logical_parent_id: "u9".to_string(),
                timestamp: "2025-01-15T10:30:00Z".to_string(),
            })
        );

        let record = Record::from_value(json!({"type": "system", "subtype": "compact_boundary"})).unwrap();
        assert_eq!(record.boundary(), None);
    }

    #[test]
    fn test_serializes_raw_json() {
        let raw = json!({"type": "user", "uuid": "u1", "extra": {"keep": true}});
        let record = Record::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }
}
