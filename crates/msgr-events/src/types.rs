//! Event model delivered to the registered listener.

use chrono::{DateTime, Utc};
use msgr_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// One event on the feed.
///
/// Serializes as `{"type": ..., "sequence": n, "timestamp": ..., ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(sequence: u64, kind: EventKind) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::Message(_) => "message",
            EventKind::Presence(_) => "presence",
            EventKind::ThreadChange(_) => "thread",
            EventKind::Warning(_) => "warning",
            EventKind::Error(_) => "error",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, EventKind::Error(_))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Message(MessageEvent),
    Presence(PresenceEvent),
    #[serde(rename = "thread")]
    ThreadChange(ThreadChange),
    Warning(Warning),
    Error(FatalError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub thread_id: String,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub body: String,
    /// Server timestamp in milliseconds.
    pub timestamp_ms: i64,
    #[serde(default)]
    pub is_group: bool,
    /// Raw attachment objects as received.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Typing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Last-active time in seconds, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<i64>,
    /// Set for typing indicators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum ThreadChange {
    #[serde(rename_all = "camelCase")]
    Renamed {
        thread_id: String,
        author_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantsAdded {
        thread_id: String,
        author_id: String,
        added: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        thread_id: String,
        author_id: String,
        left: String,
    },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        thread_id: String,
        reader_id: String,
        watermark_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Admin {
        thread_id: String,
        author_id: String,
        admin_type: String,
        body: String,
    },
}

impl ThreadChange {
    pub fn thread_id(&self) -> &str {
        match self {
            Self::Renamed { thread_id, .. }
            | Self::ParticipantsAdded { thread_id, .. }
            | Self::ParticipantLeft { thread_id, .. }
            | Self::ReadReceipt { thread_id, .. }
            | Self::Admin { thread_id, .. } => thread_id,
        }
    }
}

/// Non-fatal condition reported on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum WarningKind {
    /// Oldest undelivered events were dropped from a full queue.
    #[serde(rename_all = "camelCase")]
    Overflow {
        dropped: u64,
        first_sequence: u64,
        last_sequence: u64,
    },
    /// Sequence numbers between `expected` and `received` never arrived.
    #[serde(rename_all = "camelCase")]
    SequenceGap { expected: u64, received: u64 },
    Network,
    Protocol,
    SessionRecovered,
    TokenRefreshFailed,
}

/// Terminal failure. The session is `Terminated` once this is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for FatalError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let event = Event::new(
            7,
            EventKind::Message(MessageEvent {
                thread_id: "t1".into(),
                message_id: "mid.1".into(),
                sender_id: "42".into(),
                body: "hi".into(),
                timestamp_ms: 1_700_000_000_000,
                is_group: false,
                attachments: vec![],
            }),
        );
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["threadId"], "t1");
        assert!(value["timestamp"].is_string());
        assert!(value.get("attachments").is_none());
        assert_eq!(event.type_name(), "message");
    }

    #[test]
    fn test_thread_and_warning_shapes() {
        let event = Event::new(
            1,
            EventKind::ThreadChange(ThreadChange::Renamed {
                thread_id: "t".into(),
                author_id: "a".into(),
                name: "new".into(),
            }),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "thread");
        assert_eq!(value["change"], "renamed");

        let event = Event::new(
            2,
            EventKind::Warning(Warning::new(
                WarningKind::SequenceGap {
                    expected: 2,
                    received: 5,
                },
                "gap",
            )),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "warning");
        assert_eq!(value["kind"]["code"], "sequenceGap");
        assert_eq!(value["kind"]["received"], 5);
    }

    #[test]
    fn test_fatal_error_from_error() {
        let fatal = FatalError::from(&Error::AuthExpired("checkpoint".into()));
        assert_eq!(fatal.kind, ErrorKind::AuthExpired);
        assert!(fatal.message.contains("checkpoint"));

        let event = Event::new(3, EventKind::Error(fatal));
        assert!(event.is_fatal());
        assert_eq!(serde_json::to_value(&event).unwrap()["kind"], "authExpired");
    }

    #[test]
    fn test_event_deserializes() {
        let json = r#"{"type":"presence","sequence":4,"timestamp":"2026-01-01T00:00:00Z",
                       "userId":"9","status":"typing","threadId":"t"}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.sequence, 4);
        match event.kind {
            EventKind::Presence(p) => {
                assert_eq!(p.status, PresenceStatus::Typing);
                assert_eq!(p.thread_id.as_deref(), Some("t"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
