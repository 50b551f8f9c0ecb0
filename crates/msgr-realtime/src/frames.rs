//! Frame classification — PUBLISH payloads to typed events.
//!
//! Topics and their payloads:
//!
//! - `/t_ms` carries sync deltas (`{"deltas":[...],"lastIssuedSeqId":n}`)
//!   or a sync error (`{"errorCode":"..."}`).
//! - `/orca_presence` carries a presence list (`{"list":[{"u":..,"p":..,"l":..}]}`).
//! - `/thread_typing` and `/orca_typing_notifications` carry typing state.
//!
//! Anything else is ignored.

use msgr_core::{Error, Result};
use msgr_events::{
    EventKind, MessageEvent, PresenceEvent, PresenceStatus, ThreadChange, Warning, WarningKind,
};
use serde_json::{json, Value};
use tracing::debug;

pub const TOPIC_DELTAS: &str = "/t_ms";
pub const TOPIC_PRESENCE: &str = "/orca_presence";
pub const TOPIC_THREAD_TYPING: &str = "/thread_typing";
pub const TOPIC_TYPING: &str = "/orca_typing_notifications";
pub const TOPIC_CREATE_QUEUE: &str = "/messenger_sync_create_queue";

/// Topics subscribed after CONNACK.
pub const SUBSCRIPTIONS: &[&str] = &[
    TOPIC_DELTAS,
    TOPIC_PRESENCE,
    TOPIC_THREAD_TYPING,
    TOPIC_TYPING,
    "/legacy_web",
    "/webrtc",
    "/br_sr",
    "/sr_res",
    "/notify_disconnect",
];

/// Presence code the platform uses for "active now".
const PRESENCE_ACTIVE: i64 = 2;

#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub events: Vec<EventKind>,
    /// Highest sync sequence id seen in the frame.
    pub last_seq_id: Option<u64>,
}

/// Classify one PUBLISH by topic.
pub fn decode_publish(topic: &str, payload: &[u8]) -> Result<Decoded> {
    match topic {
        TOPIC_DELTAS => decode_deltas(&parse(topic, payload)?),
        TOPIC_PRESENCE => Ok(Decoded {
            events: decode_presence(&parse(topic, payload)?)?,
            last_seq_id: None,
        }),
        TOPIC_THREAD_TYPING | TOPIC_TYPING => Ok(Decoded {
            events: decode_typing(&parse(topic, payload)?)?,
            last_seq_id: None,
        }),
        other => {
            debug!("Ignoring PUBLISH on {} ({} bytes)", other, payload.len());
            Ok(Decoded::default())
        }
    }
}

/// Payload for the sync queue request sent after subscribing. Resumes from
/// `seq_id` when one is known.
pub fn create_queue_payload(user_id: &str, seq_id: Option<&str>) -> Vec<u8> {
    json!({
        "sync_api_version": 10,
        "max_deltas_able_to_process": 1000,
        "delta_batch_size": 500,
        "encoding": "JSON",
        "entity_fbid": user_id,
        "initial_titan_sequence_id": seq_id.unwrap_or("0"),
        "device_params": Value::Null,
    })
    .to_string()
    .into_bytes()
}

fn parse(topic: &str, payload: &[u8]) -> Result<Value> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Protocol(format!("{} payload is not JSON: {}", topic, e)))
}

// ---------------------------------------------------------------
// Deltas
// ---------------------------------------------------------------

fn decode_deltas(root: &Value) -> Result<Decoded> {
    let mut decoded = Decoded {
        last_seq_id: root.get("lastIssuedSeqId").and_then(as_u64),
        ..Default::default()
    };

    if let Some(code) = root.get("errorCode").and_then(as_string) {
        decoded.events.push(EventKind::Warning(Warning::new(
            WarningKind::Protocol,
            format!("sync error {}", code),
        )));
        return Ok(decoded);
    }

    let deltas = match root.get("deltas") {
        Some(Value::Array(deltas)) => deltas,
        Some(_) => return Err(Error::Protocol("deltas is not an array".into())),
        None if root.get("lastIssuedSeqId").is_some() => return Ok(decoded),
        None => return Err(Error::Protocol("sync frame without deltas".into())),
    };

    for delta in deltas {
        if let Some(event) = decode_delta(delta)? {
            decoded.events.push(event);
        }
    }
    Ok(decoded)
}

fn decode_delta(delta: &Value) -> Result<Option<EventKind>> {
    let class = delta.get("class").and_then(Value::as_str).unwrap_or_default();
    let event = match class {
        "NewMessage" => {
            let meta = metadata(delta)?;
            EventKind::Message(MessageEvent {
                thread_id: meta.thread_id,
                message_id: meta.message_id,
                sender_id: meta.actor_id,
                body: delta
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                timestamp_ms: meta.timestamp_ms,
                is_group: meta.is_group,
                attachments: delta
                    .get("attachments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            })
        }
        "ThreadName" => {
            let meta = metadata(delta)?;
            EventKind::ThreadChange(ThreadChange::Renamed {
                thread_id: meta.thread_id,
                author_id: meta.actor_id,
                name: delta
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        "ParticipantsAddedToGroupThread" => {
            let meta = metadata(delta)?;
            let added = delta
                .get("addedParticipants")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|p| p.get("userFbId").and_then(as_string))
                        .collect()
                })
                .unwrap_or_default();
            EventKind::ThreadChange(ThreadChange::ParticipantsAdded {
                thread_id: meta.thread_id,
                author_id: meta.actor_id,
                added,
            })
        }
        "ParticipantLeftGroupThread" => {
            let meta = metadata(delta)?;
            EventKind::ThreadChange(ThreadChange::ParticipantLeft {
                thread_id: meta.thread_id,
                author_id: meta.actor_id,
                left: required(delta, "leftParticipantFbId")?,
            })
        }
        "ReadReceipt" => {
            let key = delta
                .get("threadKey")
                .ok_or_else(|| missing("threadKey"))?;
            let (thread_id, _) = thread_key(key)?;
            EventKind::ThreadChange(ThreadChange::ReadReceipt {
                thread_id,
                reader_id: required(delta, "actorFbId")?,
                watermark_ms: delta
                    .get("watermarkTimestampMs")
                    .or_else(|| delta.get("actionTimestampMs"))
                    .and_then(as_i64)
                    .unwrap_or_default(),
            })
        }
        "AdminTextMessage" => {
            let meta = metadata(delta)?;
            EventKind::ThreadChange(ThreadChange::Admin {
                thread_id: meta.thread_id,
                author_id: meta.actor_id,
                admin_type: delta
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                body: meta.admin_text,
            })
        }
        other => {
            debug!("Skipping delta class {:?}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

struct Metadata {
    thread_id: String,
    is_group: bool,
    message_id: String,
    actor_id: String,
    timestamp_ms: i64,
    admin_text: String,
}

fn metadata(delta: &Value) -> Result<Metadata> {
    let meta = delta
        .get("messageMetadata")
        .ok_or_else(|| missing("messageMetadata"))?;
    let key = meta.get("threadKey").ok_or_else(|| missing("threadKey"))?;
    let (thread_id, is_group) = thread_key(key)?;
    Ok(Metadata {
        thread_id,
        is_group,
        message_id: required(meta, "messageId")?,
        actor_id: required(meta, "actorFbId")?,
        timestamp_ms: meta.get("timestamp").and_then(as_i64).unwrap_or_default(),
        admin_text: meta
            .get("adminText")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Group threads carry `threadFbId`; one-to-one threads carry the other
/// participant's `otherUserFbId`.
fn thread_key(key: &Value) -> Result<(String, bool)> {
    if let Some(id) = key.get("threadFbId").and_then(as_string) {
        return Ok((id, true));
    }
    if let Some(id) = key.get("otherUserFbId").and_then(as_string) {
        return Ok((id, false));
    }
    Err(missing("threadKey.threadFbId|otherUserFbId"))
}

// ---------------------------------------------------------------
// Presence and typing
// ---------------------------------------------------------------

fn decode_presence(root: &Value) -> Result<Vec<EventKind>> {
    let list = root
        .get("list")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("list"))?;

    Ok(list
        .iter()
        .filter_map(|entry| {
            let user_id = entry.get("u").and_then(as_string)?;
            let code = entry.get("p").and_then(as_i64).unwrap_or_default();
            Some(EventKind::Presence(PresenceEvent {
                user_id,
                status: if code == PRESENCE_ACTIVE {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Idle
                },
                last_active: entry.get("l").and_then(as_i64),
                thread_id: None,
            }))
        })
        .collect())
}

/// Only "started typing" produces an event.
fn decode_typing(root: &Value) -> Result<Vec<EventKind>> {
    let sender = root
        .get("sender_fbid")
        .and_then(as_string)
        .ok_or_else(|| missing("sender_fbid"))?;
    let typing = root.get("state").and_then(as_i64).unwrap_or_default() == 1;
    if !typing {
        return Ok(Vec::new());
    }

    let thread_id = root
        .get("thread")
        .and_then(as_string)
        .or_else(|| Some(sender.clone()));
    Ok(vec![EventKind::Presence(PresenceEvent {
        user_id: sender,
        status: PresenceStatus::Typing,
        last_active: None,
        thread_id,
    })])
}

// ---------------------------------------------------------------
// Value helpers; ids arrive as either strings or numbers
// ---------------------------------------------------------------

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    as_i64(v).and_then(|n| u64::try_from(n).ok())
}

fn required(v: &Value, field: &str) -> Result<String> {
    v.get(field).and_then(as_string).ok_or_else(|| missing(field))
}

fn missing(field: &str) -> Error {
    Error::Protocol(format!("delta missing {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(topic: &str, value: Value) -> Decoded {
        decode_publish(topic, value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_new_message_one_to_one() {
        let decoded = decode(
            TOPIC_DELTAS,
            json!({
                "lastIssuedSeqId": 42,
                "deltas": [{
                    "class": "NewMessage",
                    "body": "hello",
                    "attachments": [{"mercury": {}}],
                    "messageMetadata": {
                        "threadKey": {"otherUserFbId": "200002"},
                        "messageId": "mid.1",
                        "actorFbId": "200002",
                        "timestamp": "1700000000000"
                    }
                }]
            }),
        );
        assert_eq!(decoded.last_seq_id, Some(42));
        match &decoded.events[..] {
            [EventKind::Message(m)] => {
                assert_eq!(m.thread_id, "200002");
                assert_eq!(m.sender_id, "200002");
                assert_eq!(m.body, "hello");
                assert_eq!(m.timestamp_ms, 1_700_000_000_000);
                assert!(!m.is_group);
                assert_eq!(m.attachments.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_thread_changes() {
        let meta = json!({
            "threadKey": {"threadFbId": 777},
            "messageId": "mid.2",
            "actorFbId": "1",
            "timestamp": 5,
            "adminText": "You are now an admin."
        });
        let decoded = decode(
            TOPIC_DELTAS,
            json!({"deltas": [
                {"class": "ThreadName", "name": "crew", "messageMetadata": meta},
                {"class": "ParticipantsAddedToGroupThread", "messageMetadata": meta,
                 "addedParticipants": [{"userFbId": "3"}, {"userFbId": 4}]},
                {"class": "ParticipantLeftGroupThread", "messageMetadata": meta,
                 "leftParticipantFbId": "3"},
                {"class": "ReadReceipt", "threadKey": {"otherUserFbId": "9"},
                 "actorFbId": "9", "watermarkTimestampMs": "99"},
                {"class": "AdminTextMessage", "type": "change_thread_admins",
                 "messageMetadata": meta},
                {"class": "NoOp"}
            ]}),
        );
        assert_eq!(decoded.events.len(), 5);
        assert_eq!(
            decoded.events[0],
            EventKind::ThreadChange(ThreadChange::Renamed {
                thread_id: "777".into(),
                author_id: "1".into(),
                name: "crew".into(),
            })
        );
        assert!(matches!(
            &decoded.events[1],
            EventKind::ThreadChange(ThreadChange::ParticipantsAdded { added, .. }) if added == &["3", "4"]
        ));
        assert!(matches!(
            &decoded.events[3],
            EventKind::ThreadChange(ThreadChange::ReadReceipt { watermark_ms: 99, .. })
        ));
        assert!(matches!(
            &decoded.events[4],
            EventKind::ThreadChange(ThreadChange::Admin { body, .. }) if body == "You are now an admin."
        ));
    }

    #[test]
    fn test_sync_error_is_warning() {
        let decoded = decode(TOPIC_DELTAS, json!({"errorCode": "ERROR_QUEUE_NOT_FOUND"}));
        assert!(matches!(
            &decoded.events[..],
            [EventKind::Warning(w)] if w.kind == WarningKind::Protocol && w.message.contains("ERROR_QUEUE_NOT_FOUND")
        ));
    }

    #[test]
    fn test_presence_and_typing() {
        let decoded = decode(
            TOPIC_PRESENCE,
            json!({"list": [{"u": 5, "p": 2, "l": 1700}, {"u": 6, "p": 0}]}),
        );
        assert_eq!(decoded.events.len(), 2);
        assert!(matches!(
            &decoded.events[0],
            EventKind::Presence(p) if p.status == PresenceStatus::Online && p.last_active == Some(1700)
        ));
        assert!(matches!(
            &decoded.events[1],
            EventKind::Presence(p) if p.status == PresenceStatus::Idle
        ));

        let typing = decode(TOPIC_TYPING, json!({"type": "typ", "sender_fbid": 5, "state": 1}));
        assert!(matches!(
            &typing.events[..],
            [EventKind::Presence(p)] if p.status == PresenceStatus::Typing && p.thread_id.as_deref() == Some("5")
        ));
        let stopped = decode(TOPIC_THREAD_TYPING, json!({"sender_fbid": 5, "state": 0, "thread": "8"}));
        assert!(stopped.events.is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            decode_publish(TOPIC_DELTAS, b"\x00\x01garbage"),
            Err(Error::Protocol(_))
        ));
        assert!(decode_publish(TOPIC_DELTAS, br#"{"deltas":{}}"#).is_err());
        assert!(decode_publish(TOPIC_DELTAS, br#"{"deltas":[{"class":"NewMessage"}]}"#).is_err());
        assert!(decode_publish(TOPIC_PRESENCE, br#"{"nope":1}"#).is_err());
        // Unknown topics are ignored, even with junk payloads.
        assert_eq!(decode_publish("/webrtc", b"\xff").unwrap(), Decoded::default());
    }

    #[test]
    fn test_create_queue_payload() {
        let payload: Value = serde_json::from_slice(&create_queue_payload("1", Some("77"))).unwrap();
        assert_eq!(payload["entity_fbid"], "1");
        assert_eq!(payload["initial_titan_sequence_id"], "77");
        assert_eq!(payload["encoding"], "JSON");
    }

    #[test]
    fn test_subscriptions_cover_classified_topics() {
        for topic in [TOPIC_DELTAS, TOPIC_PRESENCE, TOPIC_THREAD_TYPING, TOPIC_TYPING] {
            assert!(SUBSCRIPTIONS.contains(&topic), "{} not subscribed", topic);
        }
        assert!(!SUBSCRIPTIONS.contains(&TOPIC_CREATE_QUEUE));
        let mut unique = SUBSCRIPTIONS.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), SUBSCRIPTIONS.len());
    }
}
