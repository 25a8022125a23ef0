//! Canonical decoding of CRM event webhooks.
//!
//! The CRM posts either JSON or form-encoded bodies (the body is normalized
//! upstream); field names vary between upper-case REST spellings and
//! lower-case ones, so every field is read through both. Known events with
//! missing required fields fail closed.

use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrmDecodeError {
    #[error("crm payload has no event discriminator")]
    MissingEvent,
    #[error("malformed `{event}` event: {detail}")]
    Malformed { event: String, detail: String },
}

/// An agent (or system) message authored on the CRM side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrmOutboundMessage {
    pub chat_id: String,
    pub message_id: Option<String>,
    pub text: String,
    pub author_id: Option<String>,
    pub file_url: Option<String>,
    /// Set when the CRM marks the message as system/bot generated; relays
    /// use it (with the connector author id) to drop echo traffic.
    pub system: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrmEvent {
    MessageAdd(CrmOutboundMessage),
    SessionFinish { chat_id: String },
    SessionTransfer { chat_id: String, agent_id: String },
    Unsupported { event: String },
}

impl CrmEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageAdd(_) => "message.add",
            Self::SessionFinish { .. } => "session.finish",
            Self::SessionTransfer { .. } => "session.transfer",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

pub fn decode_crm_event(value: &Value) -> Result<CrmEvent, CrmDecodeError> {
    let event = value
        .get("event")
        .or_else(|| value.get("EVENT"))
        .and_then(Value::as_str)
        .ok_or(CrmDecodeError::MissingEvent)?
        .to_ascii_uppercase();

    // Form-encoded deliveries inline the fields at the top level; JSON ones
    // nest them under `data`.
    let data = value.get("data").filter(|data| data.is_object()).unwrap_or(value);

    match event.as_str() {
        "ONIMCONNECTORMESSAGEADD" | "MESSAGE.ADD" => {
            let chat_id = field(data, &["chat_id", "CHAT_ID"]).ok_or_else(|| {
                CrmDecodeError::Malformed {
                    event: event.clone(),
                    detail: "missing chat id".to_string(),
                }
            })?;
            let text = field(data, &["text", "MESSAGE", "message_text"]);
            let file_url = field(data, &["file_url", "FILE_URL"]).or_else(|| {
                data.pointer("/files/0/url").and_then(Value::as_str).map(str::to_string)
            });
            let text = match (text, &file_url) {
                (Some(text), _) => text,
                (None, Some(_)) => String::new(),
                (None, None) => {
                    return Err(CrmDecodeError::Malformed {
                        event,
                        detail: "message carries neither text nor files".to_string(),
                    })
                }
            };

            Ok(CrmEvent::MessageAdd(CrmOutboundMessage {
                chat_id,
                message_id: field(data, &["message_id", "MESSAGE_ID", "im_message_id"]),
                text,
                author_id: field(data, &["author_id", "AUTHOR_ID", "USER_ID", "user_id"]),
                file_url,
                system: flag(data, &["system", "SYSTEM"]),
            }))
        }
        "ONIMOPENLINESSESSIONFINISH" | "SESSION.FINISH" => {
            let chat_id = field(data, &["chat_id", "CHAT_ID"]).ok_or_else(|| {
                CrmDecodeError::Malformed { event, detail: "missing chat id".to_string() }
            })?;
            Ok(CrmEvent::SessionFinish { chat_id })
        }
        "ONIMOPENLINESSESSIONTRANSFER" | "SESSION.TRANSFER" => {
            let chat_id = field(data, &["chat_id", "CHAT_ID"]).ok_or_else(|| {
                CrmDecodeError::Malformed {
                    event: event.clone(),
                    detail: "missing chat id".to_string(),
                }
            })?;
            let agent_id =
                field(data, &["agent_id", "TRANSFER_TO", "transfer_to", "USER_ID"]).ok_or_else(
                    || CrmDecodeError::Malformed {
                        event,
                        detail: "missing transfer target".to_string(),
                    },
                )?;
            Ok(CrmEvent::SessionTransfer { chat_id, agent_id })
        }
        other => Ok(CrmEvent::Unsupported { event: other.to_ascii_lowercase() }),
    }
}

/// Read one logical field through its known spellings. Numeric ids are
/// stringified so `42` and `"42"` resolve identically.
fn field(data: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match data.get(name) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

fn flag(data: &Value, names: &[&str]) -> bool {
    names.iter().any(|name| match data.get(name) {
        Some(Value::Bool(value)) => *value,
        Some(Value::String(value)) => matches!(value.as_str(), "Y" | "y" | "true" | "1"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_crm_event, CrmDecodeError, CrmEvent};

    #[test]
    fn agent_message_decodes_from_nested_json() {
        let payload = json!({
            "event": "ONIMCONNECTORMESSAGEADD",
            "data": {
                "CHAT_ID": 42,
                "MESSAGE_ID": "crm-msg-9",
                "MESSAGE": "we can help with that",
                "AUTHOR_ID": "agent-3"
            }
        });

        let CrmEvent::MessageAdd(message) = decode_crm_event(&payload).expect("decodes") else {
            panic!("expected message event");
        };
        assert_eq!(message.chat_id, "42");
        assert_eq!(message.message_id.as_deref(), Some("crm-msg-9"));
        assert_eq!(message.text, "we can help with that");
        assert_eq!(message.author_id.as_deref(), Some("agent-3"));
        assert!(!message.system);
    }

    #[test]
    fn flat_form_spelling_decodes_identically() {
        let payload = json!({
            "event": "message.add",
            "chat_id": "42",
            "message_id": "crm-msg-9",
            "text": "we can help with that",
            "author_id": "agent-3"
        });

        let CrmEvent::MessageAdd(message) = decode_crm_event(&payload).expect("decodes") else {
            panic!("expected message event");
        };
        assert_eq!(message.chat_id, "42");
        assert_eq!(message.text, "we can help with that");
    }

    #[test]
    fn system_flag_is_recognized_in_crm_spelling() {
        let payload = json!({
            "event": "ONIMCONNECTORMESSAGEADD",
            "data": {"CHAT_ID": 42, "MESSAGE": "session started", "SYSTEM": "Y"}
        });

        let CrmEvent::MessageAdd(message) = decode_crm_event(&payload).expect("decodes") else {
            panic!("expected message event");
        };
        assert!(message.system);
    }

    #[test]
    fn session_lifecycle_events_decode() {
        let finish = json!({
            "event": "ONIMOPENLINESSESSIONFINISH",
            "data": {"CHAT_ID": "42"}
        });
        assert_eq!(
            decode_crm_event(&finish).expect("decodes"),
            CrmEvent::SessionFinish { chat_id: "42".to_string() }
        );

        let transfer = json!({
            "event": "ONIMOPENLINESSESSIONTRANSFER",
            "data": {"CHAT_ID": "42", "TRANSFER_TO": "agent-7"}
        });
        assert_eq!(
            decode_crm_event(&transfer).expect("decodes"),
            CrmEvent::SessionTransfer { chat_id: "42".to_string(), agent_id: "agent-7".to_string() }
        );
    }

    #[test]
    fn unknown_events_are_tagged_unsupported() {
        let payload = json!({"event": "ONCRMDEALUPDATE", "data": {}});
        assert_eq!(
            decode_crm_event(&payload).expect("decodes"),
            CrmEvent::Unsupported { event: "oncrmdealupdate".to_string() }
        );
    }

    #[test]
    fn known_event_with_missing_chat_id_fails_closed() {
        let payload = json!({
            "event": "ONIMCONNECTORMESSAGEADD",
            "data": {"MESSAGE": "orphan"}
        });
        let error = decode_crm_event(&payload).expect_err("must fail");
        assert!(matches!(error, CrmDecodeError::Malformed { .. }));

        let no_event = json!({"data": {}});
        assert_eq!(decode_crm_event(&no_event), Err(CrmDecodeError::MissingEvent));
    }
}
