//! Canonical decoding of WA provider webhook events.
//!
//! The provider's payload shapes drift across versions (text under
//! `message.conversation` or `message.extendedTextMessage.text`, QR under
//! `data.qrcode.base64` or `data.qrcode`), so everything is normalized into
//! one tagged event type here. Shapes that claim a known event but lack its
//! required fields fail closed instead of degrading into empty strings.

use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WaDecodeError {
    #[error("webhook payload has no event discriminator")]
    MissingEvent,
    #[error("webhook payload has no instance label")]
    MissingInstance,
    #[error("malformed `{event}` event: {detail}")]
    Malformed { event: String, detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaInboundMessage {
    pub instance: String,
    pub message_id: Option<String>,
    pub sender_jid: String,
    pub text: String,
    pub media_url: Option<String>,
    pub push_name: Option<String>,
    /// Set for echoes of messages this side sent; relays drop them.
    pub from_me: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaEvent {
    MessageReceived(WaInboundMessage),
    ConnectionUpdate { instance: String, state: ConnectionSignal },
    QrUpdated { instance: String, qr_code: String },
    Unsupported { event: String },
}

/// Connection signal as reported by the provider, before it is mapped onto
/// the session state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionSignal {
    Open,
    Close,
    Connecting,
}

impl WaEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => "messages.upsert",
            Self::ConnectionUpdate { .. } => "connection.update",
            Self::QrUpdated { .. } => "qrcode.updated",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

/// Decode a normalized webhook body into a canonical event.
pub fn decode_wa_event(value: &Value) -> Result<WaEvent, WaDecodeError> {
    let event = value
        .get("event")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or(WaDecodeError::MissingEvent)?
        .to_ascii_lowercase();

    let instance = value
        .get("instance")
        .or_else(|| value.get("instanceName"))
        .and_then(Value::as_str)
        .ok_or(WaDecodeError::MissingInstance)?
        .to_string();

    let data = value.get("data").unwrap_or(&Value::Null);

    match event.as_str() {
        "messages.upsert" | "message" | "messages.received" => {
            decode_inbound_message(&event, instance, data)
        }
        "connection.update" | "connection" => {
            let state_raw = data
                .get("state")
                .or_else(|| data.get("status"))
                .and_then(Value::as_str)
                .ok_or_else(|| WaDecodeError::Malformed {
                    event: event.clone(),
                    detail: "missing connection state".to_string(),
                })?;
            let state = match state_raw.to_ascii_lowercase().as_str() {
                "open" | "connected" => ConnectionSignal::Open,
                "close" | "closed" | "logged_out" => ConnectionSignal::Close,
                "connecting" | "qr" => ConnectionSignal::Connecting,
                other => {
                    return Err(WaDecodeError::Malformed {
                        event,
                        detail: format!("unknown connection state `{other}`"),
                    })
                }
            };
            Ok(WaEvent::ConnectionUpdate { instance, state })
        }
        "qrcode.updated" | "qrcode" => {
            let qr_code = data
                .get("qrcode")
                .and_then(|qr| qr.get("base64").and_then(Value::as_str).or_else(|| qr.as_str()))
                .ok_or_else(|| WaDecodeError::Malformed {
                    event: event.clone(),
                    detail: "missing qr payload".to_string(),
                })?;
            Ok(WaEvent::QrUpdated { instance, qr_code: qr_code.to_string() })
        }
        other => Ok(WaEvent::Unsupported { event: other.to_string() }),
    }
}

fn decode_inbound_message(
    event: &str,
    instance: String,
    data: &Value,
) -> Result<WaEvent, WaDecodeError> {
    let key = data.get("key").unwrap_or(&Value::Null);

    let sender_jid = key
        .get("remoteJid")
        .or_else(|| data.get("remoteJid"))
        .or_else(|| data.get("from"))
        .and_then(Value::as_str)
        .ok_or_else(|| WaDecodeError::Malformed {
            event: event.to_string(),
            detail: "missing sender jid".to_string(),
        })?
        .to_string();

    let message_id = key
        .get("id")
        .or_else(|| data.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let from_me = key.get("fromMe").and_then(Value::as_bool).unwrap_or(false);

    let message = data.get("message").unwrap_or(&Value::Null);
    let text = message
        .get("conversation")
        .or_else(|| message.pointer("/extendedTextMessage/text"))
        .or_else(|| message.pointer("/imageMessage/caption"))
        .or_else(|| data.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let media_url = message
        .pointer("/imageMessage/url")
        .or_else(|| message.pointer("/documentMessage/url"))
        .or_else(|| message.pointer("/audioMessage/url"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let text = match (text, &media_url) {
        (Some(text), _) => text,
        // Media without caption still relays as an attachment-only message.
        (None, Some(_)) => String::new(),
        (None, None) => {
            return Err(WaDecodeError::Malformed {
                event: event.to_string(),
                detail: "message carries neither text nor media".to_string(),
            })
        }
    };

    let push_name = data.get("pushName").and_then(Value::as_str).map(str::to_string);

    Ok(WaEvent::MessageReceived(WaInboundMessage {
        instance,
        message_id,
        sender_jid,
        text,
        media_url,
        push_name,
        from_me,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_wa_event, ConnectionSignal, WaDecodeError, WaEvent};

    #[test]
    fn upsert_with_conversation_text_decodes() {
        let payload = json!({
            "event": "messages.upsert",
            "instance": "evo_line_7",
            "data": {
                "key": {"id": "wamsg-1", "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false},
                "pushName": "Maria",
                "message": {"conversation": "hello"}
            }
        });

        let WaEvent::MessageReceived(message) = decode_wa_event(&payload).expect("decodes") else {
            panic!("expected message event");
        };
        assert_eq!(message.instance, "evo_line_7");
        assert_eq!(message.message_id.as_deref(), Some("wamsg-1"));
        assert_eq!(message.sender_jid, "5511999999999@s.whatsapp.net");
        assert_eq!(message.text, "hello");
        assert_eq!(message.push_name.as_deref(), Some("Maria"));
        assert!(!message.from_me);
    }

    #[test]
    fn extended_text_and_media_shapes_decode() {
        let extended = json!({
            "event": "messages.upsert",
            "instance": "evo_line_7",
            "data": {
                "key": {"id": "wamsg-2", "remoteJid": "49170@s.whatsapp.net"},
                "message": {"extendedTextMessage": {"text": "quoted reply"}}
            }
        });
        let WaEvent::MessageReceived(message) = decode_wa_event(&extended).expect("decodes")
        else {
            panic!("expected message event");
        };
        assert_eq!(message.text, "quoted reply");

        let media = json!({
            "event": "messages.upsert",
            "instance": "evo_line_7",
            "data": {
                "key": {"id": "wamsg-3", "remoteJid": "49170@s.whatsapp.net"},
                "message": {"imageMessage": {"url": "https://cdn.example/img.jpg"}}
            }
        });
        let WaEvent::MessageReceived(message) = decode_wa_event(&media).expect("decodes") else {
            panic!("expected message event");
        };
        assert_eq!(message.media_url.as_deref(), Some("https://cdn.example/img.jpg"));
        assert_eq!(message.text, "");
    }

    #[test]
    fn connection_update_maps_provider_states() {
        for (raw, expected) in [
            ("open", ConnectionSignal::Open),
            ("connected", ConnectionSignal::Open),
            ("close", ConnectionSignal::Close),
            ("connecting", ConnectionSignal::Connecting),
        ] {
            let payload = json!({
                "event": "connection.update",
                "instance": "evo_line_7",
                "data": {"state": raw}
            });
            let WaEvent::ConnectionUpdate { state, .. } =
                decode_wa_event(&payload).expect("decodes")
            else {
                panic!("expected connection event");
            };
            assert_eq!(state, expected, "provider state `{raw}`");
        }
    }

    #[test]
    fn qr_payload_decodes_from_both_shapes() {
        let nested = json!({
            "event": "qrcode.updated",
            "instance": "evo_line_7",
            "data": {"qrcode": {"base64": "QR-B64"}}
        });
        assert_eq!(
            decode_wa_event(&nested).expect("decodes"),
            WaEvent::QrUpdated { instance: "evo_line_7".to_string(), qr_code: "QR-B64".to_string() }
        );

        let flat = json!({
            "event": "qrcode.updated",
            "instance": "evo_line_7",
            "data": {"qrcode": "QR-RAW"}
        });
        assert_eq!(
            decode_wa_event(&flat).expect("decodes"),
            WaEvent::QrUpdated { instance: "evo_line_7".to_string(), qr_code: "QR-RAW".to_string() }
        );
    }

    #[test]
    fn unknown_event_families_are_tagged_unsupported() {
        let payload = json!({"event": "presence.update", "instance": "evo_line_7", "data": {}});
        assert_eq!(
            decode_wa_event(&payload).expect("decodes"),
            WaEvent::Unsupported { event: "presence.update".to_string() }
        );
    }

    #[test]
    fn known_event_with_missing_fields_fails_closed() {
        let payload = json!({
            "event": "messages.upsert",
            "instance": "evo_line_7",
            "data": {"message": {}}
        });
        let error = decode_wa_event(&payload).expect_err("must fail closed");
        assert!(matches!(error, WaDecodeError::Malformed { .. }));

        let no_event = json!({"instance": "evo_line_7"});
        assert_eq!(decode_wa_event(&no_event), Err(WaDecodeError::MissingEvent));
    }
}
