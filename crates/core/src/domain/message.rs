use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Delivery outcome recorded on the message row. `Received` is the terminal
/// inbound state once forwarding succeeded; `Failed` marks exhausted retries
/// or a missing binding, never a dropped row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" => Some(Self::Received),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A relayed message. The external identifiers (`wa_message_id`,
/// `crm_message_id`) are the idempotency keys; each is unique across all
/// messages when present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub direction: MessageDirection,
    pub body: String,
    pub media_url: Option<String>,
    pub wa_message_id: Option<String>,
    pub crm_message_id: Option<String>,
    pub delivery_status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{MessageDirection, MessageStatus};

    #[test]
    fn direction_round_trips_from_storage_encoding() {
        for direction in [MessageDirection::Inbound, MessageDirection::Outbound] {
            assert_eq!(MessageDirection::parse(direction.as_str()), Some(direction));
        }
    }

    #[test]
    fn status_round_trips_from_storage_encoding() {
        let cases = [
            MessageStatus::Received,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Failed,
        ];
        for status in cases {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
    }
}
