use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageId, Role, UserId},
    error::ChatError,
};

/// Total unread messages keyed by the viewer role they apply to.
pub type UnreadCounts = BTreeMap<Role, u64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        conversation_id: ConversationId,
        content: String,
        client_message_id: Uuid,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
}

impl ClientFrame {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            ClientFrame::Message {
                conversation_id, ..
            }
            | ClientFrame::JoinConversation { conversation_id }
            | ClientFrame::LeaveConversation { conversation_id } => conversation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<Role>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_counts: Option<UnreadCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_counts: Option<UnreadCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Message { message: ChatMessage },
    ConversationUpdate { update: ConversationUpdate },
    Error(ChatError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCode;

    #[test]
    fn client_frames_use_tagged_snake_case_layout() {
        let frame = ClientFrame::JoinConversation {
            conversation_id: ConversationId::new("c-42"),
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "type": "join_conversation",
                "payload": { "conversation_id": "c-42" }
            })
        );
    }

    #[test]
    fn message_event_parses_role_keyed_unread_counts() {
        let raw = r#"{
            "type": "message",
            "payload": {
                "message": {
                    "message_id": 9,
                    "conversation_id": "c-1",
                    "sender_id": 3,
                    "content": "hi",
                    "sent_at": "2024-01-01T00:00:00Z",
                    "unread_counts": { "consultant": 4, "company": 0, "auditor": 7 }
                }
            }
        }"#;
        let ServerEvent::Message { message } = serde_json::from_str(raw).expect("parse") else {
            panic!("expected message event");
        };
        let counts = message.unread_counts.expect("counts");
        assert_eq!(counts.get(&Role::Consultant), Some(&4));
        assert_eq!(counts.get(&Role::Company), Some(&0));
        assert_eq!(counts.get(&Role::Unknown), Some(&7));
    }

    #[test]
    fn error_frames_tolerate_codes_added_by_the_server() {
        let raw = r#"{
            "type": "error",
            "payload": { "code": "slow_mode", "detail": "wait 10s" }
        }"#;
        let ServerEvent::Error(err) = serde_json::from_str(raw).expect("parse") else {
            panic!("expected error event");
        };
        assert_eq!(err.code, ChatErrorCode::Unknown);
        assert_eq!(err.detail, "wait 10s");

        let known: ServerEvent = serde_json::from_str(
            r#"{"type":"error","payload":{"code":"not_participant","detail":"no"}}"#,
        )
        .expect("parse");
        assert!(matches!(
            known,
            ServerEvent::Error(ChatError {
                code: ChatErrorCode::NotParticipant,
                ..
            })
        ));
    }
}
