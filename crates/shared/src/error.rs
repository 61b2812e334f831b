use serde::{Deserialize, Serialize};

/// Codes the chat server puts in realtime error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatErrorCode {
    NotParticipant,
    ConversationNotFound,
    InvalidFrame,
    RateLimited,
    #[serde(other)]
    Unknown,
}

/// Error frame pushed by the realtime server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatError {
    pub code: ChatErrorCode,
    pub detail: String,
}

/// `{"detail": "..."}` body returned by the REST API on most failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
}
