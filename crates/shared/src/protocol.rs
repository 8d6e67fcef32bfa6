use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ConversationId, MessageId, PartyId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: PartyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Set only on locally synthesized records; server records omit it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
}

impl ChatMessage {
    pub fn attachment_count(&self) -> usize {
        self.image_refs.len()
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    #[serde(default)]
    pub participant_ids: Vec<PartyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_id: PartyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    pub page: u32,
    pub page_size: u32,
}

/// Server-side hub methods callable over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments")]
pub enum HubInvocation {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        text: String,
    },
    StartTyping {
        conversation_id: ConversationId,
    },
    StopTyping {
        conversation_id: ConversationId,
    },
}

impl HubInvocation {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "JoinConversation",
            Self::LeaveConversation { .. } => "LeaveConversation",
            Self::SendMessage { .. } => "SendMessage",
            Self::StartTyping { .. } => "StartTyping",
            Self::StopTyping { .. } => "StopTyping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub invocation_id: u64,
    pub invocation: HubInvocation,
}

/// Server-initiated events delivered to every joined client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HubEvent {
    MessageReceived {
        message: ChatMessage,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: PartyId,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: PartyId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Completion {
        invocation_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ApiError>,
    },
    Event(HubEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_records_default_to_authoritative() {
        let message: ChatMessage = serde_json::from_str(
            r#"{"id":"7","conversation_id":"c","sender_id":"u","text":"hi","created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .expect("parse message");
        assert!(!message.provisional);
        assert!(message.image_refs.is_empty());
        assert!(message.has_text());
    }

    #[test]
    fn hub_invocation_wire_shape_names_the_method() {
        let frame = ClientFrame {
            invocation_id: 3,
            invocation: HubInvocation::JoinConversation {
                conversation_id: ConversationId::from("c-9"),
            },
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["invocation"]["method"], "JoinConversation");
        assert_eq!(json["invocation"]["arguments"]["conversation_id"], "c-9");
    }

    #[test]
    fn event_frames_round_trip_through_the_envelope() {
        let raw = r#"{"type":"event","payload":{"type":"user_typing","payload":{"conversation_id":"c","user_id":"peer"}}}"#;
        let frame: ServerFrame = serde_json::from_str(raw).expect("parse frame");
        match frame {
            ServerFrame::Event(HubEvent::UserTyping { user_id, .. }) => {
                assert_eq!(user_id, PartyId::from("peer"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
