//! The wire format spoken over a connection.
//!
//! Every frame is a JSON object carrying exactly one of the `text` or
//! `chatroom` keys. `chatroom` in turn carries exactly one operation key.
//! Frames with no key, an unknown key or more than one key fail to decode.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::Result, models::ChatLogEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Envelope {
    Text(TextMessage),
    Chatroom(ChatroomMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatroomMessage {
    Create(CreateChatroom),
    Update(UpdateChatroom),
    Delete(DeleteChatroom),
    /// Server to client only.
    Enter(EnterChatroom),
    AddUser(UserPresence),
    RemoveUser(UserPresence),
}

/// Clients usually only fill in `msg` and `chatroomID`; the rest is stamped by
/// the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMessage {
    #[serde(rename = "msg")]
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "userID")]
    pub user_id: Uuid,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "chatroomID")]
    pub chatroom_id: Uuid,
}

impl Default for TextMessage {
    fn default() -> Self {
        Self {
            text: String::new(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            user_id: Uuid::nil(),
            user_name: String::new(),
            chatroom_id: Uuid::nil(),
        }
    }
}

impl From<ChatLogEntry> for TextMessage {
    fn from(entry: ChatLogEntry) -> Self {
        Self {
            text: entry.text,
            timestamp: entry.timestamp,
            user_id: entry.user_id,
            user_name: entry.user_name,
            chatroom_id: entry.chatroom_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChatroom {
    #[serde(rename = "chatroomName")]
    pub name: String,
    #[serde(rename = "inviteUsers", default)]
    pub invite_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChatroom {
    #[serde(rename = "chatroomID")]
    pub chatroom_id: Uuid,
    #[serde(rename = "newChatroomName")]
    pub new_name: String,
    #[serde(rename = "inviteUsers", default)]
    pub invite_users: Vec<String>,
    #[serde(rename = "removeUsers", default)]
    pub remove_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteChatroom {
    #[serde(rename = "chatroomID")]
    pub chatroom_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterChatroom {
    #[serde(rename = "chatroomName")]
    pub chatroom_name: String,
    #[serde(rename = "chatroomID")]
    pub chatroom_id: Uuid,
    #[serde(rename = "usersList")]
    pub user_list: Vec<UserEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    #[serde(rename = "chatroomID")]
    pub chatroom_id: Uuid,
    pub user: UserEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub id: Uuid,
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<TextMessage> for Envelope {
    fn from(msg: TextMessage) -> Self {
        Envelope::Text(msg)
    }
}

impl From<ChatroomMessage> for Envelope {
    fn from(msg: ChatroomMessage) -> Self {
        Envelope::Chatroom(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn text_frame_uses_public_field_names() {
        let msg = TextMessage {
            text: "hi".to_owned(),
            timestamp: datetime!(2024-01-02 03:04:05.678 UTC),
            user_id: Uuid::nil(),
            user_name: "ann".to_owned(),
            chatroom_id: crate::models::MAIN_CHAT_ID,
        };
        let value: serde_json::Value =
            serde_json::from_str(&Envelope::from(msg).encode().unwrap()).unwrap();

        assert_eq!(value["text"]["msg"], "hi");
        assert_eq!(value["text"]["userName"], "ann");
        assert_eq!(value["text"]["chatroomID"], "00000000-0000-0000-0000-000000000001");
        assert_eq!(value["text"]["timestamp"], "2024-01-02T03:04:05.678Z");
        assert!(value.get("chatroom").is_none());
    }

    #[test]
    fn client_text_frame_needs_only_msg_and_chatroom() {
        let raw = json!({"text": {
            "msg": "yo",
            "chatroomID": "00000000-0000-0000-0000-000000000001"
        }});
        let Envelope::Text(msg) = Envelope::decode(raw.to_string().as_bytes()).unwrap() else {
            panic!("expected a text envelope");
        };
        assert_eq!(msg.text, "yo");
        assert_eq!(msg.chatroom_id, crate::models::MAIN_CHAT_ID);
        assert!(msg.user_id.is_nil());
    }

    #[test]
    fn chatroom_operations_decode_by_key() {
        let raw = json!({"chatroom": {"create": {"chatroomName": "team", "inviteUsers": []}}});
        assert_eq!(
            Envelope::decode(raw.to_string().as_bytes()).unwrap(),
            Envelope::Chatroom(ChatroomMessage::Create(CreateChatroom {
                name: "team".to_owned(),
                invite_users: vec![],
            }))
        );

        let raw = json!({"chatroom": {"removeUser": {
            "chatroomID": "00000000-0000-0000-0000-000000000001",
            "user": {"name": "bo", "id": "00000000-0000-0000-0000-000000000002"}
        }}});
        assert!(matches!(
            Envelope::decode(raw.to_string().as_bytes()).unwrap(),
            Envelope::Chatroom(ChatroomMessage::RemoveUser(UserPresence { user, .. }))
                if user.name == "bo"
        ));
    }

    #[test]
    fn empty_or_ambiguous_frames_are_rejected() {
        for raw in [
            json!({}),
            json!({"bogus": {}}),
            json!({"text": {"msg": "a"}, "chatroom": {"delete": {"chatroomID": Uuid::nil()}}}),
            json!({"chatroom": {}}),
            json!({"chatroom": {"delete": {"chatroomID": Uuid::nil()}, "update": {}}}),
        ] {
            assert!(
                Envelope::decode(raw.to_string().as_bytes()).is_err(),
                "{raw} should not decode"
            );
        }
    }

    #[test]
    fn enter_lists_users_under_users_list() {
        let envelope = Envelope::from(ChatroomMessage::Enter(EnterChatroom {
            chatroom_name: "mainChat".to_owned(),
            chatroom_id: crate::models::MAIN_CHAT_ID,
            user_list: vec![UserEntry { name: "ann".to_owned(), id: Uuid::nil() }],
        }));
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["chatroom"]["enter"]["usersList"][0]["name"], "ann");
    }
}
