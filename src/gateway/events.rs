//! Websocket wire events: JSON text frames shaped `{"event": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{channels::Channel, messages::Message};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub room: String,
    pub text: String,
}

/// Channel announcement payload. Clients send the whole Channel record; only
/// the name is trusted, the rest is looked up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom(String),
    LeaveRoom(String),
    SendMessage(SendMessage),
    CreateChannel(ChannelAnnouncement),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(Message),
    NewChannel(Channel),
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<ClientEvent, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    pub fn parse(frame: &str) -> Result<ServerEvent, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
