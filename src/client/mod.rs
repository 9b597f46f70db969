//! Client-side sync: keeps a channel list and one room view current against
//! the REST snapshot endpoints and the live gateway.

mod api;
mod connection;
mod sync;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::{channels::Channel, messages::{self, Message}};

pub use api::Api;
pub use connection::{ChannelSubscription, Connection, RoomSubscription};
pub use sync::{ChannelList, RoomView};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket failed: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("handshake rejected with status {0}")]
    Rejected(u16),
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("token cannot be sent as a header")]
    InvalidToken,
    #[error("invalid room name {0:?}")]
    InvalidRoom(String),
    #[error("channel {0:?} not found")]
    ChannelNotFound(String),
    #[error("no room selected")]
    NoActiveRoom,
    #[error("connection closed")]
    Closed,
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => ClientError::Rejected(response.status().as_u16()),
            other => ClientError::WebSocket(Box::new(other)),
        }
    }
}

/// Something that changed what the user sees.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ChannelAdded(Channel),
    Message(Message),
}

enum Incoming {
    Channel(Option<Channel>),
    Message(Option<Message>),
}

/// Top-level controller owning the connection, the channel list and the
/// active room view.
pub struct SyncAgent {
    api: Api,
    connection: Connection,
    channel_events: ChannelSubscription,
    channels: ChannelList,
    active: Option<RoomView>,
}

impl SyncAgent {
    /// Connects to the gateway, subscribes to channel announcements and loads
    /// the directory snapshot, in that order so no announcement falls between.
    pub async fn start(base_url: &str, token: &str) -> Result<SyncAgent, ClientError> {
        let api = Api::new(base_url, token)?;
        let connection = Connection::connect(api.ws_url()?.as_str(), token).await?;
        let channel_events = connection.channel_events()?;

        let mut agent = SyncAgent {
            api,
            connection,
            channel_events,
            channels: ChannelList::new(),
            active: None,
        };
        agent.refresh_channels().await?;
        Ok(agent)
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &ChannelList {
        &self.channels
    }

    pub fn active(&self) -> Option<&RoomView> {
        self.active.as_ref()
    }

    pub async fn refresh_channels(&mut self) -> Result<(), ClientError> {
        let snapshot = self.api.channels().await?;
        self.channels.merge_snapshot(snapshot);
        Ok(())
    }

    /// Switches the view to `room`: leaves the previous room, joins the new
    /// one, then loads history. Joining first means anything sent while the
    /// history request is in flight arrives on the subscription; it is merged
    /// in behind the snapshot, duplicates dropped. Unknown channel names are
    /// refused.
    pub async fn select_room(&mut self, room: &str) -> Result<&RoomView, ClientError> {
        let room = messages::room_name(room).ok_or_else(|| ClientError::InvalidRoom(room.to_owned()))?;
        if !self.channels.contains(room) {
            return Err(ClientError::ChannelNotFound(room.to_owned()));
        }
        if self.active.as_ref().is_some_and(|view| view.room() == room) {
            return self.active.as_ref().ok_or(ClientError::NoActiveRoom);
        }

        self.leave_room();
        let subscription = self.connection.join(room)?;
        let history = self.api.history(room).await?;

        let mut view = RoomView::new(history, subscription);
        while let Some(message) = view.subscription.try_recv() {
            view.apply(message);
        }
        Ok(self.active.insert(view))
    }

    /// Tears the current view down, which leaves its room.
    pub fn leave_room(&mut self) {
        self.active = None;
    }

    /// Waits for the next live change and applies it. `None` once the
    /// connection has closed.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        loop {
            let incoming = tokio::select! {
                channel = self.channel_events.recv() => Incoming::Channel(channel),
                message = next_message(&mut self.active) => Incoming::Message(message),
            };

            match incoming {
                Incoming::Channel(Some(channel)) => {
                    if self.channels.apply_created(channel.clone()) {
                        return Some(SyncEvent::ChannelAdded(channel));
                    }
                }
                Incoming::Message(Some(message)) => {
                    if let Some(view) = self.active.as_mut() {
                        if view.apply(message.clone()) {
                            return Some(SyncEvent::Message(message));
                        }
                    }
                }
                Incoming::Channel(None) | Incoming::Message(None) => return None,
            }
        }
    }

    /// Writes the channel to the directory, then announces it to everyone.
    pub async fn create_channel(&mut self, name: &str) -> Result<Channel, ClientError> {
        let channel = self.api.create_channel(name.trim()).await?;
        self.channels.apply_created(channel.clone());
        self.connection.announce_channel(&channel)?;
        Ok(channel)
    }

    /// Sends to the active room. Blank text is not sent.
    pub fn send(&self, text: &str) -> Result<(), ClientError> {
        let view = self.active.as_ref().ok_or(ClientError::NoActiveRoom)?;
        if text.trim().is_empty() {
            return Ok(());
        }
        if self.connection.is_closed() {
            return Err(ClientError::Closed);
        }
        self.connection.send(view.room(), text)
    }

    pub async fn shutdown(mut self) {
        self.active = None;
        self.connection.close().await;
    }
}

async fn next_message(active: &mut Option<RoomView>) -> Option<Message> {
    match active {
        Some(view) => view.subscription.recv().await,
        None => std::future::pending().await,
    }
}
