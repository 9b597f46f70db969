//! An explicitly owned websocket session to the gateway.
//!
//! Live messages are routed by room to [`RoomSubscription`]s, so a view only
//! ever sees the room it subscribed to. Dropping the last subscription for a
//! room sends `leave_room`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{sync::{broadcast, mpsc}, task::JoinHandle};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message as Frame,
};

use crate::{
    channels::Channel,
    gateway::events::{ChannelAnnouncement, ClientEvent, SendMessage, ServerEvent},
    messages::{self, Message},
};

use super::ClientError;

const CHANNEL_EVENT_BUFFER: usize = 64;
const ROOM_BUFFER: usize = 256;

enum Outgoing {
    Event(ClientEvent),
    Close,
}

#[derive(Default)]
struct RoomRoutes {
    next_id: u64,
    rooms: HashMap<String, Vec<(u64, mpsc::Sender<Message>)>>,
}

struct Routes {
    rooms: Mutex<RoomRoutes>,
    // None once the reader has stopped
    channels: Mutex<Option<broadcast::Sender<Channel>>>,
}

impl Routes {
    fn rooms(&self) -> MutexGuard<'_, RoomRoutes> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels(&self) -> MutexGuard<'_, Option<broadcast::Sender<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, message: Message) {
        let mut routes = self.rooms();
        if let Some(subscribers) = routes.rooms.get_mut(&message.room) {
            subscribers.retain(|(_, tx)| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // history catches the view up on its next load
                    tracing::warn!(room = %message.room, message_id = %message.id, "room subscription full, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn shut(&self) {
        self.rooms().rooms.clear();
        self.channels().take();
    }
}

pub struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Arc<Routes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Opens `ws_url` presenting `token` as a bearer credential. A 401 from the
    /// handshake comes back as [`ClientError::Rejected`].
    pub async fn connect(ws_url: &str, token: &str) -> Result<Connection, ClientError> {
        let mut request = ws_url.into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ClientError::InvalidToken)?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (channel_tx, _) = broadcast::channel(CHANNEL_EVENT_BUFFER);
        let routes = Arc::new(Routes {
            rooms: Mutex::new(RoomRoutes::default()),
            channels: Mutex::new(Some(channel_tx)),
        });

        let (outgoing, mut pending) = mpsc::unbounded_channel::<Outgoing>();
        let writer = tokio::spawn(async move {
            while let Some(next) = pending.recv().await {
                let frame = match next {
                    Outgoing::Event(event) => match event.to_frame() {
                        Ok(frame) => Frame::text(frame),
                        Err(err) => {
                            tracing::warn!(error = %err, "could not encode client event");
                            continue;
                        }
                    },
                    Outgoing::Close => {
                        let _ = sink.send(Frame::Close(None)).await;
                        break;
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_routes = routes.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                let Frame::Text(text) = frame else {
                    continue;
                };
                match ServerEvent::parse(text.as_str()) {
                    Ok(ServerEvent::ReceiveMessage(message)) => reader_routes.deliver(message),
                    Ok(ServerEvent::NewChannel(channel)) => {
                        if let Some(tx) = reader_routes.channels().as_ref() {
                            let _ = tx.send(channel);
                        }
                    }
                    Err(err) => tracing::debug!(error = %err, "unrecognised server frame"),
                }
            }
            reader_routes.shut();
        });

        Ok(Connection { outgoing, routes, reader, writer })
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.outgoing
            .send(Outgoing::Event(event))
            .map_err(|_| ClientError::Closed)
    }

    /// Joins `room` and returns a subscription carrying only its messages.
    /// The name is trimmed the same way the gateway trims it.
    pub fn join(&self, room: &str) -> Result<RoomSubscription, ClientError> {
        let room = messages::room_name(room).ok_or_else(|| ClientError::InvalidRoom(room.to_owned()))?;
        let (tx, rx) = mpsc::channel(ROOM_BUFFER);

        let mut routes = self.routes.rooms();
        if routes.rooms.get(room).is_none_or(Vec::is_empty) {
            self.emit(ClientEvent::JoinRoom(room.to_owned()))?;
        }

        let id = routes.next_id;
        routes.next_id += 1;
        routes.rooms.entry(room.to_owned()).or_default().push((id, tx));

        Ok(RoomSubscription {
            room: room.to_owned(),
            id,
            rx,
            routes: self.routes.clone(),
            outgoing: self.outgoing.clone(),
        })
    }

    pub fn send(&self, room: &str, text: &str) -> Result<(), ClientError> {
        let room = messages::room_name(room).ok_or_else(|| ClientError::InvalidRoom(room.to_owned()))?;
        self.emit(ClientEvent::SendMessage(SendMessage {
            room: room.to_owned(),
            text: text.to_owned(),
        }))
    }

    /// Asks the gateway to tell every connected session about `channel`.
    pub fn announce_channel(&self, channel: &Channel) -> Result<(), ClientError> {
        self.emit(ClientEvent::CreateChannel(ChannelAnnouncement {
            name: channel.name.clone(),
            id: Some(channel.id),
        }))
    }

    pub fn channel_events(&self) -> Result<ChannelSubscription, ClientError> {
        self.routes
            .channels()
            .as_ref()
            .map(|tx| ChannelSubscription { rx: tx.subscribe() })
            .ok_or(ClientError::Closed)
    }

    /// True once the server side has gone away.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Sends a close frame and waits for it to be written.
    pub async fn close(mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
        let _ = (&mut self.writer).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        self.routes.shut();
    }
}

/// Live messages for one room. Dropping it leaves the room once no other
/// subscription for that room remains.
pub struct RoomSubscription {
    room: String,
    id: u64,
    rx: mpsc::Receiver<Message>,
    routes: Arc<Routes>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl RoomSubscription {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Next message for this room, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// A message that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        let mut routes = self.routes.rooms();
        let Some(subscribers) = routes.rooms.get_mut(&self.room) else {
            return;
        };
        subscribers.retain(|(id, _)| *id != self.id);
        if subscribers.is_empty() {
            routes.rooms.remove(&self.room);
            let _ = self
                .outgoing
                .send(Outgoing::Event(ClientEvent::LeaveRoom(self.room.clone())));
        }
    }
}

/// `new_channel` events from the gateway.
pub struct ChannelSubscription {
    rx: broadcast::Receiver<Channel>,
}

impl ChannelSubscription {
    /// Next announced channel, or `None` once the connection is gone. Lagged
    /// announcements are skipped; a directory refresh recovers them.
    pub async fn recv(&mut self) -> Option<Channel> {
        loop {
            match self.rx.recv().await {
                Ok(channel) => return Some(channel),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "channel announcements lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached() -> (Connection, mpsc::UnboundedReceiver<Outgoing>) {
        let (channel_tx, _) = broadcast::channel(CHANNEL_EVENT_BUFFER);
        let (outgoing, pending) = mpsc::unbounded_channel();
        let connection = Connection {
            outgoing,
            routes: Arc::new(Routes {
                rooms: Mutex::new(RoomRoutes::default()),
                channels: Mutex::new(Some(channel_tx)),
            }),
            reader: tokio::spawn(std::future::pending()),
            writer: tokio::spawn(std::future::pending()),
        };
        (connection, pending)
    }

    fn emitted(pending: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(Outgoing::Event(event)) = pending.try_recv() {
            out.push(event);
        }
        out
    }

    fn message(room: &str, text: &str) -> Message {
        Message {
            id: uuid::Uuid::now_v7(),
            room: room.to_owned(),
            user_id: "u1".to_owned(),
            username: "alice".to_owned(),
            text: text.to_owned(),
            created_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn room_names_are_trimmed_like_the_gateway_does() {
        let (connection, mut pending) = detached();

        let mut lobby = connection.join(" lobby ").unwrap();
        connection.send(" lobby ", "hi").unwrap();
        assert_eq!(lobby.room(), "lobby");
        assert_eq!(emitted(&mut pending), [
            ClientEvent::JoinRoom("lobby".to_owned()),
            ClientEvent::SendMessage(SendMessage { room: "lobby".to_owned(), text: "hi".to_owned() }),
        ]);

        connection.routes.deliver(message("lobby", "hi"));
        assert_eq!(lobby.try_recv().map(|m| m.text).as_deref(), Some("hi"));
        assert!(lobby.try_recv().is_none());

        assert!(matches!(connection.join("   "), Err(ClientError::InvalidRoom(_))));
        assert!(matches!(connection.send("", "hi"), Err(ClientError::InvalidRoom(_))));
    }

    #[tokio::test]
    async fn last_subscription_leaves_the_room() {
        let (connection, mut pending) = detached();

        let first = connection.join("general").unwrap();
        let second = connection.join("general").unwrap();
        drop(first);
        assert_eq!(emitted(&mut pending), [ClientEvent::JoinRoom("general".to_owned())]);

        drop(second);
        assert_eq!(emitted(&mut pending), [ClientEvent::LeaveRoom("general".to_owned())]);
        assert!(connection.routes.rooms().rooms.is_empty());
    }

    #[tokio::test]
    async fn failed_join_leaves_no_route_behind() {
        let (connection, pending) = detached();
        drop(pending);

        assert!(matches!(connection.join("general"), Err(ClientError::Closed)));
        assert!(connection.routes.rooms().rooms.is_empty());
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn full_subscription_drops_rather_than_grows() {
        let (connection, _pending) = detached();
        let mut general = connection.join("general").unwrap();

        for i in 0..ROOM_BUFFER + 10 {
            connection.routes.deliver(message("general", &format!("m{i}")));
        }

        let mut received = 0;
        while general.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, ROOM_BUFFER);

        // still routed once there is room again
        connection.routes.deliver(message("general", "later"));
        assert_eq!(general.try_recv().map(|m| m.text).as_deref(), Some("later"));
    }
}
