use axum::extract::ws::Message as Frame;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{
    channels::{directory, Channel},
    db,
    messages::{self, store, Message},
};

use super::{
    events::{ChannelAnnouncement, ClientEvent, SendMessage, ServerEvent},
    ordering::RoomLocks,
    registry::RoomRegistry,
    session::Session,
};

pub const MAX_TEXT_LEN: usize = 4000;

/// Why an inbound event was dropped. None of these close the connection.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("dropped: {0}")]
    ValidationDropped(&'static str),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message not persisted: {0}")]
    PersistenceFailure(#[source] sqlx::Error),
    #[error("directory lookup failed: {0}")]
    Directory(#[source] sqlx::Error),
    #[error("channel {0:?} is not in the directory")]
    UnknownChannel(String),
}

/// Shared realtime state: room membership, the message store and the
/// per-room ordering locks.
#[derive(Clone)]
pub struct Gateway {
    db_pool: SqlitePool,
    registry: RoomRegistry,
    room_locks: RoomLocks,
}

impl Gateway {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self {
            db_pool,
            registry: RoomRegistry::new(),
            room_locks: RoomLocks::default(),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> Result<(), EventError> {
        match event {
            ClientEvent::JoinRoom(room) => {
                let room = room_name(&room)?;
                if session.join(room) {
                    tracing::debug!(session_id = %session.id(), room, "joined");
                }
                Ok(())
            }
            ClientEvent::LeaveRoom(room) => {
                let room = room_name(&room)?;
                if session.leave(room) {
                    tracing::debug!(session_id = %session.id(), room, "left");
                }
                Ok(())
            }
            ClientEvent::SendMessage(send) => self.send_message(session, send).await.map(|_| ()),
            ClientEvent::CreateChannel(announcement) => self.announce_channel(announcement).await.map(|_| ()),
        }
    }

    /// Persists the message, then queues it for the room's current members.
    /// The room lock spans both steps so delivery order follows store order.
    pub async fn send_message(
        &self,
        session: &Session,
        SendMessage { room, text }: SendMessage,
    ) -> Result<Message, EventError> {
        let room = room_name(&room)?;
        if text.trim().is_empty() {
            return Err(EventError::ValidationDropped("empty text"));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(EventError::ValidationDropped("text too long"));
        }

        let mut ordered = self.room_locks.lock(room).await;
        let floor = match ordered.last_stamp() {
            Some(last) => Some(last),
            None => store::latest_stamp(&self.db_pool, room)
                .await
                .map_err(EventError::PersistenceFailure)?,
        };

        // stamped under the lock and never below the room's newest stamp, so
        // created_at order matches delivery order even if the clock steps back
        let mut message = Message::new(room, session.identity(), &text);
        if let Some(floor) = floor.filter(|&floor| floor > db::to_millis(message.created_at)) {
            message.created_at = db::from_millis(floor);
        }
        store::append(&self.db_pool, &message)
            .await
            .map_err(EventError::PersistenceFailure)?;
        ordered.set_last_stamp(db::to_millis(message.created_at));

        let frame = encode(&ServerEvent::ReceiveMessage(message.clone()))?;
        let delivered = self.registry.fan_out(room, &frame);

        tracing::debug!(
            session_id = %session.id(),
            room,
            message_id = %message.id,
            delivered,
            "message sent"
        );
        Ok(message)
    }

    /// Broadcasts the directory's record of the announced channel to every
    /// connected session.
    pub async fn announce_channel(&self, announcement: ChannelAnnouncement) -> Result<Channel, EventError> {
        let name = announcement.name.trim();
        if name.is_empty() {
            return Err(EventError::ValidationDropped("empty channel name"));
        }

        let channel = directory::find_by_name(&self.db_pool, name)
            .await
            .map_err(EventError::Directory)?
            .ok_or_else(|| EventError::UnknownChannel(name.to_owned()))?;

        let frame = encode(&ServerEvent::NewChannel(channel.clone()))?;
        let delivered = self.registry.broadcast_all(&frame);
        tracing::info!(channel = %channel.name, delivered, "channel announced");
        Ok(channel)
    }
}

fn room_name(room: &str) -> Result<&str, EventError> {
    messages::room_name(room).ok_or(EventError::ValidationDropped("empty room"))
}

fn encode(event: &ServerEvent) -> Result<Frame, EventError> {
    Ok(Frame::Text(event.to_frame()?.into()))
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{auth::Identity, gateway::registry::OUTBOX_CAPACITY};

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_owned(),
            username: format!("user-{id}"),
            email: format!("{id}@example.com"),
        }
    }

    fn open(gateway: &Gateway, id: &str) -> (Session, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Session::open(gateway.registry(), identity(id), tx), rx)
    }

    fn received(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(Frame::Text(text)) = rx.try_recv() {
            out.push(ServerEvent::parse(text.as_str()).unwrap());
        }
        out
    }

    fn send(room: &str, text: &str) -> ClientEvent {
        ClientEvent::SendMessage(SendMessage { room: room.to_owned(), text: text.to_owned() })
    }

    #[tokio::test]
    async fn send_persists_then_reaches_room_members_only() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, mut ra) = open(&gateway, "a");
        let (b, mut rb) = open(&gateway, "b");
        let (_c, mut rc) = open(&gateway, "c");

        gateway.dispatch(&a, ClientEvent::JoinRoom("general".to_owned())).await.unwrap();
        gateway.dispatch(&b, ClientEvent::JoinRoom("general".to_owned())).await.unwrap();
        gateway.dispatch(&a, send("general", "hi")).await.unwrap();

        let history = store::history(&db_pool, "general", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_id, "a");
        assert_eq!(history[0].username, "user-a");

        let expected = ServerEvent::ReceiveMessage(history[0].clone());
        assert_eq!(received(&mut ra), [expected.clone()]);
        assert_eq!(received(&mut rb), [expected]);
        assert!(received(&mut rc).is_empty());
    }

    #[tokio::test]
    async fn blank_room_or_text_is_dropped_without_storing() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, mut ra) = open(&gateway, "a");
        a.join("general");

        for event in [send("general", "   "), send("  ", "hi"), send("general", "")] {
            assert!(matches!(
                gateway.dispatch(&a, event).await,
                Err(EventError::ValidationDropped(_))
            ));
        }
        let too_long = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(gateway.dispatch(&a, send("general", &too_long)).await.is_err());

        assert!(store::history(&db_pool, "general", 10).await.unwrap().is_empty());
        assert!(received(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn sending_to_an_unjoined_room_stores_but_delivers_nowhere() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, mut ra) = open(&gateway, "a");

        let message = gateway
            .send_message(&a, SendMessage { room: "lobby".to_owned(), text: "anyone?".to_owned() })
            .await
            .unwrap();

        assert!(received(&mut ra).is_empty());
        assert_eq!(store::history(&db_pool, "lobby", 10).await.unwrap(), [message]);

        // a later joiner sees it through history only
        let (b, mut rb) = open(&gateway, "b");
        b.join("lobby");
        assert!(received(&mut rb).is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_broadcasts_nothing() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, mut ra) = open(&gateway, "a");
        a.join("general");

        sqlx::query("DROP TABLE messages").execute(&db_pool).await.unwrap();

        assert!(matches!(
            gateway.dispatch(&a, send("general", "lost")).await,
            Err(EventError::PersistenceFailure(_))
        ));
        assert!(received(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_arrive_in_store_order() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (listener, mut rl) = open(&gateway, "listener");
        listener.join("general");

        let senders: Vec<_> = (0..4).map(|i| open(&gateway, &format!("s{i}")).0).collect();
        let senders = std::sync::Arc::new(senders);

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let gateway = gateway.clone();
                let senders = senders.clone();
                tokio::spawn(async move {
                    for n in 0..10 {
                        gateway.dispatch(&senders[i], send("general", &format!("{i}-{n}"))).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let live: Vec<_> = received(&mut rl)
            .into_iter()
            .map(|event| match event {
                ServerEvent::ReceiveMessage(m) => m.id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let stored: Vec<_> = store::history(&db_pool, "general", 100)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(live.len(), 40);
        assert_eq!(live, stored);
    }

    #[tokio::test]
    async fn stamps_never_run_behind_the_room() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, _ra) = open(&gateway, "a");
        a.join("general");

        // a row stamped an hour ahead, as left behind by a clock that stepped back
        let mut ahead = Message::new("general", a.identity(), "from the future");
        ahead.created_at = db::from_millis(db::to_millis(ahead.created_at) + 3_600_000);
        store::append(&db_pool, &ahead).await.unwrap();

        let first = gateway
            .send_message(&a, SendMessage { room: " general ".to_owned(), text: "one".to_owned() })
            .await
            .unwrap();
        let second = gateway
            .send_message(&a, SendMessage { room: "general".to_owned(), text: "two".to_owned() })
            .await
            .unwrap();

        assert_eq!(first.room, "general");
        assert!(first.created_at >= ahead.created_at);
        assert!(second.created_at >= first.created_at);

        let texts: Vec<_> = store::history(&db_pool, "general", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["from the future", "one", "two"]);
    }

    #[tokio::test]
    async fn channel_announcement_reaches_everyone_but_needs_a_directory_record() {
        let (db_pool, _dir) = db::test_pool().await;
        let gateway = Gateway::new(db_pool.clone());
        let (a, mut ra) = open(&gateway, "a");
        let (_b, mut rb) = open(&gateway, "b");
        a.join("general");

        let unknown = ClientEvent::CreateChannel(ChannelAnnouncement { name: "ghost".to_owned(), id: None });
        assert!(matches!(gateway.dispatch(&a, unknown).await, Err(EventError::UnknownChannel(_))));
        assert!(received(&mut rb).is_empty());

        let created = directory::create(&db_pool, "random", "a").await.unwrap().channel;
        let event = ClientEvent::CreateChannel(ChannelAnnouncement { name: "random".to_owned(), id: Some(created.id) });
        gateway.dispatch(&a, event).await.unwrap();

        let expected = ServerEvent::NewChannel(created);
        assert_eq!(received(&mut ra), [expected.clone()]);
        assert_eq!(received(&mut rb), [expected]);
    }
}
