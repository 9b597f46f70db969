//! In-memory room membership.
//!
//! Both directions of the membership relation (room -> sessions and
//! session -> rooms) live behind one lock, so every join, leave and
//! disconnect updates them together. Fan-out reads the member set under the
//! same lock, which makes the recipient list a consistent snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use axum::extract::ws::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::auth::Identity;

pub type SessionId = Uuid;

/// Frames a session may have queued before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 256;

/// Per-session queue drained by that connection's writer task.
pub type Outbox = mpsc::Sender<Message>;

struct Member {
    identity: Arc<Identity>,
    rooms: HashSet<String>,
    outbox: Outbox,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, HashSet<SessionId>>,
    sessions: HashMap<SessionId, Member>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // every mutation is one critical section; a poisoned lock still holds a consistent map
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, identity: Arc<Identity>, outbox: Outbox) -> SessionId {
        let id = Uuid::now_v7();
        self.lock().sessions.insert(id, Member {
            identity,
            rooms: HashSet::new(),
            outbox,
        });
        id
    }

    /// Returns true if the session was not already a member.
    pub fn join(&self, session: SessionId, room: &str) -> bool {
        let mut inner = self.lock();
        let Inner { rooms, sessions } = &mut *inner;
        let Some(member) = sessions.get_mut(&session) else {
            return false;
        };

        if !member.rooms.insert(room.to_owned()) {
            return false;
        }
        rooms.entry(room.to_owned()).or_default().insert(session);
        true
    }

    /// Returns true if the session was a member. Empty rooms are dropped.
    pub fn leave(&self, session: SessionId, room: &str) -> bool {
        let mut inner = self.lock();
        let Inner { rooms, sessions } = &mut *inner;
        let Some(member) = sessions.get_mut(&session) else {
            return false;
        };

        if !member.rooms.remove(room) {
            return false;
        }
        remove_member(rooms, room, session);
        true
    }

    /// Forgets the session and removes it from every room it was in.
    /// Returns the rooms it left.
    pub(crate) fn disconnect(&self, session: SessionId) -> Vec<String> {
        remove_session(&mut self.lock(), session)
    }

    /// Queues `frame` for every current member of `room`. Returns the number
    /// of sessions it was queued for.
    ///
    /// A member whose outbox is full is evicted: its outbox is dropped, which
    /// ends its writer and with it the connection.
    pub fn fan_out(&self, room: &str, frame: &Message) -> usize {
        let mut inner = self.lock();
        let Some(members) = inner.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for id in members {
            let Some(member) = inner.sessions.get(id) else {
                continue;
            };
            match member.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => stalled.push(*id),
                Err(TrySendError::Closed(_)) => {}
            }
        }

        evict(&mut inner, stalled);
        delivered
    }

    /// Queues `frame` for every connected session regardless of rooms.
    pub fn broadcast_all(&self, frame: &Message) -> usize {
        let mut inner = self.lock();

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for (id, member) in &inner.sessions {
            match member.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => stalled.push(*id),
                Err(TrySendError::Closed(_)) => {}
            }
        }

        evict(&mut inner, stalled);
        delivered
    }

    pub fn members(&self, room: &str) -> HashSet<SessionId> {
        self.lock().rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn rooms_of(&self, session: SessionId) -> HashSet<String> {
        self.lock()
            .sessions
            .get(&session)
            .map(|member| member.rooms.clone())
            .unwrap_or_default()
    }

    pub fn identity_of(&self, session: SessionId) -> Option<Arc<Identity>> {
        self.lock().sessions.get(&session).map(|m| m.identity.clone())
    }

    pub fn contains_room(&self, room: &str) -> bool {
        self.lock().rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

fn remove_member(rooms: &mut HashMap<String, HashSet<SessionId>>, room: &str, session: SessionId) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&session);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}

fn remove_session(inner: &mut Inner, session: SessionId) -> Vec<String> {
    let Inner { rooms, sessions } = inner;
    let Some(member) = sessions.remove(&session) else {
        return Vec::new();
    };

    for room in &member.rooms {
        remove_member(rooms, room, session);
    }
    member.rooms.into_iter().collect()
}

fn evict(inner: &mut Inner, stalled: Vec<SessionId>) {
    for session in stalled {
        let rooms = remove_session(inner, session);
        tracing::warn!(%session, rooms = rooms.len(), "outbox full, session evicted");
    }
}
