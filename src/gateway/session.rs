use std::{collections::HashSet, sync::Arc};

use crate::auth::Identity;

use super::registry::{Outbox, RoomRegistry, SessionId};

/// One authenticated connection. Dropping the handle removes the session from
/// every room, whichever way the connection ended.
pub struct Session {
    id: SessionId,
    identity: Arc<Identity>,
    registry: RoomRegistry,
}

impl Session {
    pub fn open(registry: &RoomRegistry, identity: Identity, outbox: Outbox) -> Session {
        let identity = Arc::new(identity);
        let id = registry.register(identity.clone(), outbox);
        Session {
            id,
            identity,
            registry: registry.clone(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn join(&self, room: &str) -> bool {
        self.registry.join(self.id, room)
    }

    pub fn leave(&self, room: &str) -> bool {
        self.registry.leave(self.id, room)
    }

    pub fn rooms(&self) -> HashSet<String> {
        self.registry.rooms_of(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let rooms = self.registry.disconnect(self.id);
        tracing::info!(
            session_id = %self.id,
            user_id = %self.identity.id,
            rooms = rooms.len(),
            "session closed"
        );
    }
}
