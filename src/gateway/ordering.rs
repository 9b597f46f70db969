use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

// newest created_at (unix millis) handed out in the room, if known
type Slot = Arc<AsyncMutex<Option<i64>>>;

/// Per-room async locks serialising the persist-then-broadcast step of sends.
/// A room's slot is dropped once nobody holds or waits on it, and with it the
/// remembered stamp.
#[derive(Clone, Default)]
pub struct RoomLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

pub struct RoomGuard {
    room: String,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    last_stamp: OwnedMutexGuard<Option<i64>>,
}

impl RoomGuard {
    /// Newest stamp issued in this room while the slot was alive.
    pub fn last_stamp(&self) -> Option<i64> {
        *self.last_stamp
    }

    pub fn set_last_stamp(&mut self, millis: i64) {
        *self.last_stamp = Some(millis);
    }
}

impl RoomLocks {
    pub async fn lock(&self, room: &str) -> RoomGuard {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room.to_owned())
            .or_default()
            .clone();

        RoomGuard {
            room: room.to_owned(),
            slots: self.slots.clone(),
            last_stamp: slot.lock_owned().await,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // two references left: the map's and the one inside our guard
        if slots.get(&self.room).is_some_and(|slot| Arc::strong_count(slot) == 2) {
            slots.remove(&self.room);
        }
    }
}
