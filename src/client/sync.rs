use crate::{channels::Channel, messages::Message};

use super::connection::RoomSubscription;

/// Known channels in the order this client learned about them.
#[derive(Debug, Default, Clone)]
pub struct ChannelList {
    channels: Vec<Channel>,
}

impl ChannelList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a directory snapshot in. Names already known keep their place;
    /// new ones are appended in snapshot order.
    pub fn merge_snapshot(&mut self, snapshot: Vec<Channel>) {
        for channel in snapshot {
            self.apply_created(channel);
        }
    }

    /// Appends a live announcement. Returns false for a channel already known
    /// by id or by name.
    pub fn apply_created(&mut self, channel: Channel) -> bool {
        if self
            .channels
            .iter()
            .any(|known| known.id == channel.id || known.name == channel.name)
        {
            return false;
        }
        self.channels.push(channel);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// The room on screen: its history plus whatever arrived live since.
pub struct RoomView {
    pub(super) messages: Vec<Message>,
    pub(super) subscription: RoomSubscription,
}

impl RoomView {
    pub(super) fn new(history: Vec<Message>, subscription: RoomSubscription) -> Self {
        Self { messages: history, subscription }
    }

    pub fn room(&self) -> &str {
        self.subscription.room()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Appends a live message unless it belongs elsewhere or is already shown.
    pub(super) fn apply(&mut self, message: Message) -> bool {
        if message.room != self.room() || self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}
