//! Ordered chat histories keyed by channel.

use std::collections::HashMap;

use crate::directory::UserDirectory;
use crate::events::{ConversationChannel, ConversationEntry};

/// Append-only histories for the broadcast, private and group channels
#[derive(Debug, Clone)]
pub struct ConversationStore {
    broadcast: Vec<ConversationEntry>,
    private: Vec<ConversationEntry>,
    groups: HashMap<String, Vec<ConversationEntry>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            broadcast: Vec::new(),
            private: Vec::new(),
            groups: HashMap::new(),
        }
    }

    /// Store whose broadcast channel opens with a greeting from the app itself
    pub fn with_welcome(app_name: &str, welcome: &str) -> Self {
        let mut store = Self::new();
        if !welcome.is_empty() {
            store.broadcast.push(ConversationEntry::new(app_name, "", welcome));
        }
        store
    }

    /// Add an entry to a channel. Group channels are created on first write.
    pub fn append(&mut self, channel: &ConversationChannel, entry: ConversationEntry) {
        match channel {
            ConversationChannel::Broadcast => self.broadcast.push(entry),
            ConversationChannel::Private => self.private.push(entry),
            ConversationChannel::Group(name) => {
                self.groups.entry(name.clone()).or_default().push(entry)
            }
        }
    }

    /// Append an entry whose author is resolved from a connection id
    pub fn append_from(
        &mut self,
        channel: &ConversationChannel,
        directory: &UserDirectory,
        local_peer_id: Option<&str>,
        author_id: &str,
        body: &str,
    ) -> ConversationEntry {
        let author = directory.resolve_label(author_id, local_peer_id);
        let entry = ConversationEntry::new(author, author_id, body);
        self.append(channel, entry.clone());
        entry
    }

    /// Entries of a channel in display order
    pub fn history(&self, channel: &ConversationChannel) -> &[ConversationEntry] {
        match channel {
            ConversationChannel::Broadcast => &self.broadcast,
            ConversationChannel::Private => &self.private,
            ConversationChannel::Group(name) => {
                self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
            }
        }
    }

    /// Whether a group channel exists, joined or written to
    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Create an empty group channel. Returns false when it already exists.
    pub fn open_group(&mut self, name: &str) -> bool {
        if self.has_group(name) {
            return false;
        }
        self.groups.insert(name.to_string(), Vec::new());
        true
    }

    /// Empty a group's history while keeping the channel for reuse
    pub fn clear_group(&mut self, name: &str) {
        if let Some(entries) = self.groups.get_mut(name) {
            entries.clear();
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
