use std::collections::HashMap;

use crate::events::{Group, Peer};

/// Label used for the local peer when it has no stored display name.
pub const SELF_LABEL: &str = "You";

/// Known peers and groups as last published by the hub.
///
/// Both rosters are replaced wholesale; there is no incremental removal.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    peers: Vec<Peer>,
    /// connection id -> index into `peers`
    index: HashMap<String, usize>,
    groups: Vec<Group>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole peer set and rebuild the lookup index
    pub fn replace_roster(&mut self, peers: Vec<Peer>) {
        self.index = peers
            .iter()
            .enumerate()
            .map(|(i, peer)| (peer.connection_id.clone(), i))
            .collect();
        self.peers = peers;
    }

    /// Replace the whole group roster
    pub fn replace_groups(&mut self, groups: Vec<Group>) {
        self.groups = groups;
    }

    pub fn peer(&self, connection_id: &str) -> Option<&Peer> {
        self.index.get(connection_id).map(|&i| &self.peers[i])
    }

    /// Resolve the label shown for a connection id: stored name, then
    /// [`SELF_LABEL`] for the local peer, then `Unknown User (<id>)`.
    pub fn resolve_label(&self, connection_id: &str, local_peer_id: Option<&str>) -> String {
        let stored = self
            .peer(connection_id)
            .and_then(|peer| peer.name.as_deref())
            .filter(|name| !name.is_empty());

        match stored {
            Some(name) => name.to_string(),
            None if local_peer_id == Some(connection_id) => SELF_LABEL.to_string(),
            None => format!("Unknown User ({})", connection_id),
        }
    }

    #[cfg(test)]
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Every peer except the local one, in roster order
    pub fn peers_except(&self, local_peer_id: Option<&str>) -> Vec<&Peer> {
        self.peers
            .iter()
            .filter(|peer| Some(peer.connection_id.as_str()) != local_peer_id)
            .collect()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Members of a group, empty when the group is unknown
    pub fn members_of(&self, group_name: &str) -> &[Peer] {
        self.groups
            .iter()
            .find(|group| group.name == group_name)
            .map(|group| group.members.as_slice())
            .unwrap_or(&[])
    }
}
