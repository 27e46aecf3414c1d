//! Single-active-group membership and the per-topic listener registry.
//!
//! Each group is a dynamically named event topic on the hub. A listener for
//! the topic is registered before the join is sent, so nothing published
//! between the hub accepting the join and the client reacting to it is lost,
//! and it is deregistered on leave, so a topic never has two listeners.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::conversation::ConversationStore;
use crate::directory::UserDirectory;
use crate::error::Result;
use crate::events::{ConversationChannel, ConversationEntry, methods};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipPhase {
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// Handler for one group topic
#[derive(Debug, Clone)]
pub struct GroupListener {
    group: String,
    registered_at: DateTime<Utc>,
}

impl GroupListener {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            registered_at: Utc::now(),
        }
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Append a topic message to the group's channel
    pub fn deliver(
        &self,
        directory: &UserDirectory,
        store: &mut ConversationStore,
        local_peer_id: Option<&str>,
        sender_id: &str,
        message: &str,
    ) -> ConversationEntry {
        let channel = ConversationChannel::Group(self.group.clone());
        store.append_from(&channel, directory, local_peer_id, sender_id, message)
    }
}

/// Topic name -> the single listener for it
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, GroupListener>,
}

impl ListenerRegistry {
    /// Register a listener. Returns false when one already exists.
    pub fn register(&mut self, topic: &str) -> bool {
        if self.listeners.contains_key(topic) {
            return false;
        }
        self.listeners
            .insert(topic.to_string(), GroupListener::new(topic));
        true
    }

    pub fn deregister(&mut self, topic: &str) -> bool {
        self.listeners.remove(topic).is_some()
    }

    pub fn get(&self, topic: &str) -> Option<&GroupListener> {
        self.listeners.get(topic)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Drop every listener except the one for `keep`
    fn evict_except(&mut self, keep: Option<&str>) {
        self.listeners.retain(|topic, _| {
            let kept = Some(topic.as_str()) == keep;
            if !kept {
                debug!(topic = %topic, "evicting stale group listener");
            }
            kept
        });
    }
}

/// Tracks which group, if any, this client belongs to
#[derive(Debug, Clone)]
pub struct GroupMembership {
    active_group: Option<String>,
    phase: MembershipPhase,
    registry: ListenerRegistry,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self {
            active_group: None,
            phase: MembershipPhase::Idle,
            registry: ListenerRegistry::default(),
        }
    }

    pub fn active_group(&self) -> Option<&str> {
        self.active_group.as_deref()
    }

    pub fn phase(&self) -> MembershipPhase {
        self.phase
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Listener for an inbound topic, if the topic is one of ours
    pub fn listener(&self, topic: &str) -> Option<&GroupListener> {
        self.registry.get(topic)
    }

    /// Switch to `group`, leaving the current group first.
    ///
    /// Returns `Ok(false)` when there was nothing to do.
    pub async fn join(
        &mut self,
        transport: &dyn Transport,
        local_peer_id: Option<&str>,
        store: &mut ConversationStore,
        group: &str,
    ) -> Result<bool> {
        if group.is_empty() || self.active_group.as_deref() == Some(group) {
            return Ok(false);
        }

        if let Some(current) = self.active_group.clone() {
            self.leave(transport, local_peer_id, store, &current).await?;
        }

        // Left over from earlier failed joins
        self.registry.evict_except(Some(group));

        self.phase = MembershipPhase::Joining;
        let newly_registered = self.registry.register(group);
        debug!(group, newly_registered, "group listener in place");

        let args = vec![json!(group), json!(local_peer_id)];
        if let Err(e) = transport.invoke(methods::ADD_TO_GROUP, args).await {
            warn!(group, error = %e, "join failed");
            self.phase = MembershipPhase::Idle;
            return Err(e);
        }

        let opened = store.open_group(group);
        self.active_group = Some(group.to_string());
        self.phase = MembershipPhase::Joined;
        info!(group, opened, "joined group");
        Ok(true)
    }

    /// Leave `group`: unsubscribe, drop its listener, then clear its history.
    /// A failed unsubscribe leaves everything as it was.
    pub async fn leave(
        &mut self,
        transport: &dyn Transport,
        local_peer_id: Option<&str>,
        store: &mut ConversationStore,
        group: &str,
    ) -> Result<()> {
        let previous_phase = self.phase;
        self.phase = MembershipPhase::Leaving;

        let args = vec![json!(group), json!(local_peer_id)];
        if let Err(e) = transport.invoke(methods::REMOVE_FROM_GROUP, args).await {
            warn!(group, error = %e, "leave failed");
            self.phase = previous_phase;
            return Err(e);
        }

        self.registry.deregister(group);
        store.clear_group(group);

        if self.active_group.as_deref() == Some(group) {
            self.active_group = None;
            self.phase = MembershipPhase::Idle;
        } else {
            self.phase = previous_phase;
        }
        info!(group, "left group");
        Ok(())
    }
}

impl Default for GroupMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Peer;
    use crate::testutil::RecordingTransport;
    use crate::transport::SessionKind;

    fn transport() -> RecordingTransport {
        RecordingTransport::new(SessionKind::Primary, "me")
    }

    #[tokio::test]
    async fn join_registers_listener_and_subscribes() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        assert!(membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap());
        assert_eq!(membership.active_group(), Some("rust"));
        assert_eq!(membership.phase(), MembershipPhase::Joined);
        assert!(membership.listener("rust").is_some());
        assert_eq!(
            hub.calls_to(methods::ADD_TO_GROUP),
            vec![vec![json!("rust"), json!("me")]]
        );
    }

    #[tokio::test]
    async fn listener_is_in_place_while_the_join_is_in_flight() {
        let hub = transport();
        hub.hold_method(methods::ADD_TO_GROUP);
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        {
            let join = membership.join(&hub, Some("me"), &mut store, "rust");
            tokio::pin!(join);
            assert!(futures::poll!(join.as_mut()).is_pending());
        }

        // AddToGroup is out and unanswered
        assert_eq!(hub.calls_to(methods::ADD_TO_GROUP).len(), 1);
        assert!(membership.listener("rust").is_some());
        assert_eq!(membership.phase(), MembershipPhase::Joining);
        assert_eq!(membership.active_group(), None);
    }

    #[tokio::test]
    async fn joining_opens_an_empty_channel() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        hub.fail_method(methods::ADD_TO_GROUP);
        assert!(membership.join(&hub, Some("me"), &mut store, "go").await.is_err());
        assert!(!store.has_group("go"));

        hub.heal_method(methods::ADD_TO_GROUP);
        membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap();
        assert!(store.has_group("rust"));

        membership.leave(&hub, Some("me"), &mut store, "rust").await.unwrap();
        assert!(store.has_group("rust"));
        assert!(store.history(&ConversationChannel::Group("rust".into())).is_empty());
    }

    #[tokio::test]
    async fn joining_the_same_group_twice_is_a_no_op() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap();
        assert!(!membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap());
        assert!(!membership.join(&hub, Some("me"), &mut store, "").await.unwrap());
        assert_eq!(hub.calls().len(), 1);
    }

    #[tokio::test]
    async fn switching_groups_leaves_first() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap();
        membership.join(&hub, Some("me"), &mut store, "go").await.unwrap();

        let order: Vec<_> = hub.calls().into_iter().map(|(m, args)| (m, args[0].clone())).collect();
        assert_eq!(
            order,
            vec![
                (methods::ADD_TO_GROUP.to_string(), json!("rust")),
                (methods::REMOVE_FROM_GROUP.to_string(), json!("rust")),
                (methods::ADD_TO_GROUP.to_string(), json!("go")),
            ]
        );
        assert_eq!(membership.active_group(), Some("go"));
        assert_eq!(membership.registry().len(), 1);
        assert!(membership.listener("rust").is_none());
    }

    #[tokio::test]
    async fn at_most_one_listener_across_failures() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();

        hub.fail_method(methods::ADD_TO_GROUP);
        assert!(membership.join(&hub, Some("me"), &mut store, "rust").await.is_err());
        assert_eq!(membership.active_group(), None);
        assert_eq!(membership.phase(), MembershipPhase::Idle);
        // Registered before the call went out, so it outlives the failure
        assert!(membership.listener("rust").is_some());
        assert_eq!(membership.registry().len(), 1);

        hub.heal_method(methods::ADD_TO_GROUP);
        membership.join(&hub, Some("me"), &mut store, "go").await.unwrap();
        assert_eq!(membership.registry().len(), 1);
        assert!(membership.listener("go").is_some());
    }

    #[tokio::test]
    async fn failed_leave_keeps_previous_state() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();
        let directory = UserDirectory::new();

        membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap();
        membership
            .listener("rust")
            .unwrap()
            .deliver(&directory, &mut store, Some("me"), "B", "hi");

        hub.fail_method(methods::REMOVE_FROM_GROUP);
        assert!(membership.leave(&hub, Some("me"), &mut store, "rust").await.is_err());
        assert_eq!(membership.active_group(), Some("rust"));
        assert_eq!(membership.phase(), MembershipPhase::Joined);
        assert!(membership.listener("rust").is_some());
        assert_eq!(store.history(&ConversationChannel::Group("rust".into())).len(), 1);

        // The join that needed that leave aborts too
        assert!(membership.join(&hub, Some("me"), &mut store, "go").await.is_err());
        assert_eq!(membership.active_group(), Some("rust"));
        assert!(membership.listener("go").is_none());
    }

    #[tokio::test]
    async fn leave_clears_history_but_keeps_channel() {
        let hub = transport();
        let mut store = ConversationStore::new();
        let mut membership = GroupMembership::new();
        let mut directory = UserDirectory::new();
        directory.replace_roster(vec![Peer {
            connection_id: "B".into(),
            name: Some("Bob".into()),
        }]);

        membership.join(&hub, Some("me"), &mut store, "rust").await.unwrap();
        let entry = membership
            .listener("rust")
            .unwrap()
            .deliver(&directory, &mut store, Some("me"), "B", "hi");
        assert_eq!(entry.author, "Bob");

        membership.leave(&hub, Some("me"), &mut store, "rust").await.unwrap();
        assert!(store.has_group("rust"));
        assert!(store.history(&ConversationChannel::Group("rust".into())).is_empty());
        assert_eq!(membership.active_group(), None);
        assert!(membership.registry().is_empty());
    }
}
