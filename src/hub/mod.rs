//! Real-time notification fan-out.
//!
//! The hub keeps a registry of live subscriber channels and routes lifecycle
//! events to a single user, to every connection of a role, or to every
//! member of a group. Publishing never blocks and never fails: a full channel
//! drops its oldest event, and an event with no recipients is discarded.

mod channel;
mod stream;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::models::{LifecycleEvent, Role, Target};

use channel::Channel;

pub use channel::Subscription;
pub use stream::{Frame, DEFAULT_KEEPALIVE};

/// Default per-channel queue bound.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Live channels
    pub channels: usize,
    /// Distinct subscriber ids with at least one channel
    pub subscribers: usize,
    /// Publish calls
    pub published: u64,
    /// Events enqueued onto channels
    pub delivered: u64,
    /// Events evicted from full channels
    pub dropped: u64,
}

pub(crate) struct HubInner {
    /// All live channels by id
    channels: DashMap<u64, Arc<Channel>>,
    /// Channel ids per subscriber (one per open connection)
    by_subscriber: DashMap<String, Vec<u64>>,
    /// Subscriber ids per group
    group_members: DashMap<String, HashSet<String>>,
    /// Reverse of `group_members`
    user_group: DashMap<String, String>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    pub(crate) fn remove_channel(&self, id: u64) -> bool {
        let Some((_, channel)) = self.channels.remove(&id) else {
            return false;
        };
        channel.close();

        let emptied = match self.by_subscriber.get_mut(&channel.subscriber_id) {
            Some(mut ids) => {
                ids.retain(|existing| *existing != id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.by_subscriber
                .remove_if(&channel.subscriber_id, |_, ids| ids.is_empty());
        }

        debug!(
            channel_id = id,
            subscriber_id = %channel.subscriber_id,
            "Channel closed"
        );
        true
    }

    fn push(&self, channel: &Channel, event: &LifecycleEvent) {
        if channel.push(event.clone()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared handle to the fan-out registry. Cloning is cheap.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Hub {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: DashMap::new(),
                by_subscriber: DashMap::new(),
                group_members: DashMap::new(),
                user_group: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: channel_capacity.max(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Open a channel for `subscriber_id`. A subscriber may hold several.
    pub fn subscribe(&self, subscriber_id: &str, role: Role) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(Channel::new(
            id,
            subscriber_id.to_string(),
            role,
            self.inner.capacity,
        ));

        self.inner.channels.insert(id, channel.clone());
        self.inner
            .by_subscriber
            .entry(subscriber_id.to_string())
            .or_default()
            .push(id);

        debug!(
            channel_id = id,
            subscriber_id = %subscriber_id,
            role = %role,
            "Channel opened"
        );

        Subscription {
            channel,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Close a channel by id. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, channel_id: u64) -> bool {
        self.inner.remove_channel(channel_id)
    }

    /// Record which group a user belongs to, or clear it with `None`.
    pub fn assign_group(&self, user_id: &str, group_id: Option<&str>) {
        if let Some((_, previous)) = self.inner.user_group.remove(user_id) {
            if let Some(mut members) = self.inner.group_members.get_mut(&previous) {
                members.remove(user_id);
            }
            self.inner
                .group_members
                .remove_if(&previous, |_, members| members.is_empty());
        }

        if let Some(group_id) = group_id {
            self.inner
                .user_group
                .insert(user_id.to_string(), group_id.to_string());
            self.inner
                .group_members
                .entry(group_id.to_string())
                .or_default()
                .insert(user_id.to_string());
        }
    }

    pub fn group_of(&self, user_id: &str) -> Option<String> {
        self.inner.user_group.get(user_id).map(|g| g.clone())
    }

    /// Deliver to every channel of one subscriber. Returns channels reached.
    pub fn publish_to_user(&self, user_id: &str, event: &LifecycleEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.deliver(self.user_channels(user_id), event)
    }

    /// Deliver to every channel opened with `role`.
    pub fn publish_to_role(&self, role: Role, event: &LifecycleEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let reached = self.deliver(self.role_channels(role), event);
        trace!(role = %role, event = event.event_type.as_str(), reached, "Published to role");
        reached
    }

    /// Deliver to every connected member of a group.
    pub fn publish_to_group(&self, group_id: &str, event: &LifecycleEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let reached = self.deliver(self.group_channels(group_id), event);
        trace!(group_id = %group_id, event = event.event_type.as_str(), reached, "Published to group");
        reached
    }

    /// Route by [`Target`].
    pub fn publish(&self, target: &Target, event: &LifecycleEvent) -> usize {
        match target {
            Target::User(user_id) => self.publish_to_user(user_id, event),
            Target::Role(role) => self.publish_to_role(*role, event),
            Target::Group(group_id) => self.publish_to_group(group_id, event),
        }
    }

    /// Deliver one event to the union of several targets. A channel matched
    /// by more than one target receives the event once.
    pub fn publish_many(&self, targets: &[Target], event: &LifecycleEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let ids: HashSet<u64> = targets
            .iter()
            .flat_map(|target| self.resolve(target))
            .collect();
        let reached = self.deliver(ids, event);

        trace!(targets = targets.len(), event = event.event_type.as_str(), reached, "Published to targets");
        reached
    }

    fn resolve(&self, target: &Target) -> Vec<u64> {
        match target {
            Target::User(user_id) => self.user_channels(user_id),
            Target::Role(role) => self.role_channels(*role),
            Target::Group(group_id) => self.group_channels(group_id),
        }
    }

    fn user_channels(&self, user_id: &str) -> Vec<u64> {
        self.inner
            .by_subscriber
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn role_channels(&self, role: Role) -> Vec<u64> {
        self.inner
            .channels
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| *entry.key())
            .collect()
    }

    fn group_channels(&self, group_id: &str) -> Vec<u64> {
        let members: Vec<String> = match self.inner.group_members.get(group_id) {
            Some(members) => members.iter().cloned().collect(),
            None => return Vec::new(),
        };
        members
            .iter()
            .flat_map(|user_id| self.user_channels(user_id))
            .collect()
    }

    fn deliver(&self, ids: impl IntoIterator<Item = u64>, event: &LifecycleEvent) -> usize {
        let mut reached = 0;
        for id in ids {
            let channel = self.inner.channels.get(&id).map(|c| c.value().clone());
            if let Some(channel) = channel {
                self.inner.push(&channel, event);
                reached += 1;
            }
        }
        reached
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            channels: self.inner.channels.len(),
            subscribers: self.inner.by_subscriber.len(),
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}
