//! Per-subscriber bounded queue and the handle that owns it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

use crate::models::{LifecycleEvent, Role};

use super::HubInner;

/// One live connection's queue. Oldest events are dropped on overflow.
pub(crate) struct Channel {
    pub(crate) id: u64,
    pub(crate) subscriber_id: String,
    pub(crate) role: Role,
    queue: Mutex<VecDeque<LifecycleEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: u64, subscriber_id: String, role: Role, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            subscriber_id,
            role,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<LifecycleEvent>> {
        // The deque stays consistent even if a holder panicked.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without blocking. Returns `true` if an older event was dropped.
    pub(crate) fn push(&self, event: LifecycleEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let dropped = {
            let mut queue = self.queue();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };

        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<LifecycleEvent> {
        self.queue().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue().len()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receiving end of a hub channel.
///
/// Dropping the subscription removes the channel from every hub index.
pub struct Subscription {
    pub(crate) channel: std::sync::Arc<Channel>,
    pub(crate) hub: Weak<HubInner>,
}

impl Subscription {
    /// Channel id, usable with [`super::Hub::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.channel.id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.channel.subscriber_id
    }

    pub fn role(&self) -> Role {
        self.channel.role
    }

    /// Wait for the next event. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<LifecycleEvent> {
        loop {
            if let Some(event) = self.channel.pop() {
                return Some(event);
            }
            if self.channel.is_closed() {
                return None;
            }
            self.channel.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&self) -> Option<LifecycleEvent> {
        self.channel.pop()
    }

    /// Events currently queued.
    pub fn pending(&self) -> usize {
        self.channel.len()
    }

    /// Events discarded from this channel because it was full.
    pub fn dropped(&self) -> u64 {
        self.channel.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_channel(self.channel.id);
        }
    }
}
