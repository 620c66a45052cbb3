//! Subscription channels for the collection lifecycle events external
//! subsystems hook: before a cycle, after reachability releases the GC
//! lock, after a purge completes, and when the FinishDestroy stall budget
//! had to be extended.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a subscription for later removal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EventHandle(usize);

struct Subscribers<F: ?Sized> {
    entries: Mutex<Vec<(usize, Arc<F>)>>,
    next_handle: AtomicUsize,
}

impl<F: ?Sized> Subscribers<F> {
    fn new() -> Self {
        Subscribers {
            entries: Mutex::new(Vec::new()),
            next_handle: AtomicUsize::new(0),
        }
    }

    fn subscribe(&self, callback: Arc<F>) -> EventHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push((handle, callback));
        EventHandle(handle)
    }

    fn unsubscribe(&self, handle: EventHandle) {
        self.entries
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    /// Snapshot under the lock; callbacks run without it so they may
    /// re-subscribe.
    fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }
}

/// A channel for plain notification events.
pub struct EventChannel {
    subscribers: Subscribers<dyn Fn() + Send + Sync>,
}

impl EventChannel {
    pub(crate) fn new() -> EventChannel {
        EventChannel {
            subscribers: Subscribers::new(),
        }
    }

    pub fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> EventHandle {
        self.subscribers.subscribe(Arc::from(callback))
    }

    pub fn unsubscribe(&self, handle: EventHandle) {
        self.subscribers.unsubscribe(handle)
    }

    pub(crate) fn broadcast(&self) {
        for callback in self.subscribers.snapshot() {
            callback();
        }
    }
}

/// A channel whose events carry a message.
pub struct MessageChannel {
    subscribers: Subscribers<dyn Fn(&str) + Send + Sync>,
}

impl MessageChannel {
    pub(crate) fn new() -> MessageChannel {
        MessageChannel {
            subscribers: Subscribers::new(),
        }
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&str) + Send + Sync>) -> EventHandle {
        self.subscribers.subscribe(Arc::from(callback))
    }

    pub fn unsubscribe(&self, handle: EventHandle) {
        self.subscribers.unsubscribe(handle)
    }

    pub(crate) fn broadcast(&self, message: &str) {
        for callback in self.subscribers.snapshot() {
            callback(message);
        }
    }
}

/// All lifecycle channels of one collector.
pub struct Events {
    /// Before the mark phase, with the GC lock held.
    pub pre_collect: EventChannel,
    /// After reachability analysis, once the GC lock is released. The
    /// unreachable set is final; destruction has not started.
    pub post_reachability: EventChannel,
    /// After a purge completed and all unreachable objects were destroyed.
    pub post_purge: EventChannel,
    /// After the whole collection request finished.
    pub post_collect: EventChannel,
    /// The FinishDestroy stall budget was extended; carries a description.
    pub finish_destroy_time_extended: MessageChannel,
}

impl Events {
    pub(crate) fn new() -> Events {
        Events {
            pre_collect: EventChannel::new(),
            post_reachability: EventChannel::new(),
            post_purge: EventChannel::new(),
            post_collect: EventChannel::new(),
            finish_destroy_time_extended: MessageChannel::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn broadcast_reaches_subscribers() {
        let channel = EventChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = channel.subscribe(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        channel.broadcast();
        channel.broadcast();
        assert_eq!(count.load(Ordering::Relaxed), 2);

        channel.unsubscribe(handle);
        channel.broadcast();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
