//! The per-engine change bus.
//!
//! Commits publish their mutations here in commit order. Each
//! subscriber has a bounded buffer; overflowing it drops the oldest
//! undelivered event and leaves a gap marker in its place, so a slow
//! subscriber learns it missed events without ever blocking publishers
//! or its peers.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loam_core::{CommitSeq, Key};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Mutation kinds, mirroring the WAL record kinds that commits carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Delete,
    Expire,
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub seq: CommitSeq,
    pub kind: ChangeKind,
    pub key: Key,
    /// Payload of inserts and expires; `None` for deletes.
    pub payload: Option<Vec<u8>>,
}

/// What a subscriber pulls off its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(ChangeEvent),
    /// Events were dropped here because the subscriber lagged.
    Gap,
}

struct SubscriberQueue {
    buf: Mutex<VecDeque<StreamItem>>,
    ready: Condvar,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, event: ChangeEvent) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            // Drop the oldest undelivered event, leaving one gap marker
            let dropped = buf.pop_front();
            if !matches!(dropped, Some(StreamItem::Gap)) && !matches!(buf.front(), Some(StreamItem::Gap)) {
                buf.push_front(StreamItem::Gap);
                if buf.len() >= self.capacity {
                    // The marker itself displaced an event slot
                    buf.remove(1);
                }
            }
        }
        buf.push_back(StreamItem::Event(event));
        self.ready.notify_one();
    }
}

/// Handle held by one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Non-blocking pull.
    pub fn poll(&self) -> Option<StreamItem> {
        self.queue.buf.lock().pop_front()
    }

    /// Pull, waiting up to `timeout` for an item.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamItem> {
        let mut buf = self.queue.buf.lock();
        if buf.is_empty() {
            self.queue.ready.wait_for(&mut buf, timeout);
        }
        buf.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.buf.lock().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.lock().remove(&self.id);
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<FxHashMap<u64, Arc<SubscriberQueue>>>,
}

/// Per-engine publisher of committed mutations.
pub struct ChangeBus {
    inner: Arc<BusInner>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Self {
        ChangeBus {
            inner: Arc::new(BusInner::default()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            buf: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity: capacity.max(2),
        });
        self.inner.subscribers.lock().insert(id, Arc::clone(&queue));
        Subscription {
            id,
            queue,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber. Publication order is the
    /// caller's responsibility (commits publish in sequence order).
    pub fn publish(&self, event: ChangeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.inner.subscribers.lock();
        for queue in subscribers.values() {
            queue.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> ChangeEvent {
        ChangeEvent {
            seq,
            kind: ChangeKind::Insert,
            key: Key::kv(format!("k{}", seq)),
            payload: Some(vec![seq as u8]),
        }
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe(DEFAULT_SUBSCRIBER_BUFFER);
        for seq in 1..=5 {
            bus.publish(event(seq));
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| sub.poll())
            .map(|item| match item {
                StreamItem::Event(e) => e.seq,
                StreamItem::Gap => panic!("unexpected gap"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn overflow_drops_oldest_and_marks_gap() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe(4);
        for seq in 1..=10 {
            bus.publish(event(seq));
        }

        let items: Vec<StreamItem> = std::iter::from_fn(|| sub.poll()).collect();
        assert!(matches!(items[0], StreamItem::Gap));
        // The newest events survived, still in order
        let seqs: Vec<u64> = items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Event(e) => Some(e.seq),
                StreamItem::Gap => None,
            })
            .collect();
        assert_eq!(seqs.last(), Some(&10));
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn slow_subscriber_does_not_affect_fast_one() {
        let bus = ChangeBus::new();
        let slow = bus.subscribe(2);
        let fast = bus.subscribe(64);
        for seq in 1..=20 {
            bus.publish(event(seq));
        }
        // Fast subscriber saw everything
        let fast_items: Vec<StreamItem> = std::iter::from_fn(|| fast.poll()).collect();
        assert_eq!(fast_items.len(), 20);
        assert!(fast_items.iter().all(|i| matches!(i, StreamItem::Event(_))));
        // Slow subscriber got a gap but survives
        assert!(slow.pending() <= 2);
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = ChangeBus::new();
        let sub = bus.subscribe(8);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn recv_timeout_wakes_on_publish() {
        let bus = Arc::new(ChangeBus::new());
        let sub = bus.subscribe(8);
        let bus_clone = Arc::clone(&bus);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            bus_clone.publish(event(1));
        });
        let item = sub.recv_timeout(Duration::from_secs(2));
        assert!(matches!(item, Some(StreamItem::Event(_))));
        handle.join().unwrap();
    }
}
