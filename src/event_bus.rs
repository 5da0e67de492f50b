// =============================================================================
// EventBus — in-process fan-out with bounded per-subscriber buffers
// =============================================================================
//
// Three topics: signals, snapshots, state. Each subscriber owns a bounded
// queue; a slow consumer never blocks the publisher — the oldest buffered
// message is dropped and the subscriber's `lag_count` is incremented so it
// can detect the gap on its next receive. Delivery within a topic, to a
// given subscriber, is strict FIFO. Modeled on the `tokio::sync::mpsc`
// push-loop shape used by the WebSocket handler, generalized into a proper
// drop-oldest ring since a plain mpsc channel only offers backpressure
// (blocking) or unbounded growth, neither of which is acceptable for a live
// push feed with slow consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::{MicroSnapshot, MtfState, Signal};

/// One message on the bus, tagged by topic so a single bus instance can
/// carry all three without separate channel types leaking into call sites.
#[derive(Debug, Clone)]
pub enum Event {
    Signal(Signal),
    Snapshot(MicroSnapshot),
    State(MtfState),
}

struct SubscriberQueue {
    buf: Mutex<VecDeque<Event>>,
    capacity: usize,
    lag_count: AtomicU64,
    notify: Notify,
}

/// A registered subscriber. Cloning is cheap (shared `Arc` handle); each
/// clone observes the same queue.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

impl Subscriber {
    /// Await and pop the next event in FIFO order. Resolves immediately if
    /// one is already buffered.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(ev) = self.queue.buf.lock().pop_front() {
                return ev;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking pop; `None` if the queue is currently empty.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.buf.lock().pop_front()
    }

    /// How many buffered messages were dropped (oldest-first) since this
    /// subscriber was created, due to the queue being full on publish.
    pub fn lag_count(&self) -> u64 {
        self.queue.lag_count.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Fan-out bus. Publishers never block: a full subscriber queue has its
/// oldest entry evicted to make room for the new one.
pub struct EventBus {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Arc<SubscriberQueue>)>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber with the bus's configured buffer capacity.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            buf: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            lag_count: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subscribers.lock().push((id, queue.clone()));
        Subscriber { id, queue }
    }

    /// Idempotent — unsubscribing an already-removed or unknown id is a no-op.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publish to every currently-registered subscriber.
    pub fn publish(&self, event: Event) {
        for (_, queue) in self.subscribers.lock().iter() {
            let mut buf = queue.buf.lock();
            if buf.len() >= queue.capacity {
                buf.pop_front();
                queue.lag_count.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event.clone());
            drop(buf);
            queue.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MicroSnapshot;

    fn snap(epoch: i64) -> Event {
        Event::Snapshot(MicroSnapshot {
            epoch_micros: epoch,
            ..MicroSnapshot::unavailable()
        })
    }

    #[test]
    fn fifo_delivery_to_single_subscriber() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe();
        bus.publish(snap(1));
        bus.publish(snap(2));
        bus.publish(snap(3));

        let order: Vec<i64> = (0..3)
            .map(|_| match sub.try_recv().unwrap() {
                Event::Snapshot(s) => s.epoch_micros,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn drop_oldest_when_full_increments_lag() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        for i in 0..70 {
            bus.publish(snap(i));
        }
        // 70 published into a buffer of 4 => 66 dropped.
        assert_eq!(sub.lag_count(), 66);
        let first = match sub.try_recv().unwrap() {
            Event::Snapshot(s) => s.epoch_micros,
            _ => unreachable!(),
        };
        assert_eq!(first, 66);
    }

    #[test]
    fn spec_scenario_buffer_64_published_70_lag_6() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe();
        for i in 0..70 {
            bus.publish(snap(i));
        }
        assert_eq!(sub.lag_count(), 6);
        let first = match sub.try_recv().unwrap() {
            Event::Snapshot(s) => s.epoch_micros,
            _ => unreachable!(),
        };
        assert_eq!(first, 6);
    }

    #[test]
    fn independent_subscribers_each_see_full_stream() {
        let bus = EventBus::new(64);
        let a = bus.subscribe();
        bus.publish(snap(1));
        let b = bus.subscribe();
        bus.publish(snap(2));

        assert!(a.try_recv().is_some());
        assert!(a.try_recv().is_some());
        assert!(a.try_recv().is_none());

        assert!(b.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(64);
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id());
        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing after unsubscribe must not panic or deliver anything.
        bus.publish(snap(1));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_awaits_publish() {
        let bus = Arc::new(EventBus::new(64));
        let sub = bus.subscribe();
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus2.publish(snap(42));
        });
        let ev = sub.recv().await;
        match ev {
            Event::Snapshot(s) => assert_eq!(s.epoch_micros, 42),
            _ => unreachable!(),
        }
        handle.await.unwrap();
    }
}
