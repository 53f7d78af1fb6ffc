//! Per-task event bus.
//!
//! One publisher (the dispatcher), many subscribers. Publishing never
//! blocks: each subscriber owns a bounded ring and the slowest subscriber
//! loses its oldest events, not the dispatcher's liveness. Late joiners get
//! a short replay of history. The stream is advisory progress; the durable
//! trail lives in the state store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::models::{Stage, StageEvent};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;
/// Default number of events replayed to a late subscriber.
pub const DEFAULT_REPLAY_DEPTH: usize = 32;

struct SubscriberQueue {
    buffer: Mutex<VecDeque<StageEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Push one event, evicting the oldest when full.
    fn push(&self, event: StageEvent) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusState {
    next_seq: u64,
    history: VecDeque<StageEvent>,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Multi-subscriber publish/subscribe channel for one task.
pub struct TaskEventBus {
    task_id: Uuid,
    state: Mutex<BusState>,
    subscriber_capacity: usize,
    replay_depth: usize,
}

impl TaskEventBus {
    pub fn new(task_id: Uuid) -> Arc<Self> {
        Self::with_capacity(task_id, DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_REPLAY_DEPTH)
    }

    pub fn with_capacity(
        task_id: Uuid,
        subscriber_capacity: usize,
        replay_depth: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            state: Mutex::new(BusState {
                next_seq: 0,
                history: VecDeque::with_capacity(replay_depth),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                closed: false,
            }),
            subscriber_capacity: subscriber_capacity.max(1),
            replay_depth,
        })
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Publish one event. Sequence numbers are assigned here, so the single
    /// publisher gives subscribers a total order. No-op after close.
    pub fn publish(
        &self,
        stage: Stage,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        let event = StageEvent {
            task_id: self.task_id,
            seq: state.next_seq,
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            payload,
        };
        state.next_seq += 1;

        if self.replay_depth > 0 {
            if state.history.len() >= self.replay_depth {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        for queue in state.subscribers.values() {
            queue.push(event.clone());
        }
    }

    /// Attach a new subscriber. Recent history is replayed first; if the
    /// bus is already closed the subscriber sees the replay and then EOF.
    pub fn subscribe(self: &Arc<Self>) -> EventSubscription {
        let queue = Arc::new(SubscriberQueue::new(
            self.subscriber_capacity.max(self.replay_depth),
        ));
        let id = {
            let mut state = self.state.lock().unwrap();
            for event in state.history.iter() {
                queue.push(event.clone());
            }
            if state.closed {
                queue.close();
            }
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.insert(id, Arc::clone(&queue));
            id
        };
        EventSubscription {
            bus: Arc::clone(self),
            queue,
            id,
        }
    }

    /// Close the bus. Idempotent; subscribers drain their buffers and then
    /// see end-of-stream. Later publishes are dropped.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        for queue in state.subscribers.values() {
            queue.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().unwrap().subscribers.remove(&id);
    }
}

/// A live subscription to one task's events.
pub struct EventSubscription {
    bus: Arc<TaskEventBus>,
    queue: Arc<SubscriberQueue>,
    id: u64,
}

impl EventSubscription {
    /// Wait for the next event. `None` means the bus closed and the buffer
    /// is drained.
    pub async fn next(&mut self) -> Option<StageEvent> {
        loop {
            if let Some(event) = self.queue.buffer.lock().unwrap().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking pull, for polling consumers.
    pub fn try_next(&mut self) -> Option<StageEvent> {
        self.queue.buffer.lock().unwrap().pop_front()
    }

    /// Events evicted from this subscriber's buffer because it was slow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn task_id(&self) -> Uuid {
        self.bus.task_id()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<TaskEventBus> {
        TaskEventBus::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_sequence_is_strictly_monotonic() {
        let bus = bus();
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(Stage::Executing, format!("step {i}"), None);
        }
        let mut last = None;
        for _ in 0..5 {
            let event = sub.next().await.unwrap();
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_then_live() {
        let bus = bus();
        bus.publish(Stage::Starting, "starting", None);
        bus.publish(Stage::Planning, "planning", None);

        let mut sub = bus.subscribe();
        assert_eq!(sub.next().await.unwrap().stage, Stage::Starting);
        assert_eq!(sub.next().await.unwrap().stage, Stage::Planning);

        bus.publish(Stage::Executing, "live", None);
        assert_eq!(sub.next().await.unwrap().stage, Stage::Executing);
    }

    #[tokio::test]
    async fn test_replay_depth_is_bounded() {
        let bus = TaskEventBus::with_capacity(Uuid::new_v4(), 64, 4);
        for i in 0..10 {
            bus.publish(Stage::Executing, format!("e{i}"), None);
        }
        let mut sub = bus.subscribe();
        let first = sub.next().await.unwrap();
        // Only the last 4 events replay; the first of them is seq 6.
        assert_eq!(first.seq, 6);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only_for_itself() {
        let bus = TaskEventBus::with_capacity(Uuid::new_v4(), 4, 0);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..4 {
            bus.publish(Stage::Executing, format!("e{i}"), None);
        }
        // Drain the fast subscriber, leave the slow one full.
        for _ in 0..4 {
            fast.next().await.unwrap();
        }
        for i in 4..8 {
            bus.publish(Stage::Executing, format!("e{i}"), None);
        }

        assert_eq!(slow.dropped(), 4);
        assert_eq!(fast.dropped(), 0);
        // The slow subscriber resumes at the oldest retained event.
        assert_eq!(slow.next().await.unwrap().seq, 4);
        // The fast subscriber saw everything in order.
        assert_eq!(fast.next().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_close_gives_eof_after_drain() {
        let bus = bus();
        let mut sub = bus.subscribe();
        bus.publish(Stage::Finished, "done", None);
        bus.close();
        bus.publish(Stage::Executing, "ignored after close", None);

        assert_eq!(sub.next().await.unwrap().stage, Stage::Finished);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_gets_replay_and_eof() {
        let bus = bus();
        bus.publish(Stage::Starting, "starting", None);
        bus.publish(Stage::Finished, "done", None);
        bus.close();

        let mut sub = bus.subscribe();
        assert_eq!(sub.next().await.unwrap().stage, Stage::Starting);
        assert_eq!(sub.next().await.unwrap().stage, Stage::Finished);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = bus();
        bus.close();
        bus.close();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let bus = bus();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
