use super::{Acker, BusConnection, BusError, Delivery, EventBus, SubscribeOptions, Subscription};
use crate::core::Event;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// In-memory event bus with durable, queue-grouped subscriptions.
///
/// Every published message gets a sequence number starting at 1. A durable
/// remembers which sequences were acknowledged; binding to an existing
/// durable with no live members resumes at the first unacknowledged
/// sequence, so unacknowledged messages are redelivered and acknowledged ones
/// are not. Live members of the same durable share a cursor, so each message
/// goes to one member only.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    published: Arc<Notify>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Bytes>>,
    durables: HashMap<(String, String), DurableState>,
    connected_clients: HashSet<String>,
    connect_count: usize,
    unsubscribe_count: usize,
    close_count: usize,
    streams_ended: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    fail_close: bool,
    fail_acks: bool,
}

struct DurableState {
    queue_group: String,
    /// First sequence this durable is interested in.
    start: u64,
    /// Next sequence to hand to a live member.
    cursor: u64,
    acked: BTreeSet<u64>,
    attempts: HashMap<u64, u64>,
    live_members: usize,
}

impl DurableState {
    fn first_unacked(&self) -> u64 {
        let mut seq = self.start;
        while self.acked.contains(&seq) {
            seq += 1;
        }
        seq
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to `topic` and returns its sequence number.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> u64 {
        let seq = {
            let mut state = self.state.lock().unwrap();
            let messages = state.topics.entry(topic.to_string()).or_default();
            messages.push(payload.into());
            messages.len() as u64
        };
        self.published.notify_waiters();
        seq
    }

    /// Ends every live subscription stream, as if the bus went away.
    pub fn end_streams(&self) {
        self.state.lock().unwrap().streams_ended = true;
        self.published.notify_waiters();
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_subscribe = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state.lock().unwrap().fail_unsubscribe = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.lock().unwrap().fail_close = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.state.lock().unwrap().fail_acks = fail;
    }

    /// Sequences acknowledged on the durable `durable_name` of `topic`.
    pub fn acked(&self, topic: &str, durable_name: &str) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .durables
            .get(&(topic.to_string(), durable_name.to_string()))
            .map(|d| d.acked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How many times `sequence` was delivered on the durable.
    pub fn delivery_attempts(&self, topic: &str, durable_name: &str, sequence: u64) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .durables
            .get(&(topic.to_string(), durable_name.to_string()))
            .and_then(|d| d.attempts.get(&sequence).copied())
            .unwrap_or(0)
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_count
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.lock().unwrap().unsubscribe_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_count
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.state.lock().unwrap().connected_clients.iter().cloned().collect()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn connect(
        &self,
        _cluster_id: &str,
        client_id: &str,
        url: &str,
    ) -> Result<Box<dyn BusConnection>, BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(BusError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if !state.connected_clients.insert(client_id.to_string()) {
            return Err(BusError::Connect {
                url: url.to_string(),
                reason: format!("client id {} already registered", client_id),
            });
        }
        state.connect_count += 1;
        state.streams_ended = false;

        Ok(Box::new(InMemoryConnection {
            bus: self.clone(),
            client_id: client_id.to_string(),
        }))
    }
}

pub struct InMemoryConnection {
    bus: InMemoryBus,
    client_id: String,
}

#[async_trait]
impl BusConnection for InMemoryConnection {
    async fn subscribe_queue_durable(
        &self,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut guard = self.bus.state.lock().unwrap();
        let state = &mut *guard;
        if state.fail_subscribe {
            return Err(BusError::Subscribe {
                topic: options.topic.clone(),
                reason: "subscription rejected".to_string(),
            });
        }

        let published = state
            .topics
            .get(&options.topic)
            .map(|m| m.len() as u64)
            .unwrap_or(0);
        let key = (options.topic.clone(), options.durable_name.clone());
        let durable = state.durables.entry(key.clone()).or_insert_with(|| {
            let start = if options.deliver_all_available {
                1
            } else {
                published + 1
            };
            DurableState {
                queue_group: options.queue_group.clone(),
                start,
                cursor: start,
                acked: BTreeSet::new(),
                attempts: HashMap::new(),
                live_members: 0,
            }
        });

        if durable.queue_group != options.queue_group {
            return Err(BusError::Subscribe {
                topic: options.topic.clone(),
                reason: format!(
                    "durable {} is bound to queue group {}",
                    options.durable_name, durable.queue_group
                ),
            });
        }
        if durable.live_members == 0 {
            durable.cursor = durable.first_unacked();
        }
        durable.live_members += 1;

        Ok(Box::new(InMemorySubscription {
            bus: self.bus.clone(),
            key,
            options: options.clone(),
            active: true,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.bus.state.lock().unwrap();
        state.close_count += 1;
        state.connected_clients.remove(&self.client_id);
        if state.fail_close {
            return Err(BusError::Close("connection already closed".to_string()));
        }
        Ok(())
    }
}

pub struct InMemorySubscription {
    bus: InMemoryBus,
    key: (String, String),
    options: SubscribeOptions,
    active: bool,
}

impl InMemorySubscription {
    fn try_next(&self) -> Option<Option<Delivery>> {
        let mut guard = self.bus.state.lock().unwrap();
        let state = &mut *guard;
        if state.streams_ended {
            return Some(None);
        }
        let available = state
            .topics
            .get(&self.key.0)
            .map(|m| m.len() as u64)
            .unwrap_or(0);
        let durable = state.durables.get_mut(&self.key)?;

        while durable.cursor <= available && durable.acked.contains(&durable.cursor) {
            durable.cursor += 1;
        }
        if durable.cursor > available {
            return None;
        }

        let sequence = durable.cursor;
        durable.cursor += 1;
        let attempt = {
            let count = durable.attempts.entry(sequence).or_insert(0);
            *count += 1;
            *count
        };
        let payload = state.topics[&self.key.0][(sequence - 1) as usize].clone();

        let acker = InMemoryAcker {
            bus: self.bus.clone(),
            key: self.key.clone(),
            sequence,
        };
        Some(Some(Delivery::new(
            Event::new(payload),
            sequence,
            attempt,
            Box::new(acker),
        )))
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut state = self.bus.state.lock().unwrap();
        if let Some(durable) = state.durables.get_mut(&self.key) {
            durable.live_members = durable.live_members.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        loop {
            // Register interest before checking so a publish in between is not missed.
            let published = self.bus.published.clone();
            let notified = published.notified();
            match self.try_next() {
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => return None,
                None => notified.await,
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        let mut this = self;
        let fail = {
            let mut state = this.bus.state.lock().unwrap();
            state.unsubscribe_count += 1;
            state.fail_unsubscribe
        };
        this.release();
        if fail {
            return Err(BusError::Unsubscribe("subscription not found".to_string()));
        }
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct InMemoryAcker {
    bus: InMemoryBus,
    key: (String, String),
    sequence: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.bus.state.lock().unwrap();
        if state.fail_acks {
            return Err(BusError::Ack {
                sequence: self.sequence,
                reason: "ack rejected".to_string(),
            });
        }
        if let Some(durable) = state.durables.get_mut(&self.key) {
            durable.acked.insert(self.sequence);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(durable: &str) -> SubscribeOptions {
        SubscribeOptions {
            topic: "interest.registered".to_string(),
            queue_group: "slack-alerter".to_string(),
            durable_name: durable.to_string(),
            deliver_all_available: true,
            ack_wait: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_on_rebind() {
        let bus = InMemoryBus::new();
        bus.publish("interest.registered", "a@example.com");
        bus.publish("interest.registered", "b@example.com");

        let conn = bus.connect("c", "client-1", "mem://").await.unwrap();
        let mut sub = conn.subscribe_queue_durable(&options("d")).await.unwrap();
        let first = sub.next_delivery().await.unwrap().unwrap();
        first.ack().await.unwrap();
        let second = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        drop(second);
        sub.unsubscribe().await.unwrap();

        let mut sub = conn.subscribe_queue_durable(&options("d")).await.unwrap();
        let again = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.sequence, 2);
        assert_eq!(again.attempt, 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_rejected() {
        let bus = InMemoryBus::new();
        let _conn = bus.connect("c", "same", "mem://").await.unwrap();
        assert!(bus.connect("c", "same", "mem://").await.is_err());
    }

    #[tokio::test]
    async fn test_durable_keeps_its_queue_group() {
        let bus = InMemoryBus::new();
        let conn = bus.connect("c", "client-1", "mem://").await.unwrap();
        let _sub = conn.subscribe_queue_durable(&options("d")).await.unwrap();

        let mut other = options("d");
        other.queue_group = "someone-else".to_string();
        assert!(conn.subscribe_queue_durable(&other).await.is_err());
    }
}
