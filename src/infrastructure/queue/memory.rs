//! In-process broker used by tests. Honors the single binding, manual acks
//! and prefetch, which is all the client relies on.

use super::channel::{BrokerChannel, Subscription, Topology};
use super::error::{QueueError, QueueResult};
use super::message::{Delivery, MessageProperties};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

#[derive(Default)]
struct State {
    ready: bool,
    topology: Option<Topology>,
    queues: HashMap<String, VecDeque<Delivery>>,
    unacked: HashMap<u64, String>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool, bool)>,
    fail_publish: bool,
}

#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool, bool)> {
        self.lock().nacked.clone()
    }

    pub fn queued(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Simulates a dropped connection.
    pub fn disconnect(&self) {
        self.lock().ready = false;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn initialize(&self, topology: &Topology) -> QueueResult<()> {
        let mut state = self.lock();
        state.ready = true;
        state.topology = Some(topology.clone());
        state.queues.entry(topology.queue.clone()).or_default();
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.lock().ready
    }

    async fn close(&self) -> QueueResult<()> {
        self.disconnect();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> QueueResult<()> {
        let mut state = self.lock();
        if !state.ready {
            return Err(QueueError::NotInitialized);
        }
        if state.fail_publish {
            return Err(QueueError::publish("broker unavailable"));
        }

        let payload = Bytes::copy_from_slice(payload);
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
            properties: properties.clone(),
        });

        let target = state
            .topology
            .as_ref()
            .filter(|t| t.exchange == exchange && t.routing_key == routing_key)
            .map(|t| t.queue.clone());

        if let Some(queue) = target {
            state.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_tag,
                routing_key: routing_key.to_string(),
                payload,
                properties,
                redelivered: false,
            };
            state.queues.entry(queue).or_default().push_back(delivery);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> QueueResult<Subscription> {
        if !self.is_initialized() {
            return Err(QueueError::NotInitialized);
        }

        let channel = self.clone();
        let queue = queue.to_string();
        let limit = usize::from(prefetch.max(1));

        let deliveries = futures_util::stream::unfold(channel, move |channel| {
            let queue = queue.clone();
            async move {
                loop {
                    let notify = channel.notify.clone();
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let mut state = channel.lock();
                        if !state.ready {
                            return None;
                        }
                        let in_flight = state.unacked.values().filter(|q| **q == queue).count();
                        if in_flight < limit {
                            if let Some(delivery) =
                                state.queues.get_mut(&queue).and_then(VecDeque::pop_front)
                            {
                                state.unacked.insert(delivery.delivery_tag, queue.clone());
                                drop(state);
                                return Some((Ok(delivery), channel));
                            }
                        }
                    }
                    notified.await;
                }
            }
        })
        .boxed();

        Ok(Subscription {
            consumer_tag: "memory-consumer".to_string(),
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> QueueResult<()> {
        let mut state = self.lock();
        if !state.ready {
            return Err(QueueError::NotInitialized);
        }
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()> {
        let mut state = self.lock();
        if !state.ready {
            return Err(QueueError::NotInitialized);
        }
        state.unacked.remove(&delivery_tag);
        state.nacked.push((delivery_tag, multiple, requeue));
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}
