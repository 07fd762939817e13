use super::error::QueueResult;
use super::message::{Delivery, MessageProperties};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub const DEFAULT_EXCHANGE: &str = "video_processing";
pub const DEFAULT_TASK_QUEUE: &str = "video_transcoding_tasks";
pub const DEFAULT_ROUTING_KEY: &str = "transcode";

/// One direct exchange, one durable queue, one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: DEFAULT_TASK_QUEUE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
        }
    }
}

pub type DeliveryStream = BoxStream<'static, QueueResult<Delivery>>;

pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Raw broker primitives. Protocol logic (ids, headers, retries, chunking)
/// lives in `BrokerClient`, so adapters stay thin.
///
/// Every method other than `initialize` fails with `QueueError::NotInitialized`
/// while no channel is open.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Open connection and channel, declare the exchange and queue, bind them.
    async fn initialize(&self, topology: &Topology) -> QueueResult<()>;

    fn is_initialized(&self) -> bool;

    async fn close(&self) -> QueueResult<()>;

    /// Resolves once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> QueueResult<()>;

    /// Manual-ack subscription limited to `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> QueueResult<Subscription>;

    async fn ack(&self, delivery_tag: u64) -> QueueResult<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()>;
}
