use super::channel::{BrokerChannel, Subscription, Topology};
use super::error::{QueueError, QueueResult};
use super::message::{
    int, Delivery, HeaderValue, MessageProperties, StreamHeaders, StreamMetadata,
    HEADER_BYTES_PROCESSED, HEADER_CHUNK_SIZE, HEADER_FILE_NAME, HEADER_IS_END, HEADER_IS_LAST,
    HEADER_MESSAGE_TYPE, HEADER_RETRY_COUNT, HEADER_SEQUENCE, HEADER_TOTAL_CHUNKS,
    HEADER_TOTAL_SIZE, STREAM_MESSAGE_TYPE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const PREFETCH: u16 = 1;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_retry_count: u32,
    pub retry_delay: Duration,
    pub reconnect_delay: Duration,
    pub default_chunk_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_delay: Duration::from_millis(3000),
            reconnect_delay: Duration::from_secs(5),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A live subscription. Stopping it ends the consumer loop after the
/// delivery currently being handled, if any, completes.
pub struct ConsumerHandle {
    pub consumer_tag: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves when the delivery stream has ended (stop, or lost connection).
    pub async fn closed(&mut self) {
        if let Err(e) = (&mut self.task).await {
            error!("Consumer task {} ended abnormally: {}", self.consumer_tag, e);
        }
    }
}

/// Task messages and chunked byte streams over one durable topology.
pub struct BrokerClient<C> {
    channel: Arc<C>,
    topology: Topology,
    config: BrokerConfig,
}

impl<C: BrokerChannel> BrokerClient<C> {
    pub fn new(channel: C, topology: Topology, config: BrokerConfig) -> Self {
        Self {
            channel: Arc::new(channel),
            topology,
            config,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub async fn initialize(&self) -> QueueResult<()> {
        self.channel.initialize(&self.topology).await
    }

    /// Keeps calling `initialize` with a fixed delay until it succeeds.
    pub async fn initialize_with_retry(&self) {
        loop {
            match self.initialize().await {
                Ok(()) => return,
                Err(e) => {
                    error!("Error connecting to RabbitMQ: {}", e);
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Re-initializes whenever the connection drops, until `shutdown` fires.
    pub async fn supervise(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            if !self.is_initialized() {
                warn!("RabbitMQ channel lost, reconnecting...");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.initialize_with_retry() => {}
                }
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.channel.is_initialized()
    }

    pub async fn close(&self) -> QueueResult<()> {
        self.channel.close().await
    }

    fn ensure_ready(&self) -> QueueResult<()> {
        if self.channel.is_initialized() {
            Ok(())
        } else {
            Err(QueueError::NotInitialized)
        }
    }

    /// Publishes a persistent JSON task with a fresh message id. Returns the id.
    pub async fn publish_message(
        &self,
        payload: &[u8],
        routing_key: &str,
        retry_count: Option<u32>,
    ) -> QueueResult<String> {
        self.ensure_ready()?;

        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties::persistent(&message_id)
            .with_content_type(mime::APPLICATION_JSON.as_ref())
            .with_header(
                HEADER_RETRY_COUNT,
                int(u64::from(retry_count.unwrap_or(0))),
            );

        self.channel
            .publish(&self.topology.exchange, routing_key, payload, properties)
            .await?;

        debug!(message_id = %message_id, routing_key, "Published task message");
        Ok(message_id)
    }

    /// Subscribes with prefetch 1 and feeds deliveries to `handler` one at a
    /// time. The handler owns the ack/nack decision.
    pub async fn consume<F, Fut>(&self, queue: &str, handler: F) -> QueueResult<ConsumerHandle>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_ready()?;
        let subscription = self.channel.consume(queue, PREFETCH).await?;
        Ok(spawn_consumer(subscription, handler))
    }

    pub async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.channel.ack(delivery.delivery_tag).await
    }

    pub async fn nack(&self, delivery: &Delivery, all_up_to: bool, requeue: bool) -> QueueResult<()> {
        self.channel
            .nack(delivery.delivery_tag, all_up_to, requeue)
            .await
    }

    /// Drops `delivery` from the queue and, while the retry budget allows,
    /// republishes its payload after `retry_delay` with the count bumped.
    ///
    /// Returns `false` once the budget is exhausted; nothing is republished.
    pub async fn initiate_message_retry(
        &self,
        delivery: &Delivery,
        routing_key: &str,
    ) -> QueueResult<bool> {
        let retry_count = delivery.properties.retry_count() + 1;

        if retry_count <= self.config.max_retry_count {
            info!(
                "Retrying message {} (attempt {}/{})",
                delivery.message_id(),
                retry_count,
                self.config.max_retry_count
            );
            self.nack(delivery, false, false).await?;
            tokio::time::sleep(self.config.retry_delay).await;
            self.publish_message(&delivery.payload, routing_key, Some(retry_count))
                .await?;
            Ok(true)
        } else {
            warn!(
                "Message {} exhausted {} retries",
                delivery.message_id(),
                self.config.max_retry_count
            );
            self.nack(delivery, false, false).await?;
            Ok(false)
        }
    }

    /// Publishes `source` as ordered chunks sharing one message id, followed
    /// by a zero-length end marker. The source is not polled again until the
    /// chunks of its previous emission are confirmed.
    ///
    /// A source error aborts the transfer; chunks already sent stay queued.
    pub async fn publish_stream<S, E>(
        &self,
        source: S,
        routing_key: &str,
        metadata: StreamMetadata,
    ) -> QueueResult<String>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        self.ensure_ready()?;

        let mut source = std::pin::pin!(source);
        let message_id = Uuid::new_v4().to_string();
        let chunk_size = metadata
            .chunk_size
            .unwrap_or(self.config.default_chunk_size)
            .max(1);
        let content_type = metadata
            .mime_type
            .clone()
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

        let mut sequence: u64 = 0;
        let mut bytes_processed: u64 = 0;

        while let Some(emission) = source.next().await {
            let emission = emission.map_err(QueueError::stream)?;

            let mut offset = 0;
            while offset < emission.len() {
                let end = (offset + chunk_size).min(emission.len());
                let part = emission.slice(offset..end);
                offset = end;
                bytes_processed += part.len() as u64;

                let mut properties = MessageProperties::persistent(&message_id)
                    .with_content_type(content_type.clone())
                    .with_header(
                        HEADER_MESSAGE_TYPE,
                        HeaderValue::Text(STREAM_MESSAGE_TYPE.to_string()),
                    )
                    .with_header(HEADER_SEQUENCE, int(sequence))
                    .with_header(HEADER_CHUNK_SIZE, int(part.len() as u64))
                    .with_header(HEADER_BYTES_PROCESSED, int(bytes_processed))
                    .with_header(
                        HEADER_IS_LAST,
                        HeaderValue::Bool(metadata.file_size == Some(bytes_processed)),
                    );
                if let Some(name) = &metadata.file_name {
                    properties = properties.with_header(HEADER_FILE_NAME, HeaderValue::Text(name.clone()));
                }
                if let Some(size) = metadata.file_size {
                    properties = properties.with_header(HEADER_TOTAL_SIZE, int(size));
                }

                self.channel
                    .publish(&self.topology.exchange, routing_key, &part, properties)
                    .await
                    .map_err(|e| QueueError::stream(format!("Failed to publish chunk: {}", e)))?;
                sequence += 1;
            }
        }

        let mut end_marker = MessageProperties::persistent(&message_id)
            .with_header(
                HEADER_MESSAGE_TYPE,
                HeaderValue::Text(STREAM_MESSAGE_TYPE.to_string()),
            )
            .with_header(HEADER_SEQUENCE, int(sequence))
            .with_header(HEADER_IS_END, HeaderValue::Bool(true))
            .with_header(HEADER_TOTAL_CHUNKS, int(sequence));
        if let Some(size) = metadata.file_size {
            end_marker = end_marker.with_header(HEADER_TOTAL_SIZE, int(size));
        }

        self.channel
            .publish(&self.topology.exchange, routing_key, &[], end_marker)
            .await
            .map_err(|e| QueueError::stream(format!("Failed to send end marker: {}", e)))?;

        debug!(
            message_id = %message_id,
            chunks = sequence,
            bytes = bytes_processed,
            "Published stream"
        );
        Ok(message_id)
    }

    /// `publish_stream` over an async reader.
    pub async fn publish_reader<R>(
        &self,
        reader: R,
        routing_key: &str,
        metadata: StreamMetadata,
    ) -> QueueResult<String>
    where
        R: AsyncRead + Send,
    {
        let capacity = metadata
            .chunk_size
            .unwrap_or(self.config.default_chunk_size)
            .max(1);
        self.publish_stream(ReaderStream::with_capacity(reader, capacity), routing_key, metadata)
            .await
    }

    /// Reassembles chunked transfers by message id and hands each complete
    /// payload to `on_complete` when its end marker arrives. Every message,
    /// chunk or marker, is acked individually.
    ///
    /// Relies on in-order delivery from a single queue; chunks from
    /// concurrent producers sharing an id are not reconciled.
    pub async fn consume_stream<F, Fut>(
        &self,
        queue: &str,
        on_complete: F,
    ) -> QueueResult<ConsumerHandle>
    where
        F: Fn(Bytes, StreamHeaders) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_ready()?;
        let subscription = self.channel.consume(queue, PREFETCH).await?;

        let channel = self.channel.clone();
        let on_complete = Arc::new(on_complete);
        let buffers = Arc::new(tokio::sync::Mutex::new(HashMap::<String, PendingStream>::new()));

        Ok(spawn_consumer(subscription, move |delivery: Delivery| {
            let channel = channel.clone();
            let on_complete = on_complete.clone();
            let buffers = buffers.clone();
            async move {
                let headers = StreamHeaders::from_properties(&delivery.properties);
                let message_id = delivery.message_id().to_string();

                let completed = {
                    let mut buffers = buffers.lock().await;
                    let pending = buffers
                        .entry(message_id.clone())
                        .or_insert_with(|| PendingStream::new(headers.clone()));

                    if headers.is_end {
                        buffers.remove(&message_id)
                    } else {
                        pending.chunks.push(delivery.payload.clone());
                        None
                    }
                };

                if let Some(stream) = completed {
                    let (bytes, metadata) = stream.finish();
                    on_complete(bytes, metadata).await;
                }

                if let Err(e) = channel.ack(delivery.delivery_tag).await {
                    error!(message_id = %message_id, "Failed to ack stream message: {}", e);
                }
            }
        }))
    }
}

struct PendingStream {
    chunks: Vec<Bytes>,
    metadata: StreamHeaders,
}

impl PendingStream {
    fn new(metadata: StreamHeaders) -> Self {
        Self {
            chunks: Vec::new(),
            metadata,
        }
    }

    fn finish(self) -> (Bytes, StreamHeaders) {
        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut buffer = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            buffer.extend_from_slice(chunk);
        }
        (buffer.freeze(), self.metadata)
    }
}

fn spawn_consumer<F, Fut>(subscription: Subscription, handler: F) -> ConsumerHandle
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Subscription {
        consumer_tag,
        mut deliveries,
    } = subscription;
    let stop = CancellationToken::new();
    let token = stop.clone();
    let tag = consumer_tag.clone();

    let task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => handler(delivery).await,
                Some(Err(e)) => {
                    error!("Consumer {} received an error: {}", tag, e);
                    break;
                }
                None => break,
            }
        }
        info!("Consumer {} stopped", tag);
    });

    ConsumerHandle {
        consumer_tag,
        stop,
        task,
    }
}

/// Ingest-side capability: enqueue one task message.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish_task(&self, payload: &[u8], routing_key: &str) -> QueueResult<String>;
}

#[async_trait]
impl<C: BrokerChannel> TaskPublisher for BrokerClient<C> {
    async fn publish_task(&self, payload: &[u8], routing_key: &str) -> QueueResult<String> {
        self.publish_message(payload, routing_key, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::memory::MemoryChannel;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn client() -> Arc<BrokerClient<MemoryChannel>> {
        let config = BrokerConfig {
            retry_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(10),
            ..BrokerConfig::default()
        };
        Arc::new(BrokerClient::new(MemoryChannel::new(), Topology::default(), config))
    }

    async fn ready_client() -> Arc<BrokerClient<MemoryChannel>> {
        let client = client();
        client.initialize().await.unwrap();
        client
    }

    fn delivery_from(message: &crate::infrastructure::queue::memory::PublishedMessage, tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            payload: message.payload.clone(),
            properties: message.properties.clone(),
            redelivered: false,
        }
    }

    async fn round_trip(data: Vec<u8>, chunk_size: usize, emission: usize) -> (Bytes, StreamHeaders) {
        let client = ready_client().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handle = client
            .consume_stream(&client.topology().queue, move |bytes, meta| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((bytes, meta));
                }
            })
            .await
            .unwrap();

        let emissions: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(emission.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let metadata = StreamMetadata {
            file_size: Some(data.len() as u64),
            file_name: Some("clip.mp4".into()),
            mime_type: Some("video/mp4".into()),
            chunk_size: Some(chunk_size),
        };
        let routing_key = client.topology().routing_key.clone();
        client
            .publish_stream(futures_util::stream::iter(emissions), &routing_key, metadata)
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        handle.stop();
        handle.closed().await;
        received
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let client = client();
        assert!(matches!(
            client.publish_message(b"{}", "transcode", None).await,
            Err(QueueError::NotInitialized)
        ));
        assert!(matches!(
            client.consume("video_transcoding_tasks", |_| async {}).await,
            Err(QueueError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn publish_message_is_persistent_with_default_retry_count() {
        let client = ready_client().await;
        let id = client.publish_message(b"{\"id\":1}", "transcode", None).await.unwrap();

        let published = client.channel().published();
        assert_eq!(published.len(), 1);
        let props = &published[0].properties;
        assert!(props.persistent);
        assert_eq!(props.message_id.as_deref(), Some(id.as_str()));
        assert_eq!(props.retry_count(), 0);
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(published[0].exchange, "video_processing");
    }

    #[tokio::test]
    async fn message_ids_are_unique() {
        let client = ready_client().await;
        let a = client.publish_message(b"a", "transcode", None).await.unwrap();
        let b = client.publish_message(b"b", "transcode", None).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn first_retry_of_default_message_sets_count_to_one() {
        let client = ready_client().await;
        client.publish_message(b"job", "transcode", None).await.unwrap();
        let original = delivery_from(&client.channel().published()[0], 1);

        assert!(client.initiate_message_retry(&original, "transcode").await.unwrap());

        let published = client.channel().published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].properties.retry_count(), 1);
        assert_eq!(published[1].payload, original.payload);
        assert_eq!(client.channel().nacked(), vec![(1, false, false)]);
    }

    #[tokio::test]
    async fn retries_stop_after_max_retry_count() {
        let client = ready_client().await;
        client.publish_message(b"job", "transcode", None).await.unwrap();
        let mut current = delivery_from(&client.channel().published()[0], 1);

        for expected in 1..=3u32 {
            assert!(client.initiate_message_retry(&current, "transcode").await.unwrap());
            let published = client.channel().published();
            let last = published.last().unwrap();
            assert_eq!(last.properties.retry_count(), expected);
            current = delivery_from(last, u64::from(expected) + 1);
        }

        let before = client.channel().published().len();
        assert!(!client.initiate_message_retry(&current, "transcode").await.unwrap());
        assert_eq!(client.channel().published().len(), before);
        assert_eq!(client.channel().nacked().len(), 4);
        assert!(client.channel().nacked().iter().all(|(_, _, requeue)| !requeue));
    }

    #[tokio::test]
    async fn prefetch_holds_second_task_until_first_is_settled() {
        let client = ready_client().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_handler = seen.clone();
        let mut handle = client
            .consume(&client.topology().queue, move |delivery| {
                seen_in_handler.lock().unwrap().push(delivery.payload.clone());
                let tx = tx.clone();
                async move {
                    let _ = tx.send(delivery);
                }
            })
            .await
            .unwrap();

        client.publish_message(b"first", "transcode", None).await.unwrap();
        client.publish_message(b"second", "transcode", None).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"first");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        client.ack(&first).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload.as_ref(), b"second");
        assert_eq!(seen.lock().unwrap().len(), 2);

        handle.stop();
        handle.closed().await;
    }

    #[tokio::test]
    async fn stream_round_trip_with_uneven_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (bytes, meta) = round_trip(data.clone(), 3_000, 4_096).await;
        assert_eq!(bytes.as_ref(), data.as_slice());
        assert_eq!(meta.file_name.as_deref(), Some("clip.mp4"));
        assert_eq!(meta.total_size, Some(10_000));
        assert_eq!(meta.sequence, 0);
    }

    #[tokio::test]
    async fn stream_round_trip_single_byte_chunks() {
        let data = b"adaptive".to_vec();
        let (bytes, _) = round_trip(data.clone(), 1, 3).await;
        assert_eq!(bytes.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn empty_stream_sends_only_end_marker() {
        let (bytes, meta) = round_trip(Vec::new(), 1024, 1).await;
        assert!(bytes.is_empty());
        assert!(meta.is_end);
        assert_eq!(meta.total_chunks, Some(0));
    }

    #[tokio::test]
    async fn stream_chunks_carry_sequence_and_last_flag() {
        let client = ready_client().await;
        let data = Bytes::from_static(b"0123456789");
        let metadata = StreamMetadata {
            file_size: Some(10),
            chunk_size: Some(4),
            ..StreamMetadata::default()
        };
        let source = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(data)]);
        let id = client.publish_stream(source, "transcode", metadata).await.unwrap();

        let published = client.channel().published();
        assert_eq!(published.len(), 4);
        let headers: Vec<StreamHeaders> = published
            .iter()
            .map(|m| StreamHeaders::from_properties(&m.properties))
            .collect();

        assert!(published.iter().all(|m| m.properties.message_id.as_deref() == Some(id.as_str())));
        assert_eq!(headers.iter().map(|h| h.sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(
            headers[..3].iter().map(|h| h.bytes_processed).collect::<Vec<_>>(),
            vec![Some(4), Some(8), Some(10)]
        );
        assert_eq!(headers.iter().map(|h| h.is_last).collect::<Vec<_>>(), vec![false, false, true, false]);
        assert!(headers[3].is_end);
        assert_eq!(headers[3].total_chunks, Some(3));
        assert!(published[3].payload.is_empty());
        assert_eq!(
            published[0].properties.content_type.as_deref(),
            Some("application/octet-stream")
        );
    }

    #[tokio::test]
    async fn source_error_aborts_stream_without_end_marker() {
        let client = ready_client().await;
        let source = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::other("disk gone")),
        ]);

        let result = client
            .publish_stream(source, "transcode", StreamMetadata::default())
            .await;

        assert!(matches!(result, Err(QueueError::Stream(_))));
        let published = client.channel().published();
        assert_eq!(published.len(), 1);
        assert!(!StreamHeaders::from_properties(&published[0].properties).is_end);
    }

    #[tokio::test]
    async fn publish_reader_streams_async_reader() {
        let client = ready_client().await;
        let reader = std::io::Cursor::new(vec![7u8; 2_500]);
        let metadata = StreamMetadata {
            file_size: Some(2_500),
            chunk_size: Some(1_000),
            ..StreamMetadata::default()
        };
        client.publish_reader(reader, "transcode", metadata).await.unwrap();

        let published = client.channel().published();
        assert_eq!(published.len(), 4);
        let total: usize = published.iter().map(|m| m.payload.len()).sum();
        assert_eq!(total, 2_500);
    }

    #[tokio::test]
    async fn supervise_reconnects_after_connection_loss() {
        let client = ready_client().await;
        client.channel().disconnect();
        assert!(!client.is_initialized());

        let shutdown = CancellationToken::new();
        let supervisor = {
            let client = client.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.supervise(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_initialized() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        supervisor.await.unwrap();
    }
}
