use super::channel::{BrokerChannel, Subscription, Topology};
use super::error::{QueueError, QueueResult};
use super::message::{Delivery, HeaderValue, Headers, MessageProperties};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Event, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

struct Session {
    conn: Connection,
    channel: Channel,
}

/// lapin-backed channel. Holds at most one live connection; a connection
/// error clears it and drops the readiness flag until `initialize` runs again.
#[derive(Clone)]
pub struct RabbitMqChannel {
    url: String,
    session: Arc<Mutex<Option<Session>>>,
    ready: Arc<AtomicBool>,
    /// Bumped on every successful `initialize`.
    generation: Arc<AtomicU64>,
}

impl RabbitMqChannel {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            session: Arc::new(Mutex::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn connect(url: &str) -> QueueResult<(Connection, Channel)> {
        info!("Connecting to RabbitMQ");
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to RabbitMQ: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {}", e)))?;

        Ok((conn, channel))
    }

    async fn declare_topology(channel: &Channel, topology: &Topology) -> QueueResult<()> {
        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Publishes resolve only once the broker confirms them.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(())
    }

    fn channel(&self) -> QueueResult<Channel> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(QueueError::NotInitialized);
        }
        let guard = self.session.lock().map_err(|_| QueueError::NotInitialized)?;
        guard
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(QueueError::NotInitialized)
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn initialize(&self, topology: &Topology) -> QueueResult<()> {
        let (conn, channel) = Self::connect(&self.url).await?;
        Self::declare_topology(&channel, topology).await?;

        let events = conn.events_listener();
        let generation = {
            let mut guard = self
                .session
                .lock()
                .map_err(|_| QueueError::Connection("session lock poisoned".into()))?;
            *guard = Some(Session { conn, channel });
            self.ready.store(true, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        tokio::spawn(watch_connection(
            events,
            ConnectionWatch {
                session: self.session.clone(),
                ready: self.ready.clone(),
                live: self.generation.clone(),
                generation,
            },
        ));

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            routing_key = %topology.routing_key,
            "✅ Connected to RabbitMQ"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn close(&self) -> QueueResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        let session = match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(session) = session {
            session.channel.close(200, "Closing channel").await?;
            session.conn.close(200, "Closing connection").await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> QueueResult<()> {
        let channel = self.channel()?;

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| QueueError::publish(format!("Failed to publish message: {}", e)))?
            .await
            .map_err(|e| QueueError::publish(format!("Failed to confirm publication: {}", e)))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> QueueResult<Subscription> {
        let channel = self.channel()?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("transcoder-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("Failed to create consumer: {}", e)))?;

        let deliveries = consumer
            .map(|result| {
                result
                    .map(from_lapin_delivery)
                    .map_err(|e| QueueError::Consume(e.to_string()))
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> QueueResult<()> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> QueueResult<()> {
        self.channel()?
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mode = if properties.persistent { PERSISTENT } else { TRANSIENT };
    let mut props = BasicProperties::default()
        .with_delivery_mode(mode)
        .with_headers(to_field_table(&properties.headers));

    if let Some(id) = properties.message_id {
        props = props.with_message_id(ShortString::from(id));
    }
    if let Some(content_type) = properties.content_type {
        props = props.with_content_type(ShortString::from(content_type));
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }
    if let Some(app_id) = properties.app_id {
        props = props.with_app_id(ShortString::from(app_id));
    }
    props
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Text(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).ok()?),
                AMQPValue::ShortString(v) => HeaderValue::Text(v.as_str().to_string()),
                AMQPValue::LongString(v) => {
                    HeaderValue::Text(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        persistent: props.delivery_mode().is_some_and(|m| m == PERSISTENT),
        timestamp: *props.timestamp(),
        app_id: props.app_id().as_ref().map(|s| s.as_str().to_string()),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        payload: Bytes::from(delivery.data),
        properties,
        redelivered: delivery.redelivered,
    }
}

/// What a connection watcher may clear, and the generation it belongs to.
struct ConnectionWatch<T> {
    session: Arc<Mutex<Option<T>>>,
    ready: Arc<AtomicBool>,
    live: Arc<AtomicU64>,
    generation: u64,
}

impl<T> ConnectionWatch<T> {
    /// Drops the session unless a newer `initialize` already replaced it.
    fn clear(&self) -> bool {
        let Ok(mut guard) = self.session.lock() else {
            return false;
        };
        if self.live.load(Ordering::SeqCst) != self.generation {
            return false;
        }
        self.ready.store(false, Ordering::SeqCst);
        guard.take();
        true
    }
}

/// Follows a connection's events until the first error, then clears the
/// session so the next operation reports `NotInitialized`.
async fn watch_connection<S, T>(events: S, watch: ConnectionWatch<T>)
where
    S: Stream<Item = Event>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Event::Error(err) => {
                if watch.clear() {
                    warn!("RabbitMQ connection closed: {}", err);
                }
                return;
            }
            Event::ConnectionBlocked(reason) => warn!("RabbitMQ connection blocked: {}", reason),
            Event::ConnectionUnblocked => info!("RabbitMQ connection unblocked"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::message::{HEADER_IS_END, HEADER_RETRY_COUNT};

    #[test]
    fn headers_survive_field_table_conversion() {
        let mut headers = Headers::new();
        headers.insert(HEADER_RETRY_COUNT.into(), HeaderValue::Int(2));
        headers.insert(HEADER_IS_END.into(), HeaderValue::Bool(true));
        headers.insert("x-file-name".into(), HeaderValue::Text("a.mp4".into()));

        assert_eq!(from_field_table(&to_field_table(&headers)), headers);
    }

    #[test]
    fn persistence_maps_to_delivery_mode() {
        let props = to_basic_properties(MessageProperties::persistent("abc"));
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            props.message_id().as_ref().map(|s| s.as_str()),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let channel = RabbitMqChannel::new("amqp://localhost:5672");
        assert!(!channel.is_initialized());
        assert!(matches!(
            channel.publish("x", "y", b"z", MessageProperties::default()).await,
            Err(QueueError::NotInitialized)
        ));
        assert!(matches!(channel.ack(1).await, Err(QueueError::NotInitialized)));
    }

    fn watch(live: u64, generation: u64) -> ConnectionWatch<&'static str> {
        ConnectionWatch {
            session: Arc::new(Mutex::new(Some("session"))),
            ready: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicU64::new(live)),
            generation,
        }
    }

    fn heartbeat_lost() -> Event {
        Event::Error(lapin::Error::from(lapin::ErrorKind::MissingHeartbeatError))
    }

    #[tokio::test]
    async fn connection_error_clears_session() {
        let watched = watch(1, 1);
        let (session, ready) = (watched.session.clone(), watched.ready.clone());
        let events = futures_util::stream::iter(vec![
            Event::ConnectionBlocked("low on memory".into()),
            Event::ConnectionUnblocked,
            heartbeat_lost(),
        ]);

        watch_connection(events, watched).await;

        assert!(!ready.load(Ordering::SeqCst));
        assert!(session.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_watcher_leaves_newer_session() {
        let watched = watch(2, 1);
        let (session, ready) = (watched.session.clone(), watched.ready.clone());

        watch_connection(futures_util::stream::iter(vec![heartbeat_lost()]), watched).await;

        assert!(ready.load(Ordering::SeqCst));
        assert_eq!(*session.lock().unwrap(), Some("session"));
    }

    #[tokio::test]
    async fn blocked_connection_keeps_session() {
        let watched = watch(1, 1);
        let (session, ready) = (watched.session.clone(), watched.ready.clone());
        let events = futures_util::stream::iter(vec![Event::ConnectionBlocked("disk alarm".into())]);

        watch_connection(events, watched).await;

        assert!(ready.load(Ordering::SeqCst));
        assert!(session.lock().unwrap().is_some());
    }
}
