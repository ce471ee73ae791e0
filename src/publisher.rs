//! Bus publishing.
//!
//! Validated records are serialized to JSON and emitted to the message bus
//! through the [`BusProducer`] seam: `KafkaBusProducer` in production (an
//! idempotent, full-ISR-acknowledged `rdkafka` producer with compression and
//! batching handled by the client), `MemoryBusProducer` for tests and local
//! development.
//!
//! Topic is `<prefix>.<protocol-lowercase>`; the partition key is
//! `<device-id>_<hash(device-id) mod partition-count>` with a fixed-seed hash
//! so a device's records always land on the same partition. Publish attempts
//! run under the Kafka retry policy behind a circuit breaker; an open breaker
//! fails fast and back-pressures the pipeline.

use crate::config::{KafkaConfig, PolicyConfig};
use crate::error::{GatewayError, Result};
use crate::record::{keys, TelemetryRecord};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message schema version advertised in headers.
const SCHEMA_VERSION: &str = "1.0";

/// A serialized record addressed for the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Destination topic.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// JSON payload.
    pub payload: Vec<u8>,
    /// Message headers.
    pub headers: Vec<(String, String)>,
}

/// Broker confirmation for one message.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    /// Partition the message landed on.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

/// The bus client seam. Production uses Kafka; tests use the in-memory bus.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Sends one message and awaits broker acknowledgement.
    async fn send(&self, message: BusMessage) -> Result<Delivery>;

    /// Awaits delivery confirmation for all in-flight messages.
    async fn flush(&self, deadline: Duration) -> Result<()>;

    /// False once the producer has reported a fatal error.
    fn healthy(&self) -> bool;
}

/// `rdkafka`-backed producer.
pub struct KafkaBusProducer {
    producer: FutureProducer,
    send_timeout: Duration,
    fatal: AtomicBool,
}

impl KafkaBusProducer {
    /// Builds the producer from the Kafka config section.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set(
                "enable.idempotence",
                if config.enable_idempotence { "true" } else { "false" },
            )
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.num.messages", config.batch_size.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| GatewayError::config(format!("Kafka producer init: {}", e)))?;

        info!(
            brokers = %config.bootstrap_servers,
            compression = %config.compression,
            "Kafka producer created"
        );
        Ok(Self {
            producer,
            send_timeout: Duration::from_millis(config.message_timeout_ms),
            fatal: AtomicBool::new(false),
        })
    }

    fn classify(&self, topic: &str, err: KafkaError) -> GatewayError {
        let code = err.rdkafka_error_code();
        if matches!(code, Some(RDKafkaErrorCode::Fatal)) {
            self.fatal.store(true, Ordering::Relaxed);
        }
        let retriable = matches!(
            code,
            Some(
                RDKafkaErrorCode::QueueFull
                    | RDKafkaErrorCode::MessageTimedOut
                    | RDKafkaErrorCode::BrokerTransportFailure
                    | RDKafkaErrorCode::AllBrokersDown
                    | RDKafkaErrorCode::NotEnoughReplicas
                    | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                    | RDKafkaErrorCode::LeaderNotAvailable
                    | RDKafkaErrorCode::NetworkException
                    | RDKafkaErrorCode::RequestTimedOut
                    | RDKafkaErrorCode::OperationTimedOut
            )
        );
        if retriable {
            GatewayError::publish_retriable(topic, err.to_string())
        } else {
            // Broker-side terminal rejections (e.g. message too large) are
            // dropped without retry
            GatewayError::publish_terminal(topic, err.to_string())
        }
    }
}

#[async_trait]
impl BusProducer for KafkaBusProducer {
    async fn send(&self, message: BusMessage) -> Result<Delivery> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((err, _unsent)) => Err(self.classify(&message.topic, err)),
        }
    }

    async fn flush(&self, deadline: Duration) -> Result<()> {
        let producer = self.producer.clone();
        let result = tokio::task::spawn_blocking(move || {
            let outcome = producer.flush(Timeout::After(deadline));
            (outcome, producer.in_flight_count())
        })
        .await
        .map_err(|e| GatewayError::internal(format!("flush task join: {}", e)))?;

        match result {
            (Ok(()), _) => Ok(()),
            (Err(_), pending) => Err(GatewayError::FlushTimeout {
                pending: pending.max(0) as usize,
            }),
        }
    }

    fn healthy(&self) -> bool {
        !self.fatal.load(Ordering::Relaxed)
    }
}

/// In-memory bus for tests and brokerless development.
///
/// Partition assignment mirrors the bus partitioner: the numeric suffix of
/// the partition key selects the partition; offsets are monotonic per
/// topic-partition.
pub struct MemoryBusProducer {
    messages: Mutex<Vec<DeliveredMessage>>,
    offsets: Mutex<HashMap<(String, i32), i64>>,
    sent: AtomicI64,
    healthy: AtomicBool,
}

/// A message captured by [`MemoryBusProducer`].
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    /// Destination topic.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// JSON payload.
    pub payload: Vec<u8>,
    /// Message headers.
    pub headers: Vec<(String, String)>,
    /// Assigned partition.
    pub partition: i32,
    /// Assigned offset.
    pub offset: i64,
}

impl MemoryBusProducer {
    /// Creates an empty in-memory bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            offsets: Mutex::new(HashMap::new()),
            sent: AtomicI64::new(0),
            healthy: AtomicBool::new(true),
        })
    }

    /// Snapshot of every delivered message, in delivery order.
    pub fn messages(&self) -> Vec<DeliveredMessage> {
        self.messages.lock().clone()
    }

    /// Total messages delivered.
    pub fn delivered_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed).max(0) as usize
    }

    /// Marks the producer unhealthy, as a fatal broker error would.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    fn partition_of(key: &str) -> i32 {
        key.rsplit('_')
            .next()
            .and_then(|suffix| suffix.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusProducer for MemoryBusProducer {
    async fn send(&self, message: BusMessage) -> Result<Delivery> {
        if !self.healthy.load(Ordering::Relaxed) {
            return Err(GatewayError::publish_retriable(
                &message.topic,
                "in-memory bus marked down",
            ));
        }

        let partition = Self::partition_of(&message.key);
        let offset = {
            let mut offsets = self.offsets.lock();
            let slot = offsets
                .entry((message.topic.clone(), partition))
                .or_insert(0);
            let assigned = *slot;
            *slot += 1;
            assigned
        };

        self.messages.lock().push(DeliveredMessage {
            topic: message.topic,
            key: message.key,
            payload: message.payload,
            headers: message.headers,
            partition,
            offset,
        });
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(Delivery { partition, offset })
    }

    async fn flush(&self, _deadline: Duration) -> Result<()> {
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

// Fixed seeds keep the device -> partition mapping stable across restarts
const PARTITION_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x7465_6c65_6d65_7472,
    0x792e_6770_7300_0001,
    0x6770_7367_6174_6500,
    0x0000_0000_0000_002a,
);

/// Publishes validated records to the bus with retry and a circuit breaker.
pub struct Publisher {
    producer: Arc<dyn BusProducer>,
    topic_prefix: String,
    partition_count: u32,
    producer_name: String,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    shut_down: AtomicBool,
    partition_hasher: ahash::RandomState,
}

impl Publisher {
    /// Creates a publisher over the given bus producer.
    pub fn new(
        producer: Arc<dyn BusProducer>,
        kafka: &KafkaConfig,
        policy: &PolicyConfig,
        producer_name: impl Into<String>,
    ) -> Self {
        let (a, b, c, d) = PARTITION_HASH_SEEDS;
        Self {
            producer,
            topic_prefix: kafka.topic_prefix.clone(),
            partition_count: kafka.partition_count.max(1),
            producer_name: producer_name.into(),
            retry: RetryPolicy::from_config("kafka", policy),
            breaker: policy.breaker.as_ref().map(CircuitBreaker::from_config),
            shut_down: AtomicBool::new(false),
            partition_hasher: ahash::RandomState::with_seeds(a, b, c, d),
        }
    }

    /// Topic for a record: `<prefix>.<protocol-lowercase>`, `unknown` when
    /// the record carries no `Protocol` extended key.
    pub fn topic_for(&self, record: &TelemetryRecord) -> String {
        let protocol = record
            .extended_str(keys::PROTOCOL)
            .map(|p| p.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        format!("{}.{}", self.topic_prefix, protocol)
    }

    /// Partition key for a device: `<device-id>_<partition-index>`.
    pub fn partition_key(&self, device_id: &str) -> String {
        format!("{}_{}", device_id, self.partition_index(device_id))
    }

    fn partition_index(&self, device_id: &str) -> u32 {
        (self.partition_hasher.hash_one(device_id) % u64::from(self.partition_count)) as u32
    }

    /// Publishes one validated record under the Kafka resilience policy.
    ///
    /// Fails fast with [`GatewayError::CircuitOpen`] while the breaker is
    /// open; the pipeline treats that as back-pressure.
    pub async fn publish(
        &self,
        record: &TelemetryRecord,
        token: &CancellationToken,
    ) -> Result<Delivery> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(GatewayError::publish_terminal(
                self.topic_for(record),
                "publisher is shut down",
            ));
        }
        if let Some(breaker) = &self.breaker {
            breaker.try_acquire()?;
        }

        let message = self.build_message(record)?;
        debug!(topic = %message.topic, key = %message.key, "Publishing record");

        let producer = Arc::clone(&self.producer);
        let outcome = self
            .retry
            .execute(token, move || {
                let producer = Arc::clone(&producer);
                let message = message.clone();
                async move { producer.send(message).await }
            })
            .await;

        if let Some(breaker) = &self.breaker {
            match &outcome {
                Ok(_) => breaker.record_success(),
                // Cancellation says nothing about broker health
                Err(GatewayError::Cancelled) => {}
                Err(_) => breaker.record_failure(),
            }
        }
        outcome
    }

    fn build_message(&self, record: &TelemetryRecord) -> Result<BusMessage> {
        let topic = self.topic_for(record);
        let payload = serde_json::to_vec(record)
            .map_err(|e| GatewayError::internal(format!("record serialization: {}", e)))?;
        let protocol = record
            .extended_str(keys::PROTOCOL)
            .unwrap_or("unknown")
            .to_string();
        let quality = record.quality_score().unwrap_or(0);

        Ok(BusMessage {
            key: self.partition_key(&record.device_id),
            payload,
            headers: vec![
                ("device_id".to_string(), record.device_id.clone()),
                ("schema_version".to_string(), SCHEMA_VERSION.to_string()),
                (
                    "content_type".to_string(),
                    "application/json".to_string(),
                ),
                ("producer".to_string(), self.producer_name.clone()),
                ("protocol".to_string(), protocol),
                ("quality_score".to_string(), quality.to_string()),
            ],
            topic,
        })
    }

    /// Awaits delivery confirmation for all in-flight records.
    pub async fn flush(&self, deadline: Duration) -> Result<()> {
        match self.producer.flush(deadline).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Publisher flush failed: {}", e);
                Err(e)
            }
        }
    }

    /// False iff the publisher was shut down or the broker reported a fatal
    /// error.
    pub fn healthy(&self) -> bool {
        !self.shut_down.load(Ordering::Relaxed) && self.producer.healthy()
    }

    /// Marks the publisher shut down; subsequent publishes fail terminally.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use chrono::Utc;

    fn publisher_over(memory: Arc<MemoryBusProducer>) -> Publisher {
        let kafka = KafkaConfig {
            partition_count: 8,
            ..Default::default()
        };
        // Fast-retry policy so failure tests stay quick
        let policy = PolicyConfig {
            max_attempts: 2,
            backoff: "linear".to_string(),
            base_delay_ms: 1,
            max_delay_ms: None,
            timeout_ms: None,
            breaker: None,
        };
        Publisher::new(memory, &kafka, &policy, "gpsgate")
    }

    fn record_with_protocol() -> TelemetryRecord {
        let mut record = TelemetryRecord::new("truck-1", 48.1173, 11.5167);
        record.timestamp = Some(Utc::now());
        record.set_extended(keys::PROTOCOL, "NMEA");
        record.set_extended(keys::QUALITY_SCORE, 85);
        record
    }

    #[tokio::test]
    async fn test_topic_and_key_derivation() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        let record = record_with_protocol();
        let token = CancellationToken::new();

        publisher
            .publish(&record, &token)
            .await
            .expect("publish succeeds");

        let messages = memory.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "telemetry.gps.nmea");
        assert!(messages[0].key.starts_with("truck-1_"));

        let suffix: u32 = messages[0]
            .key
            .rsplit('_')
            .next()
            .expect("key suffix")
            .parse()
            .expect("numeric suffix");
        assert!(suffix < 8);
    }

    #[tokio::test]
    async fn test_unknown_protocol_topic() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        let mut record = record_with_protocol();
        record.extended_data.remove(keys::PROTOCOL);
        let token = CancellationToken::new();

        publisher.publish(&record, &token).await.expect("publish");
        assert_eq!(memory.messages()[0].topic, "telemetry.gps.unknown");
    }

    #[tokio::test]
    async fn test_headers_attached() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        let token = CancellationToken::new();

        publisher
            .publish(&record_with_protocol(), &token)
            .await
            .expect("publish");

        let headers = memory.messages()[0].headers.clone();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("device_id").as_deref(), Some("truck-1"));
        assert_eq!(get("schema_version").as_deref(), Some("1.0"));
        assert_eq!(get("content_type").as_deref(), Some("application/json"));
        assert_eq!(get("producer").as_deref(), Some("gpsgate"));
        assert_eq!(get("protocol").as_deref(), Some("NMEA"));
        assert_eq!(get("quality_score").as_deref(), Some("85"));
    }

    #[tokio::test]
    async fn test_partition_stable_per_device() {
        let publisher = publisher_over(MemoryBusProducer::new());
        let first = publisher.partition_key("truck-1");
        for _ in 0..10 {
            assert_eq!(publisher.partition_key("truck-1"), first);
        }
    }

    #[tokio::test]
    async fn test_offsets_monotonic_per_partition() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        let token = CancellationToken::new();

        for _ in 0..3 {
            publisher
                .publish(&record_with_protocol(), &token)
                .await
                .expect("publish");
        }

        let offsets: Vec<i64> = memory.messages().iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_publish_and_health() {
        let publisher = publisher_over(MemoryBusProducer::new());
        assert!(publisher.healthy());

        publisher.shutdown();
        assert!(!publisher.healthy());

        let token = CancellationToken::new();
        let result = publisher.publish(&record_with_protocol(), &token).await;
        assert!(matches!(
            result,
            Err(GatewayError::Publish { retriable: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_producer_degrades_health() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        memory.set_healthy(false);
        assert!(!publisher.healthy());
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let memory = MemoryBusProducer::new();
        memory.set_healthy(false);

        let kafka = KafkaConfig::default();
        let policy = PolicyConfig {
            max_attempts: 1,
            backoff: "linear".to_string(),
            base_delay_ms: 1,
            max_delay_ms: None,
            timeout_ms: None,
            breaker: Some(crate::config::BreakerConfig {
                failure_ratio: 0.5,
                window_secs: 60,
                min_throughput: 3,
                break_secs: 30,
            }),
        };
        let publisher = Publisher::new(memory.clone(), &kafka, &policy, "gpsgate");
        let token = CancellationToken::new();
        let record = record_with_protocol();

        // Three failing attempts trip the breaker
        for _ in 0..3 {
            let result = publisher.publish(&record, &token).await;
            assert!(matches!(result, Err(GatewayError::Publish { .. })));
        }

        // Now the breaker rejects before the producer is even called
        let before = memory.delivered_count();
        let result = publisher.publish(&record, &token).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen)));
        assert_eq!(memory.delivered_count(), before);
    }

    #[tokio::test]
    async fn test_payload_is_canonical_json() {
        let memory = MemoryBusProducer::new();
        let publisher = publisher_over(memory.clone());
        let token = CancellationToken::new();

        let mut record = record_with_protocol();
        record.speed = Some(41.4848);
        publisher.publish(&record, &token).await.expect("publish");

        let json: serde_json::Value =
            serde_json::from_slice(&memory.messages()[0].payload).expect("valid JSON");
        assert_eq!(json["deviceId"], "truck-1");
        assert!(json.get("heading").is_none(), "unset fields omitted");
        assert_eq!(json["extendedData"]["Protocol"], "NMEA");
    }
}
