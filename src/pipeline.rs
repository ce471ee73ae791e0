//! The ingest-decode-publish pipeline.
//!
//! Frames flow through a fixed pool of workers over bounded, device-sharded
//! channels: a frame lands on shard `hash(device_id) % workers`, so frames
//! from one device are processed FIFO by one worker while devices spread
//! across the pool. Reordering can happen across devices, never within one.
//! Bounded channels propagate back-pressure to the connection layer.
//!
//! Per frame: match a decoder, decode, validate (plugin then central),
//! enrich the reserved extended-data keys, publish. Every failure is a
//! counted drop; nothing propagates past the pipeline boundary. The pooled
//! payload buffer is released when the frame is dropped at the end of
//! processing, on success and error paths alike.

use crate::error::GatewayError;
use crate::frame::RawFrame;
use crate::lock_mutex;
use crate::plugin::PluginRegistry;
use crate::publisher::Publisher;
use crate::record::keys;
use crate::resilience::RetryPolicy;
use crate::sessions::SessionTracker;
use crate::validator::Validator;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a worker waits before re-trying a publish rejected by the open
/// circuit breaker. The worker stalls, the shard fills, intake back-pressures.
const BREAKER_RETRY_DELAY: Duration = Duration::from_millis(500);

// Seeds differ from the publisher's so shard and partition skew stay independent
const SHARD_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6465_7669_6365_5f69,
    0x645f_7368_6172_6401,
    0x1f3a_5c77_9b2d_e681,
    0x0000_0000_0000_0007,
);

/// Lock-free pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    failed_no_decoder: AtomicU64,
    failed_decode: AtomicU64,
    failed_validation: AtomicU64,
    failed_publish: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSnapshot {
    /// Frames dequeued by workers.
    pub received: u64,
    /// Records confirmed by the bus.
    pub published: u64,
    /// Frames no registered decoder accepted.
    pub failed_no_decoder: u64,
    /// Frames the matched decoder rejected.
    pub failed_decode: u64,
    /// Records that violated hard invariants.
    pub failed_validation: u64,
    /// Records dropped after the publish path gave up.
    pub failed_publish: u64,
}

impl PipelineSnapshot {
    /// Total counted drops.
    pub fn failed_total(&self) -> u64 {
        self.failed_no_decoder + self.failed_decode + self.failed_validation + self.failed_publish
    }
}

impl PipelineMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            received: self.messages_received.load(Ordering::Relaxed),
            published: self.messages_published.load(Ordering::Relaxed),
            failed_no_decoder: self.failed_no_decoder.load(Ordering::Relaxed),
            failed_decode: self.failed_decode.load(Ordering::Relaxed),
            failed_validation: self.failed_validation.load(Ordering::Relaxed),
            failed_publish: self.failed_publish.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable, device-sharded handle for enqueueing frames.
#[derive(Clone)]
pub struct PipelineIntake {
    shards: Vec<mpsc::Sender<RawFrame>>,
    hasher: ahash::RandomState,
}

impl PipelineIntake {
    /// Enqueues a frame onto its device's shard, awaiting channel capacity.
    /// This await is the back-pressure point for the connection layer.
    pub async fn submit(&self, frame: RawFrame) -> crate::error::Result<()> {
        let shard = (self.hasher.hash_one(frame.device_id.as_str())
            % self.shards.len() as u64) as usize;
        self.shards[shard]
            .send(frame)
            .await
            .map_err(|_| GatewayError::internal("pipeline intake is closed"))
    }

    /// Number of worker shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

struct WorkerContext {
    registry: Arc<PluginRegistry>,
    validator: Arc<Validator>,
    publisher: Arc<Publisher>,
    // Wraps the publish step; the bus policy itself lives in the publisher
    processing: RetryPolicy,
    tracker: Arc<SessionTracker>,
    metrics: Arc<PipelineMetrics>,
}

/// The worker pool binding registry, validator, and publisher.
pub struct Pipeline {
    intake: Mutex<Option<PipelineIntake>>,
    metrics: Arc<PipelineMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active_workers: Arc<AtomicUsize>,
}

impl Pipeline {
    /// Spawns `workers` worker tasks sharing `total_capacity` of bounded
    /// intake, and returns the pipeline with a cloneable intake handle.
    ///
    /// `token` is the pipeline's own cancellation signal; it is only fired
    /// to abandon workers that failed to drain in time. The graceful path is
    /// dropping every intake clone and calling [`Pipeline::drain`].
    pub fn spawn(
        workers: usize,
        total_capacity: usize,
        registry: Arc<PluginRegistry>,
        validator: Arc<Validator>,
        publisher: Arc<Publisher>,
        processing: RetryPolicy,
        tracker: Arc<SessionTracker>,
        token: CancellationToken,
    ) -> (Self, PipelineIntake) {
        let workers = workers.max(1);
        let per_shard = (total_capacity / workers).max(1);
        let metrics = Arc::new(PipelineMetrics::default());
        let active_workers = Arc::new(AtomicUsize::new(workers));
        let context = Arc::new(WorkerContext {
            registry,
            validator,
            publisher,
            processing,
            tracker,
            metrics: Arc::clone(&metrics),
        });

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            let ctx = Arc::clone(&context);
            let active = Arc::clone(&active_workers);
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, rx, ctx, worker_token).await;
                active.fetch_sub(1, Ordering::Relaxed);
            }));
        }

        info!(workers, per_shard, "Pipeline started");

        let (a, b, c, d) = SHARD_HASH_SEEDS;
        let intake = PipelineIntake {
            shards,
            hasher: ahash::RandomState::with_seeds(a, b, c, d),
        };

        (
            Self {
                intake: Mutex::new(Some(intake.clone())),
                metrics,
                handles: Mutex::new(handles),
                active_workers,
            },
            intake,
        )
    }

    /// Pipeline counters.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Health predicate: true while any worker is alive.
    pub fn is_running(&self) -> bool {
        self.active_workers.load(Ordering::Relaxed) > 0
    }

    /// Closes the pipeline's own intake handle and awaits worker drain.
    ///
    /// Workers exit once every intake clone has dropped and their shards are
    /// empty. Returns false if the deadline expired with workers still busy;
    /// the caller should then cancel the pipeline token to abandon them.
    pub async fn drain(&self, deadline: Duration) -> bool {
        drop(lock_mutex!(self.intake).take());
        let handles: Vec<_> = lock_mutex!(self.handles).drain(..).collect();

        match tokio::time::timeout(deadline, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Pipeline drained");
                true
            }
            Err(_) => {
                error!("Pipeline drain deadline exceeded; abandoning workers");
                false
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    mut rx: mpsc::Receiver<RawFrame>,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
) {
    debug!(worker, "Pipeline worker started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!(worker, "Pipeline worker abandoned before drain completed");
                break;
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => process_frame(&ctx, frame, &token).await,
                    None => break, // intake closed and shard drained
                }
            }
        }
    }
    debug!(worker, "Pipeline worker stopped");
}

async fn process_frame(ctx: &WorkerContext, frame: RawFrame, token: &CancellationToken) {
    ctx.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
    ctx.tracker.record_message();

    let payload_len = frame.len();
    let Some(plugin) = ctx.registry.match_for_bytes(frame.payload.as_slice()) else {
        ctx.metrics.failed_no_decoder.fetch_add(1, Ordering::Relaxed);
        warn!(
            device_id = %frame.device_id,
            error_type = "no_decoder",
            "No decoder accepts frame"
        );
        return;
    };

    let mut record =
        match ctx
            .registry
            .decode_with(&plugin, frame.payload.as_slice(), &frame.device_id)
        {
            Ok(record) => record,
            Err(e) => {
                ctx.metrics.failed_decode.fetch_add(1, Ordering::Relaxed);
                warn!(
                    device_id = %frame.device_id,
                    plugin = %plugin.name(),
                    error_type = "decode",
                    "Frame dropped: {}",
                    e
                );
                return;
            }
        };

    // A decoder that only saw time-of-day leaves the timestamp unset;
    // stamp it with the frame's ingress wall clock
    if record.timestamp.is_none() {
        record.timestamp = Some(frame.received_at);
    }

    if let Err(reason) = plugin.validate(&record) {
        ctx.metrics.failed_validation.fetch_add(1, Ordering::Relaxed);
        warn!(
            device_id = %record.device_id,
            plugin = %plugin.name(),
            error_type = "validation",
            "Record dropped by plugin validator: {}",
            reason
        );
        return;
    }

    let verdict = ctx.validator.validate(&record);
    if !verdict.is_valid {
        ctx.metrics.failed_validation.fetch_add(1, Ordering::Relaxed);
        warn!(
            device_id = %record.device_id,
            error_type = "validation",
            "Record dropped: {}",
            verdict.errors.join("; ")
        );
        return;
    }

    let quality = ctx.validator.quality_score(&record);
    record.set_extended(keys::PROTOCOL, plugin.protocol().as_str());
    record.set_extended(
        keys::PROCESSED_AT,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    record.set_extended(keys::PROCESSING_ID, Uuid::new_v4().to_string());
    record.set_extended(keys::DATA_SIZE, payload_len as u64);
    record.set_extended(keys::QUALITY_SCORE, quality);

    loop {
        let publisher = Arc::clone(&ctx.publisher);
        let attempt_record = &record;
        let outcome = ctx
            .processing
            .execute(token, move || {
                let publisher = Arc::clone(&publisher);
                async move { publisher.publish(attempt_record, token).await }
            })
            .await;
        match outcome {
            Ok(delivery) => {
                record.set_extended(keys::KAFKA_PARTITION, delivery.partition);
                record.set_extended(keys::KAFKA_OFFSET, delivery.offset);
                ctx.metrics.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    device_id = %record.device_id,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Record published"
                );
                break;
            }
            Err(GatewayError::CircuitOpen) => {
                // Stall this worker until the breaker admits traffic again;
                // the full shard then back-pressures the connection layer
                tokio::select! {
                    _ = token.cancelled() => {
                        ctx.metrics.failed_publish.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            device_id = %record.device_id,
                            error_type = "publish",
                            "Record dropped: cancelled while breaker open"
                        );
                        break;
                    }
                    _ = tokio::time::sleep(BREAKER_RETRY_DELAY) => {}
                }
            }
            Err(e) => {
                ctx.metrics.failed_publish.fetch_add(1, Ordering::Relaxed);
                warn!(
                    device_id = %record.device_id,
                    error_type = "publish",
                    "Record dropped: {}",
                    e
                );
                break;
            }
        }
    }
    // frame drops here, returning its pooled buffer
}
