//! Per-partition consumer: a blocking read loop for new entries plus a
//! periodic reclaim of pending entries that went stale on another consumer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::redis::{StreamClient, StreamEntry, StreamError};

pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MIN_IDLE_TIME: Duration = Duration::from_secs(60);

/// Entries claimed per reclaim scan; each scan restarts at the PEL head, so
/// the per-tick catch-up cost stays bounded without a persistent cursor.
const RECLAIM_COUNT: usize = 10;
const RECLAIM_SCAN_START: &str = "0-0";

const CONNECTION_BACKOFF: Duration = Duration::from_secs(5);
const NOGROUP_BACKOFF: Duration = Duration::from_secs(5);
const COMMAND_BACKOFF: Duration = Duration::from_secs(2);

/// Consumer tunables.
///
/// `block_timeout` also bounds how long a stopping consumer can stay parked
/// in a blocking read. `min_idle_time` should exceed the typical p99 handler
/// runtime, or entries still being worked on get reassigned.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub block_timeout: Duration,
    pub claim_interval: Duration,
    pub min_idle_time: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            claim_interval: DEFAULT_CLAIM_INTERVAL,
            min_idle_time: DEFAULT_MIN_IDLE_TIME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Idle,
            1 => ConsumerState::Running,
            2 => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }
}

/// A message surfaced to a handler, reconstructed from one stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    /// Field/value pairs in the order the producer wrote them.
    pub fields: Vec<(String, String)>,
    pub partition: u32,
}

/// User-supplied message processing.
///
/// Returning `Ok` acknowledges the entry; returning `Err` leaves it in the
/// group's pending list to be reclaimed after `min_idle_time`. Handlers must
/// be idempotent: delivery is at-least-once and reclaimed entries may
/// interleave with new ones.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Long-running consumer bound to one `(stream, group, consumer_id)` triple.
///
/// Cloning yields another handle onto the same consumer; the read loop and
/// reclaim ticker run on shared state behind the handle.
#[derive(Clone)]
pub struct PartitionConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    stream: String,
    group: String,
    consumer_id: String,
    partition: u32,
    client: Arc<dyn StreamClient>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
}

impl PartitionConsumer {
    pub fn new(
        client: Arc<dyn StreamClient>,
        handler: Arc<dyn MessageHandler>,
        stream: String,
        group: String,
        consumer_id: String,
        partition: u32,
        options: ConsumerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConsumerInner {
                stream,
                group,
                consumer_id,
                partition,
                client,
                handler,
                options,
                state: AtomicU8::new(ConsumerState::Idle as u8),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state()
    }

    pub fn block_timeout(&self) -> Duration {
        self.inner.options.block_timeout
    }

    /// Spawn the read loop and the reclaim ticker. Starting an already
    /// running or stopped consumer is a warned no-op; the Stopped state is
    /// terminal.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ConsumerState::Idle as u8,
                ConsumerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!(
                stream = %self.inner.stream,
                consumer = %self.inner.consumer_id,
                state = ?self.state(),
                "consumer cannot be started from this state, ignoring"
            );
            return;
        }

        info!(
            stream = %self.inner.stream,
            group = %self.inner.group,
            consumer = %self.inner.consumer_id,
            "starting partition consumer"
        );
        let reader = self.inner.clone();
        tokio::spawn(async move { reader.read_loop().await });
        let reclaimer = self.inner.clone();
        tokio::spawn(async move { reclaimer.reclaim_loop().await });
    }

    /// Cooperative stop: flip the state, cancel the reclaim ticker, and let
    /// the blocking read observe the flag within `block_timeout`. Idempotent.
    pub fn stop(&self) {
        match self.inner.state.compare_exchange(
            ConsumerState::Running as u8,
            ConsumerState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!(
                    stream = %self.inner.stream,
                    consumer = %self.inner.consumer_id,
                    "stopping partition consumer"
                );
                _ = self.inner.shutdown.send(true);
            }
            Err(previous) if previous == ConsumerState::Idle as u8 => {
                // Never started; nothing to unwind.
                self.inner
                    .state
                    .store(ConsumerState::Stopped as u8, Ordering::SeqCst);
            }
            Err(_) => {
                debug!(consumer = %self.inner.consumer_id, "consumer already stopped");
            }
        }
    }
}

impl ConsumerInner {
    fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn read_loop(self: Arc<Self>) {
        let block_ms = self.options.block_timeout.as_millis() as u64;
        while self.state() == ConsumerState::Running {
            match self
                .client
                .xread_group(&self.stream, &self.group, &self.consumer_id, block_ms)
                .await
            {
                // Block timeout elapsed with no new entries.
                Ok(None) => {}
                Ok(Some(entries)) => self.process_batch(entries).await,
                Err(err @ StreamError::Connection(_)) => {
                    self.report_error(&err, "readloop_redis_conn");
                    tokio::time::sleep(self.options.block_timeout.max(CONNECTION_BACKOFF)).await;
                }
                Err(err @ StreamError::NoGroup(_)) => {
                    self.report_error(&err, "readloop_nogroup");
                    self.recreate_group().await;
                    tokio::time::sleep(NOGROUP_BACKOFF).await;
                }
                Err(err) => {
                    self.report_error(&err, "readloop_xreadgroup");
                    tokio::time::sleep(COMMAND_BACKOFF).await;
                }
            }
        }
        self.state
            .store(ConsumerState::Stopped as u8, Ordering::SeqCst);
        debug!(stream = %self.stream, consumer = %self.consumer_id, "read loop exited");
    }

    async fn reclaim_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.options.claim_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; consume it so the first
        // scan happens a full claim interval after start.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if self.state() != ConsumerState::Running {
                        break;
                    }
                    if !self.reclaim_once().await {
                        break;
                    }
                }
            }
        }
        debug!(stream = %self.stream, consumer = %self.consumer_id, "reclaim ticker stopped");
    }

    /// One reclaim scan. Returns false when reclaim must shut down for good
    /// (the store does not know XAUTOCLAIM); every other failure is reported
    /// and the next tick retries.
    async fn reclaim_once(&self) -> bool {
        let min_idle_ms = self.options.min_idle_time.as_millis() as u64;
        match self
            .client
            .xautoclaim(
                &self.stream,
                &self.group,
                &self.consumer_id,
                min_idle_ms,
                RECLAIM_SCAN_START,
                RECLAIM_COUNT,
            )
            .await
        {
            Ok((_next_cursor, entries)) => {
                if !entries.is_empty() {
                    let labels = [("stream", self.stream.clone())];
                    metrics::counter!("qtask_messages_reclaimed_total", &labels)
                        .increment(entries.len() as u64);
                    info!(
                        stream = %self.stream,
                        consumer = %self.consumer_id,
                        count = entries.len(),
                        "reclaimed stalled entries"
                    );
                    self.process_batch(entries).await;
                }
                true
            }
            Err(err @ StreamError::UnsupportedCommand(_)) => {
                self.report_error(&err, "autoclaim_unsupported");
                warn!(
                    stream = %self.stream,
                    "store does not support XAUTOCLAIM, stalled-entry reclaim disabled"
                );
                false
            }
            Err(err @ StreamError::Connection(_)) => {
                self.report_error(&err, "autoclaim_redis_conn");
                true
            }
            Err(err @ StreamError::NoGroup(_)) => {
                self.report_error(&err, "autoclaim_nogroup");
                self.recreate_group().await;
                true
            }
            Err(err) => {
                self.report_error(&err, "autoclaim");
                true
            }
        }
    }

    /// Idempotent group (re)creation after a NOGROUP response.
    async fn recreate_group(&self) {
        if let Err(err) = self
            .client
            .xgroup_create(&self.stream, &self.group, "0")
            .await
        {
            warn!(
                stream = %self.stream,
                group = %self.group,
                "consumer group re-creation failed: {err}"
            );
        }
    }

    /// Deliver a batch in entry-id order. Handlers never run concurrently on
    /// the same partition; the next read is only issued once the whole batch
    /// has been observed.
    async fn process_batch(&self, entries: Vec<StreamEntry>) {
        for entry in entries {
            if self.state() != ConsumerState::Running {
                break;
            }
            self.deliver(entry).await;
        }
    }

    async fn deliver(&self, entry: StreamEntry) {
        let labels = [("stream", self.stream.clone())];
        metrics::counter!("qtask_messages_received_total", &labels).increment(1);

        let Some(fields) = pair_fields(&entry.fields) else {
            warn!(
                stream = %self.stream,
                entry_id = %entry.id,
                "dropping entry with malformed field list"
            );
            metrics::counter!("qtask_messages_dropped_total", &labels).increment(1);
            return;
        };

        let message = Message {
            id: entry.id,
            fields,
            partition: self.partition,
        };
        let started = tokio::time::Instant::now();
        match self.handler.handle(&message).await {
            Ok(()) => {
                metrics::histogram!("qtask_handler_duration_seconds", &labels)
                    .record(started.elapsed().as_secs_f64());
                match self
                    .client
                    .xack(&self.stream, &self.group, &message.id)
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("qtask_messages_acked_total", &labels).increment(1);
                        debug!(stream = %self.stream, entry_id = %message.id, "acknowledged entry");
                    }
                    Err(err) => {
                        error!(
                            stream = %self.stream,
                            entry_id = %message.id,
                            "failed to acknowledge entry: {err}"
                        );
                    }
                }
            }
            Err(err) => {
                metrics::counter!("qtask_handler_failures_total", &labels).increment(1);
                error!(
                    stream = %self.stream,
                    partition = self.partition,
                    entry_id = %message.id,
                    "handler failed, leaving entry pending for reclaim: {err:#}"
                );
            }
        }
    }

    fn report_error(&self, err: &StreamError, context: &'static str) {
        let labels = [("context", context.to_string())];
        metrics::counter!("qtask_consumer_errors_total", &labels).increment(1);
        error!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_id,
            context,
            "consumer error: {err}"
        );
    }
}

/// Pair a flat field list back into an ordered mapping. Odd-length or empty
/// lists cannot be paired and make the entry undeliverable.
fn pair_fields(flat: &[String]) -> Option<Vec<(String, String)>> {
    if flat.is_empty() || flat.len() % 2 != 0 {
        return None;
    }
    Some(
        flat.chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    )
}
