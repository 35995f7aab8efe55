//! Redis Streams queue with consumer groups.
//!
//! # Stream Structure
//!
//! - `tasks`: jobs published by the server, consumed by agents
//! - `results`: results published by agents, consumed by the server
//!
//! Both streams share the consumer group `mrva`, created with `MKSTREAM` on
//! connect. Each entry carries one field, `payload`, holding the JSON
//! message.
//!
//! # Reliability
//!
//! - Publishing waits for the `XADD` reply, which carries the entry id the
//!   broker assigned. No reply within the confirm timeout is a failure.
//! - Entries are read with `XREADGROUP` into a local hand-off of one entry
//!   and acknowledged with `XACK` only when `next_job` or `next_result`
//!   takes them. Anything read but not yet taken stays pending in the group.
//! - On start the consumer first re-reads its own pending entries. Entries
//!   left pending by another consumer for longer than the claim idle time
//!   are taken over with `XAUTOCLAIM`, so messages a crashed process never
//!   took are delivered again even when it restarts under a new name.
//! - Malformed entries are acknowledged and deleted (reject without requeue).
//! - The connection is rebuilt lazily under a lock after any transport error,
//!   and the failed operation is retried once on the fresh connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, FromRedisValue, RedisError, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobQueue, QueueError, RESULTS_STREAM, TASKS_STREAM};
use crate::metrics;
use crate::scheduler::job::{AnalyzeJob, AnalyzeResult};

/// Field holding the JSON message in every stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Most entries taken over from other consumers in one `XAUTOCLAIM`.
const CLAIM_BATCH: usize = 10;

/// Consumer name unique to this process: `{hostname}-{pid}`.
pub fn default_consumer_name() -> String {
    let host = System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "mrva".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Which side of the queue this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Publishes jobs, consumes results.
    Server,
    /// Publishes results, consumes jobs.
    Agent,
}

impl QueueRole {
    /// The stream this role consumes.
    pub fn inbound_stream(&self) -> &'static str {
        match self {
            QueueRole::Server => RESULTS_STREAM,
            QueueRole::Agent => TASKS_STREAM,
        }
    }
}

/// Configuration for the Redis Streams queue.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL.
    pub url: String,
    /// Consumer group shared by all processes of one role.
    pub group: String,
    /// Consumer name of this process within the group.
    pub consumer: String,
    /// Maximum wait for a publish to be confirmed.
    pub confirm_timeout: Duration,
    /// Sleep between polls when the stream is empty.
    pub idle_interval: Duration,
    /// Initial connection attempts before giving up.
    pub connect_attempts: u32,
    /// Fixed delay between initial connection attempts.
    pub connect_backoff: Duration,
    /// Entries read ahead of `next_job`/`next_result`. They are pending,
    /// not acknowledged, until taken.
    pub buffer: usize,
    /// How long an entry must sit unacknowledged with another consumer
    /// before this one takes it over.
    pub claim_idle: Duration,
    /// Prepended to the stream keys, for sharing one Redis between
    /// deployments.
    pub key_prefix: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            group: "mrva".to_string(),
            consumer: default_consumer_name(),
            confirm_timeout: Duration::from_secs(2),
            idle_interval: Duration::from_secs(5),
            connect_attempts: 5,
            connect_backoff: Duration::from_secs(3),
            buffer: 1,
            claim_idle: Duration::from_secs(60),
            key_prefix: String::new(),
        }
    }
}

impl RedisQueueConfig {
    /// Creates a configuration for the given Redis URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_connect_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff = backoff;
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Redis key of `stream` under the configured prefix.
    pub fn stream_key(&self, stream: &str) -> String {
        format!("{}{}", self.key_prefix, stream)
    }
}

/// Returns true for errors that mean the connection itself is unusable.
fn is_transport_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// A stream entry as read from the broker.
#[derive(Debug)]
struct Entry {
    id: String,
    payload: Option<String>,
}

/// A decoded message still pending in the group under `entry_id`.
#[derive(Debug)]
struct Delivery<T> {
    entry_id: String,
    message: T,
}

/// Lazily (re)established connection shared by publisher and consumer.
struct RedisLink {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisLink {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Mutex::new(None),
        }
    }

    /// Returns the current connection, opening one if there is none.
    ///
    /// Holding the lock across the connect keeps concurrent callers from
    /// opening several connections after an invalidation.
    async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened Redis connection");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("Invalidated Redis connection");
        }
    }

    /// Runs `op`, rebuilding the connection and retrying once on a
    /// transport error.
    async fn execute<T, F>(&self, op: F) -> RedisResult<T>
    where
        F: Fn(MultiplexedConnection) -> BoxFuture<'static, RedisResult<T>> + Send + Sync,
        T: Send,
    {
        let mut retried = false;
        loop {
            let result = match self.connection().await {
                Ok(conn) => op(conn).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) if is_transport_error(&e) => {
                    self.invalidate().await;
                    if retried {
                        return Err(e);
                    }
                    warn!(error = %e, "Redis transport error, reconnecting");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn ping(&self) -> RedisResult<()> {
        self.execute(|mut conn| {
            async move {
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> RedisResult<()> {
        let stream = stream.to_string();
        let group = group.to_string();
        self.execute(move |mut conn| {
            let stream = stream.clone();
            let group = group.clone();
            async move {
                let created: RedisResult<()> =
                    conn.xgroup_create_mkstream(&stream, &group, "0").await;
                match created {
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                    other => other,
                }
            }
            .boxed()
        })
        .await
    }

    async fn xadd(&self, stream: &str, payload: String) -> RedisResult<String> {
        let stream = stream.to_string();
        self.execute(move |mut conn| {
            let stream = stream.clone();
            let payload = payload.clone();
            async move {
                let id: String = conn
                    .xadd(&stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
                    .await?;
                Ok(id)
            }
            .boxed()
        })
        .await
    }

    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: &str,
    ) -> RedisResult<Option<Entry>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let start = start.to_string();
        self.execute(move |mut conn| {
            let stream = stream.clone();
            let start = start.clone();
            let opts = StreamReadOptions::default()
                .group(group.clone(), consumer.clone())
                .count(1);
            async move {
                let reply: Option<StreamReadReply> =
                    conn.xread_options(&[&stream], &[&start], &opts).await?;
                Ok(reply
                    .and_then(|r| r.keys.into_iter().next())
                    .and_then(|key| key.ids.into_iter().next())
                    .map(|entry| Entry {
                        payload: entry.get::<String>(PAYLOAD_FIELD),
                        id: entry.id,
                    }))
            }
            .boxed()
        })
        .await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> RedisResult<()> {
        let (stream, group, id) = (stream.to_string(), group.to_string(), id.to_string());
        self.execute(move |mut conn| {
            let (stream, group, id) = (stream.clone(), group.clone(), id.clone());
            async move {
                let _: i64 = conn.xack(&stream, &group, &[&id]).await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Moves entries idle for at least `min_idle` from any consumer of the
    /// group to `consumer` and returns them.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> RedisResult<Vec<Entry>> {
        let (stream, group, consumer) = (stream.to_string(), group.to_string(), consumer.to_string());
        let min_idle_ms = min_idle.as_millis() as u64;
        self.execute(move |mut conn| {
            let (stream, group, consumer) = (stream.clone(), group.clone(), consumer.clone());
            async move {
                // Reply: [next-start, [[id, [field, value, ...]], ...], (deleted ids)]
                let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
                    .arg(&stream)
                    .arg(&group)
                    .arg(&consumer)
                    .arg(min_idle_ms)
                    .arg("0-0")
                    .arg("COUNT")
                    .arg(CLAIM_BATCH)
                    .query_async(&mut conn)
                    .await?;
                let Some(claimed) = reply.get(1) else {
                    return Ok(Vec::new());
                };
                let claimed = StreamClaimReply::from_redis_value(claimed)?;
                Ok(claimed
                    .ids
                    .into_iter()
                    .map(|entry| Entry {
                        payload: entry.get::<String>(PAYLOAD_FIELD),
                        id: entry.id,
                    })
                    .collect())
            }
            .boxed()
        })
        .await
    }

    /// Acknowledges and deletes an entry so it is never delivered again.
    async fn reject(&self, stream: &str, group: &str, id: &str) -> RedisResult<()> {
        self.ack(stream, group, id).await?;
        let (stream, id) = (stream.to_string(), id.to_string());
        self.execute(move |mut conn| {
            let (stream, id) = (stream.clone(), id.clone());
            async move {
                let _: i64 = conn.xdel(&stream, &[&id]).await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }
}

/// Queue over Redis Streams.
pub struct RedisStreamQueue {
    link: Arc<RedisLink>,
    config: RedisQueueConfig,
    role: QueueRole,
    tasks_key: String,
    results_key: String,
    jobs: Option<Mutex<mpsc::Receiver<Delivery<AnalyzeJob>>>>,
    results: Option<Mutex<mpsc::Receiver<Delivery<AnalyzeResult>>>>,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStreamQueue {
    /// Connects to Redis, creates the consumer group and starts consuming
    /// the role's inbound stream.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if Redis is still unreachable
    /// after the configured number of attempts.
    pub async fn connect(config: RedisQueueConfig, role: QueueRole) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let link = Arc::new(RedisLink::new(client));

        connect_with_retry(&link, &config).await?;
        let tasks_key = config.stream_key(TASKS_STREAM);
        let results_key = config.stream_key(RESULTS_STREAM);
        for stream in [&tasks_key, &results_key] {
            link.ensure_group(stream, &config.group).await?;
        }

        let shutdown = CancellationToken::new();
        let (jobs, results, handle) = match role {
            QueueRole::Agent => {
                let (tx, rx) = mpsc::channel(config.buffer.max(1));
                let handle = spawn_consumer::<AnalyzeJob>(&link, &config, tasks_key.clone(), tx, &shutdown);
                (Some(Mutex::new(rx)), None, handle)
            }
            QueueRole::Server => {
                let (tx, rx) = mpsc::channel(config.buffer.max(1));
                let handle =
                    spawn_consumer::<AnalyzeResult>(&link, &config, results_key.clone(), tx, &shutdown);
                (None, Some(Mutex::new(rx)), handle)
            }
        };

        info!(
            url = %config.url,
            group = %config.group,
            consumer = %config.consumer,
            inbound = %config.stream_key(role.inbound_stream()),
            "Connected to Redis queue"
        );

        Ok(Self {
            link,
            config,
            role,
            tasks_key,
            results_key,
            jobs,
            results,
            shutdown,
            consumer: Mutex::new(Some(handle)),
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Receives the next delivery and acknowledges it, handing ownership of
    /// the message to the caller.
    async fn take<T>(
        &self,
        rx: &Mutex<mpsc::Receiver<Delivery<T>>>,
        stream: &str,
    ) -> Option<T> {
        let delivery = rx.lock().await.recv().await?;
        if let Err(e) = self
            .link
            .ack(stream, &self.config.group, &delivery.entry_id)
            .await
        {
            // Still pending: a restart may deliver it a second time.
            error!(
                stream = stream,
                entry_id = %delivery.entry_id,
                error = %e,
                "Failed to acknowledge message"
            );
        }
        Some(delivery.message)
    }

    async fn publish<M: Serialize>(&self, stream: &str, message: &M) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let payload = serde_json::to_string(message)?;

        match tokio::time::timeout(self.config.confirm_timeout, self.link.xadd(stream, payload)).await
        {
            Ok(Ok(entry_id)) => {
                debug!(stream = stream, entry_id = %entry_id, "Publish confirmed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(stream = stream, error = %e, "Publish failed");
                metrics::record_publish_failure(stream);
                Err(e.into())
            }
            Err(_) => {
                self.link.invalidate().await;
                error!(
                    stream = stream,
                    timeout_ms = self.config.confirm_timeout.as_millis() as u64,
                    "Publish not confirmed"
                );
                metrics::record_publish_failure(stream);
                Err(QueueError::ConfirmTimeout {
                    stream: stream.to_string(),
                    timeout: self.config.confirm_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisStreamQueue {
    async fn publish_job(&self, job: &AnalyzeJob) -> Result<(), QueueError> {
        self.publish(&self.tasks_key, job).await
    }

    async fn next_job(&self) -> Option<AnalyzeJob> {
        match &self.jobs {
            Some(rx) => self.take(rx, &self.tasks_key).await,
            None => None,
        }
    }

    async fn publish_result(&self, result: &AnalyzeResult) -> Result<(), QueueError> {
        self.publish(&self.results_key, result).await
    }

    async fn next_result(&self) -> Option<AnalyzeResult> {
        match &self.results {
            Some(rx) => self.take(rx, &self.results_key).await,
            None => None,
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue consumer task panicked");
            }
        }
        self.link.invalidate().await;
        info!("Redis queue closed");
    }
}

async fn connect_with_retry(link: &RedisLink, config: &RedisQueueConfig) -> Result<(), QueueError> {
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match link.ping().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Redis connection attempt failed"
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(config.connect_backoff).await;
                }
            }
        }
    }

    Err(QueueError::ConnectionFailed(format!(
        "gave up after {} attempts: {}",
        attempts, last_error
    )))
}

fn spawn_consumer<T>(
    link: &Arc<RedisLink>,
    config: &RedisQueueConfig,
    stream: String,
    tx: mpsc::Sender<Delivery<T>>,
    shutdown: &CancellationToken,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(consume(
        Arc::clone(link),
        config.clone(),
        stream,
        tx,
        shutdown.clone(),
    ))
}

/// Consumer loop for one stream.
///
/// Never exits on a broker or decoding error; only shutdown or a closed
/// local channel ends it.
async fn consume<T>(
    link: Arc<RedisLink>,
    config: RedisQueueConfig,
    stream: String,
    tx: mpsc::Sender<Delivery<T>>,
    shutdown: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    let stream = stream.as_str();
    // Pending entries after `cursor` are replayed first; `None` reads new
    // ones with ">". Handed-over entries stay pending until taken, so the
    // cursor has to move past them.
    let mut cursor = Some("0".to_string());
    let mut last_claim: Option<Instant> = None;
    // Ids that may still sit in the hand-off; a claim must not duplicate them.
    let mut handed = HandedOver::new(config.buffer.max(1) + 1);
    info!(stream = stream, consumer = %config.consumer, "Queue consumer started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if cursor.is_none() && last_claim.map_or(true, |at| at.elapsed() >= config.claim_idle) {
            last_claim = Some(Instant::now());
            match link
                .claim_idle(stream, &config.group, &config.consumer, config.claim_idle)
                .await
            {
                Ok(entries) => {
                    if !entries.is_empty() {
                        info!(stream = stream, count = entries.len(), "Claimed idle entries");
                    }
                    let mut stopped = false;
                    for entry in entries {
                        if handed.contains(&entry.id) {
                            continue;
                        }
                        let id = entry.id.clone();
                        if !dispatch(&link, &config, stream, entry, &tx, &shutdown).await {
                            stopped = true;
                            break;
                        }
                        handed.push(id);
                    }
                    if stopped {
                        break;
                    }
                }
                Err(e) => error!(stream = stream, error = %e, "Failed to claim idle entries"),
            }
        }

        let start = cursor.as_deref().unwrap_or(">");
        let entry = match link
            .read_one(stream, &config.group, &config.consumer, start)
            .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if cursor.take().is_some() {
                    continue;
                }
                if idle(&shutdown, config.idle_interval).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                error!(stream = stream, error = %e, "Failed to read from stream");
                if idle(&shutdown, config.idle_interval).await {
                    break;
                }
                continue;
            }
        };

        if cursor.is_some() {
            cursor = Some(entry.id.clone());
        }
        let id = entry.id.clone();
        if !dispatch(&link, &config, stream, entry, &tx, &shutdown).await {
            break;
        }
        handed.push(id);
    }

    info!(stream = stream, "Queue consumer stopped");
}

/// The most recent entry ids handed to the local channel.
#[derive(Debug)]
struct HandedOver {
    ids: VecDeque<String>,
    limit: usize,
}

impl HandedOver {
    fn new(limit: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, id: String) {
        if self.ids.len() == self.limit {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|known| known == id)
    }
}

/// Decodes one entry and hands it to the local channel without
/// acknowledging it. Malformed entries are rejected.
///
/// Returns false once the consumer should stop.
async fn dispatch<T>(
    link: &RedisLink,
    config: &RedisQueueConfig,
    stream: &str,
    entry: Entry,
    tx: &mpsc::Sender<Delivery<T>>,
    shutdown: &CancellationToken,
) -> bool
where
    T: DeserializeOwned,
{
    let message = entry
        .payload
        .as_deref()
        .ok_or_else(|| "missing payload field".to_string())
        .and_then(|p| serde_json::from_str::<T>(p).map_err(|e| e.to_string()));

    let message = match message {
        Ok(message) => message,
        Err(e) => {
            error!(
                stream = stream,
                entry_id = %entry.id,
                error = %e,
                "Rejecting malformed message"
            );
            if let Err(e) = link.reject(stream, &config.group, &entry.id).await {
                error!(stream = stream, entry_id = %entry.id, error = %e, "Failed to reject message");
            }
            return true;
        }
    };

    let delivery = Delivery {
        entry_id: entry.id,
        message,
    };
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = tx.send(delivery) => {
            if sent.is_err() {
                debug!(stream = stream, "Local receiver dropped, stopping consumer");
                return false;
            }
            true
        }
    }
}

/// Sleeps for `interval`; returns true if shutdown was requested meanwhile.
async fn idle(shutdown: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}
