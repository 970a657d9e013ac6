//! Fire-and-forget usage telemetry.
//!
//! Events go into a bounded queue with `try_send`; a background task ships
//! them in batches when a batch fills, on a timer, and on explicit
//! [`TelemetrySink::flush`]. A full queue drops events instead of waiting,
//! and delivery failures are logged and forgotten.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::debug;

use crate::config::PrevueConfig;

/// Future returned by [`TelemetryTransport::send_batch`].
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// One telemetry record.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A named occurrence with properties.
    Capture {
        /// Anonymous installation id.
        distinct_id: String,
        /// Event name.
        event: String,
        /// Free-form properties.
        properties: Map<String, Value>,
        /// When the event happened.
        timestamp: DateTime<Utc>,
    },
    /// Traits attached to the installation id.
    Identify {
        /// Anonymous installation id.
        distinct_id: String,
        /// Free-form traits.
        traits: Map<String, Value>,
        /// When the traits were recorded.
        timestamp: DateTime<Utc>,
    },
}

/// Delivers batches of events.
pub trait TelemetryTransport: Send + Sync + 'static {
    /// Sends one batch.
    fn send_batch(&self, batch: Vec<TelemetryEvent>) -> TransportFuture<'_>;
}

/// Posts batches as JSON to an HTTP endpoint.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Builds a transport posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the client construction failure as text.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[derive(Serialize)]
struct BatchBody<'a> {
    batch: &'a [TelemetryEvent],
}

impl TelemetryTransport for HttpTransport {
    fn send_batch(&self, batch: Vec<TelemetryEvent>) -> TransportFuture<'_> {
        Box::pin(async move {
            self.client
                .post(&self.endpoint)
                .json(&BatchBody { batch: &batch })
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map(drop)
                .map_err(|err| err.to_string())
        })
    }
}

/// Queue and batching limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TelemetryOptions {
    /// Events held before new ones are dropped.
    pub capacity: usize,
    /// Events per delivered batch.
    pub batch_size: usize,
    /// Timer flush period.
    pub flush_interval: Duration,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            capacity: 256,
            batch_size: 32,
            flush_interval: Duration::from_secs(10),
        }
    }
}

enum Command {
    Event(TelemetryEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle used by the rest of the crate to record events.
#[derive(Debug)]
pub struct TelemetrySink {
    distinct_id: String,
    queue: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySink {
    /// A sink that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            distinct_id: String::new(),
            queue: None,
            task: None,
            dropped: Arc::default(),
        }
    }

    /// Starts the background task delivering through `transport`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        distinct_id: impl Into<String>,
        transport: impl TelemetryTransport,
        options: TelemetryOptions,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(options.capacity.max(1));
        let task = tokio::spawn(deliver(receiver, transport, options));
        Self {
            distinct_id: distinct_id.into(),
            queue: Some(queue),
            task: Some(task),
            dropped: Arc::default(),
        }
    }

    /// Builds the sink selected by configuration. Telemetry stays off
    /// unless it is enabled and an endpoint is set.
    #[must_use]
    pub fn from_config(config: &PrevueConfig) -> Self {
        let Some(endpoint) = config
            .telemetry_endpoint
            .as_deref()
            .filter(|_| config.telemetry_enabled)
        else {
            return Self::disabled();
        };
        match HttpTransport::new(endpoint) {
            Ok(transport) => Self::start(
                installation_id(&config.profile),
                transport,
                TelemetryOptions::default(),
            ),
            Err(err) => {
                debug!(error = %err, "telemetry disabled");
                Self::disabled()
            }
        }
    }

    /// Returns `true` when events are delivered somewhere.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Events dropped because the queue was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records `event` without waiting.
    pub fn capture(&self, event: &str, properties: Map<String, Value>) {
        self.enqueue(TelemetryEvent::Capture {
            distinct_id: self.distinct_id.clone(),
            event: event.to_owned(),
            properties,
            timestamp: Utc::now(),
        });
    }

    /// Records installation traits without waiting.
    pub fn identify(&self, traits: Map<String, Value>) {
        self.enqueue(TelemetryEvent::Identify {
            distinct_id: self.distinct_id.clone(),
            traits,
            timestamp: Utc::now(),
        });
    }

    fn enqueue(&self, event: TelemetryEvent) {
        let Some(queue) = &self.queue else {
            return;
        };
        if queue.try_send(Command::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delivers everything queued so far.
    pub async fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if queue.send(Command::Flush(ack)).await.is_ok() {
            drop(done.await);
        }
    }

    /// Drains the queue and stops the background task, giving up after
    /// `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        drop(self.queue.take());
        let Some(task) = self.task.take() else {
            return;
        };
        if timeout(grace, task).await.is_err() {
            debug!("telemetry drain abandoned");
        }
    }
}

/// Anonymous id derived from the profile name.
#[must_use]
pub fn installation_id(profile: &str) -> String {
    let digest = Sha256::digest(format!("prevue:{profile}").as_bytes());
    hex::encode(digest.get(..16).unwrap_or_default())
}

async fn deliver(
    mut receiver: mpsc::Receiver<Command>,
    transport: impl TelemetryTransport,
    options: TelemetryOptions,
) {
    let mut batch = Vec::with_capacity(options.batch_size);
    let mut ticker = interval(options.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Event(event)) => {
                    batch.push(event);
                    if batch.len() >= options.batch_size.max(1) {
                        send(&transport, &mut batch).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    send(&transport, &mut batch).await;
                    drop(ack.send(()));
                }
                None => {
                    send(&transport, &mut batch).await;
                    return;
                }
            },
            _ = ticker.tick() => send(&transport, &mut batch).await,
        }
    }
}

async fn send(transport: &impl TelemetryTransport, batch: &mut Vec<TelemetryEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    match transport.send_batch(events).await {
        Ok(()) => debug!(count, "telemetry batch delivered"),
        Err(err) => debug!(count, error = %err, "telemetry batch dropped"),
    }
}
