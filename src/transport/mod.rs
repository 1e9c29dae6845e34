//! Network transport - one logical Electrum connection per session.
//!
//! # Responsibilities
//!
//! - request/response calls with a per-call deadline
//! - transparent reconnect with exponential backoff, bounded by `RetryPolicy`
//! - a poller task forwarding server pushes over an mpsc channel
//!
//! ```text
//! Session (mutex) ──call()──> Transport ──> Arc<dyn Backend> ──> Electrum server
//!        ^                        │
//!        └──── TransportEvent ────┘  (poller task: NewBlock, ScriptActivity,
//!                                     Reconnected, Disconnected)
//! ```

mod backend;
mod electrum;

pub use backend::{Backend, BackendError, Connector, Notification, ScriptHistory, ScriptUnspent};
pub use electrum::ElectrumConnector;

use crate::config::{RetryPolicy, SessionConfig};
use crate::error::{Error, Result};
use crate::network::Endpoint;
use bitcoin::ScriptBuf;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    NewBlock { height: u32 },
    ScriptActivity { script: ScriptBuf },
    Reconnected { generation: u64 },
    /// Poller lost the connection it was started on.
    Disconnected { generation: u64, reason: String },
}

impl From<Notification> for TransportEvent {
    fn from(n: Notification) -> Self {
        match n {
            Notification::NewBlock { height } => TransportEvent::NewBlock { height },
            Notification::ScriptActivity { script } => TransportEvent::ScriptActivity { script },
        }
    }
}

/// Batch answers must line up one-to-one with the request.
pub(crate) fn expect_batch<T>(what: &str, expected: usize, items: Vec<T>) -> Result<Vec<T>> {
    if items.len() != expected {
        return Err(Error::Query(format!("{}: expected {} results, got {}", what, expected, items.len())));
    }
    Ok(items)
}

pub struct Transport {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    retry: RetryPolicy,
    request_timeout: Duration,
    poll_interval: Duration,
    backend: Option<Arc<dyn Backend>>,
    /// Bumped on every successful connect.
    generation: u64,
    watched: HashSet<ScriptBuf>,
    notifications: bool,
    poller: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Single connect attempt; failure is a `Connection` error, not retried.
    pub async fn open(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        if endpoint.tls && !endpoint.validate_domain {
            warn!("TLS certificate validation disabled for {} - insecure, test use only", endpoint.host_port);
        }
        let backend = connector
            .connect(&endpoint)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", endpoint, e)))?;
        info!("Connected to {}", endpoint);

        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                connector,
                endpoint,
                retry: config.retry,
                request_timeout: config.request_timeout,
                poll_interval: config.poll_interval,
                backend: Some(backend),
                generation: 1,
                watched: HashSet::new(),
                notifications: false,
                poller: None,
                events,
            },
            rx,
        ))
    }

    pub fn endpoint(&self) -> &Endpoint { &self.endpoint }
    pub fn is_connected(&self) -> bool { self.backend.is_some() }
    pub fn generation(&self) -> u64 { self.generation }

    /// Run `op` against the live backend, reconnecting on transient failures.
    ///
    /// A call that outlives its deadline fails with `Timeout`; a late result is
    /// dropped with the future. Rejected or malformed responses are `Query`
    /// errors and are never retried.
    pub async fn call<T, F, Fut>(&mut self, what: &'static str, timeout: Option<Duration>, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let deadline = timeout.unwrap_or(self.request_timeout);
        let mut failures = 0u32;
        loop {
            let backend = match self.backend.clone() {
                Some(backend) => backend,
                None => self.reconnect().await?,
            };
            debug!("{} (generation {})", what, self.generation);

            match tokio::time::timeout(deadline, op(backend)).await {
                Err(_) => {
                    warn!("{} timed out after {:?}", what, deadline);
                    return Err(Error::Timeout(deadline));
                }
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => {
                    failures += 1;
                    warn!("{} failed ({}/{}): {}", what, failures, self.retry.max_attempts, e);
                    self.mark_down();
                    if failures >= self.retry.max_attempts {
                        return Err(Error::ConnectionLost { attempts: failures, reason: e.to_string() });
                    }
                }
                Ok(Err(e)) => return Err(Error::Query(format!("{}: {}", what, e))),
            }
        }
    }

    /// Reconnect now if the connection is down.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.backend.is_none() {
            self.reconnect().await?;
        }
        Ok(())
    }

    /// Subscribe to pushes for scripts not yet watched.
    pub async fn watch(&mut self, scripts: &[ScriptBuf]) -> Result<()> {
        let fresh: Vec<ScriptBuf> = scripts.iter().filter(|s| !self.watched.contains(*s)).cloned().collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let batch = Arc::new(fresh.clone());
        self.call("subscribe_scripts", None, move |b| {
            let batch = batch.clone();
            async move { b.subscribe_scripts(&batch).await }
        })
        .await?;
        self.watched.extend(fresh);
        Ok(())
    }

    /// Forget subscriptions; used when the authenticated wallet is dropped.
    pub fn unwatch_all(&mut self) {
        self.watched.clear();
    }

    /// Start (or restart) the poller on the current connection.
    pub fn start_notifications(&mut self) {
        self.notifications = true;
        self.spawn_poller();
    }

    /// Apply a poller `Disconnected` event if it refers to the live connection.
    pub fn handle_disconnect(&mut self, generation: u64) -> bool {
        if generation == self.generation && self.backend.is_some() {
            self.mark_down();
            true
        } else {
            false
        }
    }

    /// Drop the connection; the next call reconnects.
    pub fn mark_down(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.backend = None;
    }

    pub fn close(&mut self) {
        self.notifications = false;
        self.watched.clear();
        self.mark_down();
        info!("Closed connection to {}", self.endpoint);
    }

    async fn reconnect(&mut self) -> Result<Arc<dyn Backend>> {
        let mut last = String::from("not connected");
        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay(attempt);
            info!("Reconnecting to {} in {:?} (attempt {}/{})", self.endpoint, delay, attempt + 1, self.retry.max_attempts);
            tokio::time::sleep(delay).await;

            let backend = match self.connector.connect(&self.endpoint).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Reconnect to {} failed: {}", self.endpoint, e);
                    last = e.to_string();
                    continue;
                }
            };
            if !self.watched.is_empty() {
                let scripts: Vec<ScriptBuf> = self.watched.iter().cloned().collect();
                if let Err(e) = backend.subscribe_scripts(&scripts).await {
                    warn!("Resubscribe after reconnect failed: {}", e);
                    last = e.to_string();
                    continue;
                }
            }

            self.generation += 1;
            self.backend = Some(backend.clone());
            if self.notifications {
                self.spawn_poller();
            }
            let _ = self.events.send(TransportEvent::Reconnected { generation: self.generation });
            info!("Reconnected to {} (generation {})", self.endpoint, self.generation);
            return Ok(backend);
        }
        Err(Error::ConnectionLost { attempts: self.retry.max_attempts, reason: last })
    }

    fn spawn_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        let Some(backend) = self.backend.clone() else { return };
        let events = self.events.clone();
        let generation = self.generation;
        let interval = self.poll_interval;

        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match backend.poll_notifications().await {
                    Ok(notes) => {
                        for note in notes {
                            if events.send(note.into()).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) if e.is_transient() => {
                        let _ = events.send(TransportEvent::Disconnected { generation, reason: e.to_string() });
                        return;
                    }
                    Err(e) => debug!("Notification poll: {}", e),
                }
            }
        }));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
