//! Live-update fan-out.
//!
//! Change notifications from the bus listener and from control requests all
//! land on one capacity-1 trigger channel. The run loop drains it, enumerates
//! players once, resolves every distinct client filter and pushes the result.
//! A burst of triggers while an evaluation is pending or running costs
//! exactly one more evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::model::PlayerSnapshot;
use crate::selector::{self, SelectionMemory};

/// What the hub needs from the rest of the daemon to compute a push.
#[async_trait]
pub trait PlayerSource: Send + Sync {
    async fn list_players(&self) -> Result<Vec<PlayerSnapshot>>;

    fn memory(&self) -> &SelectionMemory;
}

/// Write half of a client connection.
#[async_trait]
pub trait ClientSink: Send {
    async fn send(&mut self, payload: String) -> anyhow::Result<()>;

    async fn close(&mut self);
}

/// Payload pushed to clients: the resolved player, or an explicit error they
/// can render without reconnecting.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum HubMessage<'a> {
    Player(&'a PlayerSnapshot),
    Error { error: String },
}

impl HubMessage<'_> {
    fn from_selection(result: &Result<PlayerSnapshot>) -> HubMessage<'_> {
        match result {
            Ok(player) => HubMessage::Player(player),
            Err(err) => HubMessage::Error {
                error: err.to_string(),
            },
        }
    }
}

pub struct HubClient {
    id: u64,
    filter: Option<String>,
    sink: Mutex<Box<dyn ClientSink>>,
}

impl HubClient {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    // The sink mutex serializes pushes to one client.
    async fn push(&self, payload: &str, limit: Duration) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        timeout(limit, sink.send(payload.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("push timed out after {limit:?}"))?
    }
}

/// Cheap handle for requesting a re-evaluation.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        // Full means an evaluation is already pending.
        let _ = self.tx.try_send(());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubTimeouts {
    pub evaluate: Duration,
    pub push: Duration,
}

impl Default for HubTimeouts {
    fn default() -> Self {
        Self {
            evaluate: Duration::from_millis(1500),
            push: Duration::from_secs(2),
        }
    }
}

pub struct Hub {
    clients: RwLock<HashMap<u64, Arc<HubClient>>>,
    next_id: AtomicU64,
    trigger: Trigger,
    pending: Mutex<mpsc::Receiver<()>>,
    timeouts: HubTimeouts,
}

impl Hub {
    #[must_use]
    pub fn new(timeouts: HubTimeouts) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            trigger: Trigger { tx },
            pending: Mutex::new(rx),
            timeouts,
        }
    }

    #[must_use]
    pub fn trigger_handle(&self) -> Trigger {
        self.trigger.clone()
    }

    pub fn trigger(&self) {
        self.trigger.fire();
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Adds a client, pushes its first snapshot right away and schedules a
    /// global re-evaluation. A failed first push unregisters the client.
    pub async fn register(
        &self,
        source: &dyn PlayerSource,
        filter: Option<String>,
        sink: Box<dyn ClientSink>,
    ) -> anyhow::Result<Arc<HubClient>> {
        let client = Arc::new(HubClient {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            filter: filter.filter(|f| !f.is_empty()),
            sink: Mutex::new(sink),
        });
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id, client.clone());
        debug!(client = client.id, filter = ?client.filter, "hub client registered");
        self.trigger();

        let players = self.evaluate(source).await;
        let selection = players.and_then(|players| {
            selector::select(&players, client.filter(), source.memory())
        });
        let payload = serde_json::to_string(&HubMessage::from_selection(&selection))?;
        if let Err(err) = client.push(&payload, self.timeouts.push).await {
            self.unregister(client.id).await;
            return Err(err);
        }
        Ok(client)
    }

    pub async fn unregister(&self, id: u64) {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(client) = removed {
            client.sink.lock().await.close().await;
            debug!(client = id, "hub client removed");
        }
    }

    /// Drives evaluations until `cancel` fires.
    pub async fn run(&self, source: &dyn PlayerSource, cancel: CancellationToken) {
        let mut pending = self.pending.lock().await;
        loop {
            let signal = tokio::select! {
                () = cancel.cancelled() => return,
                signal = pending.recv() => signal,
            };
            if signal.is_none() {
                return;
            }
            while pending.try_recv().is_ok() {}

            tokio::select! {
                () = cancel.cancelled() => return,
                () = self.broadcast(source) => {}
            }
        }
    }

    /// One evaluation cycle: a single enumeration shared by every filter.
    pub async fn broadcast(&self, source: &dyn PlayerSource) {
        let clients: Vec<Arc<HubClient>> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if clients.is_empty() {
            return;
        }

        // Auto-mode (None) sorts first so explicit filters see its memory update.
        let mut groups: BTreeMap<Option<String>, Vec<Arc<HubClient>>> = BTreeMap::new();
        for client in clients {
            groups.entry(client.filter.clone()).or_default().push(client);
        }

        let players = self.evaluate(source).await;
        let mut failed = Vec::new();
        for (filter, group) in groups {
            let selection = players
                .as_ref()
                .map(|players| selector::select(players, filter.as_deref(), source.memory()));
            let message = match &selection {
                Ok(result) => HubMessage::from_selection(result),
                Err(err) => HubMessage::Error {
                    error: err.to_string(),
                },
            };
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%err, "failed to encode hub payload");
                    continue;
                }
            };
            let results = join_all(
                group
                    .iter()
                    .map(|client| client.push(&payload, self.timeouts.push)),
            )
            .await;
            for (client, result) in group.iter().zip(results) {
                if let Err(err) = result {
                    warn!(client = client.id, %err, "ws broadcast failed");
                    failed.push(client.id);
                }
            }
        }

        for id in failed {
            self.unregister(id).await;
        }
    }

    async fn evaluate(&self, source: &dyn PlayerSource) -> Result<Vec<PlayerSnapshot>> {
        let limit = self.timeouts.evaluate;
        match timeout(limit, source.list_players()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?limit, "player enumeration timed out");
                Err(RemoteError::Timeout(limit))
            }
        }
    }
}
