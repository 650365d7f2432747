//! Connection supervision.
//!
//! The `ConnectionSupervisor` owns one slot per configured server and drives
//! each through `Disconnected -> Connecting -> Validating -> Connected`,
//! retrying with exponential backoff. Servers are connected concurrently;
//! one server's failure never blocks or aborts the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::sleep;

use super::client::{ClientTimeouts, ProtocolClient};
use super::errors::McpError;
use super::transport::TransportSession;
use super::types::{ConnectionState, ServerSpec, ToolDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default number of connection attempts per server.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt (doubles each time).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── Connector ───────────────────────────────────────────────────────────────

/// Produces a handshaken client for one server spec.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ServerSpec) -> Result<ProtocolClient, McpError>;
}

/// Launches the server as a subprocess and talks to it over stdio.
#[derive(Debug, Clone, Default)]
pub struct StdioConnector {
    timeouts: ClientTimeouts,
}

impl StdioConnector {
    pub fn new(timeouts: ClientTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<ProtocolClient, McpError> {
        let session = TransportSession::open(spec).await?;
        ProtocolClient::connect(session, self.timeouts).await
    }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the 1-based `attempt`: none for the first, then
    /// `base, 2*base, 4*base, ...`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor)
    }
}

// ─── Slots & Reports ─────────────────────────────────────────────────────────

struct ServerSlot {
    spec: ServerSpec,
    state: ConnectionState,
    client: Option<ProtocolClient>,
    /// Catalog from the most recent successful `tools/list`.
    catalog: Vec<ToolDescriptor>,
    /// Set while no `tools/list` has succeeded since the slot connected.
    catalog_stale: bool,
    /// Order of entry into `Connected`.
    connected_seq: Option<u64>,
}

impl ServerSlot {
    fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            state: ConnectionState::Disconnected,
            client: None,
            catalog: Vec::new(),
            catalog_stale: false,
            connected_seq: None,
        }
    }

    /// Stored state, with `Degraded` substituted for a soft-disconnected client.
    fn effective_state(&self) -> ConnectionState {
        match (&self.state, &self.client) {
            (ConnectionState::Connected, Some(client)) if !client.is_connected() => {
                ConnectionState::Degraded
            }
            (state, _) => *state,
        }
    }

    fn is_available(&self) -> bool {
        self.effective_state() == ConnectionState::Connected
    }

    /// Release the client; returns any close error.
    async fn teardown(&mut self) -> Option<McpError> {
        self.state = ConnectionState::Closing;
        let result = match self.client.take() {
            Some(client) => client.disconnect().await.err(),
            None => None,
        };
        self.catalog.clear();
        self.catalog_stale = false;
        self.connected_seq = None;
        self.state = ConnectionState::Disconnected;
        result
    }
}

/// Outcome of `ConnectionSupervisor::initialize`.
#[derive(Debug, Default)]
pub struct InitReport {
    /// Servers that reached `Connected`, in connection order.
    pub connected: Vec<String>,
    /// Disabled servers, never attempted.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, McpError)>,
}

// ─── ConnectionSupervisor ────────────────────────────────────────────────────

/// Owns every named `ProtocolClient` and its connection state.
pub struct ConnectionSupervisor {
    slots: Vec<ServerSlot>,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    next_seq: AtomicU64,
}

impl ConnectionSupervisor {
    /// Register servers in declaration order. Later specs reusing a name are
    /// ignored.
    pub fn new(specs: Vec<ServerSpec>, connector: Arc<dyn Connector>, retry: RetryPolicy) -> Self {
        let mut slots: Vec<ServerSlot> = Vec::with_capacity(specs.len());
        for spec in specs {
            if slots.iter().any(|s| s.spec.name == spec.name) {
                tracing::warn!(server = %spec.name, "duplicate server name ignored");
                continue;
            }
            slots.push(ServerSlot::new(spec));
        }
        Self {
            slots,
            connector,
            retry,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Connect every enabled, disconnected server concurrently.
    ///
    /// Never fails as a whole: per-server failures land in the report.
    pub async fn initialize(&mut self) -> InitReport {
        let Self {
            slots,
            connector,
            retry,
            next_seq,
        } = self;
        let connector: &dyn Connector = &**connector;
        let retry: &RetryPolicy = retry;
        let next_seq: &AtomicU64 = next_seq;

        let mut report = InitReport::default();
        let mut pending = Vec::new();
        for slot in slots.iter_mut() {
            if !slot.spec.enabled {
                tracing::info!(server = %slot.spec.name, "server disabled, skipping");
                report.skipped.push(slot.spec.name.clone());
            } else if slot.state == ConnectionState::Disconnected {
                pending.push(connect_slot(slot, connector, retry, next_seq));
            }
        }

        for (name, result) in join_all(pending).await {
            if let Err(e) = result {
                tracing::error!(server = %name, error = %e, "server unavailable");
                report.failed.push((name, e));
            }
        }

        report.connected = self.get_available_servers();
        tracing::info!(
            connected = report.connected.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "connection supervisor initialized"
        );
        report
    }

    /// Names of `Connected` servers, in connection order.
    pub fn get_available_servers(&self) -> Vec<String> {
        self.available_slots()
            .into_iter()
            .map(|slot| slot.spec.name.clone())
            .collect()
    }

    /// Effective state of a server, `None` if the name is not registered.
    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.slot(name).map(ServerSlot::effective_state)
    }

    /// The live client for a server, regardless of health.
    pub fn client(&self, name: &str) -> Option<&ProtocolClient> {
        self.slot(name).and_then(|slot| slot.client.as_ref())
    }

    /// Catalogs of `Connected` servers, oldest connection first.
    pub(crate) fn connected_catalogs(&self) -> Vec<(&str, &[ToolDescriptor])> {
        self.available_slots()
            .into_iter()
            .map(|slot| (slot.spec.name.as_str(), slot.catalog.as_slice()))
            .collect()
    }

    /// Re-fetch the tool catalog of every `Connected` server.
    pub async fn refresh_catalogs(&mut self) -> Vec<(String, McpError)> {
        let mut errors = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.is_available()) {
            let Some(client) = slot.client.as_ref() else {
                continue;
            };
            match client.list_tools().await {
                Ok(tools) => {
                    slot.catalog = tools;
                    slot.catalog_stale = false;
                }
                Err(e) => {
                    tracing::warn!(server = %slot.spec.name, error = %e, "catalog refresh failed");
                    errors.push((slot.spec.name.clone(), e));
                }
            }
        }
        errors
    }

    /// Re-check every `Degraded` server and re-fetch stale catalogs.
    ///
    /// A successful `tools/list` restores `Connected` with a fresh catalog; a failed
    /// one tears a `Degraded` client down to `Disconnected`. A failed fetch
    /// for a stale `Connected` server leaves the slot in place; a timeout
    /// there degrades the client like any other call. Returns the torn-down
    /// servers with the error that ended them.
    pub async fn health_check(&mut self) -> Vec<(String, McpError)> {
        let mut lost = Vec::new();
        for slot in self.slots.iter_mut() {
            let state = slot.effective_state();
            let stale = state == ConnectionState::Connected && slot.catalog_stale;
            if state != ConnectionState::Degraded && !stale {
                continue;
            }
            let Some(client) = slot.client.as_ref() else {
                continue;
            };
            match client.list_tools().await {
                Ok(tools) => {
                    client.mark_healthy();
                    slot.catalog = tools;
                    slot.catalog_stale = false;
                    tracing::info!(
                        server = %slot.spec.name,
                        tools = slot.catalog.len(),
                        "server catalog refreshed"
                    );
                }
                Err(e) if stale => {
                    tracing::warn!(server = %slot.spec.name, error = %e, "catalog still unavailable");
                }
                Err(e) => {
                    tracing::warn!(server = %slot.spec.name, error = %e, "degraded server lost");
                    if let Some(close_err) = slot.teardown().await {
                        tracing::debug!(server = %slot.spec.name, error = %close_err, "close failed");
                    }
                    lost.push((slot.spec.name.clone(), e));
                }
            }
        }
        lost
    }

    /// Disconnect every client. Idempotent; close errors are collected and
    /// returned, never raised.
    pub async fn shutdown(&mut self) -> Vec<(String, McpError)> {
        let mut errors = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.state == ConnectionState::Disconnected && slot.client.is_none() {
                continue;
            }
            if let Some(e) = slot.teardown().await {
                tracing::warn!(server = %slot.spec.name, error = %e, "error closing server");
                errors.push((slot.spec.name.clone(), e));
            } else {
                tracing::debug!(server = %slot.spec.name, "server disconnected");
            }
        }
        errors
    }

    fn slot(&self, name: &str) -> Option<&ServerSlot> {
        self.slots.iter().find(|s| s.spec.name == name)
    }

    fn available_slots(&self) -> Vec<&ServerSlot> {
        let mut available: Vec<&ServerSlot> =
            self.slots.iter().filter(|s| s.is_available()).collect();
        available.sort_by_key(|s| s.connected_seq);
        available
    }
}

/// Drive one slot through its connect-with-retry state machine.
async fn connect_slot(
    slot: &mut ServerSlot,
    connector: &dyn Connector,
    retry: &RetryPolicy,
    next_seq: &AtomicU64,
) -> (String, Result<(), McpError>) {
    let name = slot.spec.name.clone();
    let mut last_error: Option<McpError> = None;

    for attempt in 1..=retry.max_attempts {
        let delay = retry.delay_before(attempt);
        if !delay.is_zero() {
            tracing::info!(
                server = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying connection"
            );
            sleep(delay).await;
        }

        slot.state = ConnectionState::Connecting;
        let client = match connector.connect(&slot.spec).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(server = %name, attempt, error = %e, "connection attempt failed");
                slot.state = ConnectionState::Disconnected;
                last_error = Some(e);
                continue;
            }
        };

        slot.state = ConnectionState::Validating;
        match client.list_tools().await {
            Ok(tools) => {
                slot.catalog = tools;
                slot.catalog_stale = false;
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "initial tool listing failed, assuming usable");
                slot.catalog = Vec::new();
                slot.catalog_stale = true;
            }
        }
        client.mark_healthy();

        slot.client = Some(client);
        slot.connected_seq = Some(next_seq.fetch_add(1, Ordering::SeqCst));
        slot.state = ConnectionState::Connected;
        tracing::info!(
            server = %name,
            attempt,
            tools = slot.catalog.len(),
            "server connected"
        );
        return (name, Ok(()));
    }

    let last_error = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no connection attempts allowed".into());
    let err = McpError::RetriesExhausted {
        name: name.clone(),
        attempts: retry.max_attempts,
        last_error,
    };
    (name, Err(err))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
