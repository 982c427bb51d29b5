//! # Stream Synchronization Client
//!
//! Keeps a locally materialized list consistent with a server-side push
//! stream. One driver task owns the connection lifecycle: it connects,
//! applies envelopes to the shared state, and on transport failure tears
//! the connection down and schedules exactly one reconnect attempt through
//! a registry-managed timer. The logical subscription survives across
//! reconnects even though the concrete transport is replaced every time.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::core::registry::{CleanupRegistry, ManagedOperation};
use crate::sync::envelope::{self, ItemMapper, SnapshotMapper};
use crate::sync::transport::{StreamConnection, StreamError, StreamTransport};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Consumer-facing configuration for one subscription.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub endpoint: String,
    /// Reconnect automatically after a transport error.
    pub auto_reconnect: bool,
    /// Fixed delay between a transport error and the next attempt.
    pub reconnect_interval: Duration,
    /// Bearer token sent with the subscription request.
    pub auth_token: Option<String>,
    /// Optional watchdog: treat a stream with no events (heartbeats
    /// included) for this long as failed. Off by default.
    pub idle_timeout: Option<Duration>,
}

impl StreamOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            auth_token: None,
            idle_timeout: None,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new("")
    }
}

pub type OpenHook = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional mapping functions and lifecycle callbacks.
pub struct StreamHandlers<T> {
    pub map_snapshot: Option<SnapshotMapper<T>>,
    pub map_item: Option<ItemMapper<T>>,
    pub on_open: Option<OpenHook>,
    pub on_error: Option<ErrorHook>,
}

impl<T> Default for StreamHandlers<T> {
    fn default() -> Self {
        Self {
            map_snapshot: None,
            map_item: None,
            on_open: None,
            on_error: None,
        }
    }
}

/// The reactive triple consumers observe.
#[derive(Debug, Clone)]
pub struct StreamState<T> {
    pub items: Vec<T>,
    pub connected: bool,
    pub error: Option<String>,
}

impl<T> StreamState<T> {
    fn initial() -> Self {
        Self {
            items: Vec::new(),
            connected: false,
            error: None,
        }
    }
}

/// Connection lifecycle phases. `Closed` is terminal and only reached by
/// explicit teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    ClosedWithError,
    Closed,
}

/// Inputs to the phase transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Opened,
    TransportFailed,
    ReconnectDue,
    Teardown,
}

/// Pure transition function for the connection state machine, kept free of
/// transport detail so reconnect policy is testable on its own.
pub fn next_phase(phase: ConnectionPhase, signal: ConnectionSignal) -> ConnectionPhase {
    match (phase, signal) {
        (_, ConnectionSignal::Teardown) => ConnectionPhase::Closed,
        (ConnectionPhase::Closed, _) => ConnectionPhase::Closed,
        (ConnectionPhase::Connecting, ConnectionSignal::Opened) => ConnectionPhase::Open,
        (ConnectionPhase::Connecting, ConnectionSignal::TransportFailed) => {
            ConnectionPhase::ClosedWithError
        }
        (ConnectionPhase::Open, ConnectionSignal::TransportFailed) => {
            ConnectionPhase::ClosedWithError
        }
        (ConnectionPhase::ClosedWithError, ConnectionSignal::ReconnectDue) => {
            ConnectionPhase::Connecting
        }
        (unchanged, _) => unchanged,
    }
}

/// Handle to one logical subscription. Dropping it (or registry cleanup)
/// cancels the driver task, the live transport and any pending reconnect.
pub struct StreamClient<T> {
    state_tx: Arc<watch::Sender<StreamState<T>>>,
    state_rx: watch::Receiver<StreamState<T>>,
    driver: ManagedOperation,
}

impl<T> StreamClient<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Opens the subscription and starts the driver task. The task runs as
    /// a registry-managed operation so an abandoned client is still torn
    /// down by registry cleanup.
    pub fn spawn<Tr>(
        transport: Tr,
        options: StreamOptions,
        handlers: StreamHandlers<T>,
        registry: CleanupRegistry,
    ) -> Self
    where
        Tr: StreamTransport,
    {
        let (tx, rx) = watch::channel(StreamState::initial());
        let state_tx = Arc::new(tx);
        let driver = registry.managed_operation();
        let token = driver.token();

        let driver_state = Arc::clone(&state_tx);
        tokio::spawn(async move {
            drive_stream(transport, options, handlers, driver_state, registry, token).await;
        });

        Self {
            state_tx,
            state_rx: rx,
            driver,
        }
    }

    /// A receiver over the reactive triple; `changed()` fires on every state
    /// mutation (heartbeats and vetoed items produce none).
    pub fn subscribe(&self) -> watch::Receiver<StreamState<T>> {
        self.state_rx.clone()
    }

    pub fn connected(&self) -> bool {
        self.state_rx.borrow().connected
    }

    pub fn error(&self) -> Option<String> {
        self.state_rx.borrow().error.clone()
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state_rx.borrow().items.clone()
    }

    /// Empties the materialized list without touching the connection.
    pub fn clear(&self) {
        self.state_tx.send_modify(|state| state.items.clear());
    }

    /// Terminal teardown: cancels the driver, which closes the transport
    /// and any pending reconnect timer.
    pub fn shutdown(&self) {
        self.driver.cancel();
    }
}

impl<T> Drop for StreamClient<T> {
    fn drop(&mut self) {
        self.driver.cancel();
    }
}

enum ReadOutcome {
    TransportFailed(String),
    Teardown,
}

async fn drive_stream<T, Tr>(
    transport: Tr,
    options: StreamOptions,
    handlers: StreamHandlers<T>,
    state: Arc<watch::Sender<StreamState<T>>>,
    registry: CleanupRegistry,
    token: CancellationToken,
) where
    T: DeserializeOwned + Send + Sync + 'static,
    Tr: StreamTransport,
{
    let mut phase = ConnectionPhase::Connecting;

    while phase != ConnectionPhase::Closed {
        // --- Connect ---
        log::info!("Connecting to stream endpoint: {}", options.endpoint);
        let attempt = tokio::select! {
            _ = token.cancelled() => {
                phase = next_phase(phase, ConnectionSignal::Teardown);
                continue;
            }
            attempt = transport.connect(&options.endpoint) => attempt,
        };

        match attempt {
            Ok(mut connection) => {
                phase = next_phase(phase, ConnectionSignal::Opened);
                state.send_modify(|s| {
                    s.connected = true;
                    s.error = None;
                });
                if let Some(hook) = &handlers.on_open {
                    hook();
                }
                log::info!("Stream connected: {}", options.endpoint);

                match read_events(&mut connection, &options, &handlers, &state, &token).await {
                    ReadOutcome::Teardown => {
                        phase = next_phase(phase, ConnectionSignal::Teardown);
                        continue;
                    }
                    ReadOutcome::TransportFailed(message) => {
                        phase = next_phase(phase, ConnectionSignal::TransportFailed);
                        note_failure(&state, &handlers, &message);
                    }
                }
                // The failed connection is dropped here, tearing the
                // transport down before any reconnect is scheduled.
            }
            Err(e) => {
                phase = next_phase(phase, ConnectionSignal::TransportFailed);
                note_failure(&state, &handlers, &e.to_string());
            }
        }

        // --- Closed with error: reconnect or park ---
        if !options.auto_reconnect {
            log::info!(
                "Auto-reconnect disabled. Stream stays closed: {}",
                options.endpoint
            );
            token.cancelled().await;
            phase = next_phase(phase, ConnectionSignal::Teardown);
            continue;
        }

        let fired = tokio::select! {
            _ = token.cancelled() => false,
            fired = registry.managed_sleep(options.reconnect_interval) => fired,
        };
        phase = if fired {
            next_phase(phase, ConnectionSignal::ReconnectDue)
        } else {
            next_phase(phase, ConnectionSignal::Teardown)
        };
    }

    state.send_modify(|s| s.connected = false);
    log::debug!("Stream driver stopped: {}", options.endpoint);
}

async fn read_events<T, C>(
    connection: &mut C,
    options: &StreamOptions,
    handlers: &StreamHandlers<T>,
    state: &watch::Sender<StreamState<T>>,
    token: &CancellationToken,
) -> ReadOutcome
where
    T: DeserializeOwned,
    C: StreamConnection,
{
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return ReadOutcome::Teardown,
            event = next_with_watchdog(connection, options.idle_timeout) => event,
        };

        match event {
            Some(Ok(raw)) => {
                if let Some(envelope) = envelope::parse_envelope(&raw) {
                    state.send_if_modified(|s| {
                        envelope::apply_envelope(
                            &mut s.items,
                            envelope,
                            handlers.map_snapshot.as_ref(),
                            handlers.map_item.as_ref(),
                        )
                    });
                }
            }
            Some(Err(e)) => return ReadOutcome::TransportFailed(e.to_string()),
            None => return ReadOutcome::TransportFailed("stream closed by server".to_string()),
        }
    }
}

async fn next_with_watchdog<C>(
    connection: &mut C,
    idle_timeout: Option<Duration>,
) -> Option<Result<String, StreamError>>
where
    C: StreamConnection,
{
    match idle_timeout {
        Some(window) => match timeout(window, connection.next_event()).await {
            Ok(event) => event,
            Err(_) => Some(Err(StreamError::IdleTimeout)),
        },
        None => connection.next_event().await,
    }
}

fn note_failure<T>(
    state: &watch::Sender<StreamState<T>>,
    handlers: &StreamHandlers<T>,
    message: &str,
) {
    log::warn!("Stream transport error: {}", message);
    state.send_modify(|s| {
        s.connected = false;
        s.error = Some(message.to_string());
    });
    if let Some(hook) = &handlers.on_error {
        hook(message);
    }
}
