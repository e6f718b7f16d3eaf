//! Connection-session state machine for the coordination service.
//!
//! Owns the session lifecycle: connect, observe session events, and
//! recover lost sessions with a fixed-delay retry. All client callbacks
//! are marshalled onto one coordinating task before any shared state is
//! touched; no two callbacks ever run concurrently.

use crate::client::{CoordinationClient, SessionEvent};
use crate::config::SessionConfig;
use crate::error::SessionError;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection status of the session. Exactly one instance per session;
/// transitions are driven only by service callbacks and the retry timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no connect attempted yet.
    Initialized,
    /// First connect in flight.
    Connecting,
    /// Retry connect in flight after a loss.
    Reconnecting,
    /// Session established.
    Connected,
    /// Connection dropped; service-side auto-recovery pending.
    Suspended,
    /// Session gone; a reconnect will be scheduled.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Resilient session to the coordination service.
pub struct ConnectionSession {
    client: Arc<dyn CoordinationClient>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// Create a session over the given client. Call [`ConnectionSession::start`]
    /// to begin connecting.
    pub fn new(client: Arc<dyn CoordinationClient>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Initialized);
        let state_tx = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let task = SessionTask {
            client: client.clone(),
            config,
            state_tx: state_tx.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            client,
            state_tx,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Whether the process may serve: this coordination service is
    /// crucial, so anything short of an established (or auto-recovering)
    /// session suspends upstream request handling.
    pub fn is_serving(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Suspended
        )
    }

    /// The underlying client.
    pub fn client(&self) -> Arc<dyn CoordinationClient> {
        self.client.clone()
    }

    /// Stop the session: cancel any pending reconnect and close the
    /// underlying client session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "closing coordination session failed");
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

/// The single coordinating task owning all session state.
struct SessionTask {
    client: Arc<dyn CoordinationClient>,
    config: SessionConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self) {
        // Subscribe before connecting so the first event is not missed.
        let mut events = self.client.subscribe_session();

        self.set_state(ConnectionState::Connecting);
        let mut retry: Option<Pin<Box<Sleep>>> = None;
        if let Err(e) = self.connect().await {
            warn!(error = %e, "initial connect failed");
            self.set_state(ConnectionState::Closed);
            self.schedule_reconnect(&mut retry);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => self.on_event(event, &mut retry).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                () = async { retry.as_mut().expect("guarded").as_mut().await },
                        if retry.is_some() => {
                    retry = None;
                    self.set_state(ConnectionState::Reconnecting);
                    debug!("reconnecting to coordination service");
                    if let Err(e) = self.connect().await {
                        warn!(error = %e, "reconnect failed");
                        self.set_state(ConnectionState::Closed);
                        self.schedule_reconnect(&mut retry);
                    }
                }
            }
        }
    }

    /// One connect attempt, bounded by the configured timeout.
    async fn connect(&self) -> crate::error::Result<()> {
        match tokio::time::timeout(self.config.connect_timeout, self.client.connect()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectFailed {
                reason: "connect attempt timed out".to_string(),
            }
            .into()),
        }
    }

    async fn on_event(&self, event: SessionEvent, retry: &mut Option<Pin<Box<Sleep>>>) {
        match event {
            SessionEvent::Connected => {
                info!("coordination session established");
                *retry = None;
                self.set_state(ConnectionState::Connected);
            }
            SessionEvent::Suspended => {
                // The client library recovers suspended connections by
                // itself; just wait.
                if self.state() == ConnectionState::Connected {
                    warn!("coordination session suspended");
                    self.set_state(ConnectionState::Suspended);
                }
            }
            SessionEvent::Lost => {
                warn!("coordination session lost");
                self.set_state(ConnectionState::Closed);
                self.schedule_reconnect(retry);
            }
            SessionEvent::ConnectFailed => {
                warn!("coordination connect failed");
                self.set_state(ConnectionState::Closed);
                self.schedule_reconnect(retry);
            }
        }
    }

    /// Schedule a fixed-delay reconnect. Never scheduled twice: skipped
    /// when a retry timer is pending or a reconnect is already running.
    fn schedule_reconnect(&self, retry: &mut Option<Pin<Box<Sleep>>>) {
        if retry.is_some() || self.state() == ConnectionState::Reconnecting {
            debug!("reconnect already scheduled, skip");
            return;
        }

        let delay = self.config.reconnect_interval;
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        *retry = Some(Box::pin(sleep(delay)));
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            debug!(%previous, current = %state, "connection state changed");
            self.state_tx.send_replace(state);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}
