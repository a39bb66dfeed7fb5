//! Best-effort realtime channel adapter.
//!
//! Pushes answer events to the proctoring/collaboration channel and surfaces
//! inbound messages. The connection is an explicit state machine
//! `Connecting -> Open -> Backoff -> ... -> Failed` driven by a retry
//! counter. Once retries are exhausted the adapter stays `Failed` for the rest
//! of the session. `send` never blocks and never fails from the caller's
//! point of view.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::RealtimeError;
use crate::model::AnswerValue;
use crate::traits::{RealtimeLink, RealtimeTransport};

/// Event pushed after every answer or flag mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub question_id: String,
    /// `None` when the mutation cleared the answer or only touched the flag.
    pub answer_snapshot: Option<AnswerValue>,
    pub timestamp: DateTime<Utc>,
    /// Seconds spent on the question so far.
    pub time_spent: u64,
}

/// A message received from the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub kind: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InboundMessage {
    /// Proctor and collaborator messages are forwarded to the UI as-is.
    pub fn is_surfaced(&self) -> bool {
        matches!(self.kind.as_str(), "proctor" | "collaborator")
    }
}

/// Connection state of the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting { attempt: u32 },
    Open,
    Backoff { attempt: u32, delay_ms: u64 },
    /// Retries exhausted; permanent for this session.
    Failed,
    /// Closed by the owner.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ConnectionState::Open => write!(f, "connected"),
            ConnectionState::Backoff { delay_ms, .. } => write!(f, "reconnecting in {delay_ms}ms"),
            ConnectionState::Failed => write!(f, "offline"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Outbound events buffered while a send is in progress; overflow is dropped.
    pub buffer: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            buffer: 64,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Realtime adapter for one session.
pub struct RealtimeAdapter {
    outbound: mpsc::Sender<OutboundEvent>,
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeAdapter {
    /// Start connecting in the background. `on_message` receives every
    /// inbound message.
    pub fn connect<F>(
        transport: Arc<dyn RealtimeTransport>,
        session_id: impl Into<String>,
        policy: ReconnectPolicy,
        on_message: F,
    ) -> Self
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(policy.buffer.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Connecting { attempt: 1 });
        let state_tx = Arc::new(state_tx);
        let driver = tokio::spawn(drive(
            transport,
            session_id.into(),
            policy,
            Box::new(on_message),
            outbound_rx,
            Arc::clone(&state_tx),
        ));
        Self {
            outbound,
            state,
            state_tx,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Fire-and-forget push. Dropped silently unless the channel is open.
    pub fn send(&self, event: OutboundEvent) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.outbound.try_send(event) {
            tracing::debug!("realtime event dropped: {e}");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the driver and any pending backoff.
    pub fn close(&self) {
        if let Some(driver) = crate::lock(&self.driver).take() {
            driver.abort();
            self.state_tx.send_replace(ConnectionState::Closed);
        }
    }
}

impl Drop for RealtimeAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

type MessageHandler = Box<dyn Fn(InboundMessage) + Send + Sync>;

enum LinkEnd {
    Dropped(RealtimeError),
    Shutdown,
}

async fn drive(
    transport: Arc<dyn RealtimeTransport>,
    session_id: String,
    policy: ReconnectPolicy,
    on_message: MessageHandler,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut failures: u32 = 0;
    loop {
        state.send_replace(ConnectionState::Connecting {
            attempt: failures + 1,
        });
        match transport.connect(&session_id).await {
            Ok(link) => {
                tracing::debug!(session = %session_id, "realtime channel open");
                failures = 0;
                state.send_replace(ConnectionState::Open);
                match pump(link, &mut outbound, &on_message).await {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Dropped(e) => {
                        tracing::warn!(session = %session_id, "realtime channel dropped: {e}")
                    }
                }
            }
            Err(e) => tracing::warn!(session = %session_id, "realtime connect failed: {e}"),
        }

        failures += 1;
        if failures > policy.max_retries {
            tracing::warn!(
                session = %session_id,
                "realtime unavailable after {} retries, falling back to polling",
                policy.max_retries
            );
            state.send_replace(ConnectionState::Failed);
            return;
        }
        let delay = policy.delay_for(failures);
        state.send_replace(ConnectionState::Backoff {
            attempt: failures,
            delay_ms: saturating_millis(delay),
        });
        // Anything queued while offline is stale by the time we reconnect.
        while outbound.try_recv().is_ok() {}
        tokio::time::sleep(delay).await;
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn pump(
    mut link: RealtimeLink,
    outbound: &mut mpsc::Receiver<OutboundEvent>,
    on_message: &MessageHandler,
) -> LinkEnd {
    loop {
        tokio::select! {
            event = outbound.recv() => match event {
                Some(event) => {
                    if let Err(e) = link.sink.send(&event).await {
                        return LinkEnd::Dropped(e);
                    }
                }
                None => return LinkEnd::Shutdown,
            },
            message = link.inbound.next() => match message {
                Some(Ok(message)) => on_message(message),
                Some(Err(e)) => return LinkEnd::Dropped(e),
                None => return LinkEnd::Dropped(RealtimeError::Closed),
            },
        }
    }
}
