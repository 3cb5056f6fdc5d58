use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::nats::client::types::ConnectionEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Transition of the [`ConnectionState`] machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Lost,
    Restored,
}

/// Receives connection transitions of a backend.
///
/// Each method is called at most once per transition, repeated events from the client
/// library while already in the target state are swallowed.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connection_lost(&self);

    async fn on_connection_restored(&self);
}

/// Handler for callers which are not interested in connection changes.
pub struct IgnoreConnectionChanges;

#[async_trait]
impl ConnectionHandler for IgnoreConnectionChanges {
    async fn on_connection_lost(&self) {}

    async fn on_connection_restored(&self) {}
}

const CONNECTED: u8 = 0;
const DISCONNECTED: u8 = 1;

/// Tracks whether the broker connection is usable.
///
/// The generation is bumped on every disconnect. Operations remember the generation
/// they started in and discard their result if it changed meanwhile, because broker
/// side handles obtained before a reconnect cannot be trusted.
#[derive(Clone, Debug)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug)]
struct MonitorInner {
    state: AtomicU8,
    generation: AtomicU64,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    /// Starts disconnected, a backend marks it connected after its initial connect.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: AtomicU8::new(DISCONNECTED),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::SeqCst) {
            CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.inner.state.store(CONNECTED, Ordering::SeqCst);
    }

    /// Applies a client event, returns the transition it caused if any.
    pub fn observe(&self, event: &ConnectionEvent) -> Option<Transition> {
        let (target, transition) = match event {
            ConnectionEvent::Connected => (CONNECTED, Transition::Restored),
            ConnectionEvent::Disconnected | ConnectionEvent::Closed => {
                (DISCONNECTED, Transition::Lost)
            }
        };
        let previous = self.inner.state.swap(target, Ordering::SeqCst);
        if previous == target {
            return None;
        }
        if transition == Transition::Lost {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }
        Some(transition)
    }

    /// Consumes client events until the channel closes, forwarding transitions to the
    /// handler. Events are handled one after the other, so a handler never observes a
    /// restore before the preceding loss was handled.
    pub fn spawn(
        &self,
        events: loole::Receiver<ConnectionEvent>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> AbortOnDropHandle<()> {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                match monitor.observe(&event) {
                    Some(Transition::Lost) => {
                        warn!(?event, generation = monitor.generation(), "broker connection lost");
                        handler.on_connection_lost().await;
                    }
                    Some(Transition::Restored) => {
                        info!(generation = monitor.generation(), "broker connection restored");
                        handler.on_connection_restored().await;
                    }
                    None => debug!(?event, "connection state unchanged"),
                }
            }
            debug!("connection event channel closed");
        });
        AbortOnDropHandle::new(handle)
    }
}
