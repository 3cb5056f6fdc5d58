use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use eventing_config::configuration::{Config, NatsConfig};
use eventing_core::Subscription;
use url::Url;

use crate::backend::Backend;
use crate::backend::jetstream::JetStream;
use crate::backend::nats_core::NatsCore;
use crate::connection::ConnectionHandler;
use crate::dispatcher::{EventDispatcher, OutgoingEvent};
use crate::nats::client::fake::server::FakeNatsServer;
use crate::tracing::setup_tracing;

pub const STREAM: &str = "kyma";
pub const SOURCE: &str = "my-shop";

pub async fn wait_for_condition<F>(timeout: Duration, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while Instant::now().duration_since(start) < timeout {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timeout waiting condition")
}

pub fn test_config() -> Config {
    Config {
        nats: NatsConfig {
            endpoint: "nats://fake:4222".into(),
            request_timeout_ms: 1000,
            ..NatsConfig::default()
        },
        event_type_prefix: String::new(),
        ..Config::default()
    }
}

pub fn subscription(name: &str, types: &[&str]) -> Subscription {
    Subscription::new(
        "default",
        name,
        SOURCE,
        types,
        Url::parse(&format!("http://{name}.default.svc.cluster.local")).unwrap(),
    )
}

/// Broker subject of an event type of [`subscription`] on the JetStream backend.
pub fn jetstream_subject(event_type: &str) -> String {
    format!("kyma.myshop.{event_type}")
}

#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<(Url, OutgoingEvent)>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(Url, OutgoingEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn dispatch(&self, sink: &Url, event: &OutgoingEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((sink.clone(), event.clone()));
        if self.failing.load(Ordering::SeqCst) {
            bail!("sink unavailable");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    pub lost: AtomicUsize,
    pub restored: AtomicUsize,
}

impl RecordingHandler {
    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn restored(&self) -> usize {
        self.restored.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn on_connection_lost(&self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_connection_restored(&self) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Setup<B> {
    pub server: Arc<FakeNatsServer>,
    pub backend: B,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub handler: Arc<RecordingHandler>,
}

pub async fn jetstream_setup(config: Config) -> Result<Setup<JetStream<Arc<FakeNatsServer>>>> {
    jetstream_setup_on(FakeNatsServer::new(), config).await
}

pub async fn jetstream_setup_on(
    server: Arc<FakeNatsServer>,
    config: Config,
) -> Result<Setup<JetStream<Arc<FakeNatsServer>>>> {
    setup_tracing(Some("=INFO".into()));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let handler = Arc::new(RecordingHandler::default());
    let backend = JetStream::new(server.clone(), config, dispatcher.clone());
    backend.initialize(handler.clone()).await?;
    Ok(Setup {
        server,
        backend,
        dispatcher,
        handler,
    })
}

pub async fn nats_core_setup_on(
    server: Arc<FakeNatsServer>,
) -> Result<Setup<NatsCore<Arc<FakeNatsServer>>>> {
    setup_tracing(Some("=INFO".into()));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let handler = Arc::new(RecordingHandler::default());
    let backend = NatsCore::new(server.clone(), test_config(), dispatcher.clone());
    backend.initialize(handler.clone()).await?;
    Ok(Setup {
        server,
        backend,
        dispatcher,
        handler,
    })
}
