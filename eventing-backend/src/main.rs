use std::sync::Arc;

use anyhow::{Context, Result};
use eventing_backend::backend::Backend;
use eventing_backend::dispatcher::{EventDispatcher, HttpDispatcher};
use eventing_backend::nats::client::nats::NatsConnectorImpl;
use eventing_backend::tracing::setup_tracing;
use eventing_backend::utils::retry::{RetryConfig, retry};
use eventing_backend::{JetStream, NatsCore, ResyncTrigger, StaticSubscriptions, SubscriptionSource};
use eventing_config::configuration::{BackendKind, load_config};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    setup_tracing(config.log_level.clone());

    let dispatcher: Arc<dyn EventDispatcher> =
        Arc::new(HttpDispatcher::new(config.nats.request_timeout() * 6)?);
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Jetstream => Arc::new(JetStream::new(
            NatsConnectorImpl,
            config.clone(),
            dispatcher,
        )),
        BackendKind::Nats => Arc::new(NatsCore::new(NatsConnectorImpl, config.clone(), dispatcher)),
    };
    info!(backend = %config.backend, endpoint = %config.nats.endpoint, "starting eventing backend");

    let trigger = ResyncTrigger::new();
    let span = info_span!("initialize");
    retry(&RetryConfig::default(), &span, |_attempt| {
        let backend = backend.clone();
        let trigger = trigger.clone();
        async move { backend.initialize(Arc::new(trigger)).await }
    })
    .await
    .context("connecting to the broker")?;

    let source: Arc<dyn SubscriptionSource> =
        Arc::new(StaticSubscriptions(config.subscriptions.clone()));
    let cancel = CancellationToken::new();
    let summary = ResyncTrigger::resync_all(backend.as_ref(), source.as_ref(), &cancel).await?;
    info!(synced = summary.synced, failed = summary.failed, "subscriptions synchronized");

    let resync = {
        let trigger = trigger.clone();
        let backend = backend.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { trigger.run(backend, source, cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    resync.await?;

    Ok(())
}
