use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::backend::jetstream::JetStream;
use crate::backend::nats_core::NatsCore;
use crate::nats::client::fake::server::FakeNatsServer;
use crate::resync::{ResyncTrigger, StaticSubscriptions, SubscriptionSource};
use crate::tests::utils::{
    RecordingDispatcher, jetstream_setup, subscription, test_config, wait_for_condition,
};
use crate::tracing::setup_tracing;

const CREATED: &str = "shop.order.created.v1";
const UPDATED: &str = "shop.order.updated.v1";

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_triggers_full_resync() -> Result<()> {
    setup_tracing(Some("=INFO".into()));
    let server = FakeNatsServer::new();
    let backend: Arc<dyn Backend> = Arc::new(JetStream::new(
        server.clone(),
        test_config(),
        Arc::new(RecordingDispatcher::default()),
    ));
    let trigger = ResyncTrigger::new();
    backend.initialize(Arc::new(trigger.clone())).await?;

    let subscriptions = vec![
        subscription("orders", &[CREATED, UPDATED]),
        subscription("audit", &[CREATED]),
    ];
    let source: Arc<dyn SubscriptionSource> =
        Arc::new(StaticSubscriptions(subscriptions.clone()));
    let cancel = CancellationToken::new();
    let summary = ResyncTrigger::resync_all(backend.as_ref(), source.as_ref(), &cancel).await?;
    assert_eq!(summary.synced, 2);
    assert_eq!(backend.table().len(), 3);

    let runner = {
        let trigger = trigger.clone();
        let backend = backend.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { trigger.run(backend, source, cancel).await })
    };

    server.disconnect();
    wait_for_condition(Duration::from_secs(5), || {
        let table = backend.table();
        table.keys().iter().all(|id| table.is_stale(id) == Some(true))
    })
    .await?;
    let added = server.stats().consumers_added;
    server.reconnect();

    wait_for_condition(Duration::from_secs(5), || trigger.completed() >= 1).await?;
    let table = backend.table();
    assert_eq!(table.len(), 3);
    assert!(table.keys().iter().all(|id| table.is_stale(id) == Some(false)));
    assert_eq!(server.stats().consumers_added, added);

    cancel.cancel();
    runner.await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_deletes_subscribers_of_removed_subscriptions() -> Result<()> {
    let setup = jetstream_setup(test_config()).await?;
    let cancel = CancellationToken::new();
    let orders = subscription("orders", &[CREATED]);
    let audit = subscription("audit", &[CREATED, UPDATED]);
    let all = StaticSubscriptions(vec![orders.clone(), audit]);
    ResyncTrigger::resync_all(&setup.backend, &all, &cancel).await?;
    assert_eq!(setup.backend.table().len(), 3);

    let remaining = StaticSubscriptions(vec![orders]);
    let summary = ResyncTrigger::resync_all(&setup.backend, &remaining, &cancel).await?;

    assert_eq!(summary.synced, 1);
    assert_eq!(summary.orphans_deleted, 2);
    assert_eq!(setup.backend.table().keys_for("default", "orders").len(), 1);
    assert_eq!(setup.backend.table().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_subscriptions_do_not_stop_resync() -> Result<()> {
    let setup = jetstream_setup(test_config()).await?;
    let source = StaticSubscriptions(vec![
        subscription("broken", &["created"]),
        subscription("orders", &[CREATED]),
    ]);

    let summary =
        ResyncTrigger::resync_all(&setup.backend, &source, &CancellationToken::new()).await?;

    assert_eq!((summary.synced, summary.failed), (1, 1));
    assert_eq!(setup.backend.table().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flapping_connection_coalesces_resyncs() -> Result<()> {
    setup_tracing(Some("=INFO".into()));
    let server = FakeNatsServer::new();
    let backend: Arc<dyn Backend> = Arc::new(NatsCore::new(
        server.clone(),
        test_config(),
        Arc::new(RecordingDispatcher::default()),
    ));
    let trigger = ResyncTrigger::new();
    backend.initialize(Arc::new(trigger.clone())).await?;

    let source: Arc<dyn SubscriptionSource> = Arc::new(StaticSubscriptions(vec![
        subscription("orders", &[CREATED, UPDATED]),
        subscription("audit", &[CREATED]),
    ]));
    let cancel = CancellationToken::new();
    ResyncTrigger::resync_all(backend.as_ref(), source.as_ref(), &cancel).await?;
    assert_eq!(backend.table().len(), 3);

    let runner = {
        let trigger = trigger.clone();
        let backend = backend.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { trigger.run(backend, source, cancel).await })
    };

    // Every broker call of a resync now outlasts the whole flapping sequence.
    server.set_latency(Duration::from_millis(200));
    for _ in 0..5 {
        server.disconnect();
        server.reconnect();
    }

    wait_for_condition(Duration::from_secs(10), || {
        let table = backend.table();
        trigger.completed() >= 1
            && table.len() == 3
            && table.keys().iter().all(|id| table.is_stale(id) == Some(false))
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(trigger.completed() <= 2, "{} resyncs ran", trigger.completed());
    assert_eq!(trigger.pending(), 0);

    cancel.cancel();
    runner.await?;
    Ok(())
}
