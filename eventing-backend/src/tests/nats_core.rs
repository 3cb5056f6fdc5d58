use std::time::Duration;

use anyhow::Result;
use eventing_core::SubscriptionSubjectIdentifier;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::nats::client::fake::server::FakeNatsServer;
use crate::tests::utils::{nats_core_setup_on, subscription, wait_for_condition};

const CREATED: &str = "shop.order.created.v1";
const SUBJECT: &str = "myshop.shop.order.created.v1";

#[tokio::test(flavor = "multi_thread")]
async fn test_core_subjects_are_used_verbatim() -> Result<()> {
    let setup = nats_core_setup_on(FakeNatsServer::new()).await?;
    let orders = subscription("orders", &[CREATED]);

    assert_eq!(
        setup.backend.backend_subjects(&[SUBJECT.to_string()]),
        vec![SUBJECT.to_string()]
    );

    let report = setup
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;
    assert_eq!(report.created, 1);
    assert!(
        setup
            .backend
            .table()
            .contains(&SubscriptionSubjectIdentifier::new("default", "orders", SUBJECT))
    );
    assert_eq!(setup.server.stats().queue_subscriptions, 1);
    assert_eq!(setup.server.stats().mutations(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_core_replicas_share_a_queue_group() -> Result<()> {
    let server = FakeNatsServer::new();
    let first = nats_core_setup_on(server.clone()).await?;
    let second = nats_core_setup_on(server.clone()).await?;
    let orders = subscription("orders", &[CREATED]);
    first
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;
    second
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;
    server.wait_for_subscriptions(2, Duration::from_secs(5)).await?;

    for _ in 0..4 {
        assert_eq!(server.publish(SUBJECT, "{}", None)?, 1);
    }

    wait_for_condition(Duration::from_secs(5), || {
        first.dispatcher.count() + second.dispatcher.count() == 4
    })
    .await?;
    // Core NATS has no acknowledgements.
    assert_eq!(server.stats().acks, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_core_delete_unsubscribes() -> Result<()> {
    let setup = nats_core_setup_on(FakeNatsServer::new()).await?;
    let orders = subscription("orders", &[CREATED]);
    setup
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;
    setup
        .server
        .wait_for_subscriptions(1, Duration::from_secs(5))
        .await?;

    setup.backend.delete_subscription(&orders).await?;
    setup.backend.delete_subscription(&orders).await?;

    assert!(setup.backend.table().is_empty());
    wait_for_condition(Duration::from_secs(5), || setup.server.subscription_count() == 0).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_core_max_in_flight_update_keeps_subscription() -> Result<()> {
    let setup = nats_core_setup_on(FakeNatsServer::new()).await?;
    let mut orders = subscription("orders", &[CREATED]);
    setup
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;

    orders.spec.config.max_in_flight = Some(1);
    let report = setup
        .backend
        .sync_subscription(&orders, &CancellationToken::new())
        .await?;

    assert_eq!(report.updated, 1);
    assert_eq!(setup.server.stats().queue_subscriptions, 1);
    let id = SubscriptionSubjectIdentifier::new("default", "orders", SUBJECT);
    assert_eq!(
        setup.backend.table().get(&id).unwrap().worker.max_in_flight(),
        1
    );
    Ok(())
}
