use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use switchyard::{
    BoxError, Envelope, Host, Publisher, Transport,
    consumer::InMemoryConsumerFactory,
    pool::{ConnectionPool, PoolConfig},
    subscriber::{FnSubscriber, Subscriber, Subscription, TopicRouter},
    supervisor::Supervisor,
    transport::InMemoryBroker,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    amount: u64,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let broker = InMemoryBroker::new();

    let billing = TopicRouter::new("billing")
        .route("orders.created", |envelope: Envelope| async move {
            let order: Option<Order> = envelope.json()?;
            tracing::info!(?order, "Billing order");
            Ok::<_, BoxError>(())
        })
        .route("orders.#", |envelope: Envelope| async move {
            tracing::info!(event_type = envelope.event_type(), "Billing saw order event");
            Ok::<_, BoxError>(())
        });

    let audit = FnSubscriber::new(
        Subscription::new("audit", ["#"]).asynchronous(),
        |envelope: Envelope| async move {
            tracing::info!(id = envelope.id(), event_type = envelope.event_type(), "Audited");
            Ok::<_, BoxError>(())
        },
    );

    let host = Host::new(Supervisor::new(InMemoryConsumerFactory::new(broker.clone())));
    let subscribers: [Arc<dyn Subscriber>; 2] = [Arc::new(billing), Arc::new(audit)];
    host.start(subscribers).expect("subscriptions are valid");

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let publisher = Publisher::new(Transport::new(ConnectionPool::new(
        broker.connector(),
        PoolConfig::bounded(NonZeroUsize::new(4).expect("non-zero pool size")),
    )));
    let mut id = 0;
    while !cancel.is_cancelled() {
        let topic = if id % 3 == 0 { "orders.shipped" } else { "orders.created" };
        if let Err(err) = publisher
            .publish(topic, &Order { id, amount: 100 * u64::from(id) }, Some("/demo"))
            .await
        {
            tracing::error!(%err, "Publish failed");
        }
        id += 1;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }

    host.stop(Duration::from_secs(10))
        .await
        .expect("subscriptions stop in time");
    cancel_handle.await.unwrap();
}
