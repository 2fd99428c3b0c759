// Needs a running RabbitMQ; run with `cargo test -- --ignored`.
// AMQP_ADDR overrides the default local URI.

use rabbit_brokers::brokers::{
    callback, Broker, BrokerContext, BrokerPublishParameter, BrokerSubscriptionParameter,
    ServerBrokerConfiguration,
};
use std::time::Duration;
use tokio::sync::mpsc;

fn server() -> ServerBrokerConfiguration {
    let server = ServerBrokerConfiguration::new("smoke").with_config_allowed(true);
    match std::env::var("AMQP_ADDR") {
        Ok(addr) => server.with_uri(addr),
        Err(_) => server,
    }
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_round_trip_through_rabbitmq() {
    let broker = Broker::new(server());
    assert!(broker.check_connection().await);

    let queue = format!("rabbit-brokers-smoke-{}", uuid::Uuid::new_v4());
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscription = broker
        .subscribe(
            BrokerSubscriptionParameter::new("smoke-sub", "smoke", queue.as_str()),
            callback(move |context: Box<dyn BrokerContext>| {
                let tx = tx.clone();
                async move {
                    let body = context.utf8_data().to_string();
                    context.commit().await?;
                    let _ = tx.send(body);
                    Ok::<(), anyhow::Error>(())
                }
            }),
            None,
        )
        .await
        .unwrap();

    let publisher = broker.get_publisher(
        BrokerPublishParameter::new("smoke-pub", "smoke").with_default_routing_key(queue.as_str()),
    );
    publisher.publish("ping", None).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "ping");

    broker.reset().await.unwrap();
    assert_eq!(broker.get_queue_depth(&queue).await.unwrap(), 0);

    subscription.close().await;
    publisher.close().await;
    broker.close().await;
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_queue_depth_of_unknown_queue() {
    let broker = Broker::new(server());
    let depth = broker
        .get_queue_depth("rabbit-brokers-smoke-never-declared")
        .await
        .unwrap();
    assert_eq!(depth, 0);
    broker.close().await;
}
