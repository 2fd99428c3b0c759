use rabbit_brokers::brokers::{
    callback, Broker, BrokerContext, BrokerError, BrokerPublishParameter,
    BrokerSubscriptionParameter, ContextFactory, DeliveryState, ExchangeType, FactoryBrokers,
    RabbitBrokerContext, ServerBrokerConfiguration,
};
use rabbit_brokers::headers::HeaderMap;
use rabbit_brokers::transport::{ChannelProvider, Delivery, InMemoryChannelProvider};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn factory(provider: &InMemoryChannelProvider) -> FactoryBrokers {
    let provider = provider.clone();
    let factory = FactoryBrokers::with_provider_builder(Arc::new(
        move |_: &ServerBrokerConfiguration| Arc::new(provider.clone()) as Arc<dyn ChannelProvider>,
    ));
    factory
        .add(ServerBrokerConfiguration::new("S1").with_config_allowed(true))
        .add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"))
        .add(BrokerSubscriptionParameter::new("Q1", "S1", "q1"));
    factory
}

/// Forwards every context to the test body, which settles it.
fn forwarding() -> (
    rabbit_brokers::brokers::SubscriptionCallback,
    mpsc::UnboundedReceiver<Box<dyn BrokerContext>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = callback(move |context: Box<dyn BrokerContext>| {
        let tx = tx.clone();
        async move {
            tx.send(context)
                .map_err(|_| anyhow::anyhow!("test receiver dropped"))?;
            Ok::<(), anyhow::Error>(())
        }
    });
    (handler, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Box<dyn BrokerContext>>) -> Box<dyn BrokerContext> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delivery within 5 seconds")
        .expect("subscription stopped")
}

#[tokio::test]
async fn test_commit_removes_message() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();
    assert!(subscription.is_running());

    factory.create_publisher("P1").unwrap().publish("hi", None).await.unwrap();

    let context = next(&mut rx).await;
    assert_eq!(context.utf8_data(), "hi");
    assert_eq!(context.routing_key(), "q1");
    assert_eq!(context.exchange(), "");
    assert!(!context.redelivered());
    assert!(context.broker().factory().is_some());

    context.commit().await.unwrap();
    assert!(provider.messages("q1").is_empty());
    assert_eq!(provider.unacked_count("q1"), 0);

    subscription.close().await;
}

#[tokio::test]
async fn test_rollback_presents_message_again() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    factory.create_publisher("P1").unwrap().publish("retry me", None).await.unwrap();

    let first = next(&mut rx).await;
    first.rollback().await.unwrap();

    let second = next(&mut rx).await;
    assert_eq!(second.utf8_data(), "retry me");
    assert!(second.redelivered());
    assert!(!second.can_be_requeued());
    assert!(matches!(
        second.requeue_last().await,
        Err(BrokerError::IllegalState(_))
    ));
    second.commit().await.unwrap();

    subscription.close().await;
    assert!(provider.messages("q1").is_empty());
}

#[tokio::test]
async fn test_requeue_last_goes_to_front() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    let publisher = factory.create_publisher("P1").unwrap();
    publisher.publish("first", None).await.unwrap();

    let context = next(&mut rx).await;
    assert!(context.can_be_requeued());
    context.requeue_last().await.unwrap();
    assert_eq!(context.state(), DeliveryState::Requeued);

    let again = next(&mut rx).await;
    assert_eq!(again.utf8_data(), "first");
    again.commit().await.unwrap();

    subscription.close().await;
}

#[tokio::test]
async fn test_reject_is_permanent_and_second_action_fails() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    let publisher = factory.create_publisher("P1").unwrap();
    publisher.publish("poison", None).await.unwrap();
    publisher.publish("good", None).await.unwrap();

    let poison = next(&mut rx).await;
    poison.reject().await.unwrap();
    assert!(matches!(poison.commit().await, Err(BrokerError::IllegalState(_))));
    assert!(matches!(poison.rollback().await, Err(BrokerError::IllegalState(_))));

    let good = next(&mut rx).await;
    assert_eq!(good.utf8_data(), "good");
    good.commit().await.unwrap();

    subscription.close().await;
    assert!(provider.messages("q1").is_empty());
}

#[tokio::test]
async fn test_structured_body_deserializes() {
    #[derive(Deserialize, Debug, PartialEq)]
    struct Order {
        id: u32,
        items: Vec<String>,
    }

    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    factory
        .create_publisher("P1")
        .unwrap()
        .publish(json!({ "id": 3, "items": ["a"], "note": null }), None)
        .await
        .unwrap();

    let context = next(&mut rx).await;
    let order: Order = context.deserialize().unwrap();
    assert_eq!(
        order,
        Order {
            id: 3,
            items: vec!["a".to_string()]
        }
    );
    context.commit().await.unwrap();
    subscription.close().await;
}

#[tokio::test]
async fn test_unsettled_delivery_returns_on_close() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    factory.create_publisher("P1").unwrap().publish("pending", None).await.unwrap();
    let context = next(&mut rx).await;
    assert_eq!(provider.unacked_count("q1"), 1);

    subscription.close().await;
    let messages = provider.messages("q1");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].redelivered);

    // the channel is gone, so settling now fails and leaves it pending
    assert!(context.commit().await.is_err());
    assert_eq!(context.state(), DeliveryState::Pending);
}

#[tokio::test]
async fn test_topic_bindings_filter_deliveries() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory
        .add(BrokerPublishParameter::new("orders", "S1").with_exchange("orders", ExchangeType::Topic))
        .add(
            BrokerSubscriptionParameter::new("eu-orders", "S1", "eu-orders-q")
                .with_exchange("orders", ExchangeType::Topic)
                .with_routing_key("orders.*.eu"),
        );

    let (handler, mut rx) = forwarding();
    let subscription = factory.create_subscription("eu-orders", handler).await.unwrap();

    let publisher = factory.create_publisher("orders").unwrap();
    publisher.publish_to("orders.created.us", "us", None).await.unwrap();
    publisher.publish_to("orders.created.eu", "eu", None).await.unwrap();

    let context = next(&mut rx).await;
    assert_eq!(context.utf8_data(), "eu");
    assert_eq!(context.exchange(), "orders");
    assert_eq!(context.routing_key(), "orders.created.eu");
    context.commit().await.unwrap();

    subscription.close().await;
    assert!(provider.messages("eu-orders-q").is_empty());
}

#[tokio::test]
async fn test_context_factory_override() {
    let provider = InMemoryChannelProvider::new();
    let broker = Broker::with_provider(
        ServerBrokerConfiguration::new("S1").with_config_allowed(true),
        Arc::new(provider.clone()),
    );

    let tagging: ContextFactory = Arc::new(|delivery: Delivery, broker: Broker| {
        let mut context = RabbitBrokerContext::new(delivery, broker);
        let mut headers = context.headers().cloned().unwrap_or_default();
        headers.insert("seen-by".to_string(), json!("tagging-factory"));
        context.set_headers(Some(headers));
        Box::new(context) as Box<dyn BrokerContext>
    });

    let (handler, mut rx) = forwarding();
    let subscription = broker
        .subscribe(
            BrokerSubscriptionParameter::new("Q1", "S1", "q1"),
            handler,
            Some(tagging),
        )
        .await
        .unwrap();

    broker
        .get_publisher(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"))
        .publish("hi", None)
        .await
        .unwrap();

    let context = next(&mut rx).await;
    let headers: &HeaderMap = context.headers().unwrap();
    assert_eq!(headers["seen-by"], json!("tagging-factory"));
    context.commit().await.unwrap();

    subscription.close().await;
}

#[tokio::test]
async fn test_failing_callback_keeps_loop_running() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let handler = callback(move |context: Box<dyn BrokerContext>| {
        let tx = tx.clone();
        async move {
            if context.utf8_data() == "bad" {
                context.reject().await?;
                anyhow::bail!("cannot handle '{}'", context.utf8_data());
            }
            context.commit().await?;
            tx.send(context.utf8_data().to_string())
                .map_err(|_| anyhow::anyhow!("test receiver dropped"))?;
            Ok::<(), anyhow::Error>(())
        }
    });
    let subscription = factory.create_subscription("Q1", handler).await.unwrap();

    let publisher = factory.create_publisher("P1").unwrap();
    publisher.publish("bad", None).await.unwrap();
    publisher.publish("good", None).await.unwrap();

    let handled = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(handled, "good");

    subscription.close().await;
    assert!(provider.messages("q1").is_empty());
}

#[tokio::test]
async fn test_subscribe_to_missing_queue_fails() {
    let provider = InMemoryChannelProvider::new();
    let broker = Broker::with_provider(ServerBrokerConfiguration::new("S1"), Arc::new(provider.clone()));
    let (handler, _rx) = forwarding();

    let result = broker
        .subscribe(BrokerSubscriptionParameter::new("Q1", "S1", "absent"), handler, None)
        .await;
    assert!(matches!(result, Err(ref e) if e.is_transport()));
    assert_eq!(provider.open_channel_count(), 0);
}
