use rabbit_brokers::brokers::{
    BrokerError, BrokerPublishParameter, DeliveryMode, ExchangeType, FactoryBrokers,
    ServerBrokerConfiguration,
};
use rabbit_brokers::message::Payload;
use rabbit_brokers::transport::{ChannelProvider, InMemoryChannelProvider};
use rabbit_brokers::MessageHeaders;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

fn factory(provider: &InMemoryChannelProvider) -> FactoryBrokers {
    let provider = provider.clone();
    let factory = FactoryBrokers::with_provider_builder(Arc::new(
        move |_: &ServerBrokerConfiguration| Arc::new(provider.clone()) as Arc<dyn ChannelProvider>,
    ));
    factory.add(ServerBrokerConfiguration::new("S1").with_config_allowed(true));
    factory
}

#[tokio::test]
async fn test_publish_on_default_routing_key_reaches_queue() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));

    let publisher = factory.create_publisher("P1").unwrap();
    publisher.publish("hi", None).await.unwrap();

    let messages = provider.messages("q1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"hi".to_vec());
    assert_eq!(messages[0].exchange, "");
    assert_eq!(messages[0].routing_key, "q1");
    assert_eq!(messages[0].properties.delivery_mode, 2);
    assert_eq!(messages[0].properties.content_type.as_deref(), Some("text/plain"));
    assert!(messages[0].properties.message_id.is_some());
}

#[tokio::test]
async fn test_structured_payload_drops_null_fields() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    publisher
        .publish(json!({ "a": 1, "b": null }), None)
        .await
        .unwrap();

    #[derive(Serialize)]
    struct Order {
        id: u32,
        note: Option<String>,
    }
    publisher
        .publish(Payload::json(&Order { id: 7, note: None }).unwrap(), None)
        .await
        .unwrap();

    let messages = provider.messages("q1");
    assert_eq!(messages[0].data, br#"{"a":1}"#.to_vec());
    assert_eq!(messages[0].properties.content_type.as_deref(), Some("application/json"));
    assert_eq!(messages[1].data, br#"{"id":7}"#.to_vec());
}

#[tokio::test]
async fn test_routing_key_is_required() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1"));
    provider.ensure_queue("q2");

    let publisher = factory.create_publisher("P1").unwrap();
    assert!(matches!(
        publisher.publish("hi", None).await,
        Err(BrokerError::MissingConfiguration(_))
    ));
    assert!(matches!(
        publisher.publish_to(None::<&str>, "hi", None).await,
        Err(BrokerError::MissingConfiguration(_))
    ));

    publisher.publish_to("q2", "explicit", None).await.unwrap();
    assert_eq!(provider.messages("q2").len(), 1);
}

#[tokio::test]
async fn test_metadata_and_headers_travel_with_message() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(
        BrokerPublishParameter::new("P1", "S1")
            .with_default_routing_key("q1")
            .with_delivery_mode(DeliveryMode::NonPersistent)
            .with_expiration("60000"),
    );
    let publisher = factory.create_publisher("P1").unwrap();

    #[derive(Serialize)]
    struct Trace {
        tenant: String,
        attempt: u32,
    }
    let headers = MessageHeaders::from_record(&Trace {
        tenant: "acme".to_string(),
        attempt: 2,
    })
    .unwrap();
    publisher.publish("hi", Some(headers)).await.unwrap();

    let message = &provider.messages("q1")[0];
    assert_eq!(message.properties.delivery_mode, 1);
    assert_eq!(message.properties.expiration.as_deref(), Some("60000"));
    let headers = message.properties.headers.as_ref().unwrap();
    assert_eq!(headers["tenant"], json!("acme"));
    assert_eq!(headers["attempt"], json!(2));
}

#[tokio::test]
async fn test_topic_exchange_routes_by_key() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_exchange("orders", ExchangeType::Topic));
    let publisher = factory.create_publisher("P1").unwrap();
    publisher.initialize().await.unwrap();
    assert!(provider.has_exchange("orders"));

    // an unbound key is dropped by the exchange, not an error
    publisher.publish_to("orders.created", "lost", None).await.unwrap();
    assert!(provider.messages("orders.created").is_empty());
}

#[tokio::test]
async fn test_missing_topology_fails_without_config_allowed() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory
        .add(ServerBrokerConfiguration::new("S2"))
        .add(BrokerPublishParameter::new("P2", "S2").with_default_routing_key("q9"));

    let publisher = factory.create_publisher("P2").unwrap();
    let result = publisher.publish("hi", None).await;
    assert!(matches!(result, Err(ref e) if e.is_transport()));
    assert!(!provider.has_queue("q9"));
}

#[tokio::test]
async fn test_transaction_commit_delivers() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    let tx = publisher.begin_transaction().await.unwrap();
    assert_eq!(publisher.current_transaction(), Some(tx.id()));
    publisher.publish("one", None).await.unwrap();
    publisher.publish("two", None).await.unwrap();
    assert!(provider.messages("q1").is_empty());

    tx.commit().await.unwrap();
    assert_eq!(provider.messages("q1").len(), 2);
    assert!(!publisher.in_transaction());

    // the channel stays transactional; plain publishes still land
    publisher.publish("three", None).await.unwrap();
    assert_eq!(provider.messages("q1").len(), 3);
}

#[tokio::test]
async fn test_second_transaction_is_illegal() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    let tx = publisher.begin_transaction().await.unwrap();
    assert!(matches!(
        publisher.begin_transaction().await,
        Err(BrokerError::IllegalState(_))
    ));

    tx.rollback().await.unwrap();
    let again = publisher.begin_transaction().await.unwrap();
    again.commit().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_transaction_rolls_back() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    {
        let _tx = publisher.begin_transaction().await.unwrap();
        publisher.publish("never", None).await.unwrap();
    }
    assert!(publisher.current_transaction().is_none());

    let tx = publisher.begin_transaction().await.unwrap();
    publisher.publish("kept", None).await.unwrap();
    tx.commit().await.unwrap();

    let messages = provider.messages("q1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"kept".to_vec());
}

#[tokio::test]
async fn test_close_rolls_back_open_transaction() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    let tx = publisher.begin_transaction().await.unwrap();
    publisher.publish("uncommitted", None).await.unwrap();
    publisher.close().await;

    assert!(!publisher.in_transaction());
    assert!(provider.messages("q1").is_empty());
    assert_eq!(provider.open_channel_count(), 0);

    // committing after disposal finds nothing open
    assert!(matches!(tx.commit().await, Err(BrokerError::IllegalState(_))));
}

#[tokio::test]
async fn test_rollback_on_closed_session_is_noop() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    let _tx = publisher.begin_transaction().await.unwrap();
    provider.close_all_channels();
    publisher.rollback().await.unwrap();
    assert!(!publisher.in_transaction());
}

#[tokio::test]
async fn test_publish_reopens_closed_channel() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    publisher.publish("before", None).await.unwrap();
    provider.close_all_channels();
    publisher.publish("after", None).await.unwrap();

    assert_eq!(provider.messages("q1").len(), 2);
    assert_eq!(provider.channels_opened(), 2);
}

#[tokio::test]
async fn test_stale_transaction_handle_cannot_settle_newer_transaction() {
    let provider = InMemoryChannelProvider::new();
    let factory = factory(&provider);
    factory.add(BrokerPublishParameter::new("P1", "S1").with_default_routing_key("q1"));
    let publisher = factory.create_publisher("P1").unwrap();

    // rollback through an old handle leaves the newer transaction open
    let first = publisher.begin_transaction().await.unwrap();
    publisher.commit().await.unwrap();
    let second = publisher.begin_transaction().await.unwrap();
    publisher.publish("second-work", None).await.unwrap();
    first.rollback().await.unwrap();
    assert_eq!(publisher.current_transaction(), Some(second.id()));
    second.commit().await.unwrap();
    assert_eq!(provider.messages("q1").len(), 1);

    // commit through an old handle fails and does not flush the newer one
    let third = publisher.begin_transaction().await.unwrap();
    publisher.rollback().await.unwrap();
    let fourth = publisher.begin_transaction().await.unwrap();
    publisher.publish("half", None).await.unwrap();
    assert!(matches!(third.commit().await, Err(BrokerError::IllegalState(_))));
    assert_eq!(publisher.current_transaction(), Some(fourth.id()));
    assert_eq!(provider.messages("q1").len(), 1);

    fourth.rollback().await.unwrap();
    assert!(!publisher.in_transaction());
    assert_eq!(provider.messages("q1").len(), 1);
}
