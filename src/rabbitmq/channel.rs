use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Error as LapinError, ExchangeKind,
};
use serde_json::{Number, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::brokers::configuration::ExchangeType;
use crate::brokers::errors::{BrokerError, Result};
use crate::headers::HeaderMap;
use crate::transport::{
    Delivery, DeliveryAcker, DeliveryStream, MessageProperties, QueueOptions, TransportChannel,
};

/// A lapin channel seen through the transport seam.
pub struct LapinChannel {
    id: String,
    channel: Channel,
}

impl LapinChannel {
    pub fn new(id: String, channel: Channel) -> Self {
        Self { id, channel }
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn is_not_found(error: &LapinError) -> bool {
    match error {
        LapinError::ProtocolError(amqp_error) => matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
        ),
        _ => false,
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        debug!(channel_id = %self.id, exchange = %name, kind = %kind, "Declaring exchange");
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        debug!(channel_id = %self.id, queue = %name, "Declaring queue");
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Queue '{}' declared with {} messages", name, queue.message_count());
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_basic_properties(properties),
            )
            .await?
            .await?; // wait for the broker handshake
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.channel.tx_select().await?;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.channel.tx_commit().await?;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.channel.tx_rollback().await?;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(queue) => Ok(Some(queue.message_count())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        Ok(self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        if prefetch > 0 {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| {
            delivery.map_err(BrokerError::from).map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                properties: from_basic_properties(&delivery.properties),
                data: delivery.data,
                acker: Arc::new(LapinAcker(delivery.acker)) as Arc<dyn DeliveryAcker>,
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.channel.close(200, "Closing channel").await {
            warn!(channel_id = %self.id, "Channel close reported: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(properties.delivery_mode);

    if let Some(expiration) = properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration));
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(headers) = properties.headers {
        basic = basic.with_headers(to_field_table(headers));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        delivery_mode: (*basic.delivery_mode()).unwrap_or(1),
        expiration: basic.expiration().as_ref().map(|e| e.to_string()),
        headers: basic.headers().as_ref().map(from_field_table),
        content_type: basic.content_type().as_ref().map(|c| c.to_string()),
        message_id: basic.message_id().as_ref().map(|m| m.to_string()),
        timestamp: *basic.timestamp(),
    }
}

fn to_field_table(headers: HeaderMap) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s)),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.into_iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(fields) => AMQPValue::FieldTable(to_field_table(fields.into_iter().collect())),
    }
}

fn from_field_table(table: &FieldTable) -> HeaderMap {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.to_string(), from_amqp_value(v)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.to_string(), from_amqp_value(v)))
                .collect(),
        ),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}
