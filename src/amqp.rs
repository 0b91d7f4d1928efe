// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Client
//!
//! Implementation of the [`crate::broker`] traits on top of `lapin`.
//! Connection and channel failures reported through lapin's `on_error`
//! callbacks are forwarded into the supervisors' close notifiers.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, CloseNotifier, Delivery, DeliveryStream,
        PublishProperties,
    },
    configs::{ConnectionConfig, ConsumerConfig},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueArgument, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

const REPLY_SUCCESS: u16 = 200;

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        connection_name: &str,
        cfg: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = cfg.host, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect_uri(amqp_uri(cfg), options).await {
            Ok(conn) => {
                debug!(host = cfg.host, "amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), host = cfg.host, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn notify_close(&self) -> CloseNotifier {
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn.on_error(move |err| {
            let _ = tx.send(AmqpError::Closed(err.to_string()));
        });
        rx
    }

    fn is_closed(&self) -> bool {
        !self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                field_table(def.args()),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        no_wait: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                &cfg.queue,
                &cfg.consumer_tag,
                BasicConsumeOptions {
                    no_local: cfg.no_local,
                    no_ack: cfg.auto_ack,
                    exclusive: cfg.exclusive,
                    nowait: cfg.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(cfg.queue.clone())
            })?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &props.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(props.content_type.clone()))
            .with_headers(FieldTable::from(headers));
        if let Some(kind) = &props.kind {
            properties = properties.with_type(ShortString::from(kind.clone()));
        }
        if let Some(id) = &props.message_id {
            properties = properties.with_message_id(ShortString::from(id.clone()));
        }
        if let Some(timestamp) = props.timestamp {
            properties = properties.with_timestamp(timestamp);
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: props.mandatory,
                    immediate: props.immediate,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn notify_close(&self) -> CloseNotifier {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channel.on_error(move |err| {
            let _ = tx.send(AmqpError::Closed(err.to_string()));
        });
        rx
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

/// Structured URI for `cfg`. Credentials and vhost are passed as they are, so
/// characters such as `@`, `:` or `/` need no escaping.
fn amqp_uri(cfg: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port,
        },
        vhost: cfg.vhost.clone(),
        ..AMQPUri::default()
    }
}

fn field_table(args: &BTreeMap<String, QueueArgument>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in args {
        let value = match value {
            QueueArgument::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
            QueueArgument::Int(v) => AMQPValue::LongInt(LongInt::from(*v)),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    FieldTable::from(table)
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let table = props.headers().clone().unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        kind: props.kind().as_ref().map(|kind| kind.to_string()),
        death_count: death_count(&table),
        headers: string_headers(&table),
        data: delivery.data,
    }
}

/// Keeps the UTF-8 string headers; other values are skipped.
fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
            AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
            _ => None,
        };
        if let Some(value) = value {
            headers.insert(key.as_str().to_owned(), value);
        }
    }
    headers
}

/// Reads the retry count RabbitMQ keeps in the first `x-death` entry.
fn death_count(headers: &FieldTable) -> i64 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default()
}
