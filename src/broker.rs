// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The supervisors, the topology provisioner, the dispatcher and the producer
//! talk to the broker through these traits. `crate::amqp` implements them on
//! top of `lapin`.
//!
//! Failure notifications are delivered through a [`CloseNotifier`]: the
//! receiving half of an unbounded channel fed by the client's error callbacks.

use crate::{
    configs::{ConnectionConfig, ConsumerConfig},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

/// Receives the reason a connection or channel was closed by the broker.
pub type CloseNotifier = mpsc::UnboundedReceiver<AmqpError>;

/// Stream of deliveries produced by `basic_consume`. The stream ends when the
/// channel it was opened on goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Content type used for every published envelope
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    /// AMQP `type` property
    pub kind: Option<String>,
    /// String-valued AMQP headers
    pub headers: BTreeMap<String, String>,
    /// Times the message went through dead-lettering (`x-death` count)
    pub death_count: i64,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            data,
            ..Delivery::default()
        }
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Dials physical connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection announcing `connection_name` to the broker.
    async fn connect(
        &self,
        connection_name: &str,
        cfg: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Subscribes to the failure notification of this connection.
    fn notify_close(&self) -> CloseNotifier;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel multiplexed on a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        no_wait: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to `cfg.queue` under `cfg.consumer_tag`.
    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError>;

    /// Ends the subscription registered under `consumer_tag`. The broker stops
    /// delivering to it; unacked deliveries stay with the channel.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Subscribes to the failure notification of this channel.
    fn notify_close(&self) -> CloseNotifier;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
