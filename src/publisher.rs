// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! The `Producer` wraps payloads in the message envelope, propagates the
//! caller's trace context and publishes to the service exchange with the
//! message name as routing key.
//!
//! Trace context is injected with the globally installed text-map propagator
//! unless [`Producer::with_propagator`] sets another one.

use crate::{
    broker::{BrokerChannel, PublishProperties, JSON_CONTENT_TYPE},
    configs::ProducerConfig,
    errors::AmqpError,
    link::LinkWatcher,
    message::{Envelope, Metadata},
    otel::{self, Propagation},
};
use async_trait::async_trait;
use opentelemetry::{propagation::TextMapPropagator, Context};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Object-safe publishing interface.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_json(
        &self,
        cx: &Context,
        message_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), AmqpError>;
}

pub struct Producer {
    service_name: String,
    exchange: String,
    channel: LinkWatcher<dyn BrokerChannel>,
    propagation: Propagation,
    serialize: Mutex<()>,
}

impl Producer {
    /// Publishes on `channel` as `service_name`, to `config.exchange` or to
    /// the exchange named after the service.
    pub fn new(
        service_name: &str,
        config: &ProducerConfig,
        channel: LinkWatcher<dyn BrokerChannel>,
    ) -> Self {
        let exchange = config
            .exchange
            .clone()
            .unwrap_or_else(|| service_name.to_owned());

        Self {
            service_name: service_name.to_owned(),
            exchange,
            channel,
            propagation: Propagation::default(),
            serialize: Mutex::new(()),
        }
    }

    /// Injects trace context with `propagator` instead of the global one.
    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagation = Propagation::Custom(propagator);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `payload` as `message_name`. Fails with
    /// [`AmqpError::ChannelUnavailable`] while the channel is down; nothing is
    /// retried here.
    pub async fn publish<T>(
        &self,
        cx: &Context,
        message_name: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let channel = self
            .channel
            .current()
            .ok_or_else(|| AmqpError::ChannelUnavailable(self.channel.name().to_owned()))?;

        let mut metadata = Metadata::new(&self.service_name, message_name);
        let mut headers = BTreeMap::new();
        self.propagation
            .with(|propagator| otel::enrich(cx, propagator, &mut metadata, &mut headers));

        let timestamp = u64::try_from(metadata.publish_date.timestamp()).ok();
        let data = Envelope::new(metadata, payload).to_vec()?;

        let props = PublishProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            kind: Some(message_name.to_owned()),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp,
            headers,
            mandatory: false,
            immediate: false,
        };

        let _guard = self.serialize.lock().await;
        match channel
            .basic_publish(&self.exchange, message_name, &data, &props)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %self.exchange,
                    message = message_name,
                    "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(exchange = %self.exchange, message = message_name, "message published");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Publisher for Producer {
    async fn publish_json(
        &self,
        cx: &Context,
        message_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), AmqpError> {
        self.publish(cx, message_name, &payload).await
    }
}
