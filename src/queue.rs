// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for defining RabbitMQ queues and their bindings. Queues may carry a
//! Dead Letter Queue (`<name>-dlq`) and a retry queue (`<name>-retry`); both
//! companions are declared by the topology provisioner before the main queue.

use crate::configs::{QueueConfig, RetryConfig};
use std::collections::BTreeMap;

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Queue argument value, kept independent of the AMQP client types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Str(String),
    Int(i32),
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) args: BTreeMap<String, QueueArgument>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Builds the definition of the queue `name` from its configuration entry.
    pub fn from_config(name: &str, cfg: &QueueConfig) -> QueueDefinition {
        let mut def = QueueDefinition::new(name);
        def.durable = cfg.durable;
        def.delete = cfg.auto_delete;
        def.exclusive = cfg.exclusive;
        def.passive = cfg.passive;
        def.no_wait = cfg.no_wait;
        def.ttl = cfg.ttl;
        def.max_length = cfg.max_length;
        def.max_length_bytes = cfg.max_length_bytes;

        if cfg.dlq {
            def = def.with_dlq();
        }

        if let Some(RetryConfig { ttl, retries }) = cfg.retry {
            def = def.with_retry(ttl, retries);
        }

        def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<i32> {
        self.retries
    }

    /// Declare arguments, including the dead-letter routing towards the retry
    /// queue (when configured) or the DLQ.
    pub fn args(&self) -> &BTreeMap<String, QueueArgument> {
        &self.args
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue named `<name>-dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue named `<name>-retry` holding failed messages for
    /// `ttl` milliseconds, up to `retries` times.
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    /// Definition of the retry companion queue: messages expire back into the
    /// main queue through the default exchange.
    pub(crate) fn retry_definition(&self) -> Option<QueueDefinition> {
        let retry_name = self.retry_name.as_ref()?;
        let mut def = self.companion(retry_name);
        def.args.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            QueueArgument::Str(String::new()),
        );
        def.args.insert(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
            QueueArgument::Str(self.name.clone()),
        );
        if let Some(ttl) = self.retry_ttl {
            def.args.insert(
                AMQP_HEADERS_MESSAGE_TTL.to_owned(),
                QueueArgument::Int(ttl),
            );
        }
        Some(def)
    }

    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        let dlq_name = self.dlq_name.as_ref()?;
        Some(self.companion(dlq_name))
    }

    /// Copy of this definition with its declare arguments filled in.
    pub(crate) fn with_declare_args(&self) -> QueueDefinition {
        let mut def = self.clone();

        let dead_letter_target = self.retry_name.as_ref().or(self.dlq_name.as_ref());
        if let Some(target) = dead_letter_target {
            def.args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                QueueArgument::Str(String::new()),
            );
            def.args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                QueueArgument::Str(target.clone()),
            );
        }

        if let Some(ttl) = self.ttl {
            def.args
                .insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), QueueArgument::Int(ttl));
        }

        if let Some(max) = self.max_length {
            def.args
                .insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), QueueArgument::Int(max));
        }

        if let Some(max) = self.max_length_bytes {
            def.args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                QueueArgument::Int(max),
            );
        }

        def
    }

    fn companion(&self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            no_wait: self.no_wait,
            ..QueueDefinition::default()
        }
    }
}

/// Binding of a queue to an exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) no_wait: bool,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            no_wait: false,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
