// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! Serde model of the `app` and `rabbitmq` configuration sections, and a loader
//! that layers an optional configuration file with `APP__`-prefixed environment
//! variables. Keys are kebab-case (`auto-delete`, `routing-keys`, `consumer-tag`).
//!
//! Environment variables separate sections with `__` and spell `-` as `_`:
//! `APP__RABBITMQ__BACKOFF_MS=1000` sets `rabbitmq.backoff-ms`.

use crate::{errors::AmqpError, exchange::ExchangeKind, worker_pool::Backpressure};
use config::{
    builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File, FileFormat,
    Map, Source, Value,
};
use serde::Deserialize;
use std::{collections::HashMap, fmt, time::Duration};

/// Default RabbitMQ host
pub const DEFAULT_HOST: &str = "localhost";
/// Default RabbitMQ port
pub const DEFAULT_PORT: u16 = 5672;
/// Default virtual host
pub const DEFAULT_VHOST: &str = "/";
/// Default delay between reconnect attempts
pub const DEFAULT_BACKOFF_MS: u64 = 5000;

/// Environment variable prefix used by [`Configs::load`]
pub const ENV_PREFIX: &str = "APP";

/// Root configuration consumed by the messaging runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Configs {
    pub app: AppConfigs,
    #[serde(default)]
    pub rabbitmq: RabbitMQConfigs,
}

/// Service identity.
///
/// `name` labels published messages, names the default publishing exchange and
/// is announced as the AMQP connection name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfigs {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RabbitMQConfigs {
    pub backoff_ms: u64,
    pub strict_topology: bool,
    pub connections: HashMap<String, ConnectionConfig>,
    pub channels: HashMap<String, ChannelConfig>,
    pub exchanges: HashMap<String, ExchangeConfig>,
    pub queues: HashMap<String, QueueConfig>,
    pub bindings: Vec<BindingConfig>,
    pub consumers: Vec<ConsumerConfig>,
    pub producer: Option<ProducerConfig>,
    pub dispatch: DispatchConfig,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_BACKOFF_MS,
            strict_topology: false,
            connections: HashMap::default(),
            channels: HashMap::default(),
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: vec![],
            consumers: vec![],
            producer: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl RabbitMQConfigs {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

impl ConnectionConfig {
    /// Connection to the default host, port and vhost.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            username: username.to_owned(),
            password: password.to_owned(),
            vhost: default_vhost(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    pub connection: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExchangeConfig {
    pub channel: String,
    #[serde(default, rename = "type")]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default, alias = "exclusive")]
    pub internal: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub passive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueConfig {
    pub channel: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub ttl: Option<i32>,
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub max_length_bytes: Option<i32>,
    #[serde(default)]
    pub dlq: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Milliseconds a failed message waits in the retry queue
    pub ttl: i32,
    /// Redeliveries attempted before the message goes to the DLQ, or is
    /// discarded when the queue has none
    pub retries: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BindingConfig {
    pub exchange: String,
    pub queue: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub no_wait: bool,
}

/// Consumer definition.
///
/// `auto-ack` defaults to `true`: the broker drops the message as soon as it is
/// delivered, so a failing handler loses it (at-most-once). Set it to `false` to
/// ack after the handler succeeds and reject, retry or dead-letter on failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    #[serde(default)]
    pub consumer_tag: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub queue: String,
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    #[serde(default)]
    pub requeue: bool,
}

impl ConsumerConfig {
    pub fn new(channel: &str, queue: &str) -> Self {
        Self {
            consumer_tag: String::new(),
            channel: channel.to_owned(),
            queue: queue.to_owned(),
            auto_ack: default_auto_ack(),
            exclusive: false,
            no_local: false,
            no_wait: false,
            prefetch_count: None,
            requeue: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProducerConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Publishing exchange, the service name when absent
    #[serde(default)]
    pub exchange: Option<String>,
}

/// Worker pool sizing for each consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    pub drain_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: 256,
            backpressure: Backpressure::Block,
            drain_timeout_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_owned()
}

fn default_auto_ack() -> bool {
    true
}

fn default_channel() -> String {
    "default".to_owned()
}

/// Environment source whose keys are rewritten from `_` to `-` to match the
/// kebab-case model.
#[derive(Debug, Clone)]
struct KebabEnvironment(Environment);

impl Source for KebabEnvironment {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(self
            .0
            .collect()?
            .into_iter()
            .map(|(key, value)| (key.replace('_', "-"), value))
            .collect())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator("__")
}

impl Configs {
    /// Loads the configuration from an optional file (format detected from
    /// the extension) overlaid with `APP__SECTION__KEY` environment variables.
    pub fn load(path: Option<&str>) -> Result<Configs, AmqpError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        Configs::layered(builder, environment())
    }

    fn layered(
        builder: ConfigBuilder<DefaultState>,
        env: Environment,
    ) -> Result<Configs, AmqpError> {
        let cfg: Configs = builder
            .add_source(KebabEnvironment(env))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses an in-memory configuration document.
    pub fn parse(content: &str, format: FileFormat) -> Result<Configs, AmqpError> {
        let cfg: Configs = Config::builder()
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.app.name.is_empty() {
            return Err(AmqpError::MissingProperty("app.name".to_owned()));
        }

        for (name, conn) in &self.rabbitmq.connections {
            if conn.username.is_empty() {
                return Err(AmqpError::MissingProperty(format!(
                    "rabbitmq.connections.{name}.username"
                )));
            }
            if conn.password.is_empty() {
                return Err(AmqpError::MissingProperty(format!(
                    "rabbitmq.connections.{name}.password"
                )));
            }
        }

        for (idx, consumer) in self.rabbitmq.consumers.iter().enumerate() {
            if consumer.queue.is_empty() {
                return Err(AmqpError::MissingProperty(format!(
                    "rabbitmq.consumers[{idx}].queue"
                )));
            }
            if consumer.channel.is_empty() {
                return Err(AmqpError::MissingProperty(format!(
                    "rabbitmq.consumers[{idx}].channel"
                )));
            }
        }

        let dispatch = &self.rabbitmq.dispatch;
        if dispatch.workers == 0 || dispatch.queue_capacity == 0 {
            return Err(AmqpError::ConfigError(
                "dispatch workers and queue-capacity must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}
