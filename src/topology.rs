// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! The `TopologyProvisioner` declares the configured exchanges, queues and
//! bindings once at startup, in that order. Retry and dead-letter companion
//! queues are declared before the queue whose arguments point at them.
//!
//! An entry naming a channel, queue or exchange that does not exist is logged
//! and skipped, unless strict provisioning is enabled. A declare rejected by
//! the broker always fails provisioning.

use crate::{
    broker::BrokerChannel,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    link::LinkWatcher,
    queue::{QueueBinding, QueueDefinition},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info, warn};

/// What was declared, with the channel each entity was declared on.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    queues: HashMap<String, (String, QueueDefinition)>,
    exchanges: HashMap<String, (String, ExchangeDefinition)>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    /// Declared queue `name`, with its retry and dead-letter settings.
    ///
    /// # Returns
    /// `None` when the queue was not declared, including queues skipped for
    /// a missing channel
    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name).map(|(_, def)| def)
    }

    /// Declared exchange `name`.
    pub fn exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.get(name).map(|(_, def)| def)
    }

    /// Channel the queue `name` was declared on.
    pub fn queue_channel(&self, name: &str) -> Option<&str> {
        self.queues.get(name).map(|(channel, _)| channel.as_str())
    }

    /// One entry per bound routing key, in declare order.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }
}

pub struct TopologyProvisioner {
    channels: HashMap<String, LinkWatcher<dyn BrokerChannel>>,
    strict: bool,
}

impl TopologyProvisioner {
    /// `channels` maps channel names to their supervisors' watchers.
    pub fn new(channels: HashMap<String, LinkWatcher<dyn BrokerChannel>>, strict: bool) -> Self {
        Self { channels, strict }
    }

    /// Declares everything in `cfg`. Waits for each channel it needs to be
    /// connected.
    pub async fn provision(&self, cfg: &RabbitMQConfigs) -> Result<Topology, AmqpError> {
        let mut topology = Topology::default();

        self.install_exchanges(cfg, &mut topology).await?;
        self.install_queues(cfg, &mut topology).await?;
        self.bind_queues(cfg, &mut topology).await?;

        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology installed"
        );
        Ok(topology)
    }

    async fn install_exchanges(
        &self,
        cfg: &RabbitMQConfigs,
        topology: &mut Topology,
    ) -> Result<(), AmqpError> {
        for (name, exch) in sorted(&cfg.exchanges) {
            let Some(channel) = self.channel(&exch.channel).await? else {
                self.missing(format!("channel `{}` of exchange `{name}`", exch.channel))?;
                continue;
            };

            let def = ExchangeDefinition::from_config(name, exch);
            debug!(name, kind = def.exchange_kind().as_str(), "creating exchange");
            channel.exchange_declare(&def).await?;
            debug!(name, "exchange was created");

            topology
                .exchanges
                .insert(name.to_owned(), (exch.channel.clone(), def));
        }

        Ok(())
    }

    async fn install_queues(
        &self,
        cfg: &RabbitMQConfigs,
        topology: &mut Topology,
    ) -> Result<(), AmqpError> {
        for (name, queue) in sorted(&cfg.queues) {
            let Some(channel) = self.channel(&queue.channel).await? else {
                self.missing(format!("channel `{}` of queue `{name}`", queue.channel))?;
                continue;
            };

            let def = QueueDefinition::from_config(name, queue);
            debug!(name, "creating queue");

            if let Some(retry) = def.retry_definition() {
                channel.queue_declare(&retry).await?;
                debug!(name = retry.name(), "retry queue was created");
            }

            if let Some(dlq) = def.dlq_definition() {
                channel.queue_declare(&dlq).await?;
                debug!(name = dlq.name(), "dlq was created");
            }

            let def = def.with_declare_args();
            channel.queue_declare(&def).await?;
            debug!(name, "queue was created");

            topology
                .queues
                .insert(name.to_owned(), (queue.channel.clone(), def));
        }

        Ok(())
    }

    async fn bind_queues(
        &self,
        cfg: &RabbitMQConfigs,
        topology: &mut Topology,
    ) -> Result<(), AmqpError> {
        for binding in &cfg.bindings {
            let Some((channel_name, _)) = topology.queues.get(&binding.queue) else {
                self.missing(format!("queue `{}` of a binding", binding.queue))?;
                continue;
            };
            if !topology.exchanges.contains_key(&binding.exchange) {
                self.missing(format!("exchange `{}` of a binding", binding.exchange))?;
                continue;
            }

            let Some(channel) = self.channel(channel_name).await? else {
                self.missing(format!("channel `{channel_name}` of a binding"))?;
                continue;
            };

            let keys = if binding.routing_keys.is_empty() {
                vec![String::new()]
            } else {
                binding.routing_keys.clone()
            };

            for key in keys {
                debug!(
                    queue = %binding.queue,
                    exchange = %binding.exchange,
                    key = %key,
                    "binding queue to exchange"
                );
                channel
                    .queue_bind(&binding.queue, &binding.exchange, &key, binding.no_wait)
                    .await?;

                topology.bindings.push(
                    QueueBinding::new(&binding.queue)
                        .exchange(&binding.exchange)
                        .routing_key(&key)
                        .no_wait(binding.no_wait),
                );
            }
        }

        Ok(())
    }

    /// Waits for the named channel. `Ok(None)` when no such channel exists.
    async fn channel(&self, name: &str) -> Result<Option<Arc<dyn BrokerChannel>>, AmqpError> {
        let Some(watcher) = self.channels.get(name) else {
            return Ok(None);
        };

        let mut watcher = watcher.clone();
        if watcher.current().is_none() {
            debug!(channel = name, "waiting for channel");
        }

        watcher
            .connected()
            .await
            .map(Some)
            .ok_or_else(|| AmqpError::ChannelUnavailable(name.to_owned()))
    }

    fn missing(&self, what: String) -> Result<(), AmqpError> {
        if self.strict {
            error!(missing = %what, "missing topology dependency");
            return Err(AmqpError::MissingTopologyDependency(what));
        }

        warn!(missing = %what, "missing topology dependency, skipping");
        Ok(())
    }
}

/// Entries ordered by name, so declares run in a stable order.
fn sorted<V>(map: &HashMap<String, V>) -> Vec<(&str, &V)> {
    let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.as_str(), v)).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}
