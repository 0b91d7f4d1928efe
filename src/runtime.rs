// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Runtime
//!
//! Wires the supervisors, the topology, the consumers and the producer from
//! [`Configs`], and tears them down in reverse order.
//!
//! ```ignore
//! let cfg = Configs::load(Some("config/app.yaml"))?;
//! let registry = HandlerRegistry::builder().register(OrderCreatedHandler)?.build();
//!
//! let rabbitmq = RabbitMQ::connect(&cfg, registry).await?;
//! if let Some(producer) = rabbitmq.producer() {
//!     producer.publish(&Context::current(), "OrderShipped", &shipped).await?;
//! }
//! rabbitmq.shutdown().await?;
//! ```

use crate::{
    amqp::LapinBroker,
    broker::{Broker, BrokerChannel},
    channel::ChannelSupervisor,
    configs::Configs,
    connection::ConnectionSupervisor,
    consumer::StatsSnapshot,
    dispatcher::ConsumerDispatcher,
    errors::AmqpError,
    handler::HandlerRegistry,
    link::{LinkState, LinkWatcher},
    publisher::Producer,
    queue::QueueDefinition,
    topology::{Topology, TopologyProvisioner},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type Supervision = JoinHandle<Result<(), AmqpError>>;

pub struct RabbitMQ {
    connections: BTreeMap<String, Arc<ConnectionSupervisor>>,
    channels: BTreeMap<String, Arc<ChannelSupervisor>>,
    supervision: Vec<Supervision>,
    topology: Topology,
    consumers: Vec<ConsumerDispatcher>,
    producer: Option<Arc<Producer>>,
}

impl RabbitMQ {
    /// Starts the runtime against RabbitMQ through `lapin`.
    pub async fn connect(cfg: &Configs, registry: HandlerRegistry) -> Result<RabbitMQ, AmqpError> {
        RabbitMQ::start(cfg, Arc::new(LapinBroker), registry).await
    }

    /// Spawns one supervisor per configured connection and channel, installs
    /// the topology, then starts the consumers and the producer.
    ///
    /// Waits for the channels the topology needs. On error everything started
    /// so far is shut down.
    pub async fn start(
        cfg: &Configs,
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
    ) -> Result<RabbitMQ, AmqpError> {
        cfg.validate()?;

        let mut runtime = RabbitMQ {
            connections: BTreeMap::new(),
            channels: BTreeMap::new(),
            supervision: vec![],
            topology: Topology::default(),
            consumers: vec![],
            producer: None,
        };

        match runtime.install(cfg, broker, registry).await {
            Ok(()) => Ok(runtime),
            Err(err) => {
                error!(error = err.to_string(), "failure to start rabbitmq runtime");
                if let Err(shutdown) = runtime.shutdown().await {
                    warn!(error = shutdown.to_string(), "failure to shut down after startup error");
                }
                Err(err)
            }
        }
    }

    async fn install(
        &mut self,
        cfg: &Configs,
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
    ) -> Result<(), AmqpError> {
        let service_name = cfg.app.name.as_str();
        let rmq = &cfg.rabbitmq;
        let backoff = rmq.backoff();

        for (name, conn_cfg) in &rmq.connections {
            let conn = Arc::new(ConnectionSupervisor::new(
                name,
                service_name,
                conn_cfg.clone(),
                broker.clone(),
                backoff,
            ));
            self.supervision.push(tokio::spawn({
                let conn = conn.clone();
                async move { conn.start().await }
            }));
            self.connections.insert(name.clone(), conn);
        }

        for (name, chan_cfg) in &rmq.channels {
            let Some(conn) = self.connections.get(&chan_cfg.connection) else {
                return Err(AmqpError::ConfigError(format!(
                    "channel `{name}` references unknown connection `{}`",
                    chan_cfg.connection
                )));
            };

            let chan = Arc::new(ChannelSupervisor::new(name, conn.watch(), backoff));
            self.supervision.push(tokio::spawn({
                let chan = chan.clone();
                async move { chan.start().await }
            }));
            self.channels.insert(name.clone(), chan);
        }

        let watchers: HashMap<_, _> = self
            .channels
            .iter()
            .map(|(name, chan)| (name.clone(), chan.watch()))
            .collect();
        self.topology = TopologyProvisioner::new(watchers, rmq.strict_topology)
            .provision(rmq)
            .await?;

        for consumer in &rmq.consumers {
            let watcher = self.channel_watch(&consumer.channel)?;

            if !registry.queues().contains(&consumer.queue.as_str()) {
                warn!(queue = %consumer.queue, "no handler registered for consumed queue");
            }

            let queue = self
                .topology
                .queue(&consumer.queue)
                .cloned()
                .unwrap_or_else(|| QueueDefinition::new(&consumer.queue));

            let dispatcher = ConsumerDispatcher::new(
                consumer.clone(),
                queue,
                rmq.dispatch.clone(),
                watcher,
                registry.clone(),
            )
            .with_backoff(backoff);
            dispatcher.start().await?;
            self.consumers.push(dispatcher);
        }

        for queue in registry.queues() {
            if !rmq.consumers.iter().any(|c| c.queue == queue) {
                warn!(queue, "handlers registered for a queue without consumer");
            }
        }

        if let Some(producer_cfg) = &rmq.producer {
            let watcher = self.channel_watch(&producer_cfg.channel)?;
            self.producer = Some(Arc::new(Producer::new(service_name, producer_cfg, watcher)));
        }

        info!(
            service = service_name,
            connections = self.connections.len(),
            channels = self.channels.len(),
            consumers = self.consumers.len(),
            "rabbitmq runtime started"
        );
        Ok(())
    }

    fn channel_watch(&self, name: &str) -> Result<LinkWatcher<dyn BrokerChannel>, AmqpError> {
        self.channels
            .get(name)
            .map(|chan| chan.watch())
            .ok_or_else(|| AmqpError::ConfigError(format!("unknown channel `{name}`")))
    }

    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.producer.clone()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn connection_state(&self, name: &str) -> Option<LinkState> {
        self.connections.get(name).map(|conn| conn.state())
    }

    pub fn channel_state(&self, name: &str) -> Option<LinkState> {
        self.channels.get(name).map(|chan| chan.state())
    }

    /// Counters per consumed queue.
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.consumers
            .iter()
            .map(|c| (c.queue().to_owned(), c.stats()))
            .collect()
    }

    /// Stops the consumers (draining in-flight work), then closes channels and
    /// connections.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        info!("shutting down rabbitmq runtime");

        for consumer in &self.consumers {
            consumer.stop().await?;
        }

        for chan in self.channels.values() {
            chan.close().await?;
        }

        for conn in self.connections.values() {
            conn.close().await?;
        }

        for task in self.supervision {
            match task.await {
                Ok(Err(err)) => warn!(error = err.to_string(), "supervisor stopped with error"),
                Err(err) => warn!(error = err.to_string(), "supervisor task failed"),
                _ => {}
            }
        }

        Ok(())
    }
}
