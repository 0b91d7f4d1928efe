// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Declared exchanges, queues and bindings live at broker level and survive
//! reconnects, like on a real RabbitMQ node. Acks, nacks, publishes and
//! consumers are recorded per channel.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, CloseNotifier, Delivery, DeliveryStream,
        PublishProperties,
    },
    configs::{ConnectionConfig, ConsumerConfig},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Default)]
pub(crate) struct Declared {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
    rejected: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    dials: AtomicUsize,
    fail_next: AtomicUsize,
    declared: Arc<Mutex<Declared>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Fails the next `n` dials; `usize::MAX` fails every dial.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn connection(&self, idx: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[idx].clone()
    }

    /// Makes every declare of `name` fail.
    pub(crate) fn reject(&self, name: &str) {
        self.declared.lock().unwrap().rejected.insert(name.to_owned());
    }

    pub(crate) fn exchanges(&self) -> Vec<ExchangeDefinition> {
        self.declared.lock().unwrap().exchanges.clone()
    }

    pub(crate) fn queues(&self) -> Vec<QueueDefinition> {
        self.declared.lock().unwrap().queues.clone()
    }

    pub(crate) fn bindings(&self) -> Vec<QueueBinding> {
        self.declared.lock().unwrap().bindings.clone()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(
        &self,
        _connection_name: &str,
        _cfg: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self.fail_next.load(Ordering::SeqCst);
        if failing > 0 {
            if failing != usize::MAX {
                self.fail_next.store(failing - 1, Ordering::SeqCst);
            }
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let conn = Arc::new(FakeConnection {
            declared: self.declared.clone(),
            ..FakeConnection::default()
        });
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
pub(crate) struct FakeConnection {
    closed: AtomicBool,
    declared: Arc<Mutex<Declared>>,
    notifiers: Mutex<Vec<mpsc::UnboundedSender<AmqpError>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    /// Simulates the broker dropping the connection. Its channels die with it
    /// without a channel-level notification.
    pub(crate) fn fail(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.kill();
        }
        for tx in self.notifiers.lock().unwrap().drain(..) {
            let _ = tx.send(AmqpError::Closed(reason.to_owned()));
        }
    }

    pub(crate) fn channel(&self, idx: usize) -> Arc<FakeChannel> {
        self.channels.lock().unwrap()[idx].clone()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let channel = Arc::new(FakeChannel::on(self.declared.clone()));
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn notify_close(&self) -> CloseNotifier {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notifiers.lock().unwrap().push(tx);
        rx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.kill();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub props: PublishProperties,
}

#[derive(Default)]
struct ChannelState {
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    published: Vec<Published>,
    qos: Option<u16>,
    consumed: Vec<String>,
    consumer_tags: Vec<String>,
    cancelled: Vec<String>,
    consumers: Vec<(String, DeliverySender)>,
    notifiers: Vec<mpsc::UnboundedSender<AmqpError>>,
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    closed: AtomicBool,
    declared: Arc<Mutex<Declared>>,
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    /// A channel on its own broker.
    pub(crate) fn new() -> Arc<FakeChannel> {
        Arc::new(FakeChannel::default())
    }

    fn on(declared: Arc<Mutex<Declared>>) -> FakeChannel {
        FakeChannel {
            declared,
            ..FakeChannel::default()
        }
    }

    /// Pushes a delivery to the first consumer. Returns false when nobody consumes.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        let state = self.state.lock().unwrap();
        state
            .consumers
            .iter()
            .any(|(_, tx)| tx.send(Ok(delivery.clone())).is_ok())
    }

    /// Simulates a channel-level error reported by the broker.
    pub(crate) fn fail(&self, reason: &str) {
        self.kill();
        let mut state = self.state.lock().unwrap();
        for tx in state.notifiers.drain(..) {
            let _ = tx.send(AmqpError::Closed(reason.to_owned()));
        }
    }

    /// Closes the channel silently, ending its delivery streams.
    pub(crate) fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().consumers.clear();
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.state.lock().unwrap().acks.clone()
    }

    pub(crate) fn nacks(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().nacks.clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub(crate) fn qos(&self) -> Option<u16> {
        self.state.lock().unwrap().qos
    }

    /// Queues a `basic_consume` was issued for, in order.
    pub(crate) fn consumed(&self) -> Vec<String> {
        self.state.lock().unwrap().consumed.clone()
    }

    /// Consumer tags `basic_consume` was issued with, in order.
    pub(crate) fn consumer_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().consumer_tags.clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub(crate) fn exchanges(&self) -> Vec<ExchangeDefinition> {
        self.declared.lock().unwrap().exchanges.clone()
    }

    pub(crate) fn queues(&self) -> Vec<QueueDefinition> {
        self.declared.lock().unwrap().queues.clone()
    }

    pub(crate) fn bindings(&self) -> Vec<QueueBinding> {
        self.declared.lock().unwrap().bindings.clone()
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut declared = self.declared.lock().unwrap();
        if declared.rejected.contains(def.name()) {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        match declared.exchanges.iter().find(|e| e.name() == def.name()) {
            Some(existing) if existing == def => Ok(()),
            Some(_) => Err(AmqpError::DeclareExchangeError(def.name().to_owned())),
            None => {
                declared.exchanges.push(def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut declared = self.declared.lock().unwrap();
        if declared.rejected.contains(def.name()) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        match declared.queues.iter().find(|q| q.name() == def.name()) {
            Some(existing) if existing == def => Ok(()),
            Some(_) => Err(AmqpError::DeclareQueueError(def.name().to_owned())),
            None => {
                declared.queues.push(def.clone());
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        no_wait: bool,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut declared = self.declared.lock().unwrap();
        let known_queue = declared.queues.iter().any(|q| q.name() == queue);
        let known_exchange = declared.exchanges.iter().any(|e| e.name() == exchange);
        if !known_queue || !known_exchange {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key)
            .no_wait(no_wait);
        if !declared.bindings.contains(&binding) {
            declared.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.lock().unwrap().qos = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(&self, cfg: &ConsumerConfig) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.consumed.push(cfg.queue.clone());
        state.consumer_tags.push(cfg.consumer_tag.clone());
        state.consumers.push((cfg.consumer_tag.clone(), tx));

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(consumer_tag.to_owned());
        state.consumers.retain(|(tag, _)| tag != consumer_tag);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        self.state.lock().unwrap().acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::NackMessageError)?;
        self.state.lock().unwrap().nacks.push((delivery_tag, requeue));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;
        self.state.lock().unwrap().published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            props: props.clone(),
        });
        Ok(())
    }

    fn notify_close(&self) -> CloseNotifier {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().notifiers.push(tx);
        rx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.kill();
        Ok(())
    }
}

/// Polls `cond` until it holds, failing the test after ten seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
