// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! A `ConsumerDispatcher` consumes one queue over one supervised channel. A
//! single pull task reads deliveries in broker order and hands each one to a
//! bounded [`WorkerPool`]; completion order across workers is not guaranteed.
//!
//! When the delivery stream ends because the channel died, the pull task waits
//! for the channel supervisor to publish a replacement and subscribes again.
//!
//! Stopping cancels the subscription on the broker before the pool drains. A
//! consumer without a configured tag gets a generated `<queue>-<uuid>` tag so
//! it can be cancelled.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream},
    configs::{ConsumerConfig, DispatchConfig, DEFAULT_BACKOFF_MS},
    consumer::{DispatchStats, Processor, StatsSnapshot},
    errors::AmqpError,
    handler::HandlerRegistry,
    link::LinkWatcher,
    otel::Propagation,
    queue::QueueDefinition,
    worker_pool::{Submitted, WorkerPool},
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::propagation::TextMapPropagator;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ConsumerDispatcher {
    consumer: ConsumerConfig,
    queue: QueueDefinition,
    dispatch: DispatchConfig,
    backoff: Duration,
    channel: LinkWatcher<dyn BrokerChannel>,
    registry: HandlerRegistry,
    propagation: Propagation,
    stats: Arc<DispatchStats>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerDispatcher {
    /// Creates a dispatcher for `consumer.queue`. `queue` carries the retry and
    /// dead-letter settings used in manual-ack mode.
    pub fn new(
        mut consumer: ConsumerConfig,
        queue: QueueDefinition,
        dispatch: DispatchConfig,
        channel: LinkWatcher<dyn BrokerChannel>,
        registry: HandlerRegistry,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        if consumer.consumer_tag.is_empty() {
            consumer.consumer_tag = format!("{}-{}", consumer.queue, Uuid::new_v4());
        }

        Self {
            consumer,
            queue,
            dispatch,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            channel,
            registry,
            propagation: Propagation::default(),
            stats: Arc::new(DispatchStats::default()),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Delay before subscribing again after a failed `basic_consume`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Extracts trace context with `propagator` instead of the global one.
    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagation = Propagation::Custom(propagator);
        self
    }

    pub fn queue(&self) -> &str {
        &self.consumer.queue
    }

    /// Tag the subscription is registered under on the broker.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer.consumer_tag
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Waits for the channel, subscribes and spawns the pull task.
    ///
    /// A failure to subscribe the first time is returned; later resubscriptions
    /// are retried by the pull task.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(AmqpError::ConsumerError(format!(
                "consumer for `{}` already started",
                self.consumer.queue
            )));
        }

        info!(
            queue = %self.consumer.queue,
            channel = %self.channel.name(),
            auto_ack = self.consumer.auto_ack,
            "starting consumer"
        );

        let mut stop = self.stop.subscribe();
        let mut watcher = self.channel.clone();
        let channel = tokio::select! {
            channel = watcher.connected() => channel,
            _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
        };
        let Some(channel) = channel else {
            return Err(AmqpError::ChannelUnavailable(watcher.name().to_owned()));
        };

        let stream = subscribe(channel.as_ref(), &self.consumer).await?;

        let processor = Arc::new(Processor::new(
            self.queue.clone(),
            self.consumer.clone(),
            self.registry.clone(),
            self.propagation.clone(),
            self.stats.clone(),
        ));

        let pull = PullLoop {
            consumer: self.consumer.clone(),
            dispatch: self.dispatch.clone(),
            backoff: self.backoff,
            watcher,
            processor,
            stop,
        };
        *task = Some(tokio::spawn(pull.run(channel, stream)));

        Ok(())
    }

    /// Cancels the broker subscription, stops pulling and waits for queued
    /// work to drain, up to the configured drain timeout.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.stop.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))?;
        }

        info!(queue = %self.consumer.queue, "consumer stopped");
        Ok(())
    }
}

async fn subscribe(
    channel: &dyn BrokerChannel,
    consumer: &ConsumerConfig,
) -> Result<DeliveryStream, AmqpError> {
    if let Some(prefetch) = consumer.prefetch_count {
        channel.basic_qos(prefetch).await?;
    }

    channel.basic_consume(consumer).await
}

struct PullLoop {
    consumer: ConsumerConfig,
    dispatch: DispatchConfig,
    backoff: Duration,
    watcher: LinkWatcher<dyn BrokerChannel>,
    processor: Arc<Processor>,
    stop: watch::Receiver<bool>,
}

impl PullLoop {
    async fn run(mut self, mut channel: Arc<dyn BrokerChannel>, mut stream: DeliveryStream) {
        let pool = WorkerPool::new(
            &self.consumer.queue,
            self.dispatch.workers,
            self.dispatch.queue_capacity,
            self.dispatch.backpressure,
        );

        loop {
            let next = tokio::select! {
                next = stream.next() => Some(next),
                _ = self.stop.wait_for(|stopped| *stopped) => None,
            };
            let Some(next) = next else {
                self.cancel(channel.as_ref()).await;
                break;
            };

            match next {
                Some(Ok(delivery)) => self.submit(&pool, &channel, delivery).await,
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    warn!(
                        queue = %self.consumer.queue,
                        "delivery stream ended, waiting for the channel"
                    );
                    match self.resubscribe(&channel).await {
                        Some((fresh, fresh_stream)) => {
                            channel = fresh;
                            stream = fresh_stream;
                        }
                        None => break,
                    }
                }
            }
        }

        drop(stream);
        debug!(queue = %self.consumer.queue, "draining in-flight messages");
        pool.shutdown(self.dispatch.drain_timeout()).await;
    }

    async fn cancel(&self, channel: &dyn BrokerChannel) {
        if channel.is_closed() {
            return;
        }

        let tag = &self.consumer.consumer_tag;
        match channel.basic_cancel(tag).await {
            Ok(()) => debug!(queue = %self.consumer.queue, tag, "consumer cancelled"),
            Err(err) => warn!(
                queue = %self.consumer.queue,
                error = err.to_string(),
                "failure to cancel consumer"
            ),
        }
    }

    async fn submit(&self, pool: &WorkerPool, channel: &Arc<dyn BrokerChannel>, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let job = {
            let processor = self.processor.clone();
            let channel = channel.clone();
            async move {
                if let Err(err) = processor.process(channel.as_ref(), delivery).await {
                    debug!(error = err.to_string(), "error consume msg");
                }
            }
            .boxed()
        };

        match pool.submit(job).await {
            Submitted::Queued => {}
            Submitted::Dropped => {
                self.processor.stats().record_dropped();
                if let Err(err) = self.processor.reject(channel.as_ref(), delivery_tag).await {
                    error!(error = err.to_string(), "failure to reject dropped msg");
                }
            }
            Submitted::Closed => warn!(queue = %self.consumer.queue, "worker pool closed"),
        }
    }

    /// Subscribes again once a usable channel is available. Returns `None`
    /// when stopped or when the channel supervisor has closed.
    async fn resubscribe(
        &mut self,
        stale: &Arc<dyn BrokerChannel>,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        if stale.is_closed() {
            tokio::select! {
                _ = self.watcher.lost(stale) => {},
                _ = self.stop.wait_for(|stopped| *stopped) => return None,
            }
        } else if self.sleep_or_stop().await {
            return None;
        }

        loop {
            let channel = tokio::select! {
                channel = self.watcher.connected() => channel?,
                _ = self.stop.wait_for(|stopped| *stopped) => return None,
            };

            match subscribe(channel.as_ref(), &self.consumer).await {
                Ok(stream) => {
                    info!(queue = %self.consumer.queue, "consumer resubscribed");
                    return Some((channel, stream));
                }
                Err(err) => {
                    error!(
                        queue = %self.consumer.queue,
                        error = err.to_string(),
                        backoff = ?self.backoff,
                        "failure to resubscribe, retrying"
                    );
                    if self.sleep_or_stop().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn sleep_or_stop(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => false,
            _ = self.stop.wait_for(|stopped| *stopped) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelSupervisor,
        configs::ConnectionConfig,
        connection::ConnectionSupervisor,
        errors::MessagingError,
        handler::{MessageHandler, MessageProperties},
        link::Link,
        message::{Envelope, Metadata},
        testing::{eventually, FakeBroker, FakeChannel},
        worker_pool::Backpressure,
    };
    use async_trait::async_trait;
    use opentelemetry::{
        global,
        trace::{TraceContextExt, TraceId},
        Context,
    };
    use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider};
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Once,
    };
    use tokio::sync::Semaphore;

    static TRACER_PROVIDER: Once = Once::new();

    fn install_tracer_provider() {
        TRACER_PROVIDER.call_once(|| {
            global::set_tracer_provider(SdkTracerProvider::builder().build());
        });
    }

    #[derive(Clone)]
    struct Recorder {
        message_name: &'static str,
        calls: Arc<AtomicUsize>,
        started: Arc<AtomicUsize>,
        traces: Arc<std::sync::Mutex<Vec<TraceId>>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl Recorder {
        fn new(message_name: &'static str) -> Self {
            Self {
                message_name,
                calls: Arc::default(),
                started: Arc::default(),
                traces: Arc::default(),
                gate: None,
            }
        }

        fn gated(message_name: &'static str) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let recorder = Self {
                gate: Some(gate.clone()),
                ..Recorder::new(message_name)
            };
            (recorder, gate)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        type Payload = serde_json::Value;

        fn properties(&self) -> MessageProperties {
            MessageProperties::new("orders", self.message_name)
        }

        async fn handle(
            &self,
            cx: &Context,
            _message: Envelope<serde_json::Value>,
        ) -> Result<(), MessagingError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.traces
                .lock()
                .unwrap()
                .push(cx.span().span_context().trace_id());

            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| MessagingError::InternalError)?
                    .forget();
            }

            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl MessageHandler for Exploding {
        type Payload = serde_json::Value;

        fn properties(&self) -> MessageProperties {
            MessageProperties::new("orders", "Explode")
        }

        async fn handle(
            &self,
            _cx: &Context,
            _message: Envelope<serde_json::Value>,
        ) -> Result<(), MessagingError> {
            panic!("handler blew up");
        }
    }

    fn delivery(tag: u64, name: &str) -> Delivery {
        let envelope = Envelope::new(Metadata::new("billing", name), json!({ "id": tag }));
        Delivery::new(tag, envelope.to_vec().unwrap())
    }

    fn watcher_of(channel: &Arc<FakeChannel>) -> (watch::Sender<Link<dyn BrokerChannel>>, LinkWatcher<dyn BrokerChannel>) {
        let handle: Arc<dyn BrokerChannel> = channel.clone();
        let (tx, rx) = watch::channel(Link::connected(handle));
        (tx, LinkWatcher::new("default", rx))
    }

    fn dispatcher(
        watcher: LinkWatcher<dyn BrokerChannel>,
        registry: HandlerRegistry,
        auto_ack: bool,
        dispatch: DispatchConfig,
    ) -> ConsumerDispatcher {
        let mut consumer = ConsumerConfig::new("default", "orders");
        consumer.auto_ack = auto_ack;
        consumer.prefetch_count = Some(10);
        ConsumerDispatcher::new(
            consumer,
            QueueDefinition::new("orders"),
            dispatch,
            watcher,
            registry,
        )
    }

    #[tokio::test]
    async fn routes_registered_message_to_its_handler() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let recorder = Recorder::new("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatcher = dispatcher(watcher, registry, false, DispatchConfig::default());
        dispatcher.start().await.unwrap();
        assert_eq!(channel.qos(), Some(10));
        assert_eq!(channel.consumed(), vec!["orders"]);

        assert!(channel.deliver(delivery(1, "OrderCreated")));
        eventually(|| channel.acks() == vec![1]).await;

        dispatcher.stop().await.unwrap();
        assert_eq!(recorder.calls(), 1);
        assert_eq!(dispatcher.stats().handled, 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_consumer() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let recorder = Recorder::new("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .register(Exploding)
            .unwrap()
            .build();

        let dispatch = DispatchConfig {
            workers: 1,
            ..DispatchConfig::default()
        };
        let dispatcher = dispatcher(watcher, registry, false, dispatch);
        dispatcher.start().await.unwrap();

        channel.deliver(delivery(1, "Explode"));
        channel.deliver(delivery(2, "OrderCreated"));
        eventually(|| channel.acks() == vec![2]).await;
        dispatcher.stop().await.unwrap();

        assert_eq!(channel.nacks(), vec![(1, false)]);
        assert_eq!(recorder.calls(), 1);
        assert_eq!(dispatcher.stats().panicked, 1);
    }

    #[tokio::test]
    async fn stop_cancels_the_broker_subscription() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let recorder = Recorder::new("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatcher = dispatcher(watcher, registry, true, DispatchConfig::default());
        let tag = dispatcher.consumer_tag().to_owned();
        assert!(tag.starts_with("orders-"));

        dispatcher.start().await.unwrap();
        assert_eq!(channel.consumer_tags(), vec![tag.clone()]);

        dispatcher.stop().await.unwrap();
        assert_eq!(channel.cancelled(), vec![tag]);
        assert!(!channel.deliver(delivery(1, "OrderCreated")));
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn configured_consumer_tag_is_kept() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let mut consumer = ConsumerConfig::new("default", "orders");
        consumer.consumer_tag = "billing-1".to_owned();

        let dispatcher = ConsumerDispatcher::new(
            consumer,
            QueueDefinition::new("orders"),
            DispatchConfig::default(),
            watcher,
            HandlerRegistry::default(),
        );
        dispatcher.start().await.unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(channel.consumer_tags(), vec!["billing-1"]);
        assert_eq!(channel.cancelled(), vec!["billing-1"]);
    }

    #[tokio::test]
    async fn unknown_message_does_not_affect_others() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let recorder = Recorder::new("A");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatcher = dispatcher(watcher, registry, true, DispatchConfig::default());
        dispatcher.start().await.unwrap();

        for (tag, name) in [(1, "A"), (2, "B"), (3, "A")] {
            channel.deliver(delivery(tag, name));
        }
        eventually(|| dispatcher.stats().received == 3).await;
        dispatcher.stop().await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(recorder.calls(), 2);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.handled, 2);
        assert!(channel.acks().is_empty());
    }

    #[tokio::test]
    async fn handler_runs_inside_the_publisher_trace() {
        install_tracer_provider();
        let trace_id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();

        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let recorder = Recorder::new("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatcher = dispatcher(watcher, registry, true, DispatchConfig::default())
            .with_propagator(Arc::new(TraceContextPropagator::new()));
        dispatcher.start().await.unwrap();

        let mut metadata = Metadata::new("billing", "OrderCreated");
        metadata.traceparent = format!("00-{trace_id}-00f067aa0ba902b7-01");
        metadata.span_id = "00f067aa0ba902b7".to_owned();
        let envelope = Envelope::new(metadata, json!({}));
        channel.deliver(Delivery::new(1, envelope.to_vec().unwrap()));

        eventually(|| recorder.calls() == 1).await;
        dispatcher.stop().await.unwrap();

        assert_eq!(*recorder.traces.lock().unwrap(), vec![trace_id]);
    }

    #[tokio::test]
    async fn drop_policy_rejects_when_saturated() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let (recorder, gate) = Recorder::gated("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatch = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            backpressure: Backpressure::Drop,
            ..DispatchConfig::default()
        };
        let dispatcher = dispatcher(watcher, registry, false, dispatch);
        dispatcher.start().await.unwrap();

        channel.deliver(delivery(1, "OrderCreated"));
        eventually(|| recorder.started.load(Ordering::SeqCst) == 1).await;

        channel.deliver(delivery(2, "OrderCreated"));
        channel.deliver(delivery(3, "OrderCreated"));
        eventually(|| dispatcher.stats().dropped == 1).await;
        assert_eq!(channel.nacks(), vec![(3, false)]);

        gate.add_permits(10);
        eventually(|| channel.acks() == vec![1, 2]).await;
        dispatcher.stop().await.unwrap();
        assert_eq!(recorder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_work() {
        let channel = FakeChannel::new();
        let (_tx, watcher) = watcher_of(&channel);
        let (recorder, gate) = Recorder::gated("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();

        let dispatcher = Arc::new(dispatcher(watcher, registry, false, DispatchConfig::default()));
        dispatcher.start().await.unwrap();
        channel.deliver(delivery(1, "OrderCreated"));
        eventually(|| recorder.started.load(Ordering::SeqCst) == 1).await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            gate.add_permits(1);
        });
        dispatcher.stop().await.unwrap();

        assert_eq!(recorder.calls(), 1);
        assert_eq!(channel.acks(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_channel_is_available() {
        let (_tx, rx) = watch::channel(Link::<dyn BrokerChannel>::disconnected());
        let registry = HandlerRegistry::builder().build();
        let dispatcher = Arc::new(dispatcher(
            LinkWatcher::new("default", rx),
            registry,
            true,
            DispatchConfig::default(),
        ));

        let start = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.start().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        dispatcher.stop().await.unwrap();
        start.await.unwrap().unwrap();
        assert_eq!(dispatcher.stats(), StatsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_the_connection_drops() {
        let broker = FakeBroker::new();
        let backoff = Duration::from_secs(5);
        let conn = Arc::new(ConnectionSupervisor::new(
            "default",
            "orders-service",
            ConnectionConfig::new("guest", "guest"),
            broker.clone(),
            backoff,
        ));
        let chan = Arc::new(ChannelSupervisor::new("default", conn.watch(), backoff));
        let tasks = [
            tokio::spawn({
                let conn = conn.clone();
                async move { conn.start().await }
            }),
            tokio::spawn({
                let chan = chan.clone();
                async move { chan.start().await }
            }),
        ];

        let recorder = Recorder::new("OrderCreated");
        let registry = HandlerRegistry::builder()
            .register(recorder.clone())
            .unwrap()
            .build();
        let dispatcher = dispatcher(chan.watch(), registry, false, DispatchConfig::default());
        dispatcher.start().await.unwrap();

        let first = broker.connection(0).channel(0);
        first.deliver(delivery(1, "OrderCreated"));
        eventually(|| first.acks() == vec![1]).await;

        broker.connection(0).fail("CONNECTION_FORCED");
        eventually(|| broker.dials() == 2).await;
        eventually(|| broker.connection(1).channel_count() == 1).await;
        let second = broker.connection(1).channel(0);
        eventually(|| second.consumed() == vec!["orders"]).await;

        second.deliver(delivery(1, "OrderCreated"));
        eventually(|| second.acks() == vec![1]).await;
        assert_eq!(recorder.calls(), 2);

        dispatcher.stop().await.unwrap();
        chan.close().await.unwrap();
        conn.close().await.unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }
}
