// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles one delivery end to end: decode the envelope, resolve the handler,
//! start the consumer span, invoke the handler and settle the delivery.
//!
//! Settlement depends on the consumer's ack mode. With `auto-ack` the broker
//! already considers the message delivered and nothing is sent back. In manual
//! mode:
//! - success is acked;
//! - undecodable or unroutable messages are rejected without requeue;
//! - a failed message is rejected into the retry queue while its `x-death`
//!   count is below the configured retries;
//! - once retries are exhausted it is copied to the DLQ and acked, or acked
//!   and discarded when the queue has no DLQ;
//! - without a retry queue it is rejected, requeued when the consumer asks
//!   for it.
//!
//! A handler that panics is treated as failed and rejected without requeue.

use crate::{
    broker::{BrokerChannel, Delivery, PublishProperties, JSON_CONTENT_TYPE},
    configs::ConsumerConfig,
    errors::AmqpError,
    handler::HandlerRegistry,
    message::Envelope,
    otel::{self, Propagation},
    queue::QueueDefinition,
    worker_pool::panic_message,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
    Context,
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// Counter of deliveries whose handler returned an error.
pub const FAILED_METRIC: &str = "rabbitmq_consumer_failed_total";
/// Counter of deliveries whose handler panicked.
pub const PANICKED_METRIC: &str = "rabbitmq_consumer_panicked_total";

const TRACER_NAME: &str = "amqp consumer";

/// Counters kept by a consumer.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    decode_errors: AtomicU64,
    not_found: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub handled: u64,
    pub failed: u64,
    pub decode_errors: u64,
    pub not_found: u64,
    pub dropped: u64,
    pub panicked: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Processor {
    queue: QueueDefinition,
    consumer: ConsumerConfig,
    registry: HandlerRegistry,
    tracer: BoxedTracer,
    propagation: Propagation,
    stats: Arc<DispatchStats>,
}

impl Processor {
    /// Spans are started on the tracer of the global tracer provider.
    pub(crate) fn new(
        queue: QueueDefinition,
        consumer: ConsumerConfig,
        registry: HandlerRegistry,
        propagation: Propagation,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            queue,
            consumer,
            registry,
            tracer: global::tracer(TRACER_NAME),
            propagation,
            stats,
        }
    }

    pub(crate) fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub(crate) async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), AmqpError> {
        DispatchStats::bump(&self.stats.received);
        let queue = self.queue.name();

        let envelope = match Envelope::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                DispatchStats::bump(&self.stats.decode_errors);
                error!(
                    queue,
                    error = err.to_string(),
                    "removing message from queue - reason: invalid envelope"
                );
                self.reject(channel, delivery.delivery_tag).await?;
                return Err(err);
            }
        };

        let message_name = envelope.metadata.message_name.clone();
        debug!(queue, message = %message_name, "received");

        let Some(handler) = self.registry.resolve(queue, &message_name) else {
            DispatchStats::bump(&self.stats.not_found);
            warn!(
                queue,
                message = %message_name,
                "handler not found, removing message from queue"
            );
            self.reject(channel, delivery.delivery_tag).await?;
            return Err(AmqpError::HandlerNotFound(queue.to_owned(), message_name));
        };

        let metadata = envelope.metadata.clone();
        let call = match handler.bind(envelope) {
            Ok(call) => call,
            Err(err) => {
                DispatchStats::bump(&self.stats.decode_errors);
                error!(
                    queue,
                    message = %message_name,
                    error = err.to_string(),
                    "removing message from queue - reason: invalid payload"
                );
                return self.reject(channel, delivery.delivery_tag).await;
            }
        };

        let parent = self
            .propagation
            .with(|propagator| otel::extract(propagator, &metadata, &delivery.headers));
        let cx = otel::consumer_context(&self.tracer, parent, &metadata);

        let result = AssertUnwindSafe(call(cx.clone())).catch_unwind().await;
        let settled = match result {
            Ok(Ok(())) => {
                DispatchStats::bump(&self.stats.handled);
                debug!(queue, message = %message_name, "message successfully processed");
                cx.span().set_status(Status::Ok);
                self.ack(channel, delivery.delivery_tag).await
            }
            Err(panic) => {
                DispatchStats::bump(&self.stats.panicked);
                metrics::counter!(PANICKED_METRIC, "queue" => queue.to_owned()).increment(1);
                error!(
                    queue,
                    message = %message_name,
                    panic = panic_message(&*panic),
                    "handler panicked, removing message from queue"
                );
                cx.span()
                    .set_status(Status::error(Cow::from("handler panicked")));
                self.reject(channel, delivery.delivery_tag).await
            }
            Ok(Err(err)) => {
                DispatchStats::bump(&self.stats.failed);
                metrics::counter!(FAILED_METRIC, "queue" => queue.to_owned()).increment(1);
                error!(
                    queue,
                    message = %message_name,
                    error = err.to_string(),
                    "error whiling handling msg"
                );
                record_error(&cx, &err, "handler failure");
                self.on_failure(channel, &delivery, &cx).await
            }
        };

        if let Err(err) = &settled {
            record_error(&cx, err, "failure to settle msg");
        }
        cx.span().end();
        settled
    }

    /// Rejects without requeue. No-op with auto-ack.
    pub(crate) async fn reject(
        &self,
        channel: &dyn BrokerChannel,
        delivery_tag: u64,
    ) -> Result<(), AmqpError> {
        if self.consumer.auto_ack {
            return Ok(());
        }

        channel.basic_nack(delivery_tag, false).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            err
        })
    }

    async fn ack(&self, channel: &dyn BrokerChannel, delivery_tag: u64) -> Result<(), AmqpError> {
        if self.consumer.auto_ack {
            return Ok(());
        }

        channel.basic_ack(delivery_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            err
        })
    }

    async fn on_failure(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
        cx: &Context,
    ) -> Result<(), AmqpError> {
        if self.consumer.auto_ack {
            return Ok(());
        }

        let retries = self
            .queue
            .retry_name()
            .and(self.queue.retries())
            .map(i64::from);

        if let Some(retries) = retries {
            if delivery.death_count < retries {
                warn!(
                    queue = self.queue.name(),
                    attempt = delivery.death_count + 1,
                    retries,
                    "requeuing msg for latter"
                );
                return channel
                    .basic_nack(delivery.delivery_tag, false)
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error whiling requeuing");
                        err
                    });
            }

            if let Some(dlq) = self.queue.dlq_name() {
                error!(queue = self.queue.name(), dlq, "too many attempts, sending to dlq");
                cx.span()
                    .set_status(Status::error(Cow::from("msg was sent to dlq")));
                return self.publish_to_dlq(channel, dlq, delivery).await;
            }

            // The main queue dead-letters into the retry queue, so a reject
            // here would start another round.
            error!(
                queue = self.queue.name(),
                retries,
                "too many attempts and no dlq, discarding msg"
            );
            cx.span()
                .set_status(Status::error(Cow::from("msg was discarded")));
            return self.ack(channel, delivery.delivery_tag).await;
        }

        channel
            .basic_nack(delivery.delivery_tag, self.consumer.requeue)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                err
            })
    }

    async fn publish_to_dlq(
        &self,
        channel: &dyn BrokerChannel,
        dlq: &str,
        delivery: &Delivery,
    ) -> Result<(), AmqpError> {
        let props = PublishProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            kind: delivery.kind.clone(),
            headers: delivery.headers.clone(),
            ..PublishProperties::default()
        };

        if let Err(err) = channel.basic_publish("", dlq, &delivery.data, &props).await {
            error!(error = err.to_string(), dlq, "error whiling sending to dlq");
            return Err(AmqpError::PublishingToDQLError);
        }

        channel.basic_ack(delivery.delivery_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg to default queue");
            err
        })
    }
}

fn record_error(cx: &Context, err: &(dyn std::error::Error + 'static), description: &'static str) {
    let span = cx.span();
    span.record_error(err);
    span.set_status(Status::error(description));
}
