// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Application code implements [`MessageHandler`] for one message type on one
//! queue. Handlers are collected into a [`HandlerRegistry`] before any consumer
//! starts; the registry is immutable afterwards and shared between consumers
//! without locking.
//!
//! The payload type is fixed at registration: each handler is wrapped in an
//! adapter that decodes the opaque envelope payload into `H::Payload` before
//! calling it.
//!
//! ```ignore
//! struct OrderCreatedHandler;
//!
//! #[async_trait]
//! impl MessageHandler for OrderCreatedHandler {
//!     type Payload = OrderCreated;
//!
//!     fn properties(&self) -> MessageProperties {
//!         MessageProperties::new("orders", "OrderCreated")
//!     }
//!
//!     async fn handle(&self, cx: &Context, msg: Envelope<OrderCreated>) -> Result<(), MessagingError> {
//!         Ok(())
//!     }
//! }
//!
//! let registry = HandlerRegistry::builder()
//!     .register(OrderCreatedHandler)?
//!     .build();
//! ```

use crate::{
    errors::{AmqpError, MessagingError},
    message::Envelope,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Queue and message name a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageProperties {
    pub queue_name: String,
    pub message_name: String,
}

impl MessageProperties {
    pub fn new(queue_name: &str, message_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            message_name: message_name.to_owned(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Type the envelope payload is decoded into.
    type Payload: DeserializeOwned + Send + 'static;

    fn properties(&self) -> MessageProperties;

    async fn handle(
        &self,
        cx: &Context,
        message: Envelope<Self::Payload>,
    ) -> Result<(), MessagingError>;
}

/// A handler call whose payload is already decoded. It runs the handler with
/// the context it is given.
pub type Invocation<'a> =
    Box<dyn FnOnce(Context) -> BoxFuture<'a, Result<(), MessagingError>> + Send + 'a>;

/// Handler with its payload type erased.
pub trait DynHandler: Send + Sync {
    /// Decodes the envelope payload into the handler's payload type.
    ///
    /// # Returns
    /// The call to run, or `AmqpError::ParsePayloadError` when the payload
    /// does not match. Nothing of the handler runs before the call is invoked.
    fn bind(&self, envelope: Envelope) -> Result<Invocation<'_>, AmqpError>;
}

struct Typed<H>(H);

impl<H: MessageHandler> DynHandler for Typed<H> {
    fn bind(&self, envelope: Envelope) -> Result<Invocation<'_>, AmqpError> {
        let message = envelope.decode::<H::Payload>()?;

        Ok(Box::new(move |cx: Context| {
            async move { self.0.handle(&cx, message).await }.boxed()
        }))
    }
}

type Routes = HashMap<String, HashMap<String, Arc<dyn DynHandler>>>;

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    routes: Routes,
}

impl HandlerRegistryBuilder {
    /// Registers `handler` under its own [`MessageProperties`].
    pub fn register<H: MessageHandler>(self, handler: H) -> Result<Self, AmqpError> {
        let props = handler.properties();
        self.register_for(&props.queue_name, &props.message_name, handler)
    }

    /// Registers `handler` under an explicit queue and message name.
    pub fn register_for<H: MessageHandler>(
        mut self,
        queue: &str,
        message_name: &str,
        handler: H,
    ) -> Result<Self, AmqpError> {
        let by_name = self.routes.entry(queue.to_owned()).or_default();
        if by_name.contains_key(message_name) {
            return Err(AmqpError::DuplicateHandler(
                queue.to_owned(),
                message_name.to_owned(),
            ));
        }

        debug!(queue, message_name, "handler registered");
        by_name.insert(message_name.to_owned(), Arc::new(Typed(handler)));
        Ok(self)
    }

    /// Freezes the registered handlers into a shareable registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            routes: Arc::new(self.routes),
        }
    }
}

/// Read-only `(queue, message name) -> handler` map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: Arc<Routes>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Looks up the handler for a delivery.
    ///
    /// # Parameters
    /// * `queue` - Queue the delivery was consumed from
    /// * `message_name` - `messageName` from the envelope metadata
    ///
    /// # Returns
    /// The handler, or `None` when nothing is registered for the pair
    pub fn resolve(&self, queue: &str, message_name: &str) -> Option<&Arc<dyn DynHandler>> {
        self.routes.get(queue)?.get(message_name)
    }

    /// Number of registered handlers across all queues.
    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues with at least one handler.
    pub fn queues(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }
}
