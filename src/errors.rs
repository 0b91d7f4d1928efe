// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Messaging
//!
//! `AmqpError` covers every failure the connectivity, topology, dispatch and
//! publishing layers can report. `MessagingError` is what application handlers
//! return from `MessageHandler::handle`.
//!
//! How each variant is treated:
//! - connectivity (`ConnectionError`, `ChannelError`) is retried forever by the
//!   supervisors and never reaches callers;
//! - declare failures are fatal at startup, missing topology dependencies are
//!   skipped unless strict provisioning is enabled;
//! - per-delivery failures (`ParsePayloadError`, `HandlerNotFound`, handler
//!   errors) are logged and counted, there is no caller to return them to;
//! - publishing failures are returned synchronously.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The supervised channel has no live handle right now
    #[error("channel `{0}` is not connected")]
    ChannelUnavailable(String),

    /// The broker reported that a connection or channel was closed
    #[error("closed by the broker: {0}")]
    Closed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A topology entry references a channel, queue or exchange that does not exist
    #[error("missing topology dependency: {0}")]
    MissingTopologyDependency(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// No handler registered for the queue and message name
    #[error("no handler for message `{1}` on queue `{0}`")]
    HandlerNotFound(String, String),

    /// Two handlers registered under the same queue and message name
    #[error("handler already registered for message `{1}` on queue `{0}`")]
    DuplicateHandler(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A required configuration property is absent
    #[error("missing property `{0}`")]
    MissingProperty(String),

    /// Configuration could not be loaded or deserialized
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}

/// Error returned by application message handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The handler could not process the message
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// Error publishing a message
    #[error("publisher error: {0}")]
    PublisherError(String),
}

impl From<AmqpError> for MessagingError {
    fn from(err: AmqpError) -> Self {
        MessagingError::PublisherError(err.to_string())
    }
}
