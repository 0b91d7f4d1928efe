// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ connectivity and message dispatch.
//!
//! Connections and channels are supervised and reopened after failures,
//! the topology is declared from configuration, and deliveries are routed
//! to handlers by queue and message name on a bounded worker pool.

mod otel;

#[cfg(test)]
mod testing;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod link;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod topology;
pub mod worker_pool;
