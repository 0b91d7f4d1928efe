// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every message travels as a JSON envelope:
//!
//! ```json
//! { "metadata": { "publisherName": "orders-service", "messageName": "OrderCreated",
//!                 "publishDate": "2025-01-01T00:00:00Z", "traceparent": "",
//!                 "tracestate": "", "spanId": "" },
//!   "payload": { } }
//! ```
//!
//! The trace fields decode as empty strings when absent.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub publisher_name: String,
    pub message_name: String,
    pub publish_date: DateTime<Utc>,
    #[serde(default)]
    pub traceparent: String,
    #[serde(default)]
    pub tracestate: String,
    #[serde(default)]
    pub span_id: String,
}

impl Metadata {
    pub fn new(publisher_name: &str, message_name: &str) -> Self {
        Self {
            publisher_name: publisher_name.to_owned(),
            message_name: message_name.to_owned(),
            publish_date: Utc::now(),
            traceparent: String::new(),
            tracestate: String::new(),
            span_id: String::new(),
        }
    }
}

/// Envelope around a payload. `Envelope` alone keeps the payload as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    pub metadata: Metadata,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(metadata: Metadata, payload: T) -> Self {
        Self { metadata, payload }
    }

    pub fn message_name(&self) -> &str {
        &self.metadata.message_name
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_vec(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

impl Envelope {
    /// Decodes the envelope, leaving the payload undecoded.
    pub fn from_slice(data: &[u8]) -> Result<Envelope, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Decodes the opaque payload into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Envelope<T>, AmqpError> {
        let payload = serde_json::from_value(self.payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        Ok(Envelope {
            metadata: self.metadata,
            payload,
        })
    }
}
