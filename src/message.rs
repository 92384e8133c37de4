// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The wire-visible shape of every message this client publishes: a JSON
//! body, `application/json` content type, persistent delivery mode and an
//! AMQP header table.
//!
//! [`ServiceMessage`] is the `{service, type, payload}` body shared by the
//! event and task producers.

use crate::errors::AmqpError;
use chrono::{SecondsFormat, Utc};
use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: FieldTable,
    pub delivery_mode: u8,
    pub message_id: String,
}

impl Envelope {
    /// Wraps an already encoded JSON body.
    pub fn json(body: &[u8], headers: Option<FieldTable>) -> Envelope {
        Envelope {
            body: body.to_vec(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers: headers.unwrap_or_default(),
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(key)
    }
}

/// Payload key stamped with the publish time when the caller left it out.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Body published by the event and task producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub service: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl ServiceMessage {
    /// Builds the message, stamping `payload.timestamp` (RFC 3339, UTC)
    /// unless the payload already has one.
    pub fn new(service: &str, kind: &str, mut payload: Map<String, Value>) -> ServiceMessage {
        payload.entry(TIMESTAMP_KEY).or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
        });

        ServiceMessage {
            service: service.to_owned(),
            kind: kind.to_owned(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }
}
