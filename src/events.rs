// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Producer
//!
//! Publishes service events as `{service, type, payload}` JSON to the direct
//! exchange `events` with the constant routing key `event`. Queues are
//! declared by the consumers that bind to it.

use crate::{
    broker::Connector,
    channel::AmqpConnector,
    config::{ConnectionConfig, ProducerOptions},
    errors::AmqpError,
    exchange::ExchangeKind,
    publisher::ServiceProducer,
    topology::Topology,
};
use opentelemetry::Context;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Topology used when the config does not override it.
pub fn default_topology() -> Topology {
    Topology::new("events")
        .kind(ExchangeKind::Direct)
        .routing_key("event")
        .dead_letter("events.dlx", "", "event.failed")
}

/// Settings of an [`EventProducer`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventProducerConfig {
    /// Required; stamped on every event.
    pub service_name: String,
    /// Replaces [`default_topology`] when set.
    pub topology: Option<Topology>,
}

pub struct EventProducer {
    inner: ServiceProducer,
}

impl EventProducer {
    /// Connects to the broker described by `conn` with default options.
    pub async fn connect(
        conn: &ConnectionConfig,
        config: EventProducerConfig,
    ) -> Result<EventProducer, AmqpError> {
        let connector = AmqpConnector::new(conn.clone());
        EventProducer::new(connector, config, ProducerOptions::default()).await
    }

    /// Creates an event producer over any [`Connector`]; the service name
    /// is required.
    pub async fn new(
        connector: Arc<dyn Connector>,
        config: EventProducerConfig,
        options: ProducerOptions,
    ) -> Result<EventProducer, AmqpError> {
        let topology = config.topology.unwrap_or_else(default_topology);
        let inner = ServiceProducer::new(connector, config.service_name, topology, options).await?;

        Ok(EventProducer { inner })
    }

    /// Publishes an event, stamping `payload.timestamp` when absent.
    pub async fn publish(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: Map<String, Value>,
    ) -> Result<(), AmqpError> {
        self.inner.publish(ctx, event_type, payload, None).await
    }

    /// Publishes in the background with a 5s deadline. Failures are logged.
    pub fn publish_async(&self, event_type: &str, payload: Map<String, Value>) {
        self.inner.publish_async(event_type, payload, None);
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }

    pub fn service_name(&self) -> &str {
        self.inner.service_name()
    }
}
