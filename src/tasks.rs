// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Producer
//!
//! Publishes work items as `{service, type, payload}` JSON to the topic
//! exchange `tasks`. The routing key is derived from the task type, so
//! `email.verify` travels as `tasks.email.verify` and workers can bind with
//! wildcards such as `tasks.email.*`.

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

const ROUTING_KEY_PREFIX: &str = "tasks.";

pub fn default_topology() -> Topology {
    Topology::new("tasks")
        .kind(ExchangeKind::Topic)
        .dead_letter("tasks.dlx", "", "")
}

/// Routing key of a task type.
pub fn routing_key(task_type: &str) -> String {
    format!("{ROUTING_KEY_PREFIX}{task_type}")
}

/// Settings of a [`TaskProducer`]. Without a topology the `tasks` topic
/// exchange is used.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskProducerConfig {
    pub service_name: String,
    pub topology: Option<Topology>,
}

pub struct TaskProducer {
    inner: ServiceProducer,
}

impl TaskProducer {
    /// Connects to the broker described by `conn` with default options.
    pub async fn connect(
        conn: &ConnectionConfig,
        config: TaskProducerConfig,
    ) -> Result<TaskProducer, AmqpError> {
        let connector = AmqpConnector::new(conn.clone());
        TaskProducer::new(connector, config, ProducerOptions::default()).await
    }

    /// Creates a task producer over any [`Connector`].
    pub async fn new(
        connector: Arc<dyn Connector>,
        config: TaskProducerConfig,
        options: ProducerOptions,
    ) -> Result<TaskProducer, AmqpError> {
        let topology = config.topology.unwrap_or_else(default_topology);
        let inner = ServiceProducer::new(connector, config.service_name, topology, options).await?;

        Ok(TaskProducer { inner })
    }

    /// Publishes a task routed as `tasks.<task_type>`.
    pub async fn publish(
        &self,
        ctx: &Context,
        task_type: &str,
        payload: Map<String, Value>,
    ) -> Result<(), AmqpError> {
        self.publish_with_routing_key(ctx, task_type, payload, &routing_key(task_type))
            .await
    }

    /// Publishes a task with a caller-chosen routing key.
    pub async fn publish_with_routing_key(
        &self,
        ctx: &Context,
        task_type: &str,
        payload: Map<String, Value>,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner
            .publish(ctx, task_type, payload, Some(routing_key))
            .await
    }

    /// Publishes in the background with a 5s deadline. Failures are logged.
    pub fn publish_async(&self, task_type: &str, payload: Map<String, Value>) {
        self.inner
            .publish_async(task_type, payload, Some(routing_key(task_type)));
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
