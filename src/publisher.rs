// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module provides a producer that publishes JSON messages through a
//! supervised channel. Publishing never waits for a reconnect: while the
//! supervisor is down the call fails immediately with
//! [`AmqpError::NotConnected`] and retrying is left to the caller.
//!
//! The caller's OpenTelemetry context is propagated in the message headers.
//! A deadline for the network call can travel in the same context as a
//! [`PublishDeadline`].

use crate::{
    broker::Connector,
    channel::AmqpConnector,
    config::{ConnectionConfig, ProducerOptions},
    errors::AmqpError,
    message::{Envelope, ServiceMessage},
    otel,
    supervisor::ConnectionSupervisor,
    topology::Topology,
};
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error};

/// Deadline for a publish, carried in the caller's `Context`.
///
/// ```ignore
/// let ctx = Context::current().with_value(PublishDeadline::after(Duration::from_secs(1)));
/// producer.publish(&ctx, body, None).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishDeadline(pub Instant);

/// Deadline of a fire-and-forget publish.
const ASYNC_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

impl PublishDeadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> PublishDeadline {
        PublishDeadline(Instant::now() + timeout)
    }
}

/// Publishes messages to the exchange of its topology.
pub struct Producer {
    supervisor: ConnectionSupervisor,
    publish_timeout: Duration,
}

impl Producer {
    /// Connects to the broker described by `cfg` and installs `topology`.
    pub async fn connect(
        cfg: &ConnectionConfig,
        topology: Topology,
        options: ProducerOptions,
    ) -> Result<Producer, AmqpError> {
        Producer::new(AmqpConnector::new(cfg.clone()), topology, options).await
    }

    /// Creates a producer over any [`Connector`].
    ///
    /// Setup errors (dial, channel or topology failures) are returned as is.
    pub async fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        options: ProducerOptions,
    ) -> Result<Producer, AmqpError> {
        let supervisor =
            ConnectionSupervisor::connect(connector, topology, options.reconnect_delay).await?;

        Ok(Producer {
            supervisor,
            publish_timeout: options.publish_timeout,
        })
    }

    /// Publishes `body` with the topology's routing key.
    pub async fn publish(
        &self,
        ctx: &Context,
        body: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<(), AmqpError> {
        let routing_key = &self.supervisor.topology().routing_key;
        self.publish_with_routing_key(ctx, body, headers, routing_key)
            .await
    }

    /// Publishes `body` with an explicit routing key, as topic exchange
    /// producers do when the key varies per message type.
    pub async fn publish_with_routing_key(
        &self,
        ctx: &Context,
        body: &[u8],
        headers: Option<FieldTable>,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let channel = match self.supervisor.channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "rabbitmq connection is not available");
                return Err(err);
            }
        };

        let mut envelope = Envelope::json(body, headers);
        otel::inject(ctx, &mut envelope.headers);

        let deadline = ctx
            .get::<PublishDeadline>()
            .map(|d| d.0)
            .unwrap_or_else(|| Instant::now() + self.publish_timeout);

        let exchange = &self.supervisor.topology().exchange_name;
        let publish = channel.publish(exchange, routing_key, &envelope);

        match tokio::time::timeout_at(deadline, publish).await {
            Ok(Ok(())) => {
                debug!(exchange = exchange.as_str(), routing_key, "message published");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
            Err(_) => {
                error!(exchange = exchange.as_str(), routing_key, "publish timed out");
                Err(AmqpError::PublishTimeout)
            }
        }
    }

    /// Whether the supervised connection is currently up.
    pub async fn is_connected(&self) -> bool {
        self.supervisor.is_connected().await
    }

    /// Topology installed by this producer.
    pub fn topology(&self) -> &Topology {
        self.supervisor.topology()
    }

    /// Closes the channel, then the connection, returning the first error.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.supervisor.close().await
    }
}

/// Publishes `{service, type, payload}` messages on behalf of one service.
///
/// Shared by the event and task producers, which only differ in topology
/// and routing key.
pub struct ServiceProducer {
    producer: Arc<Producer>,
    service: String,
}

impl ServiceProducer {
    /// Creates the producer. An empty `service` is rejected before dialing.
    pub async fn new(
        connector: Arc<dyn Connector>,
        service: String,
        topology: Topology,
        options: ProducerOptions,
    ) -> Result<ServiceProducer, AmqpError> {
        if service.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "service name is required".to_owned(),
            ));
        }

        let producer = Producer::new(connector, topology, options).await?;

        Ok(ServiceProducer {
            producer: Arc::new(producer),
            service,
        })
    }

    /// Publishes a message, stamping `payload.timestamp` when absent.
    /// Without `routing_key` the topology's key is used.
    pub async fn publish(
        &self,
        ctx: &Context,
        kind: &str,
        payload: Map<String, Value>,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let body = ServiceMessage::new(&self.service, kind, payload).to_json()?;

        match routing_key {
            Some(key) => {
                self.producer
                    .publish_with_routing_key(ctx, &body, None, key)
                    .await
            }
            None => self.producer.publish(ctx, &body, None).await,
        }
    }

    /// Publishes in the background with a 5s deadline. Failures are logged.
    pub fn publish_async(&self, kind: &str, payload: Map<String, Value>, routing_key: Option<String>) {
        let producer = self.producer.clone();
        let message = ServiceMessage::new(&self.service, kind, payload);

        tokio::spawn(async move {
            let ctx = Context::current().with_value(PublishDeadline::after(ASYNC_PUBLISH_TIMEOUT));
            let res = match (message.to_json(), routing_key.as_deref()) {
                (Ok(body), Some(key)) => {
                    producer
                        .publish_with_routing_key(&ctx, &body, None, key)
                        .await
                }
                (Ok(body), None) => producer.publish(&ctx, &body, None).await,
                (Err(err), _) => Err(err),
            };

            if let Err(err) = res {
                error!(
                    error = err.to_string(),
                    service = message.service.as_str(),
                    kind = message.kind.as_str(),
                    "failure to publish in background"
                );
            }
        });
    }

    pub async fn is_connected(&self) -> bool {
        self.producer.is_connected().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.producer.close().await
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }
}
