// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes the exchanges, queues and bindings a client needs
//! and installs them on a channel. A topology always has one main exchange
//! and optionally a dead-letter exchange, a dead-letter queue and a main
//! queue. Installation is idempotent, so the supervisor re-runs it on every
//! reconnect.
//!
//! Declaration order is fixed:
//! 1. Dead-letter exchange (if named)
//! 2. Dead-letter queue and its binding (if named)
//! 3. Main exchange
//! 4. Main queue with its arguments and binding (if named)
//!
//! The dead-letter exchange exists before the main queue whose arguments
//! reference it. Without a queue name the topology is producer-only: the
//! main queue is left to whichever consumer declares it.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueArguments, QueueBinding, QueueDefinition},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Declarative description of the main and dead-letter resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    /// Empty for producer-only clients.
    pub queue_name: String,
    pub routing_key: String,
    pub dead_letter_exchange_name: String,
    pub dead_letter_queue_name: String,
    pub dead_letter_routing_key: String,
}

impl Topology {
    pub fn new(exchange_name: &str) -> Topology {
        Topology {
            exchange_name: exchange_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn queue(mut self, name: &str) -> Self {
        self.queue_name = name.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Names the dead-letter exchange, queue and routing key.
    /// An empty queue name declares only the exchange.
    pub fn dead_letter(mut self, exchange: &str, queue: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange_name = exchange.to_owned();
        self.dead_letter_queue_name = queue.to_owned();
        self.dead_letter_routing_key = routing_key.to_owned();
        self
    }

    pub fn is_producer_only(&self) -> bool {
        self.queue_name.is_empty()
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange_name.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "exchange name is required".to_owned(),
            ));
        }

        if !self.dead_letter_queue_name.is_empty() && self.dead_letter_exchange_name.is_empty() {
            return Err(AmqpError::InvalidConfig(format!(
                "dead letter queue `{}` needs a dead letter exchange",
                self.dead_letter_queue_name
            )));
        }

        Ok(())
    }

    pub(crate) fn dead_letter_exchange(&self) -> Option<ExchangeDefinition> {
        if self.dead_letter_exchange_name.is_empty() {
            return None;
        }

        Some(
            ExchangeDefinition::new(&self.dead_letter_exchange_name)
                .kind(ExchangeKind::Direct)
                .durable(),
        )
    }

    pub(crate) fn dead_letter_queue(&self) -> Option<(QueueDefinition, QueueBinding)> {
        if self.dead_letter_queue_name.is_empty() {
            return None;
        }

        Some((
            QueueDefinition::new(&self.dead_letter_queue_name).durable(),
            QueueBinding::new(&self.dead_letter_queue_name)
                .exchange(&self.dead_letter_exchange_name)
                .routing_key(&self.dead_letter_routing_key),
        ))
    }

    pub(crate) fn main_exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange_name)
            .kind(self.exchange_kind)
            .durable()
    }

    pub(crate) fn main_queue(&self) -> Option<(QueueDefinition, QueueBinding)> {
        if self.is_producer_only() {
            return None;
        }

        let arguments = QueueArguments::default().dead_letter(
            &self.dead_letter_exchange_name,
            &self.dead_letter_routing_key,
        );

        Some((
            QueueDefinition::new(&self.queue_name)
                .durable()
                .arguments(arguments),
            QueueBinding::new(&self.queue_name)
                .exchange(&self.exchange_name)
                .routing_key(&self.routing_key),
        ))
    }
}

/// Installs a [`Topology`] on a channel.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn BrokerChannel>,
    topology: &'tp Topology,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<dyn BrokerChannel>, topology: &'tp Topology) -> AmqpTopology<'tp> {
        AmqpTopology { channel, topology }
    }

    /// Declares every resource of the topology in order.
    ///
    /// The first failing declaration or binding aborts the installation and
    /// is returned. Resources declared before it are left in place.
    pub async fn install(&self) -> Result<(), AmqpError> {
        if let Some(dlx) = self.topology.dead_letter_exchange() {
            self.install_exchange(&dlx).await?;
        }

        if let Some((dlq, binding)) = self.topology.dead_letter_queue() {
            self.install_queue(&dlq).await?;
            self.bind_queue(&binding).await?;
        }

        self.install_exchange(&self.topology.main_exchange()).await?;

        if let Some((queue, binding)) = self.topology.main_queue() {
            self.install_queue(&queue).await?;
            self.bind_queue(&binding).await?;
        }

        Ok(())
    }

    async fn install_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self.channel.declare_exchange(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn install_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self.channel.declare_queue(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(err)
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self.channel.bind_queue(binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use mockall::Sequence;

    fn orders() -> Topology {
        Topology::new("orders")
            .kind(ExchangeKind::Topic)
            .queue("orders.created")
            .routing_key("order.created")
            .dead_letter("orders.dlx", "orders.dlq", "order.failed")
    }

    #[tokio::test]
    async fn declares_dead_letter_resources_before_main_queue() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "orders.dlx" && def.kind == ExchangeKind::Direct)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name == "orders.dlq" && def.arguments.is_none())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name == "orders.dlq"
                    && b.exchange_name == "orders.dlx"
                    && b.routing_key == "order.failed"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "orders" && def.kind == ExchangeKind::Topic && def.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name == "orders.created"
                    && def.durable
                    && def
                        .arguments
                        .as_ref()
                        .and_then(|a| a.dead_letter_exchange.as_deref())
                        == Some("orders.dlx")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name == "orders.created"
                    && b.exchange_name == "orders"
                    && b.routing_key == "order.created"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let topology = orders();
        let res = AmqpTopology::new(Arc::new(channel), &topology).install().await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn producer_only_skips_main_queue() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_exchange()
            .times(2)
            .returning(|_| Ok(()));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let topology = Topology::new("events")
            .routing_key("event")
            .dead_letter("events.dlx", "", "event.failed");
        assert!(topology.is_producer_only());

        let res = AmqpTopology::new(Arc::new(channel), &topology).install().await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn bare_topology_declares_only_main_exchange() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "events")
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_declare_queue().never();

        let topology = Topology::new("events");
        let res = AmqpTopology::new(Arc::new(channel), &topology).install().await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn declare_failure_aborts_setup() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name.clone())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let topology = orders();
        let res = AmqpTopology::new(Arc::new(channel), &topology).install().await;
        assert_eq!(
            res,
            Err(AmqpError::DeclareExchangeError("orders.dlx".to_owned()))
        );
    }

    #[test]
    fn validate_rejects_incomplete_topologies() {
        assert!(matches!(
            Topology::default().validate(),
            Err(AmqpError::InvalidConfig(_))
        ));
        assert!(matches!(
            Topology::new("orders")
                .dead_letter("", "orders.dlq", "failed")
                .validate(),
            Err(AmqpError::InvalidConfig(_))
        ));
        assert!(orders().validate().is_ok());
    }

    #[test]
    fn deserializes_from_config() {
        let topology: Topology = serde_json::from_str(
            r#"{"exchange_name": "tasks", "exchange_kind": "topic", "routing_key": "tasks.#"}"#,
        )
        .unwrap();

        assert_eq!(topology.exchange_kind, ExchangeKind::Topic);
        assert!(topology.is_producer_only());
    }
}
