// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Seam
//!
//! The connection supervisor, producer and consumer talk to the broker only
//! through the traits in this module. `channel.rs` implements them on top of
//! lapin; the test suite implements them in memory.
//!
//! Closure of a connection or channel is exposed as a one-shot
//! [`CloseNotification`] per resource instance, so each reconnect generation
//! gets its own fresh watchers.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::sync::oneshot;

/// Resolves with the broker's reason once the resource is closed.
///
/// A `RecvError` means the resource was dropped without an error report,
/// which watchers treat as a closure as well.
pub type CloseNotification = oneshot::Receiver<String>;

/// Stream of deliveries for one subscription. It ends when the broker
/// cancels the consumer or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens a connection and a channel on it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqpError>;
}

/// A single logical session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Subscribes to the closure of this connection instance.
    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed session over a connection used for topology, publishing
/// and consuming.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Subscribes to the closure of this channel instance.
    fn notify_close(&self) -> CloseNotification;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Starts a manual-acknowledgement subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery on the channel that delivered it.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message handed from the broker to a consumer.
///
/// Handlers receive a shared reference and must not settle it themselves;
/// the consumer acknowledges or rejects it from the handler's result.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: FieldTable,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: FieldTable,
        acker: Arc<dyn Acker>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            body,
            headers,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }

    pub(crate) async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub(crate) async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}
