// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker seam on top of lapin. It establishes
//! connections to the RabbitMQ server, opens channels on them, and adapts
//! lapin's error callbacks, consumers and ackers to the crate's
//! [`CloseNotification`], [`DeliveryStream`] and [`Acker`] abstractions.

use crate::{
    broker::{
        Acker, BrokerChannel, BrokerConnection, CloseNotification, Connector, Delivery,
        DeliveryStream,
    },
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP connection and a channel on it.
///
/// Both are returned behind the broker traits so the supervisor can own and
/// replace them without knowing about lapin.
pub async fn new_amqp_channel(
    cfg: &ConnectionConfig,
) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((
                Arc::new(AmqpConnection { conn }),
                Arc::new(AmqpChannel { channel: c }),
            ))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel failure").await {
                debug!(error = close_err.to_string(), "error closing connection");
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// [`Connector`] dialing a RabbitMQ server with lapin.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    cfg: ConnectionConfig,
}

impl AmqpConnector {
    pub fn new(cfg: ConnectionConfig) -> Arc<AmqpConnector> {
        Arc::new(AmqpConnector { cfg })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqpError> {
        new_amqp_channel(&self.cfg).await
    }
}

/// Forwards the first error lapin reports to a one-shot receiver.
fn close_notification() -> (impl FnMut(lapin::Error) + Send + 'static, CloseNotification) {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    let handler = move |err: lapin::Error| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(err.to_string());
        }
    };

    (handler, rx)
}

struct AmqpConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn notify_close(&self) -> CloseNotification {
        let (handler, rx) = close_notification();
        self.conn.on_error(handler);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn notify_close(&self) -> CloseNotification {
        let (handler, rx) = close_notification();
        self.channel.on_error(handler);
        rx
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "exchange declare failed");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.field_table(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "queue declare failed");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "queue bind failed");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.clone()))
            .with_delivery_mode(envelope.delivery_mode)
            .with_message_id(ShortString::from(envelope.message_id.clone()))
            .with_headers(envelope.headers.clone());

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery.properties.headers().clone().unwrap_or_default();

    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data,
        headers,
        Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
    .redelivered(delivery.redelivered)
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}
