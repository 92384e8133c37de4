// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by the producer, consumer,
//! connection supervisor and topology installer. Each `AmqpError` variant
//! names the broker operation that failed so callers can tell setup errors
//! (fatal at construction) from publish-time errors (returned to the caller)
//! and best-effort failures (only logged).

use thiserror::Error;

/// Error returned by a message handler to request the retry path.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The supervised connection or channel is not open
    #[error("rabbitmq connection is not available")]
    NotConnected,

    /// The client was closed explicitly
    #[error("client is closed")]
    Closed,

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The publish did not complete before its deadline
    #[error("publish timed out")]
    PublishTimeout,

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// Error closing a channel or connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Error consuming a message from the delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error serializing or parsing a payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Invalid topology or client configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
