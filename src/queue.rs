// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides queue definitions, the fixed argument policy attached
//! to main queues, and queue-to-exchange bindings.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to enable message priorities
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the header field used to select the overflow behaviour
pub const AMQP_HEADERS_OVERFLOW: &str = "x-overflow";

/// Main queue message TTL: 24 hours, in milliseconds.
pub const MAIN_QUEUE_MESSAGE_TTL_MS: i32 = 24 * 60 * 60 * 1000;
pub const MAIN_QUEUE_MAX_PRIORITY: i32 = 10;
/// Drop the oldest message when the queue is full.
pub const MAIN_QUEUE_OVERFLOW: &str = "drop-head";

/// Arguments attached to a main queue when it is declared.
///
/// The TTL, priority and overflow policy are fixed. The dead-letter pair is
/// only emitted when a dead-letter exchange is set. Dead-letter queues are
/// declared without arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueArguments {
    pub(crate) message_ttl_ms: i32,
    pub(crate) max_priority: i32,
    pub(crate) overflow: String,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl Default for QueueArguments {
    fn default() -> Self {
        QueueArguments {
            message_ttl_ms: MAIN_QUEUE_MESSAGE_TTL_MS,
            max_priority: MAIN_QUEUE_MAX_PRIORITY,
            overflow: MAIN_QUEUE_OVERFLOW.to_owned(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

impl QueueArguments {
    /// Points rejected and expired messages at the given dead-letter exchange.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        if exchange.is_empty() {
            return self;
        }
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(self.message_ttl_ms)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(self.max_priority)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_OVERFLOW),
            AMQPValue::LongString(LongString::from(self.overflow.clone())),
        );

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(
                    self.dead_letter_routing_key.clone().unwrap_or_default(),
                )),
            );
        }

        FieldTable::from(args)
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) arguments: Option<QueueArguments>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created non-durable and without arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            arguments: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Attaches declare-time arguments.
    pub fn arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        self.arguments
            .as_ref()
            .map(QueueArguments::to_field_table)
            .unwrap_or_default()
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
