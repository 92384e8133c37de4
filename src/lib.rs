// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
pub(crate) mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod supervisor;
pub mod tasks;
pub mod topology;

pub use config::{ConnectionConfig, ConsumerOptions, ProducerOptions, RetryConfig};
pub use consumer::{handler_fn, Consumer, Disposition, MessageHandler};
pub use errors::{AmqpError, HandlerError};
pub use publisher::{Producer, PublishDeadline, ServiceProducer};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use topology::Topology;
