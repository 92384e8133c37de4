// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the resilient consumer: a receive loop over a
//! supervised channel that hands every delivery to a [`MessageHandler`] and
//! settles it from the handler's result.
//!
//! Retries are scheduled by the consumer itself. A failed delivery within
//! its retry budget is acknowledged and a copy carrying an incremented
//! `x-retry-count` is republished to the main exchange after an exponential
//! delay. The copy is retried until the broker confirms it, and
//! [`Consumer::close`] flushes pending copies before the connection goes
//! away. Once the budget is spent the delivery is rejected without requeue
//! and the queue's dead-letter exchange takes it.
//!
//! The loop survives reconnects: when the supervisor swaps the channel, or
//! the broker cancels the subscription, it subscribes again on the current
//! channel without caller intervention.

use crate::{
    broker::{BrokerChannel, Connector, Delivery, DeliveryStream},
    channel::AmqpConnector,
    config::{ConnectionConfig, ConsumerOptions, RetryConfig, DEFAULT_PUBLISH_TIMEOUT},
    errors::{AmqpError, HandlerError},
    message::Envelope,
    otel,
    retry::{retry_count, retry_delay, retry_headers},
    supervisor::{ConnectionSupervisor, ShutdownSignal},
    topology::Topology,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Grace period given to the receive loop to observe a stop before the
/// connection is closed under it.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Processes one delivery. Returning an error requests a retry.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.0)(delivery.clone()).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
///
/// ```ignore
/// let handler = handler_fn(|delivery: Delivery| async move {
///     let order: Order = delivery.json()?;
///     store(order).await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded.
    Acked,
    /// The handler failed; a copy with retry count `attempt` is
    /// republished after `delay`.
    Retried { attempt: u32, delay: Duration },
    /// The retry budget was spent; rejected towards the dead-letter exchange.
    DeadLettered,
}

struct ConsumerInner {
    supervisor: ConnectionSupervisor,
    retry: RetryConfig,
    options: ConsumerOptions,
    handler: Arc<dyn MessageHandler>,
    consuming: Mutex<bool>,
    stop: ShutdownSignal,
    in_flight: Arc<Semaphore>,
    retries: Mutex<JoinSet<()>>,
}

/// Consumes the main queue of a topology.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Connects to the broker described by `cfg` and installs `topology`.
    pub async fn connect(
        cfg: &ConnectionConfig,
        topology: Topology,
        retry: RetryConfig,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Result<Consumer, AmqpError> {
        let connector = AmqpConnector::new(cfg.clone());
        Consumer::new(connector, topology, retry, handler, options).await
    }

    /// Creates a consumer over any [`Connector`]. Nothing is consumed until
    /// [`Consumer::start_consuming`] is called.
    pub async fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        retry: RetryConfig,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Result<Consumer, AmqpError> {
        if topology.queue_name.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "consumer requires a queue name".to_owned(),
            ));
        }
        if options.max_in_flight == 0 {
            return Err(AmqpError::InvalidConfig(
                "max_in_flight must be at least 1".to_owned(),
            ));
        }

        let supervisor =
            ConnectionSupervisor::connect(connector, topology, options.reconnect_delay).await?;
        let permits = options.max_in_flight.min(Semaphore::MAX_PERMITS);

        Ok(Consumer {
            inner: Arc::new(ConsumerInner {
                supervisor,
                retry,
                options,
                handler,
                consuming: Mutex::new(false),
                stop: ShutdownSignal::new(),
                in_flight: Arc::new(Semaphore::new(permits)),
                retries: Mutex::new(JoinSet::new()),
            }),
        })
    }

    /// Starts the receive loop in the background.
    ///
    /// Calling it while already consuming is a no-op; calling it after
    /// [`Consumer::close`] fails with [`AmqpError::Closed`].
    pub async fn start_consuming(&self) -> Result<(), AmqpError> {
        let mut consuming = self.inner.consuming.lock().await;

        if self.inner.stop.is_triggered() {
            return Err(AmqpError::Closed);
        }
        if *consuming {
            debug!("consumer already running");
            return Ok(());
        }

        *consuming = true;
        tokio::spawn(consume_loop(self.inner.clone()));

        info!(queue = self.queue(), "consumer started");
        Ok(())
    }

    /// Whether the receive loop is running.
    pub async fn is_consuming(&self) -> bool {
        *self.inner.consuming.lock().await
    }

    /// Whether the supervised connection is currently up.
    pub async fn is_connected(&self) -> bool {
        self.inner.supervisor.is_connected().await
    }

    /// Topology installed by this consumer.
    pub fn topology(&self) -> &Topology {
        self.inner.supervisor.topology()
    }

    /// Stops the receive loop, publishes every scheduled retry copy without
    /// waiting for its delay, then closes the channel and the connection.
    ///
    /// In-flight handlers are not cancelled. Their settlements fail once the
    /// channel is gone and are only logged; an unsettled delivery is
    /// redelivered by the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        *self.inner.consuming.lock().await = false;

        if self.inner.stop.trigger() {
            info!(queue = self.queue(), "stopping consumer");
            tokio::time::sleep(CLOSE_GRACE).await;
        }

        let mut retries = std::mem::take(&mut *self.inner.retries.lock().await);
        if !retries.is_empty() {
            debug!(pending = retries.len(), "flushing scheduled retries");
        }
        while let Some(res) = retries.join_next().await {
            if let Err(err) = res {
                error!(error = err.to_string(), "retry task failed");
            }
        }

        self.inner.supervisor.close().await
    }

    fn queue(&self) -> &str {
        &self.inner.supervisor.topology().queue_name
    }
}

async fn consume_loop(inner: Arc<ConsumerInner>) {
    let queue = inner.supervisor.topology().queue_name.clone();
    let mut reconnects = inner.supervisor.subscribe_reconnects();

    'subscribe: loop {
        if inner.stop.is_triggered() {
            break;
        }

        // Any reconnect from here on replaces the channel we are about to use.
        reconnects.borrow_and_update();

        let channel = match inner.supervisor.channel().await {
            Ok(channel) => channel,
            Err(AmqpError::Closed) => break,
            Err(_) => {
                warn!(queue = queue.as_str(), "rabbitmq connection is not available, waiting...");
                if inner.sleep_or_stop(inner.options.unavailable_backoff).await {
                    break;
                }
                continue;
            }
        };

        let mut stream = match inner.subscribe(channel.as_ref(), &queue).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = err.to_string(), queue = queue.as_str(), "failure to subscribe");
                if inner.sleep_or_stop(inner.options.unavailable_backoff).await {
                    break;
                }
                continue;
            }
        };

        info!(queue = queue.as_str(), "consuming messages");

        loop {
            tokio::select! {
                biased;

                _ = inner.stop.wait() => break 'subscribe,

                changed = reconnects.changed() => {
                    if changed.is_err() {
                        break 'subscribe;
                    }
                    debug!(queue = queue.as_str(), "channel replaced, resubscribing");
                    continue 'subscribe;
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let permit = tokio::select! {
                            permit = inner.in_flight.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break 'subscribe,
                            },
                            _ = inner.stop.wait() => break 'subscribe,
                        };

                        let worker = inner.clone();
                        tokio::spawn(async move {
                            let disposition = worker.process(delivery).await;
                            debug!(?disposition, "message settled");
                            drop(permit);
                        });
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        if inner.sleep_or_stop(inner.options.resubscribe_delay).await {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                    None => {
                        warn!(queue = queue.as_str(), "delivery stream closed, resubscribing");
                        if inner.sleep_or_stop(inner.options.resubscribe_delay).await {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                },
            }
        }
    }

    *inner.consuming.lock().await = false;
    info!(queue = queue.as_str(), "consumer stopped");
}

impl ConsumerInner {
    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        channel.set_prefetch(self.options.prefetch_count).await?;
        channel.consume(queue, &self.options.consumer_tag).await
    }

    /// Sleeps for `duration`; returns `true` if the consumer was stopped first.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stop.wait() => true,
        }
    }

    /// Runs the handler on one delivery and settles it.
    async fn process(self: &Arc<Self>, delivery: Delivery) -> Disposition {
        let count = retry_count(&delivery.headers);
        let tracer = global::tracer("amqp consumer");
        let (_ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &delivery.routing_key);

        debug!(
            delivery_tag = delivery.delivery_tag,
            routing_key = delivery.routing_key.as_str(),
            retry_count = count,
            "received message"
        );

        if count >= self.retry.max_retries {
            error!(
                retry_count = count,
                max_retries = self.retry.max_retries,
                "too many attempts, sending to dlq"
            );
            span.set_status(Status::Error {
                description: Cow::from("retry budget exhausted"),
            });

            if let Err(err) = delivery.reject(false).await {
                error!(error = err.to_string(), "error whiling reject msg");
                span.record_error(&err);
            }
            return Disposition::DeadLettered;
        }

        let err = match self.handler.handle(&delivery).await {
            Ok(()) => {
                debug!("message successfully processed");
                match delivery.ack().await {
                    Ok(()) => span.set_status(Status::Ok),
                    Err(err) => {
                        error!(error = err.to_string(), "error whiling ack msg");
                        span.record_error(&err);
                    }
                }
                return Disposition::Acked;
            }
            Err(err) => err,
        };

        let last_error = err.to_string();
        let attempt = count.saturating_add(1);
        let delay = retry_delay(count, &self.retry);

        warn!(
            error = last_error.as_str(),
            attempt,
            delay_secs = delay.as_secs(),
            "error whiling handling msg, scheduling retry"
        );
        span.record_error(err.as_ref());
        span.set_status(Status::Error {
            description: Cow::from(last_error.clone()),
        });

        let mut headers = delivery.headers.clone();
        for (key, value) in retry_headers(attempt, &last_error, Utc::now().timestamp()).inner() {
            headers.insert(key.clone(), value.clone());
        }
        self.schedule_retry(Envelope::json(&delivery.body, Some(headers)), delay)
            .await;

        if let Err(err) = delivery.ack().await {
            error!(error = err.to_string(), "error whiling ack msg");
            span.record_error(&err);
        }

        Disposition::Retried { attempt, delay }
    }

    /// Republishes `envelope` after `delay`, or at once if the consumer
    /// stops first.
    async fn schedule_retry(self: &Arc<Self>, envelope: Envelope, delay: Duration) {
        let inner = self.clone();
        let mut retries = self.retries.lock().await;

        while retries.try_join_next().is_some() {}

        retries.spawn(async move {
            if inner.sleep_or_stop(delay).await {
                debug!(
                    message_id = envelope.message_id.as_str(),
                    "consumer stopping, republishing retry now"
                );
            }
            inner.republish(&envelope).await;
        });
    }

    /// Publishes a retry copy through the channel current at fire time.
    ///
    /// Failures are retried every reconnect delay until the broker confirms
    /// the copy. Once the consumer is stopping a single last attempt is made.
    async fn republish(&self, envelope: &Envelope) {
        let topology = self.supervisor.topology();

        loop {
            let stopping = self.stop.is_triggered();

            match self.publish_retry(envelope).await {
                Ok(()) => {
                    debug!(
                        exchange = topology.exchange_name.as_str(),
                        routing_key = topology.routing_key.as_str(),
                        "message republished for retry"
                    );
                    return;
                }
                Err(err) if stopping || err == AmqpError::Closed => {
                    error!(
                        error = err.to_string(),
                        message_id = envelope.message_id.as_str(),
                        "consumer stopped before retry could be republished"
                    );
                    return;
                }
                Err(err) => {
                    warn!(error = err.to_string(), "error republishing msg for retry, waiting...");
                    // A stop cuts the wait short; the next pass is the last attempt.
                    self.sleep_or_stop(self.supervisor.reconnect_delay()).await;
                }
            }
        }
    }

    async fn publish_retry(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let topology = self.supervisor.topology();
        let channel = self.supervisor.channel().await?;
        let publish = channel.publish(&topology.exchange_name, &topology.routing_key, envelope);

        tokio::time::timeout(DEFAULT_PUBLISH_TIMEOUT, publish)
            .await
            .map_err(|_| AmqpError::PublishTimeout)?
    }
}
