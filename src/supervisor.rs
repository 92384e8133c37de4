// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns one broker connection and its channel, watches both for closure and
//! replaces them when the broker drops either. The producer and consumer
//! each compose their own supervisor; supervisors are never shared between
//! clients.
//!
//! States:
//! - `Connected`: both resources open, watchers armed for this generation
//! - `Reconnecting`: old resources discarded, dialing every `reconnect_delay`
//! - `Closed`: explicit shutdown, terminal
//!
//! Every successful (re)connection starts a new generation with two fresh
//! watcher tasks, one per resource. A watcher only reports the closure of
//! its own generation, so the second notification of a double failure and
//! notifications from discarded resources never start a second reconnect.
//! Reconnection retries indefinitely at a fixed delay.

use crate::{
    broker::{BrokerChannel, BrokerConnection, CloseNotification, Connector},
    errors::AmqpError,
    topology::{AmqpTopology, Topology},
};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Connection lifecycle as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Closed,
}

/// One-shot broadcast stop flag.
///
/// Triggering is idempotent; every clone observes the same flag and any
/// number of tasks can wait on it concurrently.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        let (tx, _) = watch::channel(false);
        ShutdownSignal { tx: Arc::new(tx) }
    }

    /// Raises the flag. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the flag is raised.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once raised.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    state: ConnectionState,
    generation: u64,
}

impl Session {
    fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.connection.as_ref().is_some_and(|c| c.is_open())
            && self.channel.as_ref().is_some_and(|c| c.is_open())
    }
}

#[derive(Debug)]
struct CloseEvent {
    generation: u64,
    resource: &'static str,
    reason: String,
}

struct SupervisorInner {
    connector: Arc<dyn Connector>,
    topology: Topology,
    reconnect_delay: Duration,
    session: RwLock<Session>,
    shutdown: ShutdownSignal,
    reconnects: watch::Sender<u64>,
    events: mpsc::UnboundedSender<CloseEvent>,
}

/// Supervised connection and channel pair.
///
/// Cloning yields another handle on the same supervisor.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Connects, installs `topology` and starts supervision.
    ///
    /// Any failure here is a setup error: nothing is retried and the
    /// partially opened resources are closed before returning.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        topology: Topology,
        reconnect_delay: Duration,
    ) -> Result<ConnectionSupervisor, AmqpError> {
        topology.validate()?;

        let (connection, channel) = establish(connector.as_ref(), &topology).await?;
        let conn_closed = connection.notify_close();
        let chan_closed = channel.notify_close();

        let (reconnects, _) = watch::channel(0);
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SupervisorInner {
            connector,
            topology,
            reconnect_delay,
            session: RwLock::new(Session {
                connection: Some(connection),
                channel: Some(channel),
                state: ConnectionState::Connected,
                generation: 0,
            }),
            shutdown: ShutdownSignal::new(),
            reconnects,
            events,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx, inner.shutdown.clone()));
        inner.watch(0, conn_closed, chan_closed);

        info!(
            exchange = inner.topology.exchange_name.as_str(),
            "rabbitmq connection established"
        );

        Ok(ConnectionSupervisor { inner })
    }

    /// True only when both the connection and the channel report open.
    pub async fn is_connected(&self) -> bool {
        self.inner.session.read().await.is_healthy()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.session.read().await.state
    }

    /// The current channel, without waiting for a reconnect.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let session = self.inner.session.read().await;

        if session.state == ConnectionState::Closed {
            return Err(AmqpError::Closed);
        }

        match &session.channel {
            Some(channel) if session.is_healthy() => Ok(channel.clone()),
            _ => Err(AmqpError::NotConnected),
        }
    }

    /// Receives the generation number of every completed reconnect.
    pub fn subscribe_reconnects(&self) -> watch::Receiver<u64> {
        self.inner.reconnects.subscribe()
    }

    /// Flag raised when the supervisor is closed.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Fixed wait between reconnect attempts.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.reconnect_delay
    }

    /// Stops supervision and closes the channel, then the connection.
    ///
    /// Both are closed even if the first close fails; the first error is
    /// returned. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.shutdown.trigger() {
            debug!("rabbitmq supervisor shutting down");
        }

        let (connection, channel) = {
            let mut session = self.inner.session.write().await;
            session.state = ConnectionState::Closed;
            (session.connection.take(), session.channel.take())
        };

        let mut first_err = None;

        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error closing channel");
                first_err.get_or_insert(err);
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "error closing connection");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SupervisorInner {
    /// Arms the close watchers for one resource generation.
    fn watch(
        self: &Arc<Self>,
        generation: u64,
        conn_closed: CloseNotification,
        chan_closed: CloseNotification,
    ) {
        for (resource, notification) in [("connection", conn_closed), ("channel", chan_closed)] {
            let events = self.events.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                let reason = tokio::select! {
                    reason = notification => {
                        reason.unwrap_or_else(|_| "closed without error report".to_owned())
                    }
                    _ = shutdown.wait() => return,
                };

                let _ = events.send(CloseEvent {
                    generation,
                    resource,
                    reason,
                });
            });
        }
    }

    /// Handles a close notification. Stale notifications are ignored.
    async fn recover(self: &Arc<Self>, event: CloseEvent) {
        let (connection, channel) = {
            let mut session = self.session.write().await;

            if session.generation != event.generation
                || session.state != ConnectionState::Connected
            {
                debug!(
                    resource = event.resource,
                    generation = event.generation,
                    "ignoring stale close notification"
                );
                return;
            }

            session.state = ConnectionState::Reconnecting;
            (session.connection.take(), session.channel.take())
        };

        warn!(
            resource = event.resource,
            reason = event.reason.as_str(),
            "rabbitmq {} lost, attempting to reconnect...",
            event.resource
        );

        close_quietly(connection, channel).await;
        self.reconnect().await;
    }

    async fn reconnect(self: &Arc<Self>) {
        loop {
            info!("attempting to reconnect to rabbitmq...");

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.shutdown.wait() => return,
            }

            let (connection, channel) =
                match establish(self.connector.as_ref(), &self.topology).await {
                    Ok(resources) => resources,
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            "failed to reconnect, retrying in {:?}", self.reconnect_delay
                        );
                        continue;
                    }
                };

            let conn_closed = connection.notify_close();
            let chan_closed = channel.notify_close();

            let generation = {
                let mut session = self.session.write().await;

                if session.state == ConnectionState::Closed {
                    drop(session);
                    close_quietly(Some(connection), Some(channel)).await;
                    return;
                }

                session.generation += 1;
                session.connection = Some(connection);
                session.channel = Some(channel);
                session.state = ConnectionState::Connected;
                session.generation
            };

            self.watch(generation, conn_closed, chan_closed);
            self.reconnects.send_replace(generation);

            info!(generation, "successfully reconnected to rabbitmq");
            return;
        }
    }
}

/// Serializes recovery: one close event is handled at a time.
async fn supervise(
    inner: Weak<SupervisorInner>,
    mut events: mpsc::UnboundedReceiver<CloseEvent>,
    shutdown: ShutdownSignal,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = shutdown.wait() => return,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        inner.recover(event).await;
    }
}

/// Dials the broker and installs the topology on the new channel.
async fn establish(
    connector: &dyn Connector,
    topology: &Topology,
) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), AmqpError> {
    let (connection, channel) = connector.connect().await?;

    if let Err(err) = AmqpTopology::new(channel.clone(), topology).install().await {
        error!(error = err.to_string(), "failed to setup topology");
        close_quietly(Some(connection), Some(channel)).await;
        return Err(err);
    }

    Ok((connection, channel))
}

/// Best-effort close; errors are only logged.
async fn close_quietly(
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
) {
    if let Some(channel) = channel {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "ignoring channel close error");
        }
    }

    if let Some(connection) = connection {
        if let Err(err) = connection.close().await {
            debug!(error = err.to_string(), "ignoring connection close error");
        }
    }
}
