// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single network connection to the broker and hands out
//! channels derived from it, one per role. A background watcher observes the
//! connection's closure and reports it; reconnecting is left to the owning
//! service.

use crate::{
    broker::BrokerChannel,
    configs::RabbitMQConfigs,
    dispatcher::{ConsumerSettings, RabbitMQDispatcher},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::{PublisherSettings, RabbitMQPublisher},
    topology::AmqpTopology,
};
use lapin::{types::LongString, uri::AMQPUri, Connection, ConnectionProperties};
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};

/// Liveness of a connection, shared by everything derived from it.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    inner: Arc<HealthState>,
}

#[derive(Debug)]
struct HealthState {
    alive: AtomicBool,
    shutdown: AtomicBool,
    last_error: Mutex<Option<String>>,
    closed: Notify,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHealth {
    pub fn new() -> Self {
        ConnectionHealth {
            inner: Arc::new(HealthState {
                alive: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                last_error: Mutex::new(None),
                closed: Notify::new(),
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Whether the closure was requested through `shutdown`.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Completes once the connection is no longer alive.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            if !self.is_alive() {
                return;
            }
            notified.await;
        }
    }

    /// Records a connection loss. Only the first report is kept.
    pub(crate) fn mark_lost(&self, reason: &str) {
        if let Ok(mut last) = self.inner.last_error.lock() {
            if last.is_none() {
                *last = Some(reason.to_owned());
            }
        }
        self.close();
    }

    pub(crate) fn mark_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.close();
    }

    fn close(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.closed.notify_waiters();
    }
}

/// Spawns the task that reports the closure of a connection.
pub(crate) fn spawn_watcher(health: ConnectionHealth) -> JoinHandle<()> {
    tokio::spawn(async move {
        health.closed().await;

        if health.is_shutdown() {
            info!("amqp connection closed");
        } else {
            error!(
                error = health.last_error().unwrap_or_default(),
                "amqp connection lost"
            );
        }
    })
}

/// An established connection to the broker.
pub struct AmqpConnection {
    conn: Connection,
    health: ConnectionHealth,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpConnection {
    /// Dials the broker at `uri`.
    ///
    /// # Errors
    /// `AmqpError::ConnectionError` when the URI is malformed, the broker is
    /// unreachable or authentication fails.
    pub async fn connect(uri: &str, connection_name: &str) -> Result<AmqpConnection, AmqpError> {
        if let Err(err) = AMQPUri::from_str(uri) {
            error!(error = %err, "malformed amqp uri");
            return Err(AmqpError::ConnectionError(format!("malformed uri: {err}")));
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let health = ConnectionHealth::new();
        let reporter = health.clone();
        conn.on_error(move |err| reporter.mark_lost(&err.to_string()));
        let watcher = spawn_watcher(health.clone());

        Ok(AmqpConnection {
            conn,
            health,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub async fn from_configs(cfg: &RabbitMQConfigs) -> Result<AmqpConnection, AmqpError> {
        AmqpConnection::connect(&cfg.uri(), &cfg.connection_name).await
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.clone()
    }

    /// Opens a new channel on this connection.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.health.is_alive() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(Arc::new(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    /// Creates a publisher on a dedicated channel.
    pub async fn publisher(&self, settings: PublisherSettings) -> Result<RabbitMQPublisher, AmqpError> {
        Ok(RabbitMQPublisher::new(self.create_channel().await?, settings))
    }

    /// Creates a dispatcher on a dedicated channel. It still has to be started.
    pub async fn dispatcher(
        &self,
        topology: AmqpTopology,
        settings: ConsumerSettings,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<RabbitMQDispatcher, AmqpError> {
        Ok(RabbitMQDispatcher::new(
            self.create_channel().await?,
            self.health(),
            topology,
            settings,
            handler,
        ))
    }

    /// Closes the connection, invalidating every channel derived from it.
    ///
    /// Calling it again after the connection is closed is a no-op.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        if !self.health.is_alive() {
            return Ok(());
        }

        self.health.mark_shutdown();
        let result = self.conn.close(200, "OK").await;

        let watcher = self.watcher.lock().ok().and_then(|mut guard| guard.take());
        if let Some(watcher) = watcher {
            if let Err(err) = watcher.await {
                error!(error = err.to_string(), "connection watcher failed");
            }
        }

        result.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ShutdownError(err.to_string())
        })
    }
}
