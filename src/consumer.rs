// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! `RabbitMQConsumer` wires a connection, a dedicated channel and a
//! dispatcher together from `RabbitMQConfigs`, which is what a service
//! consuming a single queue usually needs.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use reliable_rabbitmq::{configs::RabbitMQConfigs, consumer::RabbitMQConsumer, handler::ConsumerHandler};
//! # async fn run(handler: Arc<dyn ConsumerHandler>) -> Result<(), reliable_rabbitmq::errors::AmqpError> {
//! let cfg = RabbitMQConfigs::load()?;
//! let consumer = RabbitMQConsumer::start(&cfg, handler).await?;
//! // ... until the service is asked to stop
//! consumer.shutdown().await
//! # }
//! ```

use crate::{
    channel::{AmqpConnection, ConnectionHealth},
    configs::RabbitMQConfigs,
    dispatcher::{DispatcherState, RabbitMQDispatcher},
    errors::AmqpError,
    handler::ConsumerHandler,
};
use std::sync::Arc;
use tracing::{error, info};

pub struct RabbitMQConsumer {
    conn: AmqpConnection,
    dispatcher: RabbitMQDispatcher,
}

impl RabbitMQConsumer {
    /// Connects, declares the configured topology and starts consuming.
    ///
    /// # Errors
    /// Any connection, declaration or subscription error. The connection is
    /// closed again before the error is returned.
    pub async fn start(
        cfg: &RabbitMQConfigs,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<RabbitMQConsumer, AmqpError> {
        let topology = cfg.topology()?;
        let settings = cfg.consumer_settings();

        let conn = AmqpConnection::from_configs(cfg).await?;

        let dispatcher = match conn.dispatcher(topology, settings, handler).await {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                close_quietly(&conn).await;
                return Err(err);
            }
        };

        if let Err(err) = dispatcher.start().await {
            close_quietly(&conn).await;
            return Err(err);
        }

        info!(queue = %cfg.queue, "consumer started");
        Ok(RabbitMQConsumer { conn, dispatcher })
    }

    pub fn state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.conn.health()
    }

    pub fn dispatcher(&self) -> &RabbitMQDispatcher {
        &self.dispatcher
    }

    /// Drains the dispatcher, then closes the connection.
    ///
    /// Returns after every in-flight handler invocation has been resolved.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        let drained = self.dispatcher.shutdown().await;
        let closed = self.conn.shutdown().await;

        drained.and(closed)
    }
}

async fn close_quietly(conn: &AmqpConnection) {
    if let Err(err) = conn.shutdown().await {
        error!(error = err.to_string(), "failure to close the connection after a setup error");
    }
}
