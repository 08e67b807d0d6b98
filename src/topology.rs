// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A topology is one exchange, one queue and the binding between them under a
//! routing key. Installing it performs, in order, exchange declare, queue
//! declare (including the queue's DLQ when configured) and queue bind. Every
//! step is idempotent on the broker; the first failing step aborts the rest
//! and is reported through `AmqpError::DeclareError`.

use crate::{
    broker::BrokerChannel,
    errors::{AmqpError, DeclareStep},
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use lapin::types::FieldTable;
use tracing::{debug, error};

/// The exchange, queue and binding a consumer or producer relies on.
#[derive(Debug, Clone)]
pub struct AmqpTopology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) routing_key: String,
}

impl AmqpTopology {
    /// Creates a topology binding `queue` to `exchange` under `routing_key`.
    ///
    /// Use `ExchangeDefinition::new("")` to rely on the broker's default
    /// exchange, in which case only the queue is declared.
    pub fn new(
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        routing_key: &str,
    ) -> AmqpTopology {
        AmqpTopology {
            exchange,
            queue,
            routing_key: routing_key.to_owned(),
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Declares the topology on the broker.
    ///
    /// Declaring twice with identical parameters succeeds both times.
    /// Declaring against an existing broker object with conflicting
    /// parameters fails with the step that conflicted.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queue(channel).await
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.exchange.is_default() {
            return Ok(());
        }

        debug!("creating exchange: {}", self.exchange.name);

        match channel
            .exchange_declare(
                &self.exchange.name,
                self.exchange.kind.clone().into(),
                self.exchange.options(),
                self.exchange.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %self.exchange.name,
                    "error to declare the exchange"
                );
                Err(declare_error(DeclareStep::Exchange, err))
            }
            _ => {
                debug!("exchange: {} was created", self.exchange.name);
                Ok(())
            }
        }
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if let Some(dlq_name) = &self.queue.dlq_name {
            self.declare_dlq(channel, dlq_name).await?;
        }

        debug!("creating queue: {}", self.queue.name);

        match channel
            .queue_declare(&self.queue.name, self.queue.options(), self.queue.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %self.queue.name,
                    "error to declare the queue"
                );
                Err(declare_error(DeclareStep::Queue, err))
            }
            Ok(info) => {
                debug!(
                    messages = info.message_count,
                    consumers = info.consumer_count,
                    "queue: {} was created",
                    info.name
                );
                Ok(())
            }
        }
    }

    /// Declares the DLQ that rejected deliveries of the main queue end up in.
    async fn declare_dlq(&self, channel: &dyn BrokerChannel, dlq_name: &str) -> Result<(), AmqpError> {
        match channel
            .queue_declare(dlq_name, self.queue.options(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = dlq_name, "failure to declare dlq");
                Err(declare_error(DeclareStep::Queue, err))
            }
            _ => Ok(()),
        }
    }

    async fn binding_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if self.exchange.is_default() {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.queue.name, self.exchange.name, self.routing_key
        );

        match channel
            .queue_bind(&self.queue.name, &self.exchange.name, &self.routing_key)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(declare_error(DeclareStep::Bind, err))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }
}

fn declare_error(step: DeclareStep, err: AmqpError) -> AmqpError {
    let reason = match err {
        AmqpError::BrokerError(reason) => reason,
        other => other.to_string(),
    };

    AmqpError::DeclareError { step, reason }
}
