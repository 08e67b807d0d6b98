// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Abstraction
//!
//! `BrokerChannel` is the narrow set of AMQP channel operations the
//! reliability layer relies on. The production implementation is
//! `lapin::Channel`; everything above this module holds an
//! `Arc<dyn BrokerChannel>` and never touches lapin directly.

use crate::{delivery::Delivery, errors::AmqpError};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm,
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};

/// Stream of deliveries for one subscription. It ends when the subscription
/// is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Resolves once the broker has confirmed (or refused) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Broker-side outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Routed and, for persistent messages to durable queues, stored
    Ack,
    /// The broker could not take responsibility for the message
    Nack,
    /// Mandatory publish that matched no queue
    Returned,
    /// The channel is not in confirm mode
    NotRequested,
}

impl From<publisher_confirm::Confirmation> for Confirmation {
    fn from(confirmation: publisher_confirm::Confirmation) -> Self {
        match confirmation {
            publisher_confirm::Confirmation::Ack(Some(_)) => Confirmation::Returned,
            publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
            publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
            publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
        }
    }
}

/// Broker-reported state of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The AMQP channel operations used by the topology declarator, the
/// publisher, the dispatcher and the acknowledgement coordinator.
///
/// A channel must not be shared between a publishing and a consuming role.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Sets the prefetch credit for this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Sends a message. The returned future resolves with the broker's
    /// confirmation and may be dropped when no confirmation is wanted.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        Ok(Channel::exchange_declare(self, name, kind, options, arguments).await?)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let queue = Channel::queue_declare(self, name, options, arguments).await?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        Ok(Channel::queue_bind(
            self,
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await?)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        Ok(Channel::basic_qos(self, prefetch_count, BasicQosOptions { global: false }).await?)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = Channel::basic_consume(
            self,
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
        .await?;

        Ok(consumer
            .map(|result| result.map(Delivery::from).map_err(AmqpError::from))
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        Ok(Channel::basic_cancel(self, consumer_tag, BasicCancelOptions { nowait: false }).await?)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        Ok(Channel::confirm_select(self, ConfirmSelectOptions { nowait: false }).await?)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = Channel::basic_publish(
            self,
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory,
                immediate: false,
            },
            payload,
            properties,
        )
        .await?;

        Ok(Box::pin(async move {
            confirm
                .await
                .map(Confirmation::from)
                .map_err(AmqpError::from)
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        Ok(Channel::basic_ack(self, delivery_tag, BasicAckOptions { multiple: false }).await?)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        Ok(Channel::basic_nack(
            self,
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await?)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(Channel::close(self, 200, "OK").await?)
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }
}
