// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! `RabbitMQConfigs` gathers everything the reliability layer needs from its
//! environment. Values are loaded with built-in defaults, overridden by
//! `RABBITMQ_`-prefixed environment variables (`RABBITMQ_URL`,
//! `RABBITMQ_QUEUE`, `RABBITMQ_HANDLER_CONCURRENCY`, ...).

use crate::{
    delivery::DeliveryFilter,
    dispatcher::{Concurrency, ConsumerSettings},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Message,
    publisher::PublisherSettings,
    queue::QueueDefinition,
    topology::AmqpTopology,
};
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{num::NonZeroU16, time::Duration};

/// Prefix of the environment variables read by `RabbitMQConfigs::load`
pub const ENV_PREFIX: &str = "RABBITMQ_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Full connection string; takes precedence over the individual parts
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name the connection is reported under in the broker's management UI
    pub connection_name: String,

    pub exchange: String,
    pub exchange_kind: String,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    /// Declare `<queue>-dlq` and dead-letter rejected deliveries to it
    pub dead_letter: bool,

    pub consumer_tag: String,
    /// Expected app id of inbound deliveries, and app id of outbound messages
    pub app_id: Option<String>,
    /// Number of concurrent handler invocations; 0 means unbounded
    pub handler_concurrency: u16,
    pub prefetch_multiplier: u16,
    /// Explicit prefetch credit, overriding the multiplier
    pub prefetch_count: Option<u16>,
    pub max_redeliveries: Option<u64>,

    pub confirm: bool,
    pub confirm_timeout_ms: u64,
    pub message_expiry_ms: Option<u64>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            exchange: String::new(),
            exchange_kind: "topic".to_owned(),
            queue: String::new(),
            routing_key: String::new(),
            durable: true,
            dead_letter: false,
            consumer_tag: String::new(),
            app_id: None,
            handler_concurrency: 1,
            prefetch_multiplier: 4,
            prefetch_count: None,
            max_redeliveries: None,
            confirm: true,
            confirm_timeout_ms: 10_000,
            message_expiry_ms: None,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads configuration from defaults and the environment.
    pub fn load() -> Result<RabbitMQConfigs, AmqpError> {
        Ok(Figment::from(Serialized::defaults(RabbitMQConfigs::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?)
    }

    /// The AMQP connection string.
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn exchange_kind(&self) -> Result<ExchangeKind, AmqpError> {
        self.exchange_kind.parse()
    }

    pub fn message_expiry(&self) -> Option<Duration> {
        self.message_expiry_ms.map(Duration::from_millis)
    }

    pub fn topology(&self) -> Result<AmqpTopology, AmqpError> {
        if self.queue.is_empty() {
            return Err(AmqpError::ConfigError("queue name is required".to_owned()));
        }

        let mut exchange = ExchangeDefinition::new(&self.exchange).kind(self.exchange_kind()?);
        let mut queue = QueueDefinition::new(&self.queue);

        if self.durable {
            exchange = exchange.durable();
            queue = queue.durable();
        }

        if self.dead_letter {
            queue = queue.with_dlq();
        }

        // the default exchange routes by queue name
        let routing_key = if self.exchange.is_empty() && self.routing_key.is_empty() {
            self.queue.as_str()
        } else {
            self.routing_key.as_str()
        };

        Ok(AmqpTopology::new(exchange, queue, routing_key))
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        let concurrency = match NonZeroU16::new(self.handler_concurrency) {
            Some(n) => Concurrency::Fixed(n),
            None => Concurrency::Unbounded,
        };

        let mut settings = ConsumerSettings::new(&self.consumer_tag)
            .concurrency(concurrency)
            .prefetch_multiplier(self.prefetch_multiplier)
            .filter(self.filter());

        if let Some(count) = self.prefetch_count {
            settings = settings.prefetch_count(count);
        }

        if let Some(max) = self.max_redeliveries {
            settings = settings.max_redeliveries(max);
        }

        settings
    }

    /// Identity expected of inbound deliveries: the app id, and the routing
    /// key when the exchange routes by key.
    pub fn filter(&self) -> DeliveryFilter {
        let mut filter = DeliveryFilter::new();

        if let Some(app_id) = &self.app_id {
            filter = filter.app_id(app_id);
        }

        let routes_by_key = !self.exchange.is_empty()
            && matches!(self.exchange_kind(), Ok(ExchangeKind::Direct | ExchangeKind::Topic));
        if routes_by_key && !self.routing_key.is_empty() {
            filter = filter.routing_key(&self.routing_key);
        }

        filter
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        let settings = PublisherSettings::new(&self.exchange)
            .confirm_timeout(Duration::from_millis(self.confirm_timeout_ms));

        if self.confirm {
            settings
        } else {
            settings.unreliable()
        }
    }

    /// A message carrying the configured app id, routing key and expiry.
    pub fn message(&self, body: impl Into<Vec<u8>>) -> Message {
        let mut msg = Message::new(body).routing_key(&self.routing_key);

        if let Some(app_id) = &self.app_id {
            msg = msg.app_id(app_id);
        }

        if let Some(expiry) = self.message_expiry() {
            msg = msg.expiry(expiry);
        }

        msg
    }
}
