// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing entities messages are published to. This module
//! defines the supported exchange kinds and a builder for exchange
//! definitions consumed by the topology declarator.

use crate::errors::AmqpError;
use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::{collections::BTreeMap, str::FromStr};

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unknown exchange kind `{other}`"
            ))),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is a non-durable Direct exchange. An empty
    /// name refers to the broker's default exchange, which is never declared.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the broker's pre-declared default exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Adds a single declaration argument to the exchange.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
