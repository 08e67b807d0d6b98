// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A `Delivery` is a message handed to this consumer by the broker. Its
//! delivery tag is scoped to the channel it arrived on and is used exactly
//! once to acknowledge or reject it, see [`crate::ack`].

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
};

/// Header set by quorum queues with the number of prior delivery attempts
pub const AMQP_HEADERS_X_DELIVERY_COUNT: &str = "x-delivery-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: FieldTable,
    pub data: Vec<u8>,
    pub properties: AMQPProperties,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery::new(
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            delivery.data,
            delivery.properties,
        )
    }
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        properties: AMQPProperties,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            redelivered,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            app_id: properties.app_id().as_ref().map(|v| v.as_str().to_owned()),
            message_id: properties.message_id().as_ref().map(|v| v.as_str().to_owned()),
            headers: properties.headers().clone().unwrap_or_default(),
            data,
            properties,
        }
    }

    /// Number of earlier delivery attempts reported by the broker.
    ///
    /// Reads `x-delivery-count` (quorum queues) and falls back to the count of
    /// the first `x-death` entry. Returns `None` when the broker provides
    /// neither, in which case only the `redelivered` flag is known.
    pub fn redelivery_count(&self) -> Option<u64> {
        let headers = self.headers.inner();

        if let Some(value) = headers.get(AMQP_HEADERS_X_DELIVERY_COUNT) {
            return as_count(value);
        }

        headers
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first())
            .and_then(|value| value.as_field_table())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(as_count)
    }
}

fn as_count(value: &AMQPValue) -> Option<u64> {
    let count = match value {
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        _ => return None,
    };

    u64::try_from(count).ok()
}

/// Topic-exchange routing key matching.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words. A pattern without wildcards matches only itself.
pub fn routing_key_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                matches_words(rest, key_rest)
            }
            _ => false,
        },
    }
}

/// Identity a subscriber expects inbound deliveries to carry.
///
/// Deliveries that do not match are never handed to the handler. Unset
/// fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryFilter {
    pub(crate) app_id: Option<String>,
    pub(crate) routing_key: Option<String>,
}

impl DeliveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    /// Expected routing key, which may use topic wildcards.
    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn accepts(&self, delivery: &Delivery) -> bool {
        let app_ok = match &self.app_id {
            Some(expected) => delivery.app_id.as_deref() == Some(expected.as_str()),
            None => true,
        };

        let key_ok = match &self.routing_key {
            Some(pattern) => routing_key_matches(pattern, &delivery.routing_key),
            None => true,
        };

        app_ok && key_ok
    }
}
