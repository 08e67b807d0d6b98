// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbound Messages
//!
//! A `Message` is built once by the producing service and handed to the
//! publisher. It carries the application metadata the consumer side filters
//! on (app id, routing key) and the expiry the broker enforces.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode for messages kept in memory only
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// An immutable outbound message.
#[derive(Debug, Clone)]
pub struct Message {
    body: Vec<u8>,
    app_id: Option<String>,
    message_id: String,
    routing_key: String,
    expiry: Option<Duration>,
    persistent: bool,
    content_type: String,
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl Message {
    /// Creates a persistent message with a random message id.
    pub fn new(body: impl Into<Vec<u8>>) -> Message {
        Message {
            body: body.into(),
            app_id: None,
            message_id: Uuid::new_v4().to_string(),
            routing_key: String::new(),
            expiry: None,
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers: BTreeMap::default(),
        }
    }

    /// Creates a message whose body is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(payload: &T) -> Result<Message, AmqpError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::InternalError(format!("failure to encode payload: {err}")))?;

        Ok(Message::new(body))
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = message_id.to_owned();
        self
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Time-to-live after which the broker discards the message if it is
    /// still undelivered.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn get_app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn get_message_id(&self) -> &str {
        &self.message_id
    }

    pub fn get_routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn get_expiry(&self) -> Option<Duration> {
        self.expiry
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// AMQP properties for this message. The message's own headers take
    /// precedence over `headers`.
    pub(crate) fn properties(&self, mut headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        for (key, value) in &self.headers {
            headers.insert(key.clone(), value.clone());
        }

        let delivery_mode = if self.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_message_id(ShortString::from(self.message_id.as_str()))
            .with_delivery_mode(delivery_mode)
            .with_headers(FieldTable::from(headers));

        if let Some(app_id) = &self.app_id {
            props = props.with_app_id(ShortString::from(app_id.as_str()));
        }

        // AMQP expects the per-message TTL as a decimal string of milliseconds
        if let Some(expiry) = self.expiry {
            props = props.with_expiration(ShortString::from(expiry.as_millis().to_string()));
        }

        props
    }
}
