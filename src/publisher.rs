// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes `Message`s to an exchange. An unreliable publish
//! returns once the broker has accepted the frame. A reliable publish puts the
//! channel in confirm mode (once per channel) and waits, bounded by a timeout,
//! for the broker's confirmation of that message's publish sequence number.

use crate::{
    broker::{BrokerChannel, Confirmation},
    errors::{AmqpError, PublishErrorKind},
    message::Message,
    otel,
};
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, warn};

/// Default bound on the wait for a publish confirmation
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    pub(crate) exchange: String,
    pub(crate) confirm_timeout: Duration,
    pub(crate) mandatory: bool,
    pub(crate) reliable: bool,
}

impl PublisherSettings {
    /// Publishes to `exchange`; an empty name is the default exchange, which
    /// routes by queue name.
    pub fn new(exchange: &str) -> Self {
        PublisherSettings {
            exchange: exchange.to_owned(),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            mandatory: false,
            reliable: true,
        }
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Makes `send` return without waiting for publisher confirms.
    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    /// Asks the broker to return messages that match no queue. A returned
    /// reliable publish fails as not confirmed.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Publish sequence numbers awaiting confirmation, keyed to message ids.
#[derive(Debug, Default)]
struct ConfirmTracker {
    next_seq: u64,
    unconfirmed: HashMap<u64, String>,
}

impl ConfirmTracker {
    fn register(&mut self, message_id: &str) -> u64 {
        self.next_seq += 1;
        self.unconfirmed.insert(self.next_seq, message_id.to_owned());
        self.next_seq
    }

    fn settle(&mut self, seq: u64) -> Option<String> {
        self.unconfirmed.remove(&seq)
    }
}

/// Publishes messages on one dedicated channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn BrokerChannel>,
    settings: PublisherSettings,
    confirm_mode: OnceCell<()>,
    tracker: Mutex<ConfirmTracker>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, settings: PublisherSettings) -> RabbitMQPublisher {
        RabbitMQPublisher {
            channel,
            settings,
            confirm_mode: OnceCell::new(),
            tracker: Mutex::new(ConfirmTracker::default()),
        }
    }

    /// Whether the channel has been placed in confirm mode.
    pub fn is_confirming(&self) -> bool {
        self.confirm_mode.initialized()
    }

    /// Publishes whose confirmation is still outstanding.
    pub async fn unconfirmed(&self) -> usize {
        self.tracker.lock().await.unconfirmed.len()
    }

    /// Publishes `msg` with the configured reliability.
    pub async fn send(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        self.publish(ctx, msg, self.settings.reliable).await
    }

    /// Publishes `msg`, routed with the message's routing key.
    ///
    /// # Errors
    /// With `reliable`, `PublishError { kind: NotConfirmed }` when the broker
    /// nacks or returns the message and `PublishError { kind: ConfirmTimeout }`
    /// when no confirmation arrives in time. In the timeout case the message
    /// may still have been stored.
    pub async fn publish(&self, ctx: &Context, msg: &Message, reliable: bool) -> Result<(), AmqpError> {
        if self.channel.is_open() {
            debug!(
                message_id = msg.get_message_id(),
                bytes = msg.body().len(),
                reliable,
                "publishing message"
            );
        } else {
            error!(message_id = msg.get_message_id(), "publishing on a closed channel");
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }

        if reliable {
            self.enable_confirms().await?;
        }

        let properties = msg.properties(otel::inject(ctx));

        // Sequence numbers are assigned by the broker in publish order, so the
        // registration and the send happen under the same lock.
        let (seq, confirm) = {
            let mut tracker = self.tracker.lock().await;

            let confirm = match self
                .channel
                .basic_publish(
                    &self.settings.exchange,
                    msg.get_routing_key(),
                    self.settings.mandatory,
                    msg.body(),
                    properties,
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error publishing message");
                    return Err(self.publish_error(PublishErrorKind::Rejected, msg));
                }
                Ok(confirm) => confirm,
            };

            let seq = self
                .is_confirming()
                .then(|| tracker.register(msg.get_message_id()));
            (seq, confirm)
        };

        let Some(seq) = seq else {
            return Ok(());
        };

        if !reliable {
            self.tracker.lock().await.settle(seq);
            return Ok(());
        }

        let outcome = tokio::time::timeout(self.settings.confirm_timeout, confirm).await;
        self.tracker.lock().await.settle(seq);

        match outcome {
            Ok(Ok(Confirmation::Ack)) | Ok(Ok(Confirmation::NotRequested)) => {
                debug!(seq, message_id = msg.get_message_id(), "confirmed delivery");
                Ok(())
            }
            Ok(Ok(Confirmation::Nack)) => {
                warn!(seq, message_id = msg.get_message_id(), "failed delivery");
                Err(self.publish_error(PublishErrorKind::NotConfirmed, msg))
            }
            Ok(Ok(Confirmation::Returned)) => {
                warn!(seq, message_id = msg.get_message_id(), "message returned as unroutable");
                Err(self.publish_error(PublishErrorKind::NotConfirmed, msg))
            }
            Ok(Err(err)) => {
                error!(seq, error = err.to_string(), "error waiting for confirmation");
                Err(self.publish_error(PublishErrorKind::NotConfirmed, msg))
            }
            Err(_) => {
                warn!(
                    seq,
                    message_id = msg.get_message_id(),
                    timeout_ms = self.settings.confirm_timeout.as_millis() as u64,
                    "confirmation timed out, delivery unknown"
                );
                Err(self.publish_error(PublishErrorKind::ConfirmTimeout, msg))
            }
        }
    }

    /// Places the channel in confirm mode the first time it is needed.
    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.confirm_mode
            .get_or_try_init(|| async {
                debug!("enabling publishing confirms");
                self.channel.confirm_select().await.map_err(|err| {
                    error!(error = err.to_string(), "channel could not be put into confirm mode");
                    AmqpError::ConfirmSelectError(err.to_string())
                })
            })
            .await
            .map(|_| ())
    }

    fn publish_error(&self, kind: PublishErrorKind, msg: &Message) -> AmqpError {
        AmqpError::PublishError {
            kind,
            message_id: msg.get_message_id().to_owned(),
        }
    }
}
