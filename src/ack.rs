// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Coordinator
//!
//! Maps the outcome of a handler invocation to exactly one terminal broker
//! action per delivery tag, and counts outstanding invocations so the
//! dispatcher can wait for them to drain on shutdown.
//!
//! Every resolution releases the delivery from the in-flight count, whatever
//! the broker answered, so a resolved delivery can never hold shutdown up.
//!
//! When the broker does not count redeliveries itself, a coordinator built
//! with [`AckCoordinator::counting_requeues`] counts its own requeues per
//! message, keyed by message id or, without one, by a fingerprint of the
//! delivery. At most [`MAX_TRACKED_REQUEUES`] messages are counted at once.

use crate::{
    broker::BrokerChannel, channel::ConnectionHealth, delivery::Delivery, errors::AmqpError,
};
use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Upper bound on the messages whose requeues are counted at once
pub const MAX_TRACKED_REQUEUES: usize = 10_000;

/// What should happen to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge; the broker forgets the message
    Ack,
    /// Negative-acknowledge with requeue for another attempt
    Requeue,
    /// Negative-acknowledge without requeue; dead-lettered when the queue has a DLQ
    Reject,
}

impl From<bool> for Outcome {
    fn from(handled: bool) -> Self {
        if handled {
            Outcome::Ack
        } else {
            Outcome::Requeue
        }
    }
}

/// What was actually sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued,
    Rejected,
    /// The connection was already gone; nothing was sent and the broker will
    /// redeliver the message.
    Abandoned,
}

pub struct AckCoordinator {
    channel: Arc<dyn BrokerChannel>,
    health: ConnectionHealth,
    in_flight: AtomicUsize,
    pending: Mutex<HashSet<u64>>,
    requeues: Mutex<HashMap<String, u64>>,
    counting: bool,
    drained: Notify,
}

impl AckCoordinator {
    pub fn new(channel: Arc<dyn BrokerChannel>, health: ConnectionHealth) -> AckCoordinator {
        AckCoordinator {
            channel,
            health,
            in_flight: AtomicUsize::new(0),
            pending: Mutex::new(HashSet::new()),
            requeues: Mutex::new(HashMap::new()),
            counting: false,
            drained: Notify::new(),
        }
    }

    /// Counts requeues per message so `attempts` works on queues whose broker
    /// reports no delivery count.
    pub fn counting_requeues(mut self) -> Self {
        self.counting = true;
        self
    }

    /// Registers a delivery as in flight.
    ///
    /// # Errors
    /// `AmqpError::InvalidState` when the tag is already in flight. The
    /// delivery must then not be processed a second time.
    pub fn track(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        let inserted = self
            .pending
            .lock()
            .map(|mut pending| pending.insert(delivery.delivery_tag))
            .map_err(|_| AmqpError::InternalError("pending deliveries lock poisoned".to_owned()))?;

        if !inserted {
            warn!(delivery_tag = delivery.delivery_tag, "delivery tag already in flight");
            return Err(AmqpError::InvalidState(format!(
                "delivery `{}` is already in flight",
                delivery.delivery_tag
            )));
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Resolves a tracked delivery with the handler's boolean result: `true`
    /// acknowledges, `false` requeues.
    pub async fn resolve(&self, delivery: &Delivery, handled: bool) -> Result<Resolution, AmqpError> {
        self.settle(delivery, Outcome::from(handled)).await
    }

    /// Sends the terminal action for a tracked delivery.
    ///
    /// # Errors
    /// `AmqpError::DeliveryAlreadyResolved` for a tag that is not in flight;
    /// nothing is sent to the broker in that case. `AckMessageError` or
    /// `NackMessageError` when the broker call fails; the delivery is still
    /// released.
    pub async fn settle(&self, delivery: &Delivery, outcome: Outcome) -> Result<Resolution, AmqpError> {
        let tag = delivery.delivery_tag;

        let was_pending = self
            .pending
            .lock()
            .map(|mut pending| pending.remove(&tag))
            .unwrap_or(false);

        if !was_pending {
            warn!(delivery_tag = tag, "ignoring second resolution of delivery");
            return Err(AmqpError::DeliveryAlreadyResolved(tag));
        }

        let result = self.send(delivery, outcome).await;
        self.release();
        result
    }

    async fn send(&self, delivery: &Delivery, outcome: Outcome) -> Result<Resolution, AmqpError> {
        let tag = delivery.delivery_tag;

        if !self.health.is_alive() {
            warn!(
                delivery_tag = tag,
                ?outcome,
                "connection closed, leaving delivery to broker redelivery"
            );
            self.forget(delivery);
            return Ok(Resolution::Abandoned);
        }

        match outcome {
            Outcome::Ack => {
                self.forget(delivery);
                match self.channel.basic_ack(tag).await {
                    Err(err) => {
                        error!(delivery_tag = tag, error = err.to_string(), "error whiling ack msg");
                        Err(AmqpError::AckMessageError(tag))
                    }
                    _ => {
                        info!(delivery_tag = tag, "message acknowledged");
                        Ok(Resolution::Acked)
                    }
                }
            }
            Outcome::Requeue => {
                self.remember_requeue(delivery);
                match self.channel.basic_nack(tag, true).await {
                    Err(err) => {
                        error!(delivery_tag = tag, error = err.to_string(), "error whiling requeuing");
                        Err(AmqpError::NackMessageError(tag))
                    }
                    _ => {
                        warn!(delivery_tag = tag, "message requeued");
                        Ok(Resolution::Requeued)
                    }
                }
            }
            Outcome::Reject => {
                self.forget(delivery);
                match self.channel.basic_nack(tag, false).await {
                    Err(err) => {
                        error!(delivery_tag = tag, error = err.to_string(), "error whiling rejecting");
                        Err(AmqpError::NackMessageError(tag))
                    }
                    _ => {
                        warn!(delivery_tag = tag, "message rejected without requeue");
                        Ok(Resolution::Rejected)
                    }
                }
            }
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Number of tracked deliveries not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Completes once no delivery is in flight.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of prior attempts for a delivery: the broker's count when it
    /// provides one, otherwise the requeues this coordinator has counted for
    /// the same message. A redelivered message has been attempted at least
    /// once.
    pub fn attempts(&self, delivery: &Delivery) -> u64 {
        if let Some(count) = delivery.redelivery_count() {
            return count;
        }

        let counted = self
            .requeues
            .lock()
            .ok()
            .and_then(|requeues| requeues.get(&requeue_key(delivery)).copied())
            .unwrap_or(0);

        counted.max(u64::from(delivery.redelivered))
    }

    /// Messages whose requeues are currently counted.
    pub fn tracked_requeues(&self) -> usize {
        self.requeues.lock().map(|requeues| requeues.len()).unwrap_or(0)
    }

    fn remember_requeue(&self, delivery: &Delivery) {
        if !self.counting || delivery.redelivery_count().is_some() {
            return;
        }

        let Ok(mut requeues) = self.requeues.lock() else {
            return;
        };

        let key = requeue_key(delivery);
        if let Some(count) = requeues.get_mut(&key) {
            *count += 1;
        } else if requeues.len() < MAX_TRACKED_REQUEUES {
            requeues.insert(key, 1);
        } else {
            debug!(
                delivery_tag = delivery.delivery_tag,
                "requeue table full, attempts of this message are not counted"
            );
        }
    }

    fn forget(&self, delivery: &Delivery) {
        if !self.counting {
            return;
        }

        if let Ok(mut requeues) = self.requeues.lock() {
            requeues.remove(&requeue_key(delivery));
        }
    }
}

fn requeue_key(delivery: &Delivery) -> String {
    if let Some(id) = &delivery.message_id {
        return id.clone();
    }

    let mut hasher = DefaultHasher::new();
    delivery.exchange.hash(&mut hasher);
    delivery.routing_key.hash(&mut hasher);
    delivery.data.hash(&mut hasher);
    format!("body:{:016x}", hasher.finish())
}
