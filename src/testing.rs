// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! `FakeBroker` keeps exchanges, queues, bindings and unacknowledged
//! deliveries in one shared state and hands out channels implementing
//! `BrokerChannel`. It routes direct, fanout and topic exchanges, enforces
//! per-channel prefetch, requeues and dead-letters, answers publisher confirms
//! and can sever its connection.

use crate::{
    broker::{BrokerChannel, Confirmation, DeliveryStream, PendingConfirm, QueueInfo},
    channel::ConnectionHealth,
    delivery::{routing_key_matches, Delivery, AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    errors::AmqpError,
    queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;

/// How the broker answers publishes on channels in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmMode {
    Ack,
    Nack,
    /// Confirmations never arrive
    Never,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

struct Exchange {
    kind: String,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct Queue {
    durable: bool,
    dead_letter: Option<(String, String)>,
    ready: VecDeque<StoredMessage>,
}

struct Consumer {
    channel_id: u16,
    queue: String,
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    channel_id: u16,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    prefetch: u16,
    unacked: usize,
    confirming: bool,
}

struct State {
    severed: bool,
    confirm_mode: ConfirmMode,
    confirm_selects: usize,
    next_channel: u16,
    next_tag: u64,
    max_unacked: usize,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u16, ChannelState>,
    consumers: Vec<Consumer>,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Clone)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
    health: ConnectionHealth,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker {
            state: Arc::new(Mutex::new(State {
                severed: false,
                confirm_mode: ConfirmMode::Ack,
                confirm_selects: 0,
                next_channel: 0,
                next_tag: 0,
                max_unacked: 0,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                channels: HashMap::new(),
                consumers: Vec::new(),
                unacked: BTreeMap::new(),
            })),
            health: ConnectionHealth::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Opens a new channel on the fake connection.
    pub(crate) fn channel(&self) -> Arc<dyn BrokerChannel> {
        let mut state = self.lock();
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..Default::default()
            },
        );

        Arc::new(FakeChannel {
            id,
            state: self.state.clone(),
        })
    }

    /// Health of the fake connection; `sever` marks it lost.
    pub(crate) fn health(&self) -> ConnectionHealth {
        self.health.clone()
    }

    pub(crate) fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().confirm_mode = mode;
    }

    pub(crate) fn confirm_selects(&self) -> usize {
        self.lock().confirm_selects
    }

    /// `(ready, unacked)` message counts of a queue.
    pub(crate) fn depth(&self, queue: &str) -> (usize, usize) {
        let state = self.lock();
        let ready = state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0);
        let unacked = state.unacked.values().filter(|u| u.queue == queue).count();
        (ready, unacked)
    }

    pub(crate) fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Highest number of unacknowledged deliveries any channel ever held.
    pub(crate) fn max_unacked(&self) -> usize {
        self.lock().max_unacked
    }

    /// Bodies of the ready messages of a queue, in order.
    pub(crate) fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Enqueues a message directly on `queue`, bypassing exchanges.
    pub(crate) fn push(&self, queue: &str, body: &[u8], properties: BasicProperties) {
        let mut state = self.lock();
        let message = StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_owned(),
            body: body.to_vec(),
            properties,
            redelivered: false,
        };
        state
            .queues
            .get_mut(queue)
            .expect("queue must be declared before pushing")
            .ready
            .push_back(message);
        state.dispatch();
    }

    /// Drops the connection: consumers see an error, unacked deliveries go
    /// back to their queues and every later operation fails.
    pub(crate) fn sever(&self) {
        self.health.mark_lost("connection reset by peer");

        {
            let mut state = self.lock();
            state.severed = true;

            for consumer in state.consumers.drain(..) {
                let _ = consumer
                    .sender
                    .send(Err(AmqpError::ConnectionError("connection reset by peer".to_owned())));
            }

            let ids: Vec<u16> = state.channels.keys().copied().collect();
            for id in ids {
                state.requeue_channel(id);
                if let Some(channel) = state.channels.get_mut(&id) {
                    channel.open = false;
                }
            }
        }
    }
}

fn kind_name(kind: &ExchangeKind) -> String {
    match kind {
        ExchangeKind::Direct => "direct".to_owned(),
        ExchangeKind::Fanout => "fanout".to_owned(),
        ExchangeKind::Topic => "topic".to_owned(),
        ExchangeKind::Headers => "headers".to_owned(),
        ExchangeKind::Custom(name) => name.clone(),
    }
}

fn string_argument(arguments: &FieldTable, key: &str) -> Option<String> {
    match arguments.inner().get(key) {
        Some(AMQPValue::LongString(value)) => {
            Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn precondition_failed(what: &str) -> AmqpError {
    AmqpError::BrokerError(format!("PRECONDITION_FAILED - {what}"))
}

fn not_found(what: &str) -> AmqpError {
    AmqpError::BrokerError(format!("NOT_FOUND - {what}"))
}

impl State {
    fn check_open(&self, channel_id: u16) -> Result<(), AmqpError> {
        if self.severed {
            return Err(AmqpError::BrokerError("connection closed".to_owned()));
        }

        match self.channels.get(&channel_id) {
            Some(channel) if channel.open => Ok(()),
            _ => Err(AmqpError::BrokerError("channel closed".to_owned())),
        }
    }

    /// Queues a message published to `exchange` matches.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(ex) = self.exchanges.get(exchange) else {
            return Err(not_found(&format!("no exchange '{exchange}'")));
        };

        let mut targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|(_, key)| match ex.kind.as_str() {
                "fanout" => true,
                "topic" => routing_key_matches(key, routing_key),
                _ => key == routing_key,
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.dedup();
        Ok(targets)
    }

    fn enqueue(&mut self, targets: &[String], message: &StoredMessage) {
        for target in targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
        }
    }

    /// Hands ready messages to consumers while their channels have credit.
    fn dispatch(&mut self) {
        let mut idx = 0;
        while idx < self.consumers.len() {
            let channel_id = self.consumers[idx].channel_id;
            let queue_name = self.consumers[idx].queue.clone();

            let has_credit = self
                .channels
                .get(&channel_id)
                .map(|c| c.open && (c.prefetch == 0 || c.unacked < usize::from(c.prefetch)))
                .unwrap_or(false);

            let message = if has_credit {
                self.queues
                    .get_mut(&queue_name)
                    .and_then(|q| q.ready.pop_front())
            } else {
                None
            };

            let Some(message) = message else {
                idx += 1;
                continue;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery::new(
                tag,
                message.redelivered,
                &message.exchange,
                &message.routing_key,
                message.body.clone(),
                message.properties.clone(),
            );

            if self.consumers[idx].sender.send(Ok(delivery)).is_err() {
                // receiver dropped without cancelling
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.ready.push_front(message);
                }
                self.consumers.remove(idx);
                continue;
            }

            self.unacked.insert(
                tag,
                Unacked {
                    channel_id,
                    queue: queue_name,
                    message,
                },
            );
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.unacked += 1;
                self.max_unacked = self.max_unacked.max(channel.unacked);
            }
        }
    }

    fn take_unacked(&mut self, channel_id: u16, tag: u64) -> Result<Unacked, AmqpError> {
        match self.unacked.get(&tag) {
            Some(entry) if entry.channel_id == channel_id => {}
            _ => return Err(precondition_failed(&format!("unknown delivery tag {tag}"))),
        }

        let entry = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| precondition_failed(&format!("unknown delivery tag {tag}")))?;
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.unacked -= 1;
        }
        Ok(entry)
    }

    fn requeue(&mut self, entry: Unacked) {
        let mut message = entry.message;
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            queue.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, entry: Unacked) {
        let Some((exchange, routing_key)) = self
            .queues
            .get(&entry.queue)
            .and_then(|q| q.dead_letter.clone())
        else {
            return;
        };

        let mut message = entry.message;
        let mut headers = message
            .properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();

        let previous = Delivery::new(0, false, "", "", Vec::new(), message.properties.clone())
            .redelivery_count()
            .unwrap_or(0);

        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(previous as i64 + 1),
        );
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(entry.queue.as_str())),
        );
        death.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        message.properties = message.properties.with_headers(FieldTable::from(headers));
        message.redelivered = false;
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();

        if let Ok(targets) = self.route(&exchange, &routing_key) {
            self.enqueue(&targets, &message);
        }
    }

    fn requeue_channel(&mut self, channel_id: u16) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        // highest tag first so the original order is restored at the front
        for tag in tags.into_iter().rev() {
            if let Ok(entry) = self.take_unacked(channel_id, tag) {
                self.requeue(entry);
            }
        }
    }
}

struct FakeChannel {
    id: u16,
    state: Arc<Mutex<State>>,
}

impl FakeChannel {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;
        let kind = kind_name(&kind);

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(precondition_failed(&format!(
                "inequivalent arg 'type' for exchange '{name}'"
            ))),
            Some(existing) if existing.durable != options.durable => Err(precondition_failed(
                &format!("inequivalent arg 'durable' for exchange '{name}'"),
            )),
            Some(_) => Ok(()),
            None if options.passive => Err(not_found(&format!("no exchange '{name}'"))),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    Exchange {
                        kind,
                        durable: options.durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        match state.queues.get(name) {
            Some(existing) if existing.durable != options.durable => {
                return Err(precondition_failed(&format!(
                    "inequivalent arg 'durable' for queue '{name}'"
                )))
            }
            Some(_) => {}
            None if options.passive => return Err(not_found(&format!("no queue '{name}'"))),
            None => {
                let dead_letter = string_argument(&arguments, AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                    .map(|exchange| {
                        let key = string_argument(&arguments, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                            .unwrap_or_default();
                        (exchange, key)
                    });
                state.queues.insert(
                    name.to_owned(),
                    Queue {
                        durable: options.durable,
                        dead_letter,
                        ready: VecDeque::new(),
                    },
                );
            }
        }

        let message_count = state.queues.get(name).map(|q| q.ready.len()).unwrap_or(0);
        let consumer_count = state.consumers.iter().filter(|c| c.queue == name).count();

        Ok(QueueInfo {
            name: name.to_owned(),
            message_count: message_count as u32,
            consumer_count: consumer_count as u32,
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(not_found(&format!("no queue '{queue}'")));
        }

        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(not_found(&format!("no exchange '{exchange}'")));
        };

        let binding = (queue.to_owned(), routing_key.to_owned());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        state.dispatch();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(not_found(&format!("no queue '{queue}'")));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(Consumer {
            channel_id: self.id,
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
            sender,
        });
        state.dispatch();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        let id = self.id;
        state
            .consumers
            .retain(|c| !(c.channel_id == id && c.tag == consumer_tag));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        state.confirm_selects += 1;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirming = true;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        let targets = state.route(exchange, routing_key)?;
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: payload.to_vec(),
            properties,
            redelivered: false,
        };
        state.enqueue(&targets, &message);
        state.dispatch();

        let confirming = state
            .channels
            .get(&self.id)
            .map(|c| c.confirming)
            .unwrap_or(false);

        let confirmation = match (confirming, state.confirm_mode) {
            (false, _) => Confirmation::NotRequested,
            (true, ConfirmMode::Never) => {
                return Ok(Box::pin(future::pending::<Result<Confirmation, AmqpError>>()))
            }
            (true, ConfirmMode::Nack) => Confirmation::Nack,
            (true, ConfirmMode::Ack) if mandatory && targets.is_empty() => Confirmation::Returned,
            (true, ConfirmMode::Ack) => Confirmation::Ack,
        };

        Ok(Box::pin(future::ready(Ok::<_, AmqpError>(confirmation))))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        state.take_unacked(self.id, delivery_tag)?;
        state.dispatch();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        let entry = state.take_unacked(self.id, delivery_tag)?;
        if requeue {
            state.requeue(entry);
        } else {
            state.dead_letter(entry);
        }
        state.dispatch();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.lock();
        state.check_open(self.id)?;

        let id = self.id;
        state.consumers.retain(|c| c.channel_id != id);
        state.requeue_channel(id);
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.open = false;
        }
        state.dispatch();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().check_open(self.id).is_ok()
    }
}
