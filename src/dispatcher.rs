// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module consumes one queue and hands each delivery to a
//! `ConsumerHandler`. A dispatcher goes through
//! `Idle -> Declaring -> Subscribed -> Draining -> Closed`:
//!
//! - `start` installs the topology, sets the channel's prefetch credit to
//!   `multiplier x concurrency` and subscribes.
//! - While subscribed, a fixed pool of workers pulls from the single delivery
//!   stream; each worker runs one handler invocation at a time. The prefetch
//!   credit bounds what the broker keeps in flight, so a slow handler slows
//!   the whole subscription down.
//! - A subscription the broker ends on its own, for instance because the
//!   queue was deleted, moves the dispatcher to `Draining`; `shutdown` still
//!   has to be called to resolve what is in flight and close the channel.
//! - `shutdown` cancels the subscription, lets every worker finish its current
//!   invocation, waits for all of them to be resolved and closes the channel.
//!   There is no forced cancellation: a handler that never returns blocks
//!   shutdown.
//!
//! Handler results are mapped to acknowledgements by the
//! [`AckCoordinator`](crate::ack::AckCoordinator).

use crate::{
    ack::{AckCoordinator, Outcome},
    broker::{BrokerChannel, DeliveryStream},
    channel::ConnectionHealth,
    delivery::{Delivery, DeliveryFilter},
    errors::{AmqpError, HandlerError},
    handler::ConsumerHandler,
    otel,
    topology::AmqpTopology,
};
use futures_util::{future::join_all, FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    num::NonZeroU16,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default ratio between prefetch credit and handler concurrency
pub const DEFAULT_PREFETCH_MULTIPLIER: u16 = 4;

/// How many handler invocations may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// A pool of exactly `n` workers
    Fixed(NonZeroU16),
    /// One task per delivery, bounded only by the prefetch credit
    Unbounded,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Fixed(NonZeroU16::MIN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Declaring,
    Subscribed,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub(crate) consumer_tag: String,
    pub(crate) concurrency: Concurrency,
    pub(crate) prefetch_multiplier: u16,
    pub(crate) prefetch_count: Option<u16>,
    pub(crate) filter: DeliveryFilter,
    pub(crate) requeue_filtered: bool,
    pub(crate) max_redeliveries: Option<u64>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings::new("")
    }
}

impl ConsumerSettings {
    /// Settings for one worker and a prefetch of four. An empty tag is
    /// replaced by a generated one.
    pub fn new(consumer_tag: &str) -> Self {
        let consumer_tag = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        ConsumerSettings {
            consumer_tag,
            concurrency: Concurrency::default(),
            prefetch_multiplier: DEFAULT_PREFETCH_MULTIPLIER,
            prefetch_count: None,
            filter: DeliveryFilter::default(),
            requeue_filtered: true,
            max_redeliveries: None,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn prefetch_multiplier(mut self, multiplier: u16) -> Self {
        self.prefetch_multiplier = multiplier;
        self
    }

    /// Fixes the prefetch credit instead of deriving it from the
    /// concurrency; 0 lifts the limit.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    pub fn filter(mut self, filter: DeliveryFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Rejects filtered deliveries instead of requeueing them.
    pub fn reject_filtered(mut self) -> Self {
        self.requeue_filtered = false;
        self
    }

    /// Rejects a delivery instead of handling it once it has been attempted
    /// `max` times.
    pub fn max_redeliveries(mut self, max: u64) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    /// Prefetch credit requested from the broker. A multiplier of 0 counts
    /// as 1 so a fixed pool never asks for unlimited credit.
    pub fn prefetch(&self) -> u16 {
        if let Some(count) = self.prefetch_count {
            return count;
        }

        match self.concurrency {
            Concurrency::Fixed(n) => self.prefetch_multiplier.max(1).saturating_mul(n.get()),
            Concurrency::Unbounded => 0,
        }
    }
}

/// Everything a worker needs to process deliveries.
struct Worker {
    coordinator: Arc<AckCoordinator>,
    handler: Arc<dyn ConsumerHandler>,
    settings: ConsumerSettings,
    cancel: CancellationToken,
    tracer: BoxedTracer,
    health: ConnectionHealth,
    state: Arc<watch::Sender<DispatcherState>>,
    stream_ended: AtomicBool,
}

pub struct RabbitMQDispatcher {
    channel: Arc<dyn BrokerChannel>,
    health: ConnectionHealth,
    topology: AmqpTopology,
    worker: Arc<Worker>,
    state: Arc<watch::Sender<DispatcherState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RabbitMQDispatcher {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        health: ConnectionHealth,
        topology: AmqpTopology,
        settings: ConsumerSettings,
        handler: Arc<dyn ConsumerHandler>,
    ) -> RabbitMQDispatcher {
        let mut coordinator = AckCoordinator::new(channel.clone(), health.clone());
        if settings.max_redeliveries.is_some() {
            coordinator = coordinator.counting_requeues();
        }
        let (state, _) = watch::channel(DispatcherState::Idle);
        let state = Arc::new(state);

        RabbitMQDispatcher {
            channel,
            health: health.clone(),
            topology,
            worker: Arc::new(Worker {
                coordinator: Arc::new(coordinator),
                handler,
                settings,
                cancel: CancellationToken::new(),
                tracer: global::tracer("amqp consumer"),
                health: health.clone(),
                state: state.clone(),
                stream_ended: AtomicBool::new(false),
            }),
            state,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Handler invocations not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.worker.coordinator.in_flight()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.worker.settings
    }

    /// Declares the topology, subscribes and starts the workers.
    ///
    /// # Errors
    /// `InvalidState` unless the dispatcher is idle; `DeclareError`,
    /// `QoSDeclarationError` or `ConsumeError` when setup fails, which leaves
    /// the dispatcher closed.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let began = self.state.send_if_modified(|state| {
            if *state == DispatcherState::Idle {
                *state = DispatcherState::Declaring;
                true
            } else {
                false
            }
        });

        if !began {
            return Err(AmqpError::InvalidState(format!(
                "dispatcher cannot start while {:?}",
                self.state()
            )));
        }

        match self.subscribe().await {
            Ok(stream) => {
                self.spawn_workers(stream).await;
                self.state.send_if_modified(|state| {
                    let declaring = *state == DispatcherState::Declaring;
                    if declaring {
                        *state = DispatcherState::Subscribed;
                    }
                    declaring
                });
                info!(
                    queue = self.topology.queue().name(),
                    consumer_tag = %self.worker.settings.consumer_tag,
                    "dispatcher subscribed"
                );
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(DispatcherState::Closed);
                Err(err)
            }
        }
    }

    async fn subscribe(&self) -> Result<DeliveryStream, AmqpError> {
        self.topology.install(self.channel.as_ref()).await?;

        let prefetch = self.worker.settings.prefetch();
        if let Err(err) = self.channel.basic_qos(prefetch).await {
            error!(error = err.to_string(), prefetch, "failure to set the prefetch credit");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let queue = self.topology.queue().name();
        match self
            .channel
            .basic_consume(queue, &self.worker.settings.consumer_tag)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::ConsumeError {
                    queue: queue.to_owned(),
                    reason: err.to_string(),
                })
            }
            Ok(stream) => Ok(stream),
        }
    }

    async fn spawn_workers(&self, stream: DeliveryStream) {
        let mut workers = self.workers.lock().await;

        workers.push(tokio::spawn({
            let health = self.health.clone();
            let cancel = self.worker.cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = health.closed() => {
                        warn!("connection closed, dispatcher stops pulling deliveries");
                        cancel.cancel();
                    }
                }
            }
        }));

        match self.worker.settings.concurrency {
            Concurrency::Fixed(n) => {
                let stream = Arc::new(Mutex::new(stream));
                for id in 0..n.get() {
                    let worker = self.worker.clone();
                    let stream = stream.clone();
                    workers.push(tokio::spawn(async move { worker.run(id, stream).await }));
                }
            }
            Concurrency::Unbounded => {
                let worker = self.worker.clone();
                workers.push(tokio::spawn(async move { worker.run_unbounded(stream).await }));
            }
        }
    }

    /// Drains and closes the dispatcher.
    ///
    /// Returns once every delivery pulled before the call has been resolved.
    /// Calling it on a closed dispatcher is a no-op.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let mut previous = DispatcherState::Idle;
        self.state.send_if_modified(|state| {
            previous = *state;
            match previous {
                DispatcherState::Subscribed => *state = DispatcherState::Draining,
                DispatcherState::Idle => *state = DispatcherState::Closed,
                _ => return false,
            }
            true
        });

        match previous {
            DispatcherState::Subscribed => {}
            // ended by the broker; the first caller finishes the drain
            DispatcherState::Draining if self.worker.stream_ended.swap(false, Ordering::SeqCst) => {}
            DispatcherState::Idle | DispatcherState::Closed => return Ok(()),
            DispatcherState::Declaring | DispatcherState::Draining => {
                return Err(AmqpError::InvalidState(format!(
                    "dispatcher cannot shut down while {previous:?}"
                )));
            }
        }

        info!(consumer_tag = %self.worker.settings.consumer_tag, "draining dispatcher");
        self.worker.cancel.cancel();

        if self.health.is_alive() {
            if let Err(err) = self.channel.basic_cancel(&self.worker.settings.consumer_tag).await {
                error!(error = err.to_string(), "failure to cancel the subscription");
            }
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for joined in join_all(workers).await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "dispatcher worker failed");
            }
        }

        self.worker.coordinator.wait_drained().await;
        debug!("all deliveries resolved");

        let result = if self.health.is_alive() {
            self.channel.close().await.map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ShutdownError(err.to_string())
            })
        } else {
            Ok(())
        };

        self.state.send_replace(DispatcherState::Closed);
        info!(consumer_tag = %self.worker.settings.consumer_tag, "dispatcher closed");
        result
    }
}

impl Worker {
    async fn run(&self, id: u16, stream: Arc<Mutex<DeliveryStream>>) {
        debug!(worker = id, "worker started");

        while let Some(delivery) = self.next(&stream).await {
            if self.admit(&delivery).await {
                self.handle(delivery).await;
            }
        }

        debug!(worker = id, "worker stopped");
    }

    async fn run_unbounded(self: Arc<Self>, stream: DeliveryStream) {
        let stream = Mutex::new(stream);

        while let Some(delivery) = self.next(&stream).await {
            if self.admit(&delivery).await {
                let worker = self.clone();
                tokio::spawn(async move { worker.handle(delivery).await });
            }
        }
    }

    /// Pulls the next delivery unless draining has begun.
    async fn next(&self, stream: &Mutex<DeliveryStream>) -> Option<Delivery> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                item = async { stream.lock().await.next().await } => item,
            };

            match item {
                Some(Ok(delivery)) => return Some(delivery),
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    if self.cancel.is_cancelled() || !self.health.is_alive() {
                        debug!("delivery stream closed");
                    } else {
                        self.ended_by_broker();
                    }
                    return None;
                }
            }
        }
    }

    /// The broker cancelled the subscription. Stops the other workers and
    /// lets state subscribers see the dispatcher draining.
    fn ended_by_broker(&self) {
        let first = !self.stream_ended.swap(true, Ordering::SeqCst);
        self.cancel.cancel();

        if first {
            warn!(
                consumer_tag = %self.settings.consumer_tag,
                "subscription cancelled by the broker, dispatcher stops pulling deliveries"
            );
            self.state.send_if_modified(|state| {
                let running = matches!(*state, DispatcherState::Declaring | DispatcherState::Subscribed);
                if running {
                    *state = DispatcherState::Draining;
                }
                running
            });
        }
    }

    /// Registers a pulled delivery as in flight. Returns whether it should be
    /// handed to the handler.
    async fn admit(&self, delivery: &Delivery) -> bool {
        if let Err(err) = self.coordinator.track(delivery) {
            error!(error = err.to_string(), "delivery dropped");
            return false;
        }

        if self.cancel.is_cancelled() {
            debug!(delivery_tag = delivery.delivery_tag, "draining, returning delivery");
            self.settle(delivery, Outcome::Requeue).await;
            return false;
        }

        true
    }

    async fn handle(&self, delivery: Delivery) {
        if !self.settings.filter.accepts(&delivery) {
            warn!(
                delivery_tag = delivery.delivery_tag,
                app_id = delivery.app_id.as_deref().unwrap_or_default(),
                routing_key = %delivery.routing_key,
                "removing message from queue - reason: unexpected identity"
            );
            let outcome = if self.settings.requeue_filtered {
                Outcome::Requeue
            } else {
                Outcome::Reject
            };
            self.settle(&delivery, outcome).await;
            return;
        }

        if let Some(max) = self.settings.max_redeliveries {
            let attempts = self.coordinator.attempts(&delivery);
            if attempts >= max {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    attempts, "too many attempts, sending to dlq"
                );
                self.settle(&delivery, Outcome::Reject).await;
                return;
            }
        }

        let (ctx, mut span) = otel::new_span(&delivery.headers, &self.tracer, &delivery.routing_key);

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "received: {} - exchange: {}",
            delivery.routing_key,
            delivery.exchange,
        );

        let result = AssertUnwindSafe(self.handler.exec(&ctx, &delivery))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Outcome::Ack
            }
            Ok(Err(err)) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = err.to_string(),
                    "error whiling handling msg"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                match err {
                    HandlerError::Transient(_) => Outcome::Requeue,
                    HandlerError::Permanent(_) => Outcome::Reject,
                }
            }
            Err(_) => {
                error!(delivery_tag = delivery.delivery_tag, "handler panicked");
                span.set_status(Status::Error {
                    description: Cow::from("handler panicked"),
                });
                Outcome::Requeue
            }
        };

        self.settle(&delivery, outcome).await;
    }

    async fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        if let Err(err) = self.coordinator.settle(delivery, outcome).await {
            error!(
                delivery_tag = delivery.delivery_tag,
                error = err.to_string(),
                "error resolving delivery"
            );
        }
    }
}
