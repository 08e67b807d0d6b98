// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Service-supplied message handler invoked by the dispatcher.

use crate::{delivery::Delivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;

/// Processes one delivery.
///
/// Implementations are invoked concurrently, up to the dispatcher's handler
/// concurrency. `Ok` acknowledges the delivery, `HandlerError::Transient`
/// requeues it and `HandlerError::Permanent` rejects it without requeue.
/// Requeued deliveries come back indefinitely unless the dispatcher is given a
/// redelivery cap, so handlers should be idempotent.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}
