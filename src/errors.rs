// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Reliability Layer
//!
//! This module provides the error types surfaced by the connection manager,
//! topology declaration, publisher, dispatcher and acknowledgement coordinator.
//! Setup failures (connect, declare, subscribe) are fatal to the caller, while
//! per-message failures are resolved locally through ack/nack and only reach
//! the caller as `HandlerError`s returned by their own handlers.

use std::fmt;
use thiserror::Error;

/// The topology declaration step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStep {
    Exchange,
    Queue,
    Bind,
}

impl fmt::Display for DeclareStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclareStep::Exchange => write!(f, "exchange"),
            DeclareStep::Queue => write!(f, "queue"),
            DeclareStep::Bind => write!(f, "bind"),
        }
    }
}

/// Why a publish did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    /// The broker accepted the frame but negatively confirmed it, or returned
    /// it as unroutable.
    NotConfirmed,
    /// No confirmation arrived in time. The message may or may not have been
    /// stored.
    ConfirmTimeout,
    /// The broker refused the frame outright.
    Rejected,
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishErrorKind::NotConfirmed => write!(f, "not confirmed"),
            PublishErrorKind::ConfirmTimeout => write!(f, "confirm timeout"),
            PublishErrorKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Malformed connection string, unreachable broker or failed authentication
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A topology step failed; later steps were not attempted
    #[error("failure to declare {step}: {reason}")]
    DeclareError { step: DeclareStep, reason: String },

    /// Error publishing a message
    #[error("failure to publish message `{message_id}`: {kind}")]
    PublishError {
        kind: PublishErrorKind,
        message_id: String,
    },

    /// Error entering confirm mode
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error establishing the subscription
    #[error("failure to consume from queue `{queue}`: {reason}")]
    ConsumeError { queue: String, reason: String },

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// A delivery tag was resolved twice, or was never tracked
    #[error("delivery `{0}` was already resolved")]
    DeliveryAlreadyResolved(u64),

    /// Operation not allowed in the dispatcher's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Error closing the channel or connection
    #[error("failure to shutdown: {0}")]
    ShutdownError(String),

    /// Error loading or interpreting configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Raw failure reported by the broker or the client library
    #[error("broker error: {0}")]
    BrokerError(String),
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        AmqpError::BrokerError(err.to_string())
    }
}

impl From<figment::Error> for AmqpError {
    fn from(err: figment::Error) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}

/// Error returned by a `ConsumerHandler`.
///
/// Transient failures are requeued for another attempt. Permanent failures
/// are rejected without requeue, which routes them to the queue's dead-letter
/// path when one is configured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        HandlerError::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        HandlerError::Permanent(reason.into())
    }
}
