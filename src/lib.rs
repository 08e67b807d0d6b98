// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod ack;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;
