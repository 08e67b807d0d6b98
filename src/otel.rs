// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in AMQP message headers: the publisher injects the
//! caller's context and the dispatcher extracts it to parent the span of each
//! handler invocation.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Writes propagation fields into outbound headers. Keys are lowercased.
pub(crate) struct HeaderInjector<'a>(pub(crate) &'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation fields from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a>(pub(crate) &'a BTreeMap<ShortString, AMQPValue>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(key, error = %err, "trace header is not utf-8"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// Injects `ctx` into a fresh header map for an outbound message.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(&mut headers))
    });

    headers
}

/// Creates a consumer span for a delivery, parented on the context carried in
/// its headers.
pub(crate) fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers.inner()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
