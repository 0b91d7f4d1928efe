// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context crosses the broker twice: inside the envelope metadata
//! (`traceparent`, `tracestate`, `spanId`) and in the AMQP headers. Consumers
//! read the envelope first and fall back to the headers, then start a
//! consumer span that is a child of the extracted context and linked to the
//! publishing span.

use crate::message::Metadata;
use opentelemetry::{
    global,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{
        Link, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceState, Tracer,
    },
    Context,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

pub(crate) const TRACEPARENT: &str = "traceparent";
pub(crate) const TRACESTATE: &str = "tracestate";

/// Propagator used to inject and extract trace context.
#[derive(Clone, Default)]
pub(crate) enum Propagation {
    /// Whatever the application installed with `global::set_text_map_propagator`
    #[default]
    Global,
    Custom(Arc<dyn TextMapPropagator + Send + Sync>),
}

impl Propagation {
    pub(crate) fn with<R>(&self, mut f: impl FnMut(&dyn TextMapPropagator) -> R) -> R {
        match self {
            Propagation::Global => global::get_text_map_propagator(|propagator| f(propagator)),
            Propagation::Custom(propagator) => f(propagator.as_ref()),
        }
    }
}

/// Writes trace context into string-valued AMQP headers.
pub(crate) struct HeaderInjector<'a>(pub(crate) &'a mut BTreeMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context from string-valued AMQP headers.
pub(crate) struct HeaderExtractor<'a>(pub(crate) &'a BTreeMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Name of the span covering a handler invocation.
pub(crate) fn span_name(message_name: &str) -> String {
    format!("processing: {message_name}")
}

/// Context of the publisher, taken from the envelope or, when the envelope
/// carries none, from the AMQP headers.
pub(crate) fn extract(
    propagator: &dyn TextMapPropagator,
    metadata: &Metadata,
    headers: &BTreeMap<String, String>,
) -> Context {
    if metadata.traceparent.is_empty() {
        return propagator.extract(&HeaderExtractor(headers));
    }

    let mut carrier = HashMap::new();
    carrier.insert(TRACEPARENT.to_owned(), metadata.traceparent.clone());
    if !metadata.tracestate.is_empty() {
        carrier.insert(TRACESTATE.to_owned(), metadata.tracestate.clone());
    }
    propagator.extract(&carrier)
}

/// Link to the publishing span named by `span_id` within the parent's trace.
pub(crate) fn publisher_link(parent: &Context, span_id: &str) -> Option<Link> {
    if span_id.is_empty() {
        return None;
    }

    let trace_id = parent.span().span_context().trace_id();
    let span_id = SpanId::from_hex(span_id).ok()?;
    let span_context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );

    span_context.is_valid().then(|| Link::with_context(span_context))
}

/// Starts the consumer span for `metadata` as a child of `parent` and returns
/// the context carrying it.
pub(crate) fn consumer_context<T>(tracer: &T, parent: Context, metadata: &Metadata) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let mut builder = tracer
        .span_builder(span_name(&metadata.message_name))
        .with_kind(SpanKind::Consumer);
    if let Some(link) = publisher_link(&parent, &metadata.span_id) {
        builder = builder.with_links(vec![link]);
    }

    let span = builder.start_with_context(tracer, &parent);
    parent.with_span(span)
}

/// Fills the envelope trace fields and the AMQP headers from the span active
/// in `cx`. Leaves both untouched when there is no valid span.
pub(crate) fn enrich(
    cx: &Context,
    propagator: &dyn TextMapPropagator,
    metadata: &mut Metadata,
    headers: &mut BTreeMap<String, String>,
) {
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return;
    }

    let mut carrier = HashMap::new();
    propagator.inject_context(cx, &mut carrier);

    metadata.traceparent = carrier.remove(TRACEPARENT).unwrap_or_default();
    metadata.tracestate = carrier.remove(TRACESTATE).unwrap_or_default();
    metadata.span_id = span_context.span_id().to_string();

    propagator.inject_context(cx, &mut HeaderInjector(headers));
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{TraceId, TracerProvider};
    use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider};

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    fn remote_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex(TRACE_ID).unwrap(),
            SpanId::from_hex(SPAN_ID).unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn enrich_writes_envelope_and_headers() {
        let propagator = TraceContextPropagator::new();
        let mut metadata = Metadata::new("svc", "OrderCreated");
        let mut headers = BTreeMap::new();

        enrich(&remote_context(), &propagator, &mut metadata, &mut headers);

        let expected = format!("00-{TRACE_ID}-{SPAN_ID}-01");
        assert_eq!(metadata.traceparent, expected);
        assert_eq!(metadata.span_id, SPAN_ID);
        assert_eq!(headers.get(TRACEPARENT), Some(&expected));
    }

    #[test]
    fn enrich_without_span_leaves_fields_empty() {
        let propagator = TraceContextPropagator::new();
        let mut metadata = Metadata::new("svc", "OrderCreated");
        let mut headers = BTreeMap::new();

        enrich(&Context::new(), &propagator, &mut metadata, &mut headers);

        assert_eq!(metadata.traceparent, "");
        assert_eq!(metadata.tracestate, "");
        assert_eq!(metadata.span_id, "");
        assert!(headers.is_empty());
    }

    #[test]
    fn extract_falls_back_to_headers() {
        let propagator = TraceContextPropagator::new();
        let metadata = Metadata::new("svc", "OrderCreated");
        let mut headers = BTreeMap::new();
        headers.insert(
            TRACEPARENT.to_owned(),
            format!("00-{TRACE_ID}-{SPAN_ID}-01"),
        );

        let cx = extract(&propagator, &metadata, &headers);
        assert_eq!(
            cx.span().span_context().trace_id(),
            TraceId::from_hex(TRACE_ID).unwrap()
        );
    }

    #[test]
    fn consumer_span_continues_the_publisher_trace() {
        let propagator = TraceContextPropagator::new();
        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("amqp consumer");

        let mut metadata = Metadata::new("svc", "OrderCreated");
        enrich(&remote_context(), &propagator, &mut metadata, &mut BTreeMap::new());

        let parent = extract(&propagator, &metadata, &BTreeMap::new());
        let cx = consumer_context(&tracer, parent, &metadata);
        let span = cx.span();
        let span_context = span.span_context();

        assert!(span_context.is_valid());
        assert_eq!(span_context.trace_id(), TraceId::from_hex(TRACE_ID).unwrap());
        assert_ne!(span_context.span_id(), SpanId::from_hex(SPAN_ID).unwrap());
        span.end();
    }

    #[test]
    fn links_to_publisher_span() {
        let link = publisher_link(&remote_context(), SPAN_ID).unwrap();
        assert_eq!(link.span_context.span_id(), SpanId::from_hex(SPAN_ID).unwrap());
        assert_eq!(link.span_context.trace_id(), TraceId::from_hex(TRACE_ID).unwrap());

        assert!(publisher_link(&remote_context(), "").is_none());
        assert!(publisher_link(&remote_context(), "not-hex").is_none());
        assert!(publisher_link(&Context::new(), SPAN_ID).is_none());
    }

    #[test]
    fn custom_propagation_bypasses_the_global_propagator() {
        let propagation = Propagation::Custom(Arc::new(TraceContextPropagator::new()));
        let mut metadata = Metadata::new("svc", "OrderCreated");
        let mut headers = BTreeMap::new();

        propagation.with(|propagator| {
            enrich(&remote_context(), propagator, &mut metadata, &mut headers)
        });

        assert_eq!(metadata.traceparent, format!("00-{TRACE_ID}-{SPAN_ID}-01"));
        assert!(headers.contains_key(TRACEPARENT));
    }

    #[test]
    fn names_spans_after_the_message() {
        assert_eq!(span_name("OrderCreated"), "processing: OrderCreated");
    }
}
