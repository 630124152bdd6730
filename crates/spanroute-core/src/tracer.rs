//! Tracer capability consumed by the traceroute engine.
//!
//! The engine produces one parent span per run and one child span per probe.
//! Span transport is not this crate's concern: callers hand the engine an
//! [`Arc<dyn Tracer>`](Tracer) and the engine only ever starts spans, sets
//! attributes, records a terminal status, and ends them. Three implementations
//! ship here: [`NoopTracer`], [`LogTracer`] (spans rendered as structured log
//! events), and [`RecordingTracer`] (test instrumentation).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A single span attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Str(String),
    I64(i64),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(value) => write!(f, "{}", value),
            AttrValue::I64(value) => write!(f, "{}", value),
        }
    }
}

/// A span attribute key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub key: &'static str,
    pub value: AttrValue,
}

impl Attribute {
    pub fn string(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: AttrValue::Str(value.into()),
        }
    }

    pub fn i64(key: &'static str, value: i64) -> Self {
        Self {
            key,
            value: AttrValue::I64(value),
        }
    }
}

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    #[default]
    Internal,
    Client,
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Opaque trace context: span lineage plus baggage propagated to children.
///
/// Baggage members ride along into every span started under this context but
/// never influence engine behavior.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    lineage: Vec<String>,
    baggage: BTreeMap<String, String>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a baggage member, returning the updated context.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    pub fn baggage(&self) -> impl Iterator<Item = (&str, &str)> {
        self.baggage
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Derives the context a child span hands to its own children.
    pub fn child(&self, name: &str) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(name.to_string());
        Self {
            lineage,
            baggage: self.baggage.clone(),
        }
    }

    /// Nesting depth of this context (number of ancestor spans).
    pub fn depth(&self) -> usize {
        self.lineage.len()
    }
}

/// An in-progress span. Ending consumes the handle, so a span cannot be ended
/// twice.
pub trait Span: Send {
    fn set_attributes(&mut self, attrs: &[Attribute]);

    fn set_status(&mut self, status: SpanStatus, message: &str);

    fn add_event(&mut self, name: &str);

    fn end(self: Box<Self>);
}

/// Capability for starting spans.
pub trait Tracer: Send + Sync {
    /// Starts a span under `parent`, returning the span handle and the context
    /// children of this span should be started under.
    fn start_span(
        &self,
        parent: &TraceContext,
        name: &str,
        kind: SpanKind,
        attrs: &[Attribute],
    ) -> (Box<dyn Span>, TraceContext);
}

/// Tracer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attributes(&mut self, _attrs: &[Attribute]) {}
    fn set_status(&mut self, _status: SpanStatus, _message: &str) {}
    fn add_event(&mut self, _name: &str) {}
    fn end(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(
        &self,
        parent: &TraceContext,
        name: &str,
        _kind: SpanKind,
        _attrs: &[Attribute],
    ) -> (Box<dyn Span>, TraceContext) {
        (Box::new(NoopSpan), parent.child(name))
    }
}

/// Tracer that renders each finished span as one structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    kind: SpanKind,
    start: Instant,
    attrs: Vec<Attribute>,
    status: SpanStatus,
    message: String,
    events: Vec<String>,
    baggage: String,
}

impl Span for LogSpan {
    fn set_attributes(&mut self, attrs: &[Attribute]) {
        self.attrs.extend_from_slice(attrs);
    }

    fn set_status(&mut self, status: SpanStatus, message: &str) {
        self.status = status;
        self.message = message.to_string();
    }

    fn add_event(&mut self, name: &str) {
        self.events.push(name.to_string());
    }

    fn end(self: Box<Self>) {
        let attrs = self
            .attrs
            .iter()
            .map(|attr| format!("{}={}", attr.key, attr.value))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            target: "spanroute::span",
            span = %self.name,
            kind = ?self.kind,
            status = ?self.status,
            status_message = %self.message,
            elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0,
            attributes = %attrs,
            events = self.events.len(),
            baggage = %self.baggage,
            "span end"
        );
    }
}

impl Tracer for LogTracer {
    fn start_span(
        &self,
        parent: &TraceContext,
        name: &str,
        kind: SpanKind,
        attrs: &[Attribute],
    ) -> (Box<dyn Span>, TraceContext) {
        let baggage = parent
            .baggage()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let span = LogSpan {
            name: name.to_string(),
            kind,
            start: Instant::now(),
            attrs: attrs.to_vec(),
            status: SpanStatus::Unset,
            message: String::new(),
            events: Vec::new(),
            baggage,
        };
        (Box::new(span), parent.child(name))
    }
}

/// A span retained by [`RecordingTracer`] after it ended.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub message: String,
    pub attributes: Vec<Attribute>,
    pub events: Vec<String>,
}

impl FinishedSpan {
    /// Looks up an attribute by key, last write wins.
    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .rev()
            .find(|attr| attr.key == key)
            .map(|attr| &attr.value)
    }
}

#[derive(Default)]
struct RecordingState {
    started: usize,
    ended: usize,
    finished: Vec<FinishedSpan>,
}

/// Tracer that records spans in memory; used by tests to assert exactly-once
/// span termination and attribute contents.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.state.lock().expect("recording state poisoned").started
    }

    pub fn ended(&self) -> usize {
        self.state.lock().expect("recording state poisoned").ended
    }

    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.state
            .lock()
            .expect("recording state poisoned")
            .finished
            .clone()
    }
}

struct RecordingSpan {
    state: Arc<Mutex<RecordingState>>,
    record: FinishedSpan,
}

impl Span for RecordingSpan {
    fn set_attributes(&mut self, attrs: &[Attribute]) {
        self.record.attributes.extend_from_slice(attrs);
    }

    fn set_status(&mut self, status: SpanStatus, message: &str) {
        self.record.status = status;
        self.record.message = message.to_string();
    }

    fn add_event(&mut self, name: &str) {
        self.record.events.push(name.to_string());
    }

    fn end(self: Box<Self>) {
        let mut state = self.state.lock().expect("recording state poisoned");
        state.ended += 1;
        state.finished.push(self.record);
    }
}

impl Tracer for RecordingTracer {
    fn start_span(
        &self,
        parent: &TraceContext,
        name: &str,
        kind: SpanKind,
        attrs: &[Attribute],
    ) -> (Box<dyn Span>, TraceContext) {
        let mut state = self.state.lock().expect("recording state poisoned");
        state.started += 1;
        drop(state);
        let span = RecordingSpan {
            state: self.state.clone(),
            record: FinishedSpan {
                name: name.to_string(),
                kind,
                status: SpanStatus::Unset,
                message: String::new(),
                attributes: attrs.to_vec(),
                events: Vec::new(),
            },
        };
        (Box::new(span), parent.child(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baggage_propagates_to_children() {
        let ctx = TraceContext::new()
            .with_baggage("source", "host-a")
            .with_baggage("xid", "abc");
        let child = ctx.child("run");
        assert_eq!(child.depth(), 1);
        let members: Vec<_> = child.baggage().collect();
        assert_eq!(members, vec![("source", "host-a"), ("xid", "abc")]);
    }

    #[test]
    fn test_recording_tracer_counts() {
        let tracer = RecordingTracer::new();
        let ctx = TraceContext::new();
        let (mut span, child_ctx) =
            tracer.start_span(&ctx, "run", SpanKind::Client, &[Attribute::i64("ttl", 3)]);
        let (other, _) = tracer.start_span(&child_ctx, "probe", SpanKind::Client, &[]);

        span.set_status(SpanStatus::Ok, "success");
        span.end();
        assert_eq!(tracer.started(), 2);
        assert_eq!(tracer.ended(), 1);

        other.end();
        assert_eq!(tracer.ended(), 2);

        let finished = tracer.finished();
        assert_eq!(finished[0].status, SpanStatus::Ok);
        assert_eq!(finished[0].attribute("ttl"), Some(&AttrValue::I64(3)));
        assert_eq!(finished[1].status, SpanStatus::Unset);
    }

    #[test]
    fn test_attribute_last_write_wins() {
        let tracer = RecordingTracer::new();
        let (mut span, _) = tracer.start_span(
            &TraceContext::new(),
            "probe",
            SpanKind::Client,
            &[Attribute::string("hop", "null")],
        );
        span.set_attributes(&[Attribute::string("hop", "10.0.0.1")]);
        span.end();

        let finished = tracer.finished();
        assert_eq!(
            finished[0].attribute("hop"),
            Some(&AttrValue::Str("10.0.0.1".to_string()))
        );
    }
}
