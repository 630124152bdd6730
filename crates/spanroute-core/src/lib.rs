//! Core types, traits, and error handling for spanroute.
//!
//! This crate provides the fundamental abstractions used throughout the
//! traceroute implementation:
//!
//! - [`TracerouteConfig`] and [`Protocol`] describing a single run
//! - [`TracerouteHop`] and result-table reduction
//! - [`Tracer`] / [`Span`] capability traits with no-op, log-backed, and
//!   recording implementations
//! - [`TracerouteError`] for error handling

pub mod error;
pub mod result;
pub mod tracer;
pub mod types;

pub use error::{TracerouteError, TracerouteResult};
pub use result::{reduce_final_result, ResultTable, TracerouteHop};
pub use tracer::{
    AttrValue, Attribute, FinishedSpan, LogTracer, NoopTracer, RecordingTracer, Span, SpanKind,
    SpanStatus, TraceContext, Tracer,
};
pub use types::{Protocol, TracerouteConfig};
