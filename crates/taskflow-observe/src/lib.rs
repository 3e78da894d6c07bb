//! Observability for taskflow: tracing subscriber setup and the attribute
//! names recorded on command spans.

pub mod span_attrs;
pub mod tracing_setup;
