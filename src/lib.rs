//! # Span Dispatch
//!
//! Fan-out and pipelining of span lifecycle events over an ordered set of
//! [`SpanProcessor`]s.
//!
//! A tracing SDK typically registers several span processors at once: one that
//! records start timestamps, one that enriches finished spans, one that hands
//! them to a batching exporter. This crate provides the composition layer that
//! sits between the tracer and those processors:
//!
//! * span-start events are fanned out to every processor that asked for them,
//!   in registration order,
//! * span-end events flow through a sequential pipeline in which each stage
//!   may observe, transform, or drop the span before the next stage sees it,
//! * `shutdown`/`force_flush` are fanned out to all processors and their
//!   individually asynchronous outcomes are joined into a single
//!   [`CompletionHandle`].
//!
//! The dispatcher, [`MultiSpanProcessor`], itself implements [`SpanProcessor`],
//! so dispatchers compose and nest like any other processor.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod completion;
mod error;
mod processor;
mod span;

#[cfg(any(feature = "testing", test))]
#[doc(hidden)]
pub mod testing;

pub use completion::CompletionHandle;
pub use error::{DispatchError, DispatchResult};
pub use processor::{MultiSpanProcessor, SpanProcessor};
pub use span::SpanData;
