//! In-memory test doubles for span dispatch.
//!
//! These are useful for testing and debugging purposes, and are the doubles
//! this crate's own tests are built on.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::Context;

use crate::completion::CompletionHandle;
use crate::error::DispatchError;
use crate::processor::SpanProcessor;
use crate::span::SpanData;

/// Returns a sampled span suitable as pipeline input in tests.
pub fn new_test_span_data() -> SpanData {
    SpanData {
        span_context: SpanContext::new(
            TraceId::from(1u128),
            SpanId::from(1u64),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        ),
        parent_span_id: SpanId::INVALID,
        span_kind: SpanKind::Internal,
        name: Cow::Borrowed("test-span"),
        start_time: opentelemetry::time::now(),
        end_time: opentelemetry::time::now(),
        attributes: Vec::new(),
        dropped_attributes_count: 0,
        status: Status::Unset,
    }
}

#[derive(Debug, Default)]
struct ProcessorState {
    started: Vec<SpanData>,
    ended: Vec<SpanData>,
    flush_count: usize,
    shutdown_count: usize,
    lifecycle_handles: Vec<CompletionHandle>,
}

/// A span processor that records every notification it receives in memory.
///
/// The processor is clonable; all clones share the same storage, so a test
/// can hand one clone to a dispatcher and query another. Capabilities and
/// lifecycle behavior are chosen at build time through
/// [`InMemorySpanProcessorBuilder`].
#[derive(Clone, Debug)]
pub struct InMemorySpanProcessor {
    state: Arc<Mutex<ProcessorState>>,
    observe_start: bool,
    observe_end: bool,
    lifecycle: LifecycleBehavior,
}

/// How [`InMemorySpanProcessor`] completes its shutdown/flush handles.
#[derive(Clone, Copy, Debug)]
enum LifecycleBehavior {
    /// Immediate success.
    Immediate,
    /// Immediate failure.
    Fail,
    /// Pending handles the test completes itself, retrievable through
    /// [`InMemorySpanProcessor::lifecycle_handles`].
    Manual,
}

/// Builder for [`InMemorySpanProcessor`].
#[derive(Debug)]
pub struct InMemorySpanProcessorBuilder {
    observe_start: bool,
    observe_end: bool,
    lifecycle: LifecycleBehavior,
}

impl Default for InMemorySpanProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySpanProcessorBuilder {
    /// Creates a builder for a processor with no capabilities and
    /// immediately successful lifecycle operations.
    pub fn new() -> Self {
        InMemorySpanProcessorBuilder {
            observe_start: false,
            observe_end: false,
            lifecycle: LifecycleBehavior::Immediate,
        }
    }

    /// The processor will require and record start notifications.
    pub fn observe_start(mut self) -> Self {
        self.observe_start = true;
        self
    }

    /// The processor will require and record end notifications, forwarding
    /// each span unchanged.
    pub fn observe_end(mut self) -> Self {
        self.observe_end = true;
        self
    }

    /// Shutdown and flush return handles that fail immediately.
    pub fn fail_lifecycle(mut self) -> Self {
        self.lifecycle = LifecycleBehavior::Fail;
        self
    }

    /// Shutdown and flush return pending handles the test completes itself.
    pub fn manual_lifecycle(mut self) -> Self {
        self.lifecycle = LifecycleBehavior::Manual;
        self
    }

    /// Builds the processor.
    pub fn build(self) -> InMemorySpanProcessor {
        InMemorySpanProcessor {
            state: Arc::new(Mutex::new(ProcessorState::default())),
            observe_start: self.observe_start,
            observe_end: self.observe_end,
            lifecycle: self.lifecycle,
        }
    }
}

impl InMemorySpanProcessor {
    /// Creates a builder.
    pub fn builder() -> InMemorySpanProcessorBuilder {
        InMemorySpanProcessorBuilder::new()
    }

    /// Returns the spans observed at start time.
    pub fn started_spans(&self) -> Result<Vec<SpanData>, DispatchError> {
        self.state
            .lock()
            .map(|state| state.started.clone())
            .map_err(DispatchError::from)
    }

    /// Returns the spans observed at end time.
    pub fn ended_spans(&self) -> Result<Vec<SpanData>, DispatchError> {
        self.state
            .lock()
            .map(|state| state.ended.clone())
            .map_err(DispatchError::from)
    }

    /// Number of `force_flush` calls received so far.
    pub fn flush_count(&self) -> usize {
        self.state.lock().map(|state| state.flush_count).unwrap_or(0)
    }

    /// Number of `shutdown` calls received so far.
    pub fn shutdown_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.shutdown_count)
            .unwrap_or(0)
    }

    /// The pending handles handed out so far in manual lifecycle mode.
    pub fn lifecycle_handles(&self) -> Vec<CompletionHandle> {
        self.state
            .lock()
            .map(|state| state.lifecycle_handles.clone())
            .unwrap_or_default()
    }

    /// Clears the recorded spans and counters.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ProcessorState::default();
        }
    }

    fn lifecycle_handle(&self) -> CompletionHandle {
        match self.lifecycle {
            LifecycleBehavior::Immediate => CompletionHandle::success(),
            LifecycleBehavior::Fail => CompletionHandle::failure(
                DispatchError::ProcessorFailure("in-memory processor configured to fail".into()),
            ),
            LifecycleBehavior::Manual => {
                let handle = CompletionHandle::new();
                if let Ok(mut state) = self.state.lock() {
                    state.lifecycle_handles.push(handle.clone());
                }
                handle
            }
        }
    }
}

impl SpanProcessor for InMemorySpanProcessor {
    fn on_start(&self, span: &SpanData, _parent_cx: &Context) {
        if let Ok(mut state) = self.state.lock() {
            state.started.push(span.clone());
        }
    }

    fn is_start_required(&self) -> bool {
        self.observe_start
    }

    fn on_end_with(&self, span: SpanData, forward: &mut dyn FnMut(SpanData)) {
        if let Ok(mut state) = self.state.lock() {
            state.ended.push(span.clone());
        }
        forward(span);
    }

    fn is_end_required(&self) -> bool {
        self.observe_end
    }

    fn force_flush(&self) -> CompletionHandle {
        if let Ok(mut state) = self.state.lock() {
            state.flush_count += 1;
        }
        self.lifecycle_handle()
    }

    fn shutdown(&self) -> CompletionHandle {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown_count += 1;
        }
        self.lifecycle_handle()
    }
}
