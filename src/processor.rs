//! # Span Processor Interface
//!
//! Span processor is an interface which allows hooks for span start and end
//! method invocations, plus participation in flush and shutdown. Processors
//! are registered on a [`MultiSpanProcessor`] and are invoked in the same
//! order as they were registered.
//!
//! ```ascii
//!   +------------------+   +----------------------+   +-------------------+
//!   |                  |   |                      |   |                   |
//!   |   Tracer /       +--->  MultiSpanProcessor  +--->  SpanProcessor(s) |
//!   |   span lifecycle |   |  (fan-out, pipeline) |   |  (enrich, export) |
//!   |                  |   |                      |   |                   |
//!   +------------------+   +----------------------+   +-------------------+
//! ```
//!
//! Start notifications are observational: every start-capable processor sees
//! the same span, and no processor can affect what the next one sees. End
//! notifications are a pipeline: each end-capable stage receives the span
//! value and a forwarding callback; invoking the callback (with a possibly
//! transformed span) continues the pipeline, not invoking it stops it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry::{otel_debug, otel_warn, Context};

use crate::completion::CompletionHandle;
use crate::span::SpanData;

/// An interface for hooking into span lifecycle events.
///
/// A processor declares which notifications it needs through
/// [`is_start_required`] and [`is_end_required`]; these are queried once at
/// registration time and must stay stable for the processor's lifetime. A
/// processor that overrides a handler must also override the matching
/// capability query, otherwise the handler is never invoked.
///
/// [`is_start_required`]: SpanProcessor::is_start_required
/// [`is_end_required`]: SpanProcessor::is_end_required
pub trait SpanProcessor: Send + Sync + fmt::Debug {
    /// Called when a span is started. This method is called synchronously on
    /// the thread that started the span, therefore it should not block.
    ///
    /// Start notification is observational: the span is shared by reference
    /// and every start-capable processor sees the same value.
    fn on_start(&self, _span: &SpanData, _parent_cx: &Context) {}

    /// Returns `true` if this processor needs [`on_start`] notifications.
    ///
    /// Lets callers skip building expensive start inputs when no registered
    /// processor cares.
    ///
    /// [`on_start`]: SpanProcessor::on_start
    fn is_start_required(&self) -> bool {
        false
    }

    /// Called after a span has ended, as one stage of the end pipeline.
    ///
    /// Call `forward` with the (possibly transformed) span to hand it to the
    /// next stage; return without calling it to stop the pipeline for this
    /// span. `forward` must be invoked at most once. This method is called
    /// synchronously within span end, therefore it should not block.
    ///
    /// The default implementation forwards the span unchanged.
    fn on_end_with(&self, span: SpanData, forward: &mut dyn FnMut(SpanData)) {
        forward(span)
    }

    /// Convenience form of [`on_end_with`] for callers that do not consume
    /// the pipeline output.
    ///
    /// [`on_end_with`]: SpanProcessor::on_end_with
    fn on_end(&self, span: SpanData) {
        self.on_end_with(span, &mut |_| {});
    }

    /// Returns `true` if this processor needs [`on_end_with`] notifications.
    ///
    /// [`on_end_with`]: SpanProcessor::on_end_with
    fn is_end_required(&self) -> bool {
        false
    }

    /// Force the spans lying in any internal cache to be processed.
    ///
    /// May be called repeatedly; each call does real work. The returned
    /// handle completes when the flush has finished.
    fn force_flush(&self) -> CompletionHandle {
        CompletionHandle::success()
    }

    /// Shuts down the processor. This is an opportunity for processors to do
    /// any cleanup required.
    ///
    /// Implementations should make sure shutdown can be called multiple
    /// times. The default delegates to [`force_flush`].
    ///
    /// [`force_flush`]: SpanProcessor::force_flush
    fn shutdown(&self) -> CompletionHandle {
        self.force_flush()
    }
}

/// One link of the precomputed end pipeline: takes the current span value and
/// the caller's final sink, threaded through every stage.
type EndStage = Box<dyn Fn(SpanData, &mut dyn FnMut(SpanData)) + Send + Sync>;

fn terminal_stage(span: SpanData, forward: &mut dyn FnMut(SpanData)) {
    forward(span)
}

/// A [`SpanProcessor`] that forwards all received events to an ordered
/// collection of processors.
///
/// The registration list is partitioned once at construction into the
/// processors requiring start notification and those requiring end
/// notification, and the end subset is folded into an immutable continuation
/// chain. Registration is a snapshot: processors cannot be added or removed
/// afterwards, and an empty registration yields a valid no-op dispatcher.
///
/// All views are immutable after construction, so a dispatcher can be shared
/// freely across threads; the shutdown flag is the only mutable state and is
/// updated with an atomic test-and-set so that exactly one caller performs
/// the real teardown.
///
/// `MultiSpanProcessor` implements [`SpanProcessor`] itself, so dispatchers
/// can be registered inside other dispatchers.
///
/// ```
/// use std::sync::Arc;
/// use span_dispatch::{MultiSpanProcessor, SpanProcessor};
///
/// #[derive(Debug)]
/// struct Noop;
/// impl SpanProcessor for Noop {}
///
/// let processors: Vec<Arc<dyn SpanProcessor>> = vec![Arc::new(Noop)];
/// let dispatcher = MultiSpanProcessor::new(processors);
/// assert!(!dispatcher.is_start_required());
/// assert!(dispatcher.shutdown().is_success());
/// ```
pub struct MultiSpanProcessor {
    all: Vec<Arc<dyn SpanProcessor>>,
    start_subset: Vec<Arc<dyn SpanProcessor>>,
    end_subset: Vec<Arc<dyn SpanProcessor>>,
    end_invoker: EndStage,
    is_shutdown: AtomicBool,
}

impl MultiSpanProcessor {
    /// Creates a new `MultiSpanProcessor` over `processors`.
    ///
    /// Capability queries run once here, in registration order, and the end
    /// pipeline is built by folding the end-capable subset from last to
    /// first so that each stage wraps the remainder of the chain.
    pub fn new(processors: Vec<Arc<dyn SpanProcessor>>) -> Self {
        let mut start_subset = Vec::with_capacity(processors.len());
        let mut end_subset = Vec::with_capacity(processors.len());
        for processor in &processors {
            if processor.is_start_required() {
                start_subset.push(Arc::clone(processor));
            }
            if processor.is_end_required() {
                end_subset.push(Arc::clone(processor));
            }
        }

        let mut end_invoker: EndStage = Box::new(terminal_stage);
        for processor in end_subset.iter().rev() {
            let next = end_invoker;
            let stage = Arc::clone(processor);
            end_invoker = Box::new(move |span: SpanData, sink: &mut dyn FnMut(SpanData)| {
                stage.on_end_with(span, &mut |output| next(output, &mut *sink));
            });
        }

        MultiSpanProcessor {
            all: processors,
            start_subset,
            end_subset,
            end_invoker,
            is_shutdown: AtomicBool::new(false),
        }
    }
}

impl SpanProcessor for MultiSpanProcessor {
    fn on_start(&self, span: &SpanData, parent_cx: &Context) {
        for processor in &self.start_subset {
            processor.on_start(span, parent_cx);
        }
    }

    fn is_start_required(&self) -> bool {
        !self.start_subset.is_empty()
    }

    fn on_end_with(&self, span: SpanData, forward: &mut dyn FnMut(SpanData)) {
        (self.end_invoker)(span, forward);
    }

    fn is_end_required(&self) -> bool {
        !self.end_subset.is_empty()
    }

    fn force_flush(&self) -> CompletionHandle {
        let results: Vec<CompletionHandle> = self
            .all
            .iter()
            .map(|processor| processor.force_flush())
            .collect();
        CompletionHandle::all_of(results)
    }

    fn shutdown(&self) -> CompletionHandle {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            otel_debug!(
                name: "MultiSpanProcessor.Shutdown.AlreadyShutdown",
                message = "Shutdown was already requested, nothing to do."
            );
            return CompletionHandle::success();
        }
        otel_debug!(
            name: "MultiSpanProcessor.Shutdown",
            processor_count = self.all.len() as u64
        );
        let results: Vec<CompletionHandle> = self
            .all
            .iter()
            .map(|processor| processor.shutdown())
            .collect();
        let aggregate = CompletionHandle::all_of(results);
        aggregate.on_complete(|outcome| {
            if let Err(error) = outcome {
                otel_warn!(
                    name: "MultiSpanProcessor.Shutdown.Error",
                    reason = format!("{error}")
                );
            }
        });
        aggregate
    }
}

impl fmt::Debug for MultiSpanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSpanProcessor")
            .field("all", &self.all)
            .field("start_subset", &self.start_subset)
            .field("end_subset", &self.end_subset)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{MultiSpanProcessor, SpanProcessor};
    use crate::completion::CompletionHandle;
    use crate::span::SpanData;
    use crate::testing::{new_test_span_data, InMemorySpanProcessor};
    use opentelemetry::{Context, KeyValue};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    /// Appends one attribute to every span flowing through it.
    #[derive(Debug)]
    struct Enricher {
        attribute: KeyValue,
    }

    impl SpanProcessor for Enricher {
        fn is_end_required(&self) -> bool {
            true
        }

        fn on_end_with(&self, mut span: SpanData, forward: &mut dyn FnMut(SpanData)) {
            span.attributes.push(self.attribute.clone());
            forward(span);
        }
    }

    /// Panics in every handler it implements.
    #[derive(Debug)]
    struct Panicker;

    impl SpanProcessor for Panicker {
        fn on_start(&self, _span: &SpanData, _parent_cx: &Context) {
            panic!("start handler failed");
        }

        fn is_start_required(&self) -> bool {
            true
        }

        fn on_end_with(&self, _span: SpanData, _forward: &mut dyn FnMut(SpanData)) {
            panic!("end handler failed");
        }

        fn is_end_required(&self) -> bool {
            true
        }
    }

    /// Never forwards: stops the pipeline for every span.
    #[derive(Debug)]
    struct Veto;

    impl SpanProcessor for Veto {
        fn is_end_required(&self) -> bool {
            true
        }

        fn on_end_with(&self, _span: SpanData, _forward: &mut dyn FnMut(SpanData)) {}
    }

    /// Pushes its name into a shared log on every notification it receives.
    #[derive(Debug)]
    struct OrderLogger {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        start: bool,
        end: bool,
    }

    impl SpanProcessor for OrderLogger {
        fn on_start(&self, _span: &SpanData, _parent_cx: &Context) {
            self.log.lock().unwrap().push(self.name);
        }

        fn is_start_required(&self) -> bool {
            self.start
        }

        fn on_end_with(&self, span: SpanData, forward: &mut dyn FnMut(SpanData)) {
            self.log.lock().unwrap().push(self.name);
            forward(span);
        }

        fn is_end_required(&self) -> bool {
            self.end
        }
    }

    fn dispatcher_over(processors: Vec<Arc<dyn SpanProcessor>>) -> MultiSpanProcessor {
        MultiSpanProcessor::new(processors)
    }

    #[test]
    fn on_start_reaches_only_start_capable_processors_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = OrderLogger {
            name: "a",
            log: Arc::clone(&log),
            start: true,
            end: false,
        };
        let b = OrderLogger {
            name: "b",
            log: Arc::clone(&log),
            start: false,
            end: true,
        };
        let c = OrderLogger {
            name: "c",
            log: Arc::clone(&log),
            start: true,
            end: false,
        };
        let dispatcher = dispatcher_over(vec![Arc::new(a), Arc::new(b), Arc::new(c)]);

        dispatcher.on_start(&new_test_span_data(), &Context::current());

        assert_eq!(*log.lock().unwrap(), vec!["a", "c"]);
        assert!(dispatcher.is_start_required());
    }

    #[test]
    fn start_counts_accumulate_per_call() {
        let recorder = InMemorySpanProcessor::builder().observe_start().build();
        let dispatcher = dispatcher_over(vec![Arc::new(recorder.clone())]);

        let span = new_test_span_data();
        let cx = Context::current();
        dispatcher.on_start(&span, &cx);
        dispatcher.on_start(&span, &cx);
        dispatcher.on_start(&span, &cx);

        assert_eq!(recorder.started_spans().unwrap().len(), 3);
    }

    #[test]
    fn end_pipeline_runs_stages_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let x = OrderLogger {
            name: "x",
            log: Arc::clone(&log),
            start: false,
            end: true,
        };
        let y = OrderLogger {
            name: "y",
            log: Arc::clone(&log),
            start: false,
            end: true,
        };
        let dispatcher = dispatcher_over(vec![Arc::new(x), Arc::new(y)]);

        dispatcher.on_end(new_test_span_data());

        assert_eq!(*log.lock().unwrap(), vec!["x", "y"]);
        assert!(dispatcher.is_end_required());
    }

    #[test]
    fn end_pipeline_hands_transformed_span_to_later_stages() {
        let recorder = InMemorySpanProcessor::builder().observe_end().build();
        let dispatcher = dispatcher_over(vec![
            Arc::new(Enricher {
                attribute: KeyValue::new("k", "v"),
            }),
            Arc::new(recorder.clone()),
        ]);

        let mut final_output = None;
        dispatcher.on_end_with(new_test_span_data(), &mut |span| final_output = Some(span));

        let seen = recorder.ended_spans().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].attributes.contains(&KeyValue::new("k", "v")));

        let output = final_output.expect("pipeline output should reach the caller's sink");
        assert!(output.attributes.contains(&KeyValue::new("k", "v")));
    }

    #[test]
    fn end_pipeline_short_circuits_when_a_stage_does_not_forward() {
        let recorder = InMemorySpanProcessor::builder().observe_end().build();
        let dispatcher = dispatcher_over(vec![Arc::new(Veto), Arc::new(recorder.clone())]);

        let mut sink_called = false;
        dispatcher.on_end_with(new_test_span_data(), &mut |_| sink_called = true);

        assert!(recorder.ended_spans().unwrap().is_empty());
        assert!(!sink_called);
    }

    #[test]
    fn shutdown_invokes_each_processor_at_most_once() {
        let processor = InMemorySpanProcessor::builder().build();
        let dispatcher = dispatcher_over(vec![Arc::new(processor.clone())]);

        let first = dispatcher.shutdown();
        let second = dispatcher.shutdown();
        let third = dispatcher.shutdown();

        assert_eq!(processor.shutdown_count(), 1);
        assert!(first.is_success());
        assert!(second.is_success());
        assert!(third.is_success());
    }

    #[test]
    fn concurrent_shutdown_performs_teardown_exactly_once() {
        let processor = InMemorySpanProcessor::builder().build();
        let dispatcher = Arc::new(dispatcher_over(vec![Arc::new(processor.clone())]));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || dispatcher.shutdown())
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap().is_success());
        }

        assert_eq!(processor.shutdown_count(), 1);
    }

    #[test]
    fn force_flush_does_real_work_every_time() {
        let processor = InMemorySpanProcessor::builder().build();
        let dispatcher = dispatcher_over(vec![Arc::new(processor.clone())]);

        assert!(dispatcher.force_flush().is_success());
        assert!(dispatcher.force_flush().is_success());

        assert_eq!(processor.flush_count(), 2);
    }

    #[test]
    fn force_flush_completes_only_after_all_processors() {
        let slow = InMemorySpanProcessor::builder().manual_lifecycle().build();
        let slower = InMemorySpanProcessor::builder().manual_lifecycle().build();
        let dispatcher = dispatcher_over(vec![Arc::new(slow.clone()), Arc::new(slower.clone())]);

        let aggregate = dispatcher.force_flush();
        assert!(!aggregate.is_complete());

        for handle in slow.lifecycle_handles() {
            handle.succeed();
        }
        assert!(!aggregate.is_complete());

        for handle in slower.lifecycle_handles() {
            handle.succeed();
        }
        assert!(aggregate.is_success());
    }

    #[test]
    fn force_flush_failure_of_one_processor_fails_the_aggregate() {
        let healthy = InMemorySpanProcessor::builder().build();
        let failing = InMemorySpanProcessor::builder().fail_lifecycle().build();
        let dispatcher = dispatcher_over(vec![Arc::new(healthy), Arc::new(failing)]);

        let aggregate = dispatcher.force_flush();
        assert!(aggregate.wait(Duration::from_secs(1)).is_err());
    }

    #[test]
    #[should_panic(expected = "start handler failed")]
    fn panicking_start_handler_propagates_to_the_caller() {
        let recorder = InMemorySpanProcessor::builder().observe_start().build();
        let dispatcher = dispatcher_over(vec![Arc::new(Panicker), Arc::new(recorder)]);

        dispatcher.on_start(&new_test_span_data(), &Context::current());
    }

    #[test]
    fn panicking_start_handler_prevents_later_siblings_from_running() {
        let recorder = InMemorySpanProcessor::builder().observe_start().build();
        let dispatcher = dispatcher_over(vec![Arc::new(Panicker), Arc::new(recorder.clone())]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher.on_start(&new_test_span_data(), &Context::current());
        }));

        assert!(result.is_err());
        assert!(recorder.started_spans().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "end handler failed")]
    fn panicking_end_stage_propagates_to_the_caller() {
        let recorder = InMemorySpanProcessor::builder().observe_end().build();
        let dispatcher = dispatcher_over(vec![Arc::new(Panicker), Arc::new(recorder)]);

        dispatcher.on_end(new_test_span_data());
    }

    #[test]
    fn panicking_end_stage_aborts_the_rest_of_the_pipeline() {
        let recorder = InMemorySpanProcessor::builder().observe_end().build();
        let dispatcher = dispatcher_over(vec![Arc::new(Panicker), Arc::new(recorder.clone())]);

        let mut sink_called = false;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher.on_end_with(new_test_span_data(), &mut |_| sink_called = true);
        }));

        assert!(result.is_err());
        assert!(recorder.ended_spans().unwrap().is_empty());
        assert!(!sink_called);
    }

    #[test]
    fn shutdown_failure_of_one_processor_fails_the_aggregate() {
        let healthy = InMemorySpanProcessor::builder().build();
        let failing = InMemorySpanProcessor::builder().fail_lifecycle().build();
        let dispatcher = dispatcher_over(vec![Arc::new(healthy.clone()), Arc::new(failing)]);

        let aggregate = dispatcher.shutdown();
        assert!(aggregate.wait(Duration::from_secs(1)).is_err());
        assert_eq!(healthy.shutdown_count(), 1);
    }

    #[test]
    fn empty_dispatcher_is_a_noop() {
        let dispatcher = dispatcher_over(Vec::new());

        assert!(!dispatcher.is_start_required());
        assert!(!dispatcher.is_end_required());

        dispatcher.on_start(&new_test_span_data(), &Context::current());
        let mut output = None;
        dispatcher.on_end_with(new_test_span_data(), &mut |span| output = Some(span));
        // With no stages the caller's sink still receives the span.
        assert!(output.is_some());

        assert!(dispatcher.shutdown().is_success());
        assert!(dispatcher.force_flush().is_success());
    }

    #[test]
    fn dispatchers_nest() {
        let recorder = InMemorySpanProcessor::builder().observe_end().build();
        let inner = dispatcher_over(vec![
            Arc::new(Enricher {
                attribute: KeyValue::new("layer", "inner"),
            }),
            Arc::new(recorder.clone()),
        ]);
        let outer = dispatcher_over(vec![Arc::new(inner)]);

        assert!(outer.is_end_required());
        outer.on_end(new_test_span_data());

        let seen = recorder.ended_spans().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].attributes.contains(&KeyValue::new("layer", "inner")));
    }

    #[test]
    fn nested_shutdown_propagates_to_inner_processors() {
        let processor = InMemorySpanProcessor::builder().build();
        let inner = dispatcher_over(vec![Arc::new(processor.clone())]);
        let outer = dispatcher_over(vec![Arc::new(inner)]);

        assert!(outer.shutdown().is_success());
        assert_eq!(processor.shutdown_count(), 1);
    }

    #[test]
    fn default_shutdown_delegates_to_force_flush() {
        #[derive(Debug)]
        struct FlushOnly {
            flushed: Arc<Mutex<usize>>,
        }

        impl SpanProcessor for FlushOnly {
            fn force_flush(&self) -> CompletionHandle {
                *self.flushed.lock().unwrap() += 1;
                CompletionHandle::success()
            }
        }

        let flushed = Arc::new(Mutex::new(0));
        let processor = FlushOnly {
            flushed: Arc::clone(&flushed),
        };
        let dispatcher = dispatcher_over(vec![Arc::new(processor)]);

        assert!(dispatcher.shutdown().is_success());
        assert_eq!(*flushed.lock().unwrap(), 1);
    }
}
