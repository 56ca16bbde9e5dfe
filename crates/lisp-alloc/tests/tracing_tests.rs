//! Integration tests for the tracing feature.
//!
//! A recording layer captures the spans and events a collection emits.

#![cfg(feature = "tracing")]

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use lisp_alloc::{Heap, HeapConfig, NIL};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, Registry};

#[derive(Clone, Default)]
struct Recorder {
    spans: Arc<Mutex<Vec<(String, String)>>>,
    events: Arc<Mutex<Vec<String>>>,
}

/// Picks one named field out of a span or event.
struct FieldText {
    name: &'static str,
    text: String,
}

impl Visit for FieldText {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == self.name {
            self.text = format!("{value:?}");
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == self.name {
            self.text = value.to_string();
        }
    }
}

impl<S> Layer<S> for Recorder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let name = attrs.metadata().name();
        let mut field = FieldText {
            name: if name == "gc_phase" { "phase" } else { "gc_id" },
            text: String::new(),
        };
        attrs.record(&mut field);
        self.spans.lock().unwrap().push((name.to_owned(), field.text));
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut field = FieldText {
            name: "message",
            text: String::new(),
        };
        event.record(&mut field);
        self.events.lock().unwrap().push(field.text);
    }
}

fn record(f: impl FnOnce()) -> Recorder {
    let recorder = Recorder::default();
    let subscriber = Registry::default().with(recorder.clone());
    tracing::subscriber::with_default(subscriber, f);
    recorder
}

#[test]
fn test_collection_emits_spans_per_phase() {
    let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
    heap.allocate_pair(NIL, NIL);
    let mut gc_id = 0;
    let recorder = record(|| gc_id = heap.collect_garbage().gc_id);

    let spans = recorder.spans.lock().unwrap();
    assert!(spans.contains(&("gc_collect".to_owned(), gc_id.to_string())));
    let phases: Vec<&str> = spans
        .iter()
        .filter(|(name, _)| name == "gc_phase")
        .map(|(_, phase)| phase.as_str())
        .collect();
    assert_eq!(phases, ["Mark", "Weak", "Weak", "Sweep"]);
}

#[test]
fn test_collection_logs_completion() {
    let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
    let recorder = record(|| {
        heap.collect_garbage();
    });
    let events = recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "phase_start"));
    assert!(events.iter().any(|e| e == "phase_end"));
    assert_eq!(events.iter().filter(|e| *e == "gc_complete").count(), 1);
}

#[test]
fn test_new_blocks_are_logged() {
    let recorder = record(|| {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
        for _ in 0..10 {
            heap.allocate_pair(NIL, NIL);
        }
        heap.make_string("logged").unwrap();
    });
    let events = recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "heap initialized"));
    assert!(events.iter().any(|e| e == "new cell block"));
    assert!(events.iter().any(|e| e == "new sblock"));
    assert!(events.iter().any(|e| e == "heap dropped"));
}

#[test]
fn test_pure_overflow_warns() {
    let recorder = record(|| {
        let mut heap = Heap::new(HeapConfig::new().scan_stack(false).pure_size(4096));
        for i in 0..200 {
            heap.make_pure_string(format!("pure-{i}").as_bytes(), false).unwrap();
        }
    });
    let events = recorder.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| e == "pure space overflow; further pure objects go to the heap"));
}

/// Fails the collection as soon as its sweep phase opens, after every mark
/// is set.
struct FailAtSweep;

impl<S> Layer<S> for FailAtSweep
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut field = FieldText {
            name: "phase",
            text: String::new(),
        };
        attrs.record(&mut field);
        if attrs.metadata().name() == "gc_phase" && field.text == "Sweep" {
            panic!("sweep refused");
        }
    }
}

#[test]
fn test_unwound_collection_leaves_the_heap_usable() {
    let mut heap = Heap::new(HeapConfig::new().scan_stack(false));
    heap.collect_garbage();
    let baseline = heap.stats().pairs.in_use;
    let kept = heap.list(&[NIL, NIL, NIL]);
    heap.protect(kept);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let subscriber = Registry::default().with(FailAtSweep);
        tracing::subscriber::with_default(subscriber, || heap.collect_garbage())
    }));
    assert!(result.is_err());
    assert_eq!(heap.gcs_done(), 1);

    // Marks from the abandoned run must not keep the list alive.
    assert!(heap.unprotect(kept));
    let metrics = heap.collect_garbage();
    assert_eq!(metrics.heap.pairs.in_use, baseline);
    assert_eq!(heap.gcs_done(), 2);
}
