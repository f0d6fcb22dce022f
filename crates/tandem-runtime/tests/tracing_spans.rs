#![forbid(unsafe_code)]

//! Tracing output of commands, locks, history and value cells.
//!
//! Verifies span names, targets, required fields, and that body-related
//! events are emitted inside the `command.request` span.
//!
//! Run:
//!   cargo test -p tandem-runtime --test tracing_spans

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tandem_runtime::undo::CommandSource;
use tandem_runtime::{Command, CommandError, HistoryManager, ResourceLock, UndoableCmd, ValueCell};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;

// ============================================================================
// Test Infrastructure
// ============================================================================

#[derive(Debug, Clone)]
struct CapturedSpan {
    name: String,
    target: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: tracing::Level,
    target: String,
    message: String,
    fields: HashMap<String, String>,
    parent_span_name: Option<String>,
}

struct SpanCapture {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    span_index: Arc<Mutex<HashMap<u64, usize>>>,
}

struct CaptureHandle {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureHandle {
    fn spans_named(&self, name: &str) -> Vec<CapturedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    fn events_for(&self, target: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect()
    }
}

struct FieldVisitor(Vec<(String, String)>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCapture
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        attrs.record(&mut visitor);
        let mut fields: HashMap<String, String> = visitor.0.into_iter().collect();
        for field in attrs.metadata().fields() {
            fields.entry(field.name().to_string()).or_default();
        }

        let mut spans = self.spans.lock().unwrap();
        self.span_index
            .lock()
            .unwrap()
            .insert(id.into_u64(), spans.len());
        spans.push(CapturedSpan {
            name: attrs.metadata().name().to_string(),
            target: attrs.metadata().target().to_string(),
            fields,
        });
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        values.record(&mut visitor);
        let index = self.span_index.lock().unwrap();
        if let Some(&idx) = index.get(&id.into_u64()) {
            if let Some(span) = self.spans.lock().unwrap().get_mut(idx) {
                span.fields.extend(visitor.0);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        let fields: HashMap<String, String> = visitor.0.into_iter().collect();
        let message = fields.get("message").cloned().unwrap_or_default();
        let parent_span_name = ctx
            .current_span()
            .id()
            .and_then(|id| ctx.span(id))
            .map(|span_ref| span_ref.name().to_string());

        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message,
            fields,
            parent_span_name,
        });
    }
}

/// Run `f` to completion on a current-thread runtime with capture installed.
fn capture<F, Fut>(f: F) -> CaptureHandle
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let spans = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let layer = SpanCapture {
        spans: Arc::clone(&spans),
        events: Arc::clone(&events),
        span_index: Arc::new(Mutex::new(HashMap::new())),
    };
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::TRACE)
        .with(layer);

    tracing::subscriber::with_default(subscriber, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(f());
    });
    CaptureHandle { spans, events }
}

fn noop_command(description: &str, lock: &ResourceLock) -> Command {
    Command::from_fns(|| async { Ok(()) }, || async { Ok(()) })
        .with_description(description)
        .with_dependencies([lock.clone()])
}

// ============================================================================
// Command spans
// ============================================================================

#[test]
fn command_request_span_carries_required_fields() {
    let handle = capture(|| async {
        let command = noop_command("rename", &ResourceLock::new("doc"));
        command.execute().await.unwrap();
        command.revert().await.unwrap();
    });

    let spans = handle.spans_named("command.request");
    assert_eq!(spans.len(), 2);
    for span in &spans {
        assert_eq!(span.target, "tandem.command");
        assert_eq!(span.fields.get("description").map(String::as_str), Some("rename"));
        assert!(span.fields.contains_key("state"));
    }
    assert_eq!(spans[0].fields["source"], "user");
    assert_eq!(spans[0].fields["request"], "execute");
    assert_eq!(spans[0].fields["state"], "ready");
    assert_eq!(spans[1].fields["request"], "revert");
    assert_eq!(spans[1].fields["state"], "executed");
}

#[test]
fn command_source_is_reported() {
    let handle = capture(|| async {
        let lock = ResourceLock::new("doc");
        let history = HistoryManager::default();
        let command = noop_command("replay", &lock).with_source(CommandSource::Macro);
        history.execute(Arc::new(command), false).await.unwrap();
    });

    let spans = handle.spans_named("command.request");
    assert_eq!(spans[0].fields["source"], "macro");
    let execute = handle
        .events_for("tandem.history")
        .into_iter()
        .find(|e| e.message == "execute")
        .expect("history execute event");
    assert_eq!(execute.fields["source"], "macro");
}

#[test]
fn redundant_request_is_logged_inside_its_span() {
    let handle = capture(|| async {
        let command = noop_command("noop", &ResourceLock::new("doc"));
        command.revert().await.unwrap();
    });

    let events = handle.events_for("tandem.command");
    let redundant = events
        .iter()
        .find(|e| e.fields.get("redundant").map(String::as_str) == Some("true"))
        .expect("redundant event");
    assert_eq!(redundant.level, tracing::Level::DEBUG);
    assert_eq!(redundant.parent_span_name.as_deref(), Some("command.request"));
}

#[test]
fn body_failure_is_a_warning() {
    let handle = capture(|| async {
        let command = Command::from_fns(
            || async { Err(CommandError::body("disk full")) },
            || async { Ok(()) },
        )
        .with_dependencies([ResourceLock::new("doc")]);
        assert!(command.execute().await.is_err());
    });

    let warnings: Vec<CapturedEvent> = handle
        .events_for("tandem.command")
        .into_iter()
        .filter(|e| e.level == tracing::Level::WARN)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].fields["error"].contains("disk full"));
    assert_eq!(warnings[0].parent_span_name.as_deref(), Some("command.request"));
}

// ============================================================================
// Lock, history and cell output
// ============================================================================

#[test]
fn lock_queueing_is_traced() {
    let handle = capture(|| async {
        let lock = ResourceLock::new("traced");
        let held = lock.acquire().await;
        let queued = lock.acquire();
        drop(held);
        drop(queued.await);
    });

    let messages: Vec<String> = handle
        .events_for("tandem.lock")
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(messages.iter().any(|m| m == "queued"));
    assert!(messages.iter().any(|m| m == "released"));
}

#[test]
fn history_operations_are_traced() {
    let handle = capture(|| async {
        let lock = ResourceLock::new("doc");
        let history = HistoryManager::default();
        history
            .execute(Arc::new(noop_command("a", &lock)), true)
            .await
            .unwrap();
        history.split_batch();
        history.undo().unwrap().await.unwrap();
        history.redo().unwrap().await.unwrap();
    });

    let messages: Vec<String> = handle
        .events_for("tandem.history")
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, vec!["execute", "split batch", "undo", "redo"]);
}

#[test]
fn cell_notify_span_records_duration() {
    let handle = capture(|| async {
        let cell = ValueCell::new(0u32);
        let _a = cell.subscribe(|_| {});
        let _b = cell.subscribe(|_| {});
        cell.set(1);
    });

    let spans = handle.spans_named("cell.notify");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].fields["subscribers"], "2");
    assert!(!spans[0].fields["duration_us"].is_empty());
}

#[test]
fn panicking_subscriber_is_logged() {
    let handle = capture(|| async {
        let cell = ValueCell::new(0u32);
        let _sub = cell.subscribe(|_| panic!("observer failure"));
        cell.set(1);
        assert_eq!(cell.get(), 1);
    });

    let warnings = handle.events_for("tandem.cell");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].level, tracing::Level::WARN);
    assert_eq!(warnings[0].message, "subscriber panicked");
    assert_eq!(warnings[0].fields["panic"], "observer failure");
    assert_eq!(warnings[0].parent_span_name.as_deref(), Some("cell.notify"));
}
