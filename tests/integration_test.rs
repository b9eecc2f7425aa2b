//! Integration tests for Enliven
//!
//! These tests drive a full runtime against the in-memory host, the way an
//! embedding page would: markup first, then mutations while observing.

use enliven::host::MemoryDocument;
use enliven::prelude::*;
use enliven::DispatchReport;
use futures::future::FutureExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

// =============================================================================
// Test Enhancers
// =============================================================================

type Log = Arc<Mutex<Vec<String>>>;

/// Records its lifecycle in a shared log.
///
/// Element attributes steer it: `data-gated` makes `initialize()` wait on the
/// harness gate, `data-fail`/`data-panic` make it fail, `data-reject-updates`
/// makes `update()` fail.
#[derive(Debug)]
struct Recorder {
    label: String,
    log: Log,
    gate: Option<Arc<Notify>>,
    reject_updates: bool,
    value: Mutex<Option<String>>,
    updates: AtomicUsize,
    refreshes: AtomicUsize,
}

impl Recorder {
    fn new(ctx: &EnhancerContext, log: Log, gate: Option<Arc<Notify>>) -> Self {
        Self {
            label: label(ctx.tag(), ctx.element()),
            log,
            gate: gate.filter(|_| ctx.attribute("data-gated").is_some()),
            reject_updates: ctx.attribute("data-reject-updates").is_some(),
            value: Mutex::new(None),
            updates: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Enhancer for Recorder {
    fn name(&self) -> &str {
        &self.label
    }

    async fn initialize(&self, ctx: &EnhancerContext) -> EnhancerResult<()> {
        self.log.lock().push(format!("init {}", self.label));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if ctx.attribute("data-panic").is_some() {
            panic!("render exploded");
        }
        if ctx.attribute("data-fail").is_some() {
            return Err(EnhancerError::Unavailable("pricing backend".to_string()));
        }
        *self.value.lock() = ctx.attribute("data-next-display");
        Ok(())
    }

    async fn update(&self, _topic: &str) -> EnhancerResult<()> {
        if self.reject_updates {
            return Err("stale cart".into());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&self) -> EnhancerResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) {
        self.log.lock().push(format!("destroy {}", self.label));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn label(tag: CapabilityTag, element: ElementId) -> String {
    format!("{tag}@{element}")
}

fn recorder(name: &str, tag: CapabilityTag, log: &Log, gate: Option<Arc<Notify>>) -> FnFactory {
    let log = log.clone();
    FnFactory::new(name, tag, move |ctx| {
        Ok(Arc::new(Recorder::new(ctx, log.clone(), gate.clone())) as Arc<dyn Enhancer>)
    })
}

// =============================================================================
// Harness
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime_with(
    doc: &Arc<MemoryDocument>,
    log: &Log,
    gate: Option<Arc<Notify>>,
    config: RuntimeConfig,
) -> EnhancementRuntime {
    init_tracing();
    EnhancementRuntime::builder(doc.clone())
        .config(config)
        .factory(recorder("display", CapabilityTag::Display, log, gate.clone()))
        .factory(recorder("conditional", CapabilityTag::Conditional, log, gate.clone()))
        .factory(
            recorder("cart-action", CapabilityTag::Action, log, gate.clone())
                .for_discriminators(["add-to-cart", "checkout", "clear-cart"]),
        )
        .factory(recorder("selector", CapabilityTag::Selector, log, gate.clone()))
        .factory(recorder("quantity", CapabilityTag::QuantityControl, log, gate))
        .build()
        .unwrap()
}

fn runtime(doc: &Arc<MemoryDocument>, log: &Log, gate: Option<Arc<Notify>>) -> EnhancementRuntime {
    runtime_with(doc, log, gate, RuntimeConfig::default())
}

/// Let every debounce window elapse and every spawned bind finish.
async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

/// Long enough for immediate work, shorter than one debounce window.
async fn tick() {
    sleep(Duration::from_millis(1)).await;
}

fn drain(events: &mut EventStream<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut out = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        out.push(event);
    }
    out
}

fn count(log: &Log, entry: &str) -> usize {
    log.lock().iter().filter(|e| *e == entry).count()
}

fn recorded_value(rt: &EnhancementRuntime, element: ElementId) -> Option<String> {
    rt.enhancers(element)
        .first()
        .and_then(|e| e.downcast_ref::<Recorder>().map(|p| p.value.lock().clone()))
        .flatten()
}

// =============================================================================
// Initial Sweep Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_sweep_binds_in_document_order() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let total = doc
        .append_element(root, "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let buy = doc
        .append_element(
            root,
            "button",
            &[("data-next-action", "Checkout"), ("data-next-display", "cart.count")],
        )
        .unwrap();
    let picker = doc
        .append_element(root, "div", &[("data-next-selector", "bundle")])
        .unwrap();

    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();
    let report = rt.start().await.unwrap();
    rt.ready().await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.bound, 3);
    assert_eq!(
        *log.lock(),
        vec![
            format!("init {}", label(CapabilityTag::Display, total)),
            format!("init {}", label(CapabilityTag::Display, buy)),
            format!("init {}", label(CapabilityTag::Action, buy)),
            format!("init {}", label(CapabilityTag::Selector, picker)),
        ]
    );

    let snapshot = rt.bindings();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[1].tags, vec![CapabilityTag::Display, CapabilityTag::Action]);

    let stats = rt.stats();
    assert_eq!(stats.state, RuntimeState::Observing);
    assert_eq!(stats.bound, 3);
    assert!(stats.observer_active);
    assert!(!stats.degraded);

    let seen = drain(&mut events);
    let ready: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Ready { bound } => Some(*bound),
            _ => None,
        })
        .collect();
    assert_eq!(ready, vec![3]);
    assert_eq!(
        seen.iter().filter(|e| matches!(e, RuntimeEvent::Bound { .. })).count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweep_yields_between_batches() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    for i in 0..60 {
        doc.append_element(doc.root(), "span", &[("data-next-display", &format!("item.{i}"))])
            .unwrap();
    }
    let rt = runtime_with(&doc, &log, None, RuntimeConfig::new().with_batch_size(10));

    let observed = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let rt = rt.clone();
        let observed = observed.clone();
        tokio::spawn(async move {
            // Runs only if the sweep hands control back mid-way.
            if rt.stats().sweeping {
                observed.store(rt.stats().bound, Ordering::SeqCst);
            }
        })
    };

    let report = rt.start().await.unwrap();
    watcher.await.unwrap();

    assert_eq!(report.bound, 60);
    let mid_sweep = observed.load(Ordering::SeqCst);
    assert!(mid_sweep > 0 && mid_sweep < 60, "watcher saw {mid_sweep} bindings");
}

#[tokio::test(start_paused = true)]
async fn test_rescan_never_double_binds() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();

    rt.start().await.unwrap();
    let again = rt.scan().await.unwrap();
    let third = rt.scan().await.unwrap();

    assert_eq!(again.bound, 0);
    assert_eq!(again.skipped, 1);
    assert_eq!(third.bound, 0);
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, el))), 1);
    assert_eq!(rt.stats().bound, 1);

    let ready = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::Ready { .. }))
        .count();
    assert_eq!(ready, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_scan_is_coalesced() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let gate = Arc::new(Notify::new());
    let slow = doc
        .append_element(
            doc.root(),
            "span",
            &[("data-next-display", "cart.total"), ("data-gated", "")],
        )
        .unwrap();
    let rt = runtime(&doc, &log, Some(gate.clone()));

    let first = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.scan().await })
    };
    tick().await;
    assert_eq!(rt.state(), RuntimeState::Scanning);

    let second = rt.scan().await.unwrap();
    assert!(second.coalesced);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(!first.coalesced);
    assert_eq!(first.bound, 1);
    assert_eq!(first.scanned, 2);
    assert!(rt.is_bound(slow));
    assert_eq!(rt.state(), RuntimeState::Idle);
}

// =============================================================================
// Classification & Resolution Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_tag_is_skipped_not_fatal() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let offer = doc
        .append_element(
            doc.root(),
            "div",
            &[("data-next-toggle", "upsell"), ("data-next-display", "offer.title")],
        )
        .unwrap();
    let odd = doc
        .append_element(doc.root(), "button", &[("data-next-action", "teleport")])
        .unwrap();

    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();
    rt.start().await.unwrap();

    assert!(rt.is_bound(offer));
    assert!(!rt.is_bound(odd));
    assert_eq!(rt.bindings()[0].tags, vec![CapabilityTag::Display]);

    let unresolved: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::ResolutionFailed { element, tag, error } => Some((element, tag, error)),
            _ => None,
        })
        .collect();
    assert_eq!(unresolved.len(), 2);
    assert_eq!(unresolved[0].0, offer);
    assert_eq!(unresolved[0].1, CapabilityTag::Toggle);
    assert!(matches!(unresolved[0].2, ResolutionError::Unresolved { .. }));
    assert_eq!(unresolved[1].0, odd);
    assert_eq!(unresolved[1].1, CapabilityTag::Action);
}

#[tokio::test(start_paused = true)]
async fn test_contradictory_markers_leave_element_unbound() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(
            doc.root(),
            "div",
            &[("data-next-show", "cart.empty"), ("data-next-hide", "cart.empty")],
        )
        .unwrap();
    let fine = doc
        .append_element(doc.root(), "div", &[("data-next-show", "cart.full")])
        .unwrap();

    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();
    let report = rt.start().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(!rt.is_bound(el));
    assert!(rt.is_bound(fine));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        RuntimeEvent::ClassificationFailed(ClassificationError::Contradictory { element, .. }) if *element == el
    )));
}

#[tokio::test(start_paused = true)]
async fn test_template_render_binds_rows_not_templates() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let template = doc
        .append_element(root, "div", &[("data-next-template", "cart-item")])
        .unwrap();
    doc.append_element(template, "button", &[("data-next-quantity", "increase")])
        .unwrap();
    doc.append_element(template, "span", &[("data-next-display", "{item.name}")])
        .unwrap();
    let list = doc.append_element(root, "ul", &[]).unwrap();

    let rt = runtime(&doc, &log, None);
    let report = rt.start().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.bound, 0);

    let (qty, name) = doc.batch(|d| {
        let row = d.append_element(list, "li", &[]).unwrap();
        let qty = d
            .append_element(row, "button", &[("data-next-quantity", "increase")])
            .unwrap();
        let name = d
            .append_element(row, "span", &[("data-next-display", "item.name")])
            .unwrap();
        (qty, name)
    });

    tick().await;
    assert!(!rt.is_bound(qty));
    assert_eq!(rt.stats().queued, 2);

    settle().await;
    assert!(rt.is_bound(qty));
    assert!(rt.is_bound(name));
    assert_eq!(rt.stats().bound, 2);
    assert_eq!(
        *log.lock(),
        vec![
            format!("init {}", label(CapabilityTag::QuantityControl, qty)),
            format!("init {}", label(CapabilityTag::Display, name)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_templates_inserted_while_observing_stay_unbound() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let existing = doc
        .append_element(root, "div", &[("data-next-template", "cart-item")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    let (qty, name) = doc.batch(|d| {
        let upsell = d.create_element("div");
        d.set_attribute(upsell, "data-next-template", "upsell").unwrap();
        let qty = d
            .append_element(upsell, "button", &[("data-next-quantity", "increase")])
            .unwrap();
        let name = d
            .append_element(upsell, "span", &[("data-next-display", "item.name")])
            .unwrap();
        d.append_child(root, upsell).unwrap();
        (qty, name)
    });
    let late = doc
        .append_element(existing, "button", &[("data-next-action", "add-to-cart")])
        .unwrap();
    let row = doc
        .append_element(root, "span", &[("data-next-display", "cart.total")])
        .unwrap();
    settle().await;

    assert!(!rt.is_bound(qty));
    assert!(!rt.is_bound(name));
    assert!(!rt.is_bound(late));
    assert!(rt.is_bound(row));
    assert_eq!(rt.stats().bound, 1);
    assert_eq!(*log.lock(), vec![format!("init {}", label(CapabilityTag::Display, row))]);
}

#[tokio::test(start_paused = true)]
async fn test_template_marker_toggle_rebinds_descendants() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let container = doc.append_element(doc.root(), "div", &[]).unwrap();
    let item = doc
        .append_element(container, "span", &[("data-next-display", "item.name")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();
    assert!(rt.is_bound(item));

    let entry = label(CapabilityTag::Display, item);
    doc.set_attribute(container, "data-next-template", "cart-item").unwrap();
    settle().await;
    assert!(!rt.is_bound(item));
    assert_eq!(*log.lock(), vec![format!("init {entry}"), format!("destroy {entry}")]);

    let report = rt.scan().await.unwrap();
    assert_eq!(report.bound, 0);
    assert!(!rt.is_bound(item));

    assert!(doc.remove_attribute(container, "data-next-template").unwrap());
    settle().await;
    assert!(rt.is_bound(item));
    assert_eq!(count(&log, &format!("init {entry}")), 2);
    assert_eq!(rt.stats().bound, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_prunes_bindings_inside_new_template() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let container = doc.append_element(doc.root(), "div", &[]).unwrap();
    let item = doc
        .append_element(container, "span", &[("data-next-display", "item.name")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    rt.pause().unwrap();
    doc.set_attribute(container, "data-next-template", "cart-item").unwrap();
    let report = rt.resume().await.unwrap();

    assert_eq!(report.pruned, 1);
    assert_eq!(report.bound, 0);
    assert!(!rt.is_bound(item));
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, item))), 1);
}

// =============================================================================
// Error Isolation Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_enhancers_are_isolated() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let ok_a = doc
        .append_element(root, "span", &[("data-next-display", "a")])
        .unwrap();
    let failing = doc
        .append_element(root, "span", &[("data-next-display", "b"), ("data-fail", "")])
        .unwrap();
    let ok_b = doc
        .append_element(root, "span", &[("data-next-display", "c")])
        .unwrap();
    let panicking = doc
        .append_element(root, "span", &[("data-next-display", "d"), ("data-panic", "")])
        .unwrap();
    let mixed = doc
        .append_element(
            root,
            "button",
            &[("data-next-action", "add-to-cart"), ("data-next-selector", "bundle")],
        )
        .unwrap();

    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();
    let report = rt.start().await.unwrap();

    assert_eq!(report.bound, 3);
    assert!(rt.is_bound(ok_a));
    assert!(rt.is_bound(ok_b));
    assert!(rt.is_bound(mixed));
    assert!(!rt.is_bound(failing));
    assert!(!rt.is_bound(panicking));

    // Attempted initializations are destroyed even when they failed.
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, failing))), 1);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, panicking))), 1);

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::InitializationFailed(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(matches!(failures[0], InitializationError::Failed { element, .. } if element == failing));
    assert!(matches!(failures[1], InitializationError::Panicked { element, .. } if element == panicking));
}

// =============================================================================
// Steady-State Reactivity Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_removed_subtree_is_unbound_immediately() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let panel = doc.append_element(doc.root(), "section", &[]).unwrap();
    let a = doc
        .append_element(panel, "span", &[("data-next-display", "a")])
        .unwrap();
    let b = doc
        .append_element(panel, "div", &[("data-next-selector", "size")])
        .unwrap();
    let keep = doc
        .append_element(doc.root(), "span", &[("data-next-display", "keep")])
        .unwrap();

    let rt = runtime(&doc, &log, None);
    let mut events = rt.subscribe();
    rt.start().await.unwrap();
    drain(&mut events);

    doc.remove(panel).unwrap();
    tick().await;

    assert!(!rt.is_bound(a));
    assert!(!rt.is_bound(b));
    assert!(rt.is_bound(keep));
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, a))), 1);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Selector, b))), 1);

    let unbound: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::Unbound { element } => Some(element),
            _ => None,
        })
        .collect();
    assert_eq!(unbound, vec![a, b]);
}

#[tokio::test(start_paused = true)]
async fn test_discarded_subtree_is_unbound() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let panel = doc.append_element(doc.root(), "section", &[]).unwrap();
    let a = doc
        .append_element(panel, "span", &[("data-next-display", "a")])
        .unwrap();

    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    doc.remove(panel).unwrap();
    doc.discard(panel).unwrap();
    tick().await;

    assert_eq!(rt.stats().bound, 0);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, a))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attribute_burst_rebinds_once() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "v0")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    for i in 1..=50 {
        doc.set_attribute(el, "data-next-display", &format!("v{i}")).unwrap();
    }
    settle().await;

    let entry = label(CapabilityTag::Display, el);
    assert_eq!(
        *log.lock(),
        vec![
            format!("init {entry}"),
            format!("destroy {entry}"),
            format!("init {entry}"),
        ]
    );
    assert_eq!(recorded_value(&rt, el).as_deref(), Some("v50"));
}

#[tokio::test(start_paused = true)]
async fn test_untracked_attribute_is_ignored() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    doc.set_attribute(el, "class", "highlight").unwrap();
    settle().await;
    assert_eq!(log.lock().len(), 1);

    let tracked = runtime_with(
        &doc,
        &log,
        None,
        RuntimeConfig::new().track_attribute("data-next-package-id"),
    );
    rt.destroy();
    log.lock().clear();
    tracked.start().await.unwrap();
    doc.set_attribute(el, "data-next-package-id", "42").unwrap();
    settle().await;
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, el))), 2);
}

#[tokio::test(start_paused = true)]
async fn test_marker_removed_unbinds_element() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    assert!(doc.remove_attribute(el, "data-next-display").unwrap());
    settle().await;

    assert!(!rt.is_bound(el));
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, el))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_detached_element_with_stripped_marker_is_unbound() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    // Same tick: the removal is processed after the marker is already gone.
    doc.remove(el).unwrap();
    doc.remove_attribute(el, "data-next-display").unwrap();
    settle().await;

    let entry = label(CapabilityTag::Display, el);
    assert!(!rt.is_bound(el));
    assert_eq!(*log.lock(), vec![format!("init {entry}"), format!("destroy {entry}")]);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_precedes_create_in_one_window() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let old = doc
        .append_element(root, "span", &[("data-next-display", "old")])
        .unwrap();
    let tail = doc.append_element(root, "p", &[]).unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    let fresh = doc.batch(|d| {
        d.remove(old).unwrap();
        let fresh = d
            .append_element(root, "span", &[("data-next-display", "new")])
            .unwrap();
        d.insert_before(root, fresh, Some(tail)).unwrap();
        fresh
    });
    settle().await;

    assert_eq!(
        *log.lock(),
        vec![
            format!("init {}", label(CapabilityTag::Display, old)),
            format!("destroy {}", label(CapabilityTag::Display, old)),
            format!("init {}", label(CapabilityTag::Display, fresh)),
        ]
    );
    assert!(rt.is_bound(fresh));
    assert!(!rt.is_bound(old));
}

#[tokio::test(start_paused = true)]
async fn test_moved_element_is_rebound() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let el = doc
        .append_element(root, "span", &[("data-next-display", "cart.total")])
        .unwrap();
    let aside = doc.append_element(root, "aside", &[]).unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    doc.append_child(aside, el).unwrap();
    settle().await;

    let entry = label(CapabilityTag::Display, el);
    assert_eq!(
        *log.lock(),
        vec![format!("init {entry}"), format!("destroy {entry}"), format!("init {entry}")]
    );
    assert!(rt.is_bound(el));
}

#[tokio::test(start_paused = true)]
async fn test_removal_during_initialization_discards_enhancer() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let gate = Arc::new(Notify::new());
    let rt = runtime(&doc, &log, Some(gate.clone()));
    rt.start().await.unwrap();

    let el = doc
        .append_element(
            doc.root(),
            "span",
            &[("data-next-display", "cart.total"), ("data-gated", "")],
        )
        .unwrap();
    settle().await;
    assert!(rt.is_binding(el));

    doc.remove(el).unwrap();
    tick().await;
    assert!(!rt.is_binding(el));
    assert_eq!(rt.stats().pending_binds, 0);

    gate.notify_one();
    settle().await;

    let entry = label(CapabilityTag::Display, el);
    assert!(!rt.is_bound(el));
    assert_eq!(*log.lock(), vec![format!("init {entry}"), format!("destroy {entry}")]);
}

// =============================================================================
// Pause / Resume / Observer Failure Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume_reconciles_bulk_changes() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let a = doc
        .append_element(root, "span", &[("data-next-display", "a")])
        .unwrap();
    let b = doc
        .append_element(root, "span", &[("data-next-display", "b")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    rt.pause().unwrap();
    assert!(rt.stats().observer_paused);

    doc.remove(b).unwrap();
    doc.set_attribute(a, "data-next-display", "a2").unwrap();
    let c = doc
        .append_element(root, "span", &[("data-next-display", "c")])
        .unwrap();
    settle().await;

    assert!(rt.is_bound(b));
    assert!(!rt.is_bound(c));

    let report = rt.resume().await.unwrap();
    assert_eq!(report.pruned, 2);
    assert_eq!(report.bound, 2);
    assert!(rt.stats().observer_active);
    settle().await;

    assert!(!rt.is_bound(b));
    assert!(rt.is_bound(a));
    assert!(rt.is_bound(c));
    assert_eq!(recorded_value(&rt, a).as_deref(), Some("a2"));
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, a))), 2);
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, c))), 1);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, b))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_keeps_changes_queued_before_it() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    let el = doc
        .append_element(doc.root(), "span", &[("data-next-display", "a")])
        .unwrap();
    tick().await;
    rt.pause().unwrap();
    assert_eq!(rt.stats().queued, 1);

    settle().await;
    assert!(!rt.is_bound(el));

    rt.resume().await.unwrap();
    settle().await;
    assert!(rt.is_bound(el));
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, el))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_observer_start_failure_then_retry() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let section = doc.create_element("section");
    let inside = doc
        .append_element(section, "span", &[("data-next-display", "cart.total")])
        .unwrap();

    let rt = runtime_with(&doc, &log, None, RuntimeConfig::new().with_root(section));
    let mut events = rt.subscribe();
    let err = rt.start().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ObserverStart(ObserverStartError::Detached(root)) if root == section
    ));

    let stats = rt.stats();
    assert!(stats.degraded);
    assert!(!stats.observer_active);
    assert_eq!(stats.state, RuntimeState::Observing);
    assert!(!rt.is_bound(inside));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ObserverStartFailed(_))));

    doc.append_child(doc.root(), section).unwrap();
    let report = rt.retry_observer().await.unwrap();
    assert_eq!(report.bound, 1);
    assert!(rt.is_bound(inside));

    let stats = rt.stats();
    assert!(stats.observer_active);
    assert!(!stats.degraded);

    let later = doc
        .append_element(section, "div", &[("data-next-selector", "size")])
        .unwrap();
    settle().await;
    assert!(rt.is_bound(later));
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_destroy_is_total() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let gate = Arc::new(Notify::new());
    let bound = doc
        .append_element(doc.root(), "span", &[("data-next-display", "a")])
        .unwrap();
    let rt = runtime(&doc, &log, Some(gate.clone()));
    let mut events = rt.subscribe();
    rt.start().await.unwrap();

    let slow = doc
        .append_element(
            doc.root(),
            "span",
            &[("data-next-display", "b"), ("data-gated", "")],
        )
        .unwrap();
    let queued = doc
        .append_element(doc.root(), "span", &[("data-next-display", "c")])
        .unwrap();
    settle().await;
    assert_eq!(rt.stats().pending_binds, 1);

    doc.set_attribute(bound, "data-next-display", "a2").unwrap();
    tick().await;

    rt.destroy();
    rt.destroy();
    assert_eq!(rt.state(), RuntimeState::Destroyed);
    assert_eq!(rt.stats().bound, 0);
    assert_eq!(rt.stats().queued, 0);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, bound))), 1);

    gate.notify_one();
    settle().await;

    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, slow))), 1);
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, queued))), 0);
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, bound))), 1);
    assert_eq!(rt.stats().pending_binds, 0);
    assert_eq!(doc.subscriber_count(), 0);

    let destroyed = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::Destroyed))
        .count();
    assert_eq!(destroyed, 1);
    assert!(matches!(rt.scan().await, Err(RuntimeError::Destroyed)));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_tears_down() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let a = doc
        .append_element(doc.root(), "span", &[("data-next-display", "a")])
        .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    let handle = rt.clone();
    drop(rt);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, a))), 0);

    drop(handle);
    tick().await;
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, a))), 1);
    assert_eq!(doc.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_aborts_hung_initialization() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let gate = Arc::new(Notify::new());
    let bound = doc
        .append_element(doc.root(), "span", &[("data-next-display", "a")])
        .unwrap();
    let rt = runtime(&doc, &log, Some(gate));
    rt.start().await.unwrap();

    let hung = doc
        .append_element(
            doc.root(),
            "span",
            &[("data-next-display", "b"), ("data-gated", "")],
        )
        .unwrap();
    settle().await;
    assert!(rt.is_binding(hung));
    assert_eq!(doc.subscriber_count(), 1);

    drop(rt);
    settle().await;

    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, bound))), 1);
    assert_eq!(count(&log, &format!("init {}", label(CapabilityTag::Display, hung))), 1);
    assert_eq!(count(&log, &format!("destroy {}", label(CapabilityTag::Display, hung))), 1);
    assert_eq!(doc.subscriber_count(), 0);
}

// =============================================================================
// External Producer & Factory Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_notify_and_refresh_reach_bound_enhancers() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let root = doc.root();
    let total = doc
        .append_element(root, "span", &[("data-next-display", "cart.total")])
        .unwrap();
    doc.append_element(root, "button", &[("data-next-action", "clear-cart")])
        .unwrap();
    doc.append_element(
        root,
        "span",
        &[("data-next-display", "cart.count"), ("data-reject-updates", "")],
    )
    .unwrap();
    let rt = runtime(&doc, &log, None);
    rt.start().await.unwrap();

    let report = rt.notify("cart").await;
    assert_eq!(report, DispatchReport { delivered: 2, failed: 1 });

    let report = rt.refresh(total).await;
    assert_eq!(report.delivered, 1);

    let enhancers = rt.enhancers(total);
    let recorder = enhancers[0].downcast_ref::<Recorder>().unwrap();
    assert_eq!(recorder.updates.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.refreshes.load(Ordering::SeqCst), 1);

    rt.destroy();
    assert_eq!(rt.notify("cart").await, DispatchReport::default());
}

#[tokio::test(start_paused = true)]
async fn test_lazy_factory_loads_once_on_demand() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let loads = Arc::new(AtomicUsize::new(0));
    doc.append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
        .unwrap();

    let lazy = {
        let loads = loads.clone();
        let log = log.clone();
        LazyFactory::new("checkout", CapabilityTag::Action, move || {
            let loads = loads.clone();
            let log = log.clone();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(
                    Arc::new(recorder("checkout-impl", CapabilityTag::Action, &log, None)) as Arc<dyn EnhancerFactory>
                )
            }
            .boxed()
        })
        .for_discriminators(["checkout"])
    };

    let rt = EnhancementRuntime::builder(doc.clone())
        .factory(recorder("display", CapabilityTag::Display, &log, None))
        .factory(lazy)
        .build()
        .unwrap();
    rt.start().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 0);

    let first = doc
        .append_element(doc.root(), "button", &[("data-next-action", "checkout")])
        .unwrap();
    let second = doc
        .append_element(doc.root(), "button", &[("data-next-action", "Checkout")])
        .unwrap();
    settle().await;

    assert!(rt.is_bound(first));
    assert!(rt.is_bound(second));
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_factory_wins() {
    let doc = Arc::new(MemoryDocument::new());
    let log = Log::default();
    let el = doc
        .append_element(doc.root(), "button", &[("data-next-action", "checkout")])
        .unwrap();

    let generic = FnFactory::new("generic-action", CapabilityTag::Action, |_| {
        Err(ResolutionError::CreateFailed {
            factory: "generic-action".to_string(),
            reason: "should not be chosen".to_string(),
        })
    });
    let registry = FactoryRegistryBuilder::new()
        .with(generic)
        .with(recorder("checkout", CapabilityTag::Action, &log, None).with_priority(5))
        .build();

    let rt = EnhancementRuntime::builder(doc.clone())
        .factories(registry)
        .build()
        .unwrap();
    rt.start().await.unwrap();

    assert!(rt.is_bound(el));
    assert_eq!(*log.lock(), vec![format!("init {}", label(CapabilityTag::Action, el))]);
}
