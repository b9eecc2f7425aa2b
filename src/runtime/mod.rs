//! The enhancement runtime.
//!
//! `EnhancementRuntime` drives the initial sweep, owns the binding registry
//! and keeps bindings correct while the tree mutates.
//!
//! # States
//!
//! ```text
//! Idle ──start()──▶ Scanning ──▶ Observing ◀──▶ Scanning (rescan)
//!   │                                │
//!   └────────────destroy()───────────┴──▶ Destroyed
//! ```
//!
//! # Invariants
//!
//! 1. At most one binding record per element; a sweep and a flush never
//!    double-bind (reservation dedup).
//! 2. A removal is applied as soon as the observer reports it; additions wait
//!    for the debounce window, so destroy-before-create is never reversed.
//! 3. An initialization that finishes after its element left the tree, after
//!    a rebind or after teardown is destroyed instead of committed.
//! 4. Every enhancer whose `initialize()` was attempted is destroyed exactly
//!    once, on every path including `destroy()` and drop.
//! 5. No lock is held across an `.await`.

mod bind;

use std::fmt;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::bindings::{BindingRegistry, BindingSnapshot};
use crate::capability::CapabilityTag;
use crate::classifier::ElementClassifier;
use crate::config::RuntimeConfig;
use crate::enhancer::Enhancer;
use crate::error::{
    ClassificationError, ConfigError, InitializationError, ObserverStartError, ResolutionError, RuntimeError,
    RuntimeResult,
};
use crate::factory::EnhancerFactory;
use crate::host::{ElementId, Host};
use crate::observer::{ChangeDelivery, ChangeObserver};
use crate::registry::FactoryRegistry;
use crate::stream::{EventHub, EventStream, StreamBuilder};

/// Lifecycle state of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Scanning,
    Observing,
    Destroyed,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Scanning => "scanning",
            RuntimeState::Observing => "observing",
            RuntimeState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published to [`EnhancementRuntime::subscribe`] streams.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The first sweep finished. Published once.
    Ready { bound: usize },
    SweepCompleted { scanned: usize, bound: usize },
    Bound { element: ElementId, tags: Vec<CapabilityTag> },
    Unbound { element: ElementId },
    ClassificationFailed(ClassificationError),
    ResolutionFailed {
        element: ElementId,
        tag: CapabilityTag,
        error: ResolutionError,
    },
    InitializationFailed(InitializationError),
    /// The runtime is bound but not reactive until the observer is retried.
    ObserverStartFailed(ObserverStartError),
    Destroyed,
}

/// Outcome of one `scan()` (or the sweep run by `start()`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates visited.
    pub scanned: usize,
    /// New bindings committed.
    pub bound: usize,
    /// Candidates excluded, already bound, or left without any enhancer.
    pub skipped: usize,
    /// Candidates whose classification failed.
    pub failed: usize,
    /// Stale bindings destroyed before the pass (detached or changed while
    /// unobserved).
    pub pruned: usize,
    /// The request was folded into a sweep already in progress.
    pub coalesced: bool,
}

impl SweepReport {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    fn absorb(&mut self, pass: SweepReport) {
        self.scanned += pass.scanned;
        self.bound += pass.bound;
        self.skipped += pass.skipped;
        self.failed += pass.failed;
        self.pruned += pass.pruned;
    }
}

/// Outcome of `notify()`/`refresh()` fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub state: RuntimeState,
    /// Elements with a committed binding.
    pub bound: usize,
    /// Elements whose binding is being initialized.
    pub pending_binds: usize,
    /// Elements queued in the observer for the next flush.
    pub queued: usize,
    pub observer_active: bool,
    pub observer_paused: bool,
    pub sweeping: bool,
    /// Bound but not reactive: the observer failed to start.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Destroyed,
}

struct Control {
    /// Idle, Observing or Destroyed. Scanning is derived from `scanning`.
    phase: RuntimeState,
    started: bool,
    scanning: bool,
    rescan_requested: bool,
    degraded: bool,
    observer: Option<ChangeObserver>,
    driver: Option<JoinHandle<()>>,
    /// Bind tasks spawned for observer flushes.
    flushes: JoinSet<()>,
}

impl Control {
    fn state(&self) -> RuntimeState {
        match self.phase {
            RuntimeState::Destroyed => RuntimeState::Destroyed,
            _ if self.scanning => RuntimeState::Scanning,
            phase => phase,
        }
    }
}

pub(crate) struct RuntimeInner {
    host: Arc<dyn Host>,
    config: RuntimeConfig,
    root: ElementId,
    tracked: Vec<String>,
    classifier: Arc<ElementClassifier>,
    factories: FactoryRegistry,
    bindings: Mutex<BindingRegistry>,
    control: Mutex<Control>,
    events: EventHub<RuntimeEvent>,
    readiness: watch::Sender<Readiness>,
}

impl RuntimeInner {
    fn state(&self) -> RuntimeState {
        self.control.lock().state()
    }

    fn is_destroyed(&self) -> bool {
        self.control.lock().phase == RuntimeState::Destroyed
    }

    /// Run sweeps until no rescan was requested while one was in progress.
    /// The caller must have set `scanning`.
    async fn run_sweeps(&self) -> SweepReport {
        let mut total = SweepReport::default();
        loop {
            let pass = self.sweep_pass().await;
            total.absorb(pass);
            if !self.rescan_pending() {
                break;
            }
            tracing::debug!("running coalesced rescan");
        }
        self.events.publish(RuntimeEvent::SweepCompleted {
            scanned: total.scanned,
            bound: total.bound,
        });
        total
    }

    fn rescan_pending(&self) -> bool {
        let mut control = self.control.lock();
        if control.rescan_requested && control.phase != RuntimeState::Destroyed {
            control.rescan_requested = false;
            return true;
        }
        control.scanning = false;
        control.rescan_requested = false;
        false
    }

    /// Create the observer on first use and attach it to the root.
    fn attach_observer(self: &Arc<Self>) -> RuntimeResult<()> {
        let mut control = self.control.lock();
        if control.phase == RuntimeState::Destroyed {
            return Err(RuntimeError::Destroyed);
        }

        let Control { observer, driver, .. } = &mut *control;
        let observer = observer.get_or_insert_with(|| {
            let (sink, deliveries) = StreamBuilder::new()
                .buffer_size(self.config.delivery_buffer)
                .build();
            *driver = Some(tokio::spawn(drive(Arc::downgrade(self), deliveries)));
            ChangeObserver::new(
                self.host.clone(),
                self.classifier.clone(),
                self.tracked.clone(),
                self.config.debounce,
                sink,
            )
        });

        match observer.start(self.root) {
            Ok(()) => {
                control.degraded = false;
                Ok(())
            }
            Err(err) => {
                control.degraded = true;
                drop(control);
                self.events.publish(RuntimeEvent::ObserverStartFailed(err.clone()));
                Err(err.into())
            }
        }
    }

    /// Stop observing, destroy every binding and refuse further work.
    /// Returns false if the runtime was already torn down.
    fn teardown(&self) -> bool {
        let (observer, driver, mut flushes) = {
            let mut control = self.control.lock();
            if control.phase == RuntimeState::Destroyed {
                return false;
            }
            control.phase = RuntimeState::Destroyed;
            (
                control.observer.take(),
                control.driver.take(),
                std::mem::take(&mut control.flushes),
            )
        };

        if let Some(mut observer) = observer {
            observer.stop();
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        // Enhancers caught mid-initialization are destroyed when their task drops.
        flushes.abort_all();

        let records = self.bindings.lock().close();
        let elements = records.len();
        let destroyed: usize = records.into_iter().map(|record| record.destroy()).sum();

        self.readiness.send_replace(Readiness::Destroyed);
        tracing::info!(elements, destroyed, "enhancement runtime destroyed");
        self.events.publish(RuntimeEvent::Destroyed);
        true
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Shared by every [`EnhancementRuntime`] clone. Tears the runtime down when
/// the last handle goes away, even if bind tasks still hold the inner state.
struct HandleGuard {
    inner: Weak<RuntimeInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.teardown() {
                tracing::debug!("last runtime handle dropped");
            }
        }
    }
}

/// Drains observer deliveries for as long as the runtime is alive.
async fn drive(runtime: Weak<RuntimeInner>, mut deliveries: EventStream<ChangeDelivery>) {
    while let Some(delivery) = deliveries.next().await {
        let Some(inner) = runtime.upgrade() else {
            break;
        };
        inner.apply(delivery);
    }
    tracing::debug!("change delivery stream closed");
}

/// Discovers marker-annotated elements, binds enhancers to them and keeps the
/// bindings correct while the tree mutates.
///
/// Cloning yields another handle to the same runtime. Dropping the last
/// handle tears the runtime down like [`destroy`](Self::destroy).
///
/// # Example
///
/// ```rust
/// use enliven::prelude::*;
/// use enliven::host::MemoryDocument;
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct Label;
///
/// #[async_trait]
/// impl Enhancer for Label {
///     fn name(&self) -> &str { "label" }
///     async fn initialize(&self, _: &EnhancerContext) -> EnhancerResult<()> { Ok(()) }
///     fn destroy(&self) {}
///     fn as_any(&self) -> &dyn std::any::Any { self }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), RuntimeError> {
/// let doc = Arc::new(MemoryDocument::new());
/// let price = doc.append_element(doc.root(), "span", &[("data-next-display", "cart.total")]).unwrap();
///
/// let runtime = EnhancementRuntime::builder(doc.clone())
///     .factory(FnFactory::new("label", CapabilityTag::Display, |_| {
///         Ok(Arc::new(Label) as Arc<dyn Enhancer>)
///     }))
///     .build()?;
///
/// runtime.start().await?;
/// assert!(runtime.is_bound(price));
///
/// runtime.destroy();
/// assert_eq!(runtime.stats().bound, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EnhancementRuntime {
    inner: Arc<RuntimeInner>,
    _guard: Arc<HandleGuard>,
}

impl EnhancementRuntime {
    pub fn builder(host: Arc<dyn Host>) -> RuntimeBuilder {
        RuntimeBuilder::new(host)
    }

    /// Run the initial sweep, signal readiness, then start observing.
    ///
    /// If the observer cannot attach, the bindings made by the sweep stay in
    /// place, the runtime is marked degraded and the error is returned;
    /// [`retry_observer`](Self::retry_observer) may be used later.
    pub async fn start(&self) -> RuntimeResult<SweepReport> {
        {
            let mut control = self.inner.control.lock();
            let phase = control.phase;
            match phase {
                RuntimeState::Destroyed => return Err(RuntimeError::Destroyed),
                RuntimeState::Idle if !control.started && !control.scanning => {
                    control.started = true;
                    control.scanning = true;
                }
                _ => {
                    return Err(RuntimeError::InvalidState {
                        operation: "start",
                        state: control.state().as_str(),
                    });
                }
            }
        }

        tracing::info!(root = %self.inner.root, "starting enhancement runtime");
        let report = self.inner.run_sweeps().await;

        {
            let mut control = self.inner.control.lock();
            if control.phase == RuntimeState::Destroyed {
                return Err(RuntimeError::Destroyed);
            }
            control.phase = RuntimeState::Observing;
        }

        let bound = self.inner.bindings.lock().len();
        self.inner.readiness.send_replace(Readiness::Ready);
        tracing::info!(scanned = report.scanned, bound, "initial sweep complete");
        self.inner.events.publish(RuntimeEvent::Ready { bound });

        self.inner.attach_observer()?;
        Ok(report)
    }

    /// Sweep the root again. A call made while a sweep is running is folded
    /// into it and returns immediately with `coalesced` set.
    pub async fn scan(&self) -> RuntimeResult<SweepReport> {
        {
            let mut control = self.inner.control.lock();
            if control.phase == RuntimeState::Destroyed {
                return Err(RuntimeError::Destroyed);
            }
            if control.scanning {
                control.rescan_requested = true;
                tracing::debug!("scan coalesced into the sweep in progress");
                return Ok(SweepReport::coalesced());
            }
            control.scanning = true;
        }

        let report = self.inner.run_sweeps().await;
        if self.inner.is_destroyed() {
            return Err(RuntimeError::Destroyed);
        }
        Ok(report)
    }

    /// Detach the observer for bulk tree surgery. Changes already queued are
    /// kept and delivered after [`resume`](Self::resume).
    pub fn pause(&self) -> RuntimeResult<()> {
        let mut control = self.inner.control.lock();
        if control.phase == RuntimeState::Destroyed {
            return Err(RuntimeError::Destroyed);
        }
        if let Some(observer) = control.observer.as_mut() {
            observer.pause();
        }
        Ok(())
    }

    /// Re-attach the observer to the same root, then rescan to pick up what
    /// changed while paused.
    pub async fn resume(&self) -> RuntimeResult<SweepReport> {
        let resumed = {
            let mut control = self.inner.control.lock();
            match control.phase {
                RuntimeState::Destroyed => return Err(RuntimeError::Destroyed),
                RuntimeState::Idle => {
                    return Err(RuntimeError::InvalidState {
                        operation: "resume",
                        state: RuntimeState::Idle.as_str(),
                    })
                }
                _ => {}
            }
            match control.observer.as_mut() {
                Some(observer) => observer.resume(),
                None => Ok(()),
            }
        };

        if let Err(err) = resumed {
            self.inner.control.lock().degraded = true;
            self.inner.events.publish(RuntimeEvent::ObserverStartFailed(err.clone()));
            return Err(err.into());
        }
        self.scan().await
    }

    /// Try to attach the observer again after a failed start, then rescan to
    /// pick up what changed while the runtime was not reactive.
    pub async fn retry_observer(&self) -> RuntimeResult<SweepReport> {
        {
            let control = self.inner.control.lock();
            match control.phase {
                RuntimeState::Destroyed => return Err(RuntimeError::Destroyed),
                RuntimeState::Idle => {
                    return Err(RuntimeError::InvalidState {
                        operation: "retry observer",
                        state: RuntimeState::Idle.as_str(),
                    })
                }
                _ => {}
            }
        }
        self.inner.attach_observer()?;
        tracing::info!(root = %self.inner.root, "change observer attached on retry");
        self.scan().await
    }

    /// Tear down: stop observing, destroy every bound enhancer, clear queued
    /// changes. Idempotent. Flush binds still initializing are aborted and
    /// their enhancers destroyed; a sweep still initializing destroys its
    /// enhancers as soon as they finish.
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    /// Call `update(topic)` on every bound enhancer.
    pub async fn notify(&self, topic: &str) -> DispatchReport {
        let targets = self.inner.all_enhancers();
        let mut report = DispatchReport::default();
        for enhancer in targets {
            if enhancer.is_destroyed() {
                continue;
            }
            match enhancer.inner().update(topic).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        topic,
                        tag = %enhancer.capability().tag,
                        enhancer = enhancer.inner().name(),
                        error = %err,
                        "enhancer update failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Call `refresh()` on the enhancers bound to `element`.
    pub async fn refresh(&self, element: ElementId) -> DispatchReport {
        let targets = self.inner.enhancers_of(element);
        let mut report = DispatchReport::default();
        for enhancer in targets {
            if enhancer.is_destroyed() {
                continue;
            }
            match enhancer.inner().refresh().await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        element = %element,
                        enhancer = enhancer.inner().name(),
                        error = %err,
                        "enhancer refresh failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Wait until the first sweep has completed.
    pub async fn ready(&self) -> RuntimeResult<()> {
        let mut readiness = self.inner.readiness.subscribe();
        let state = *readiness
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map_err(|_| RuntimeError::Destroyed)?;
        match state {
            Readiness::Ready => Ok(()),
            _ => Err(RuntimeError::Destroyed),
        }
    }

    /// Open a stream of runtime events.
    pub fn subscribe(&self) -> EventStream<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state()
    }

    pub fn stats(&self) -> RuntimeStats {
        let (state, sweeping, degraded, observer_active, observer_paused, queued) = {
            let control = self.inner.control.lock();
            let observer = control.observer.as_ref();
            (
                control.state(),
                control.scanning,
                control.degraded,
                observer.is_some_and(ChangeObserver::is_active),
                observer.is_some_and(ChangeObserver::is_paused),
                observer.map_or(0, ChangeObserver::queued_len),
            )
        };
        let bindings = self.inner.bindings.lock();
        RuntimeStats {
            state,
            bound: bindings.len(),
            pending_binds: bindings.pending_len(),
            queued,
            observer_active,
            observer_paused,
            sweeping,
            degraded,
        }
    }

    pub fn is_bound(&self, element: ElementId) -> bool {
        self.inner.bindings.lock().is_bound(element)
    }

    /// Whether an initialization for `element` is in flight.
    pub fn is_binding(&self, element: ElementId) -> bool {
        self.inner.bindings.lock().is_pending(element)
    }

    /// Snapshots of every binding, in binding order.
    pub fn bindings(&self) -> Vec<BindingSnapshot> {
        self.inner.bindings.lock().snapshots()
    }

    /// The enhancers currently bound to `element`.
    pub fn enhancers(&self, element: ElementId) -> Vec<Arc<dyn Enhancer>> {
        self.inner.bindings.lock().enhancers_of(element)
    }

    pub fn root(&self) -> ElementId {
        self.inner.root
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }
}

impl fmt::Debug for EnhancementRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancementRuntime")
            .field("root", &self.inner.root)
            .field("state", &self.inner.state())
            .field("factories", &self.inner.factories.names())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EnhancementRuntime`].
pub struct RuntimeBuilder {
    host: Arc<dyn Host>,
    config: RuntimeConfig,
    factories: FactoryRegistry,
}

impl RuntimeBuilder {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            config: RuntimeConfig::default(),
            factories: FactoryRegistry::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register one factory.
    pub fn factory(mut self, factory: impl EnhancerFactory + 'static) -> Self {
        self.factories.register(Arc::new(factory));
        self
    }

    /// Register every factory of `registry`, after those already added.
    pub fn factories(mut self, registry: FactoryRegistry) -> Self {
        for factory in registry.iter() {
            self.factories.register(factory.clone());
        }
        self
    }

    pub fn build(self) -> RuntimeResult<EnhancementRuntime> {
        self.config.validate()?;
        let root = self.config.root.unwrap_or_else(|| self.host.root());
        if !self.host.exists(root) {
            return Err(ConfigError::Invalid(format!("root {root} does not exist")).into());
        }

        let classifier = Arc::new(ElementClassifier::new(self.config.vocabulary.clone()));
        let tracked = self.config.tracked_attributes();
        let (readiness, _) = watch::channel(Readiness::Pending);
        let events = EventHub::new(self.config.event_buffer);

        let inner = Arc::new(RuntimeInner {
            host: self.host,
            root,
            tracked,
            classifier,
            factories: self.factories,
            bindings: Mutex::new(BindingRegistry::new()),
            control: Mutex::new(Control {
                phase: RuntimeState::Idle,
                started: false,
                scanning: false,
                rescan_requested: false,
                degraded: false,
                observer: None,
                driver: None,
                flushes: JoinSet::new(),
            }),
            events,
            readiness,
            config: self.config,
        });
        Ok(EnhancementRuntime {
            _guard: Arc::new(HandleGuard {
                inner: Arc::downgrade(&inner),
            }),
            inner,
        })
    }
}
