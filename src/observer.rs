//! Change observation.
//!
//! `ChangeObserver` subscribes once to the host's subtree mutations, keeps
//! only the relevant ones, normalizes them into [`MutationEvent`]s and hands
//! them to a sink:
//!
//! - removals are forwarded immediately, as [`ChangeDelivery::Removed`];
//! - additions and attribute changes are queued and delivered together as
//!   one [`ChangeDelivery::Flush`] per debounce window. The window is fixed
//!   from the first queued change, so a steady stream of mutations cannot
//!   postpone delivery forever.
//!
//! A childList mutation is relevant only if an added or removed node is a
//! classification candidate or contains one (removed nodes that were already
//! discarded are always forwarded). An attribute mutation is
//! relevant only if its name is on the allowlist.

use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::classifier::ElementClassifier;
use crate::error::ObserverStartError;
use crate::host::{ElementId, Host, MutationSubscription, ObserveOptions, RawMutation};
use crate::stream::EventSender;

/// Kind of a normalized mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Added,
    Removed,
    AttributeChanged,
}

/// A normalized mutation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub element: ElementId,
    pub attribute_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl MutationEvent {
    pub fn added(element: ElementId) -> Self {
        Self {
            kind: MutationKind::Added,
            element,
            attribute_name: None,
            old_value: None,
            new_value: None,
        }
    }

    pub fn removed(element: ElementId) -> Self {
        Self {
            kind: MutationKind::Removed,
            element,
            attribute_name: None,
            old_value: None,
            new_value: None,
        }
    }

    pub fn attribute_changed(
        element: ElementId,
        name: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            kind: MutationKind::AttributeChanged,
            element,
            attribute_name: Some(name.into()),
            old_value,
            new_value,
        }
    }
}

/// What the observer hands to its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDelivery {
    /// Removed subtree roots, delivered as soon as they are seen.
    Removed(Vec<MutationEvent>),
    /// Added elements (in arrival order) followed by coalesced attribute
    /// changes, once per debounce window.
    Flush(Vec<MutationEvent>),
}

/// Observer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStatus {
    Inactive,
    Active,
    Paused,
}

#[derive(Debug)]
struct AttributeDelta {
    old_value: Option<String>,
    new_value: Option<String>,
}

#[derive(Debug, Default)]
struct PendingChanges {
    added: IndexSet<ElementId>,
    attributes: IndexMap<(ElementId, String), AttributeDelta>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.attributes.is_empty()
    }

    /// Distinct elements awaiting (re-)classification.
    fn element_count(&self) -> usize {
        let mut elements: IndexSet<ElementId> = self.added.clone();
        elements.extend(self.attributes.keys().map(|(el, _)| *el));
        elements.len()
    }

    fn purge(&mut self, mut doomed: impl FnMut(ElementId) -> bool) {
        self.added.retain(|el| !doomed(*el));
        self.attributes.retain(|(el, _), _| !doomed(*el));
    }

    fn drain(&mut self) -> Vec<MutationEvent> {
        let mut events: Vec<MutationEvent> = self.added.drain(..).map(MutationEvent::added).collect();
        events.extend(
            self.attributes
                .drain(..)
                .map(|((el, name), delta)| MutationEvent::attribute_changed(el, name, delta.old_value, delta.new_value)),
        );
        events
    }

    fn clear(&mut self) {
        self.added.clear();
        self.attributes.clear();
    }
}

#[derive(Debug)]
struct Shared {
    status: ObserverStatus,
    root: Option<ElementId>,
    pending: PendingChanges,
}

struct Worker {
    host: Arc<dyn Host>,
    classifier: Arc<ElementClassifier>,
    tracked: Arc<Vec<String>>,
    debounce: Duration,
    sink: EventSender<ChangeDelivery>,
    shared: Arc<Mutex<Shared>>,
}

impl Worker {
    async fn run(self, mut subscription: MutationSubscription, mut detach: oneshot::Receiver<()>) {
        let mut deadline = if self.shared.lock().pending.is_empty() {
            None
        } else {
            Some(Instant::now() + self.debounce)
        };

        loop {
            let armed = deadline.is_some();
            let wake_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                _ = &mut detach => break,

                batch = subscription.recv() => {
                    let Some(batch) = batch else {
                        tracing::debug!("host closed the mutation subscription");
                        self.shared.lock().status = ObserverStatus::Inactive;
                        break;
                    };
                    let removed = self.ingest(batch);
                    if !removed.is_empty() && self.sink.send(ChangeDelivery::Removed(removed)).await.is_err() {
                        break;
                    }
                    if deadline.is_none() && !self.shared.lock().pending.is_empty() {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                }

                _ = tokio::time::sleep_until(wake_at), if armed => {
                    deadline = None;
                    let events = self.shared.lock().pending.drain();
                    if !events.is_empty() {
                        tracing::debug!(events = events.len(), "flushing debounced changes");
                        if self.sink.send(ChangeDelivery::Flush(events)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Filter and queue one raw batch. Returns the removals to forward now.
    fn ingest(&self, batch: Vec<RawMutation>) -> Vec<MutationEvent> {
        let host = self.host.as_ref();
        let mut removed_events = Vec::new();
        let mut shared = self.shared.lock();

        for record in batch {
            match record {
                RawMutation::ChildList { added, removed, .. } => {
                    // Every removal is forwarded. Its markers may already be
                    // gone, and a detached node reports nothing further.
                    for node in removed {
                        shared.pending.purge(|el| host.contains(node, el));
                        removed_events.push(MutationEvent::removed(node));
                    }
                    for node in added {
                        let candidates = self.classifier.candidates(host, node);
                        if candidates.is_empty() {
                            tracing::trace!(element = %node, "ignoring insertion without candidates");
                            continue;
                        }
                        shared.pending.added.extend(candidates);
                    }
                }
                RawMutation::Attribute { target, name, old_value } => {
                    if !self.tracked.iter().any(|t| *t == name) {
                        tracing::trace!(element = %target, attribute = %name, "ignoring untracked attribute");
                        continue;
                    }
                    let new_value = host.attribute(target, &name);
                    shared
                        .pending
                        .attributes
                        .entry((target, name))
                        .and_modify(|delta| delta.new_value = new_value.clone())
                        .or_insert(AttributeDelta { old_value, new_value });
                }
            }
        }
        removed_events
    }
}

/// Debounced, filtered view of a host's subtree mutations.
pub struct ChangeObserver {
    host: Arc<dyn Host>,
    classifier: Arc<ElementClassifier>,
    tracked: Arc<Vec<String>>,
    debounce: Duration,
    sink: EventSender<ChangeDelivery>,
    shared: Arc<Mutex<Shared>>,
    detach: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ChangeObserver {
    /// Create an inactive observer delivering to `sink`.
    ///
    /// `tracked` is the attribute allowlist.
    pub fn new(
        host: Arc<dyn Host>,
        classifier: Arc<ElementClassifier>,
        tracked: Vec<String>,
        debounce: Duration,
        sink: EventSender<ChangeDelivery>,
    ) -> Self {
        Self {
            host,
            classifier,
            tracked: Arc::new(tracked),
            debounce,
            sink,
            shared: Arc::new(Mutex::new(Shared {
                status: ObserverStatus::Inactive,
                root: None,
                pending: PendingChanges::default(),
            })),
            detach: None,
            worker: None,
        }
    }

    /// Start observing `root`.
    ///
    /// On failure the observer stays inactive and `start` may be retried.
    /// Starting on a different root than the current one discards queued
    /// changes first.
    pub fn start(&mut self, root: ElementId) -> Result<(), ObserverStartError> {
        let (status, current) = {
            let shared = self.shared.lock();
            (shared.status, shared.root)
        };
        match status {
            ObserverStatus::Active if current == Some(root) => return Ok(()),
            ObserverStatus::Paused if current == Some(root) => return self.resume(),
            ObserverStatus::Inactive => {}
            _ => self.stop(),
        }
        self.attach(root)
    }

    /// Stop observing and discard queued, undelivered changes.
    pub fn stop(&mut self) {
        self.detach_worker();
        let mut shared = self.shared.lock();
        shared.status = ObserverStatus::Inactive;
        shared.root = None;
        shared.pending.clear();
    }

    /// Detach from the host but keep queued changes for delivery on resume.
    pub fn pause(&mut self) {
        if self.status() != ObserverStatus::Active {
            return;
        }
        self.detach_worker();
        self.shared.lock().status = ObserverStatus::Paused;
        tracing::debug!("change observer paused");
    }

    /// Re-attach to the same root after `pause`.
    pub fn resume(&mut self) -> Result<(), ObserverStartError> {
        let (status, root) = {
            let shared = self.shared.lock();
            (shared.status, shared.root)
        };
        match (status, root) {
            (ObserverStatus::Paused, Some(root)) => self.attach(root),
            _ => Ok(()),
        }
    }

    pub fn status(&self) -> ObserverStatus {
        self.shared.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == ObserverStatus::Active
    }

    pub fn is_paused(&self) -> bool {
        self.status() == ObserverStatus::Paused
    }

    pub fn root(&self) -> Option<ElementId> {
        self.shared.lock().root
    }

    /// Distinct elements queued for the next flush.
    pub fn queued_len(&self) -> usize {
        self.shared.lock().pending.element_count()
    }

    fn attach(&mut self, root: ElementId) -> Result<(), ObserverStartError> {
        let options = ObserveOptions::subtree_with_attributes(self.tracked.as_ref().clone());
        let subscription = match self.host.observe(root, options) {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(root = %root, error = %err, "change observer failed to start");
                return Err(err);
            }
        };

        {
            let mut shared = self.shared.lock();
            shared.status = ObserverStatus::Active;
            shared.root = Some(root);
        }

        let (detach_tx, detach_rx) = oneshot::channel();
        let worker = Worker {
            host: self.host.clone(),
            classifier: self.classifier.clone(),
            tracked: self.tracked.clone(),
            debounce: self.debounce,
            sink: self.sink.clone(),
            shared: self.shared.clone(),
        };
        self.detach = Some(detach_tx);
        self.worker = Some(tokio::spawn(worker.run(subscription, detach_rx)));
        tracing::debug!(root = %root, "change observer attached");
        Ok(())
    }

    fn detach_worker(&mut self) {
        if let Some(detach) = self.detach.take() {
            let _ = detach.send(());
        }
        self.worker.take();
    }
}

impl std::fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("tracked", &self.tracked)
            .field("debounce", &self.debounce)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl Drop for ChangeObserver {
    fn drop(&mut self) {
        self.detach_worker();
    }
}
