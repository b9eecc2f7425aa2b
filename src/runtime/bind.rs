//! Binding and unbinding elements.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::Instrument;

use super::{RuntimeEvent, RuntimeInner, RuntimeState, SweepReport};
use crate::bindings::{destroy_all, BindingRecord, StaleCommit};
use crate::classifier::Classification;
use crate::enhancer::{EnhancerContext, ManagedEnhancer};
use crate::host::ElementId;
use crate::observer::{ChangeDelivery, MutationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BindOutcome {
    Bound,
    /// Detached, already bound, or already being bound.
    Skipped,
    Excluded,
    /// Classified, but no enhancer resolved and initialized.
    NoEnhancers,
    ClassificationFailed,
    /// Initialized, but the claim was invalidated meanwhile.
    Stale,
}

impl RuntimeInner {
    /// One pass over the root: prune stale bindings, then bind every
    /// candidate in document order, yielding between batches.
    pub(super) async fn sweep_pass(&self) -> SweepReport {
        let pruned = self.prune_stale();
        let candidates = self.classifier.candidates(self.host.as_ref(), self.root);
        let mut report = SweepReport {
            scanned: candidates.len(),
            pruned,
            ..SweepReport::default()
        };

        for (index, batch) in candidates.chunks(self.config.batch_size).enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }
            if self.bindings.lock().is_closed() {
                break;
            }
            for &element in batch {
                match self.bind_element(element).await {
                    BindOutcome::Bound => report.bound += 1,
                    BindOutcome::ClassificationFailed => report.failed += 1,
                    BindOutcome::Skipped
                    | BindOutcome::Excluded
                    | BindOutcome::NoEnhancers
                    | BindOutcome::Stale => report.skipped += 1,
                }
            }
            tracing::debug!(batch = index, size = batch.len(), "sweep batch processed");
        }
        report
    }

    /// Destroy bindings whose element left the tree, whose tracked
    /// attributes changed since binding, or which now classify as excluded
    /// (an ancestor became a template). Returns how many were destroyed.
    fn prune_stale(&self) -> usize {
        let host = self.host.as_ref();
        let stale: Vec<BindingRecord> = {
            let mut bindings = self.bindings.lock();
            let doomed: Vec<ElementId> = bindings
                .records()
                .filter(|record| {
                    let element = record.element();
                    !host.is_connected(element)
                        || self.classifier.fingerprint(host, element, &self.tracked) != record.fingerprint()
                        || matches!(self.classifier.classify(host, element), Ok(Classification::Excluded(_)))
                })
                .map(BindingRecord::element)
                .collect();
            doomed
                .into_iter()
                .filter_map(|element| bindings.invalidate(element))
                .collect()
        };
        let pruned = stale.len();
        self.release_records(stale, "stale");
        pruned
    }

    /// Classify, resolve, initialize and commit one element.
    pub(super) async fn bind_element(&self, element: ElementId) -> BindOutcome {
        let span = tracing::debug_span!("bind", element = %element);
        self.bind_element_inner(element).instrument(span).await
    }

    async fn bind_element_inner(&self, element: ElementId) -> BindOutcome {
        let host = self.host.as_ref();
        if !host.is_connected(element) {
            return BindOutcome::Skipped;
        }
        let Some(reservation) = self.bindings.lock().reserve(element) else {
            return BindOutcome::Skipped;
        };

        let capabilities = match self.classifier.classify(host, element) {
            Ok(Classification::Tags(capabilities)) => capabilities,
            Ok(Classification::Excluded(reason)) => {
                tracing::trace!(?reason, "element excluded");
                self.bindings.lock().release(reservation);
                return BindOutcome::Excluded;
            }
            Err(err) => {
                tracing::warn!(error = %err, "classification failed");
                self.bindings.lock().release(reservation);
                self.events.publish(RuntimeEvent::ClassificationFailed(err));
                return BindOutcome::ClassificationFailed;
            }
        };
        let fingerprint = self.classifier.fingerprint(host, element, &self.tracked);

        let mut enhancers: Vec<Arc<ManagedEnhancer>> = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            if !self.bindings.lock().holds(&reservation) {
                break;
            }
            let tag = capability.tag;
            let ctx = EnhancerContext::new(element, capability.clone(), self.host.clone());
            let instance = match self.factories.resolve(&ctx).await {
                Ok(instance) => instance,
                Err(err) => {
                    tracing::warn!(tag = %tag, error = %err, "no enhancer for capability");
                    self.events.publish(RuntimeEvent::ResolutionFailed { element, tag, error: err });
                    continue;
                }
            };

            let managed = Arc::new(ManagedEnhancer::new(element, capability, instance));
            match managed.initialize(&ctx).await {
                Ok(()) => enhancers.push(managed),
                Err(err) => {
                    tracing::warn!(tag = %tag, error = %err, "enhancer failed to initialize");
                    managed.destroy();
                    self.events.publish(RuntimeEvent::InitializationFailed(err));
                }
            }
        }

        if enhancers.is_empty() {
            self.bindings.lock().release(reservation);
            return BindOutcome::NoEnhancers;
        }

        let tags = enhancers.iter().map(|e| e.capability().tag).collect::<Vec<_>>();
        let committed = {
            let mut bindings = self.bindings.lock();
            if host.is_connected(element) {
                bindings.commit(reservation, enhancers, fingerprint)
            } else {
                bindings.release(reservation);
                Err(StaleCommit { enhancers })
            }
        };

        match committed {
            Ok(()) => {
                tracing::debug!(?tags, "element bound");
                self.events.publish(RuntimeEvent::Bound { element, tags });
                BindOutcome::Bound
            }
            Err(stale) => {
                let destroyed = destroy_all(stale.enhancers);
                tracing::debug!(destroyed, "binding went stale during initialization, discarded");
                BindOutcome::Stale
            }
        }
    }

    /// Apply one observer delivery.
    pub(super) fn apply(self: &Arc<Self>, delivery: ChangeDelivery) {
        match delivery {
            ChangeDelivery::Removed(events) => {
                for event in events {
                    self.unbind_subtree(event.element);
                }
            }
            ChangeDelivery::Flush(events) => {
                let host = self.host.as_ref();
                let template = &self.classifier.vocabulary().template;
                let mut rebound = HashSet::new();
                let mut order = IndexSet::new();
                for event in events {
                    match event.kind {
                        MutationKind::Added => {
                            order.insert(event.element);
                        }
                        MutationKind::AttributeChanged => {
                            // Fully destroy the old binding before anything
                            // reclassifies the element.
                            if rebound.insert(event.element) {
                                let previous = self.bindings.lock().invalidate(event.element);
                                self.release_records(previous.into_iter().collect(), "rebind");
                            }
                            order.insert(event.element);
                            if event.attribute_name.as_ref() == Some(template) {
                                // Descendants switch between row content and
                                // template content: reclassify all of them.
                                let records = self
                                    .bindings
                                    .lock()
                                    .invalidate_where(|el| el != event.element && host.contains(event.element, el));
                                self.release_records(records, "template toggled");
                                order.extend(self.classifier.candidates(host, event.element));
                            }
                        }
                        MutationKind::Removed => self.unbind_subtree(event.element),
                    }
                }
                if order.is_empty() {
                    return;
                }

                let mut control = self.control.lock();
                if control.phase == RuntimeState::Destroyed {
                    return;
                }
                let runtime = Arc::clone(self);
                while control.flushes.try_join_next().is_some() {}
                tracing::debug!(elements = order.len(), "binding flushed elements");
                control.flushes.spawn(async move {
                    for element in order {
                        runtime.bind_element(element).await;
                    }
                });
            }
        }
    }

    /// Destroy the bindings of `node` and its descendants. A node already
    /// discarded has no descendants left to walk; every binding whose element
    /// no longer exists went with it.
    fn unbind_subtree(&self, node: ElementId) {
        let host = self.host.as_ref();
        let discarded = !host.exists(node);
        let records = self
            .bindings
            .lock()
            .invalidate_where(|element| host.contains(node, element) || (discarded && !host.exists(element)));
        self.release_records(records, "removed");
    }

    fn release_records(&self, records: Vec<BindingRecord>, reason: &'static str) {
        for record in records {
            let element = record.element();
            let destroyed = record.destroy();
            tracing::debug!(element = %element, destroyed, reason, "element unbound");
            self.events.publish(RuntimeEvent::Unbound { element });
        }
    }

    pub(super) fn all_enhancers(&self) -> Vec<Arc<ManagedEnhancer>> {
        self.bindings
            .lock()
            .records()
            .flat_map(|record| record.enhancers().iter().cloned())
            .collect()
    }

    pub(super) fn enhancers_of(&self, element: ElementId) -> Vec<Arc<ManagedEnhancer>> {
        self.bindings
            .lock()
            .get(element)
            .map(|record| record.enhancers().to_vec())
            .unwrap_or_default()
    }
}
