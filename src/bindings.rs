//! Binding registry.
//!
//! Associates element handles with their active enhancers. The registry holds
//! handles only, never the elements, and entries are removed explicitly when
//! the element leaves the tree.
//!
//! Binding an element is a two-phase operation. `reserve` claims the element
//! with a fresh generation token before any suspension point; `commit` only
//! succeeds if that reservation is still the current one. Removal, rebind and
//! teardown all invalidate reservations, so an initialization that finishes
//! late can never resurrect a binding.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::time::Instant;

use crate::capability::CapabilityTag;
use crate::enhancer::{Enhancer, ManagedEnhancer};
use crate::host::ElementId;

/// Live association between an element and its enhancers.
#[derive(Debug)]
pub(crate) struct BindingRecord {
    element: ElementId,
    enhancers: Vec<Arc<ManagedEnhancer>>,
    generation: u64,
    bound_at: Instant,
    fingerprint: Vec<Option<String>>,
}

impl BindingRecord {
    pub(crate) fn element(&self) -> ElementId {
        self.element
    }

    pub(crate) fn fingerprint(&self) -> &[Option<String>] {
        &self.fingerprint
    }

    pub(crate) fn enhancers(&self) -> &[Arc<ManagedEnhancer>] {
        &self.enhancers
    }

    /// Destroy every enhancer, last initialized first. Returns how many
    /// destroys this call performed.
    pub(crate) fn destroy(self) -> usize {
        destroy_all(self.enhancers)
    }

    fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            element: self.element,
            tags: self.enhancers.iter().map(|e| e.capability().tag).collect(),
            generation: self.generation,
            bound_at: self.bound_at,
        }
    }
}

/// Destroy a set of enhancers in reverse initialization order.
pub(crate) fn destroy_all(enhancers: Vec<Arc<ManagedEnhancer>>) -> usize {
    enhancers.iter().rev().filter(|e| e.destroy()).count()
}

/// Read-only view of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub element: ElementId,
    pub tags: Vec<CapabilityTag>,
    pub generation: u64,
    pub bound_at: Instant,
}

/// A claimed, not yet committed, binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub(crate) element: ElementId,
    pub(crate) generation: u64,
}

/// Why a commit was refused.
#[derive(Debug)]
pub(crate) struct StaleCommit {
    pub(crate) enhancers: Vec<Arc<ManagedEnhancer>>,
}

#[derive(Debug, Default)]
pub(crate) struct BindingRegistry {
    records: IndexMap<ElementId, BindingRecord>,
    in_flight: HashMap<ElementId, u64>,
    next_generation: u64,
    closed: bool,
}

impl BindingRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_bound(&self, element: ElementId) -> bool {
        self.records.contains_key(&element)
    }

    pub(crate) fn is_pending(&self, element: ElementId) -> bool {
        self.in_flight.contains_key(&element)
    }

    /// Claim `element` for binding. `None` if it is already bound, already
    /// being bound, or the registry is closed.
    pub(crate) fn reserve(&mut self, element: ElementId) -> Option<Reservation> {
        if self.closed || self.records.contains_key(&element) || self.in_flight.contains_key(&element) {
            return None;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.in_flight.insert(element, generation);
        Some(Reservation { element, generation })
    }

    /// Whether `reservation` is still the live claim on its element.
    pub(crate) fn holds(&self, reservation: &Reservation) -> bool {
        !self.closed && self.in_flight.get(&reservation.element) == Some(&reservation.generation)
    }

    /// Drop a reservation that produced no enhancers.
    pub(crate) fn release(&mut self, reservation: Reservation) {
        if self.in_flight.get(&reservation.element) == Some(&reservation.generation) {
            self.in_flight.remove(&reservation.element);
        }
    }

    /// Turn a reservation into a binding record.
    ///
    /// Refused when the reservation was invalidated in the meantime; the
    /// caller must destroy the returned enhancers.
    pub(crate) fn commit(
        &mut self,
        reservation: Reservation,
        enhancers: Vec<Arc<ManagedEnhancer>>,
        fingerprint: Vec<Option<String>>,
    ) -> Result<(), StaleCommit> {
        if !self.holds(&reservation) {
            return Err(StaleCommit { enhancers });
        }
        self.in_flight.remove(&reservation.element);
        self.records.insert(
            reservation.element,
            BindingRecord {
                element: reservation.element,
                enhancers,
                generation: reservation.generation,
                bound_at: Instant::now(),
                fingerprint,
            },
        );
        Ok(())
    }

    /// Remove the binding for `element` and cancel any reservation for it.
    pub(crate) fn invalidate(&mut self, element: ElementId) -> Option<BindingRecord> {
        self.in_flight.remove(&element);
        self.records.shift_remove(&element)
    }

    /// Invalidate every bound or reserved element matching `predicate`.
    pub(crate) fn invalidate_where(&mut self, mut predicate: impl FnMut(ElementId) -> bool) -> Vec<BindingRecord> {
        self.in_flight.retain(|element, _| !predicate(*element));
        let doomed: Vec<ElementId> = self.records.keys().copied().filter(|e| predicate(*e)).collect();
        doomed
            .into_iter()
            .filter_map(|element| self.records.shift_remove(&element))
            .collect()
    }

    /// Refuse all further reservations and commits, and hand back every record.
    pub(crate) fn close(&mut self) -> Vec<BindingRecord> {
        self.closed = true;
        self.in_flight.clear();
        self.records.drain(..).map(|(_, record)| record).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn get(&self, element: ElementId) -> Option<&BindingRecord> {
        self.records.get(&element)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &BindingRecord> {
        self.records.values()
    }

    pub(crate) fn snapshots(&self) -> Vec<BindingSnapshot> {
        self.records.values().map(BindingRecord::snapshot).collect()
    }

    /// Public handles of one element's enhancers.
    pub(crate) fn enhancers_of(&self, element: ElementId) -> Vec<Arc<dyn Enhancer>> {
        self.records
            .get(&element)
            .map(|r| r.enhancers.iter().map(|e| e.inner().clone()).collect())
            .unwrap_or_default()
    }
}
