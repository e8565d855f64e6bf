//! Replicated document store: an RGA sequence of shape records.
//!
//! ```text
//!  head ─► [3@bob] ─► [2@alice]† ─► [5@alice] ─► [4@carol]
//!            │            │              ▲
//!            └ anchor ────┘ anchor ──────┘        († = tombstone)
//! ```
//!
//! Every element remembers the element it was inserted after (its anchor).
//! Integration starts right after the anchor and skips every element with
//! a larger id, so siblings sharing an anchor end up sorted by descending
//! `(clock, origin)`: the later insert goes first, and for equal clocks the
//! lexicographically larger origin goes first. Lamport clocks make a
//! causally later insert larger than everything its author had seen.
//!
//! Deleted elements stay in the sequence as tombstones. They still serve as
//! anchors, keep their record for undo, and a delete that arrives before its
//! insert leaves the id in the delete set so the insert lands tombstoned.
//!
//! Reference: Roh et al., Replicated abstract data types (RGA), JPDC 2011
//! Reference: Kleppmann et al., Interleaving anomalies in collaborative text editors

use std::collections::HashSet;

use super::ids::{ActorId, ElementId, LamportClock, StateVector, MAX_REMOTE_CLOCK};
use super::update::{LocalOp, Op, Snapshot, Update};
use crate::{Shape, ShapeId};

#[derive(Clone, Debug)]
struct Element {
    id: ElementId,
    anchor: Option<ElementId>,
    shape: Shape,
    deleted: bool,
}

/// Handle returned by [`Document::observe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// One visible change. Positions inside an event are sequential: each one
/// is valid after the changes listed before it were applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Inserted { position: usize, shape_id: ShapeId },
    Removed { position: usize, shape_id: ShapeId },
}

impl Change {
    pub fn position(&self) -> usize {
        match self {
            Change::Inserted { position, .. } | Change::Removed { position, .. } => *position,
        }
    }

    pub fn shape_id(&self) -> &ShapeId {
        match self {
            Change::Inserted { shape_id, .. } | Change::Removed { shape_id, .. } => shape_id,
        }
    }
}

/// Delivered to observers after every local or remote change.
#[derive(Debug)]
pub struct DocEvent<'a> {
    /// The ops that were actually integrated.
    pub update: &'a Update,
    /// True when produced by this replica's own transaction.
    pub local: bool,
    pub changes: &'a [Change],
}

impl DocEvent<'_> {
    pub fn origin(&self) -> &ActorId {
        &self.update.origin
    }

    pub fn affected_positions(&self) -> Vec<usize> {
        self.changes.iter().map(Change::position).collect()
    }
}

/// Outcome of [`Document::apply_remote`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Ops integrated, including previously parked ones that became ready.
    pub integrated: usize,
    /// Ops already known (duplicate delivery).
    pub duplicates: usize,
    /// Inserts parked because their anchor has not arrived yet.
    pub parked: usize,
    /// Ops refused because their clocks are out of range.
    pub rejected: usize,
}

impl ApplyReport {
    pub fn changed(&self) -> bool {
        self.integrated > 0
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.integrated += other.integrated;
        self.duplicates += other.duplicates;
        self.parked += other.parked;
        self.rejected += other.rejected;
    }
}

/// First clock in `update` a peer is not allowed to send.
fn out_of_range_clock(update: &Update) -> Option<u64> {
    let element_clocks = update.ops.iter().map(|op| match op {
        Op::Insert { id, .. } | Op::Delete { id } => id.clock,
    });
    std::iter::once(update.clock)
        .chain(element_clocks)
        .find(|clock| *clock > MAX_REMOTE_CLOCK)
}

type Observer = Box<dyn FnMut(&DocEvent<'_>) + Send>;

/// The replicated ordered collection of shape records.
pub struct Document {
    actor: ActorId,
    clock: LamportClock,
    /// Document order, tombstones included.
    elements: Vec<Element>,
    visible: usize,
    known: HashSet<ElementId>,
    /// Every id ever deleted, integrated or not.
    deleted: HashSet<ElementId>,
    /// Remote remainders waiting for their anchors.
    pending: Vec<Update>,
    state_vector: StateVector,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl Document {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            clock: LamportClock::new(),
            elements: Vec::new(),
            visible: 0,
            known: HashSet::new(),
            deleted: HashSet::new(),
            pending: Vec::new(),
            state_vector: StateVector::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Bootstrap a replica from another replica's (or the relay's) snapshot.
    pub fn from_snapshot(actor: ActorId, snapshot: &Snapshot) -> Self {
        let mut doc = Self::new(actor);
        doc.apply_snapshot(snapshot);
        doc
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Whether the replica holds any history at all, tombstones included.
    pub fn has_history(&self) -> bool {
        !self.elements.is_empty() || !self.deleted.is_empty() || !self.pending.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.len() - self.visible
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(Update::len).sum()
    }

    pub fn get(&self, position: usize) -> Option<&Shape> {
        self.raw_of_visible(position).map(|raw| &self.elements[raw].shape)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shape> {
        self.elements.iter().filter(|e| !e.deleted).map(|e| &e.shape)
    }

    /// Materialized sequence, the only thing a renderer should read.
    pub fn shapes(&self) -> Vec<Shape> {
        self.iter().cloned().collect()
    }

    pub fn position_of(&self, shape_id: &ShapeId) -> Option<usize> {
        self.iter().position(|shape| shape.id() == shape_id)
    }

    // ───────────────────────────────────────────────────────────────
    // Observers
    // ───────────────────────────────────────────────────────────────

    pub fn observe<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&DocEvent<'_>) + Send + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Stop delivery to `id`. Returns false if it was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn emit(&mut self, update: &Update, local: bool, changes: &[Change]) {
        let event = DocEvent {
            update,
            local,
            changes,
        };
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Local mutation
    // ───────────────────────────────────────────────────────────────

    /// Apply a UI mutation immediately and return the update to transmit.
    ///
    /// Never fails: inserts past the end are clamped, replace/delete past
    /// the end produce an empty update.
    pub fn apply_local(&mut self, op: LocalOp) -> Update {
        self.transact(|tx| tx.apply(op))
    }

    /// Group several local mutations into one update.
    pub fn transact<F>(&mut self, f: F) -> Update
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        let mut tx = Transaction {
            doc: self,
            ops: Vec::new(),
            changes: Vec::new(),
        };
        f(&mut tx);
        let Transaction { ops, changes, .. } = tx;
        self.commit_local(ops, changes)
    }

    fn commit_local(&mut self, ops: Vec<Op>, changes: Vec<Change>) -> Update {
        if ops.is_empty() {
            return Update::empty(self.actor.clone(), self.clock.current());
        }
        let clock = self.clock.tick();
        self.state_vector.observe(&self.actor, clock);
        let update = Update::new(self.actor.clone(), clock, ops);
        self.emit(&update, true, &changes);
        update
    }

    // ───────────────────────────────────────────────────────────────
    // Remote integration
    // ───────────────────────────────────────────────────────────────

    /// Merge an update from a peer. Idempotent and order-independent.
    ///
    /// An update whose stamp or element clocks exceed [`MAX_REMOTE_CLOCK`]
    /// is refused as a whole and counted in [`ApplyReport::rejected`].
    pub fn apply_remote(&mut self, update: &Update) -> ApplyReport {
        let mut report = ApplyReport::default();
        if let Some(clock) = out_of_range_clock(update) {
            log::error!(
                "Rejected update {}@{}: clock {clock} exceeds {MAX_REMOTE_CLOCK}",
                update.clock,
                update.origin
            );
            report.rejected = update.len().max(1);
            return report;
        }
        self.clock.observe(update.clock);
        if update.is_empty() {
            return report;
        }

        if let Some(rest) = self.integrate_update(update, &mut report) {
            let already_parked = self
                .pending
                .iter()
                .any(|p| p.origin == update.origin && p.clock == update.clock);
            if already_parked {
                report.duplicates += rest.len();
            } else {
                report.parked += rest.len();
                log::debug!(
                    "Parked {} ops from {} waiting for anchors",
                    rest.len(),
                    update.origin
                );
                self.pending.push(rest);
            }
        }
        if report.integrated > 0 && !self.pending.is_empty() {
            self.drain_pending(&mut report);
        }
        report
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> ApplyReport {
        let mut report = ApplyReport::default();
        for update in &snapshot.updates {
            report.merge(self.apply_remote(update));
        }
        report
    }

    /// Integrate what can be integrated; return the remainder, if any.
    fn integrate_update(&mut self, update: &Update, report: &mut ApplyReport) -> Option<Update> {
        let mut integrated = Vec::new();
        let mut parked = Vec::new();
        let mut changes = Vec::new();

        for op in &update.ops {
            match op {
                Op::Insert { id, anchor, shape } => {
                    self.clock.observe(id.clock);
                    if self.known.contains(id) {
                        report.duplicates += 1;
                        continue;
                    }
                    if anchor.as_ref().is_some_and(|a| !self.known.contains(a)) {
                        parked.push(op.clone());
                        continue;
                    }
                    if let Some(change) = self.integrate_insert(id, anchor.as_ref(), shape) {
                        changes.push(change);
                    }
                    integrated.push(op.clone());
                }
                Op::Delete { id } => {
                    if self.deleted.contains(id) {
                        report.duplicates += 1;
                        continue;
                    }
                    if let Some(change) = self.integrate_delete(id) {
                        changes.push(change);
                    }
                    integrated.push(op.clone());
                }
            }
        }

        report.integrated += integrated.len();
        if parked.is_empty() {
            self.state_vector.observe(&update.origin, update.clock);
        }
        if !integrated.is_empty() {
            let applied = Update::new(update.origin.clone(), update.clock, integrated);
            self.emit(&applied, false, &changes);
        }

        (!parked.is_empty()).then(|| Update::new(update.origin.clone(), update.clock, parked))
    }

    fn drain_pending(&mut self, report: &mut ApplyReport) {
        loop {
            let waiting = std::mem::take(&mut self.pending);
            let mut progressed = false;
            for update in waiting {
                match self.integrate_update(&update, report) {
                    Some(rest) => {
                        progressed |= rest.len() < update.len();
                        self.pending.push(rest);
                    }
                    None => progressed = true,
                }
            }
            if !progressed || self.pending.is_empty() {
                break;
            }
        }
    }

    /// Place a new element. The anchor must already be integrated.
    fn integrate_insert(
        &mut self,
        id: &ElementId,
        anchor: Option<&ElementId>,
        shape: &Shape,
    ) -> Option<Change> {
        let mut raw = match anchor {
            None => 0,
            Some(anchor) => self.raw_index(anchor).map_or(self.elements.len(), |i| i + 1),
        };
        while raw < self.elements.len() && self.elements[raw].id > *id {
            raw += 1;
        }

        let deleted = self.deleted.contains(id);
        let change = (!deleted).then(|| Change::Inserted {
            position: self.visible_before(raw),
            shape_id: shape.id().clone(),
        });

        self.elements.insert(
            raw,
            Element {
                id: id.clone(),
                anchor: anchor.cloned(),
                shape: shape.clone(),
                deleted,
            },
        );
        self.known.insert(id.clone());
        if !deleted {
            self.visible += 1;
        }
        change
    }

    fn integrate_delete(&mut self, id: &ElementId) -> Option<Change> {
        self.deleted.insert(id.clone());
        let raw = self.raw_index(id)?;
        if self.elements[raw].deleted {
            return None;
        }
        let position = self.visible_before(raw);
        let element = &mut self.elements[raw];
        element.deleted = true;
        self.visible -= 1;
        Some(Change::Removed {
            position,
            shape_id: element.shape.id().clone(),
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Snapshots
    // ───────────────────────────────────────────────────────────────

    /// Full state as one synthetic update, tombstones and parked ops included.
    ///
    /// Elements are listed in document order, which always puts an anchor
    /// before the elements placed after it.
    pub fn snapshot(&self) -> Snapshot {
        let mut ops: Vec<Op> = self
            .elements
            .iter()
            .map(|e| Op::Insert {
                id: e.id.clone(),
                anchor: e.anchor.clone(),
                shape: e.shape.clone(),
            })
            .collect();

        let mut deleted: Vec<&ElementId> = self.deleted.iter().collect();
        deleted.sort();
        ops.extend(deleted.into_iter().map(|id| Op::Delete { id: id.clone() }));

        let mut updates = vec![Update::new(self.actor.clone(), self.clock.current(), ops)];
        updates.extend(self.pending.iter().cloned());
        Snapshot::new(updates)
    }

    /// Snapshot under a fresh stamp of this replica, for republishing the
    /// whole state to a room.
    pub fn stamped_snapshot(&mut self) -> Snapshot {
        let clock = self.clock.tick();
        self.state_vector.observe(&self.actor, clock);
        let mut snapshot = self.snapshot();
        if let Some(head) = snapshot.updates.first_mut() {
            head.clock = clock;
        }
        snapshot
    }

    // ───────────────────────────────────────────────────────────────
    // Lookups
    // ───────────────────────────────────────────────────────────────

    fn raw_index(&self, id: &ElementId) -> Option<usize> {
        if !self.known.contains(id) {
            return None;
        }
        self.elements.iter().position(|e| e.id == *id)
    }

    fn visible_before(&self, raw: usize) -> usize {
        self.elements[..raw].iter().filter(|e| !e.deleted).count()
    }

    fn raw_of_visible(&self, position: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .nth(position)
            .map(|(raw, _)| raw)
    }

    pub(crate) fn is_visible(&self, id: &ElementId) -> bool {
        self.raw_index(id).is_some_and(|raw| !self.elements[raw].deleted)
    }

    /// Record of an element, tombstoned or not.
    pub(crate) fn element_shape(&self, id: &ElementId) -> Option<&Shape> {
        self.raw_index(id).map(|raw| &self.elements[raw].shape)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("actor", &self.actor)
            .field("clock", &self.clock.current())
            .field("visible", &self.visible)
            .field("tombstones", &self.tombstone_count())
            .field("pending", &self.pending_count())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Local mutations collected into one update.
pub struct Transaction<'doc> {
    doc: &'doc mut Document,
    ops: Vec<Op>,
    changes: Vec<Change>,
}

impl Transaction<'_> {
    pub fn len(&self) -> usize {
        self.doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Shape> {
        self.doc.get(position)
    }

    pub fn apply(&mut self, op: LocalOp) {
        match op {
            LocalOp::InsertAt(position, shape) => {
                self.insert_at(position, shape);
            }
            LocalOp::ReplaceAt(position, shape) => {
                if !self.replace_at(position, shape) {
                    log::warn!("Replace at {position} ignored: document has {} shapes", self.len());
                }
            }
            LocalOp::DeleteAt(position) => {
                if self.delete_at(position).is_none() {
                    log::warn!("Delete at {position} ignored: document has {} shapes", self.len());
                }
            }
            LocalOp::Push(shape) => {
                self.push(shape);
            }
        }
    }

    /// Insert at a visible position, clamped to the end.
    pub fn insert_at(&mut self, position: usize, shape: Shape) -> ElementId {
        let position = position.min(self.doc.len());
        let anchor = match position {
            0 => None,
            p => self.visible_id(p - 1),
        };
        self.insert_after(anchor, shape)
    }

    pub fn push(&mut self, shape: Shape) -> ElementId {
        let end = self.doc.len();
        self.insert_at(end, shape)
    }

    /// Swap the record at `position` for `shape`, keeping its place.
    pub fn replace_at(&mut self, position: usize, shape: Shape) -> bool {
        let Some(old) = self.visible_id(position) else {
            return false;
        };
        self.delete_element(&old);
        self.insert_after(Some(old), shape);
        true
    }

    pub fn delete_at(&mut self, position: usize) -> Option<Shape> {
        let id = self.visible_id(position)?;
        let shape = self.doc.element_shape(&id).cloned();
        self.delete_element(&id);
        shape
    }

    fn visible_id(&self, position: usize) -> Option<ElementId> {
        self.doc
            .raw_of_visible(position)
            .map(|raw| self.doc.elements[raw].id.clone())
    }

    pub(crate) fn insert_after(&mut self, anchor: Option<ElementId>, shape: Shape) -> ElementId {
        let clock = self.doc.clock.tick();
        let id = ElementId::new(clock, self.doc.actor.clone());
        if let Some(change) = self.doc.integrate_insert(&id, anchor.as_ref(), &shape) {
            self.changes.push(change);
        }
        self.ops.push(Op::Insert {
            id: id.clone(),
            anchor,
            shape,
        });
        id
    }

    /// Tombstone a visible element. False if it is unknown or already deleted.
    pub(crate) fn delete_element(&mut self, id: &ElementId) -> bool {
        if !self.doc.is_visible(id) {
            return false;
        }
        if let Some(change) = self.doc.integrate_delete(id) {
            self.changes.push(change);
        }
        self.ops.push(Op::Delete { id: id.clone() });
        true
    }

    pub(crate) fn is_visible(&self, id: &ElementId) -> bool {
        self.doc.is_visible(id)
    }

    pub(crate) fn element_shape(&self, id: &ElementId) -> Option<&Shape> {
        self.doc.element_shape(id)
    }
}
