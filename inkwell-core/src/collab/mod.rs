//! Convergence core: replicated document, update codec and undo scope.
//!
//! [`Replica`] bundles a [`Document`] with the [`UndoManager`] tracking its
//! own origin. Local edits go through the replica so they are recorded for
//! undo; remote updates bypass the undo scope entirely.

pub mod codec;
pub mod document;
pub mod ids;
pub mod undo;
pub mod update;

pub use codec::DecodeError;
pub use document::{ApplyReport, Change, DocEvent, Document, ObserverId, Transaction};
pub use ids::{ActorId, ElementId, LamportClock, StateVector, MAX_REMOTE_CLOCK};
pub use undo::{UndoConfig, UndoError, UndoManager};
pub use update::{LocalOp, Op, Snapshot, Update};

use crate::Shape;

/// A document plus the undo scope for its own edits.
pub struct Replica {
    document: Document,
    undo: UndoManager,
}

impl Replica {
    pub fn new(actor: ActorId) -> Self {
        Self::with_undo_config(actor, UndoConfig::default())
    }

    pub fn with_undo_config(actor: ActorId, config: UndoConfig) -> Self {
        Self::from_document(Document::new(actor), config)
    }

    /// Wrap an existing document, e.g. one bootstrapped from a snapshot.
    pub fn from_document(document: Document, config: UndoConfig) -> Self {
        let undo = UndoManager::new(document.actor().clone(), config);
        Self { document, undo }
    }

    pub fn actor(&self) -> &ActorId {
        self.document.actor()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn shapes(&self) -> Vec<Shape> {
        self.document.shapes()
    }

    pub fn state_vector(&self) -> &StateVector {
        self.document.state_vector()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.document.snapshot()
    }

    pub fn stamped_snapshot(&mut self) -> Snapshot {
        self.document.stamped_snapshot()
    }

    pub fn apply_local(&mut self, op: LocalOp) -> Update {
        let update = self.document.apply_local(op);
        self.undo.record_local(&update);
        update
    }

    pub fn transact<F>(&mut self, f: F) -> Update
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        let update = self.document.transact(f);
        self.undo.record_local(&update);
        update
    }

    pub fn apply_remote(&mut self, update: &Update) -> ApplyReport {
        self.document.apply_remote(update)
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> ApplyReport {
        self.document.apply_snapshot(snapshot)
    }

    pub fn undo(&mut self) -> Result<Update, UndoError> {
        self.undo.undo(&mut self.document)
    }

    pub fn redo(&mut self) -> Result<Update, UndoError> {
        self.undo.redo(&mut self.document)
    }

    pub fn stop_capturing(&mut self) {
        self.undo.stop_capturing();
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn observe<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&DocEvent<'_>) + Send + 'static,
    {
        self.document.observe(observer)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.document.unobserve(id)
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("document", &self.document)
            .field("undo", &self.undo)
            .finish()
    }
}
