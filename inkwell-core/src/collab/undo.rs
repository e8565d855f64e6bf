//! Undo/redo scoped to one origin.
//!
//! Only updates produced by the tracked origin are recorded; remote edits
//! are never undone. Entries store net effects (element ids inserted and
//! deleted) rather than positions, and inverses are applied as ordinary
//! local transactions so they replicate like any other edit.
//!
//! ```text
//!  record_local ──► [entry][entry][entry]   undo stack
//!                                  │ undo: inverse via Transaction
//!                                  ▼
//!                   [entry][entry]          redo stack
//! ```
//!
//! Updates arriving within `capture_timeout` of the previous one merge into
//! the same entry, so a drag that replaces the record on every pointer move
//! undoes as one step.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::document::Document;
use super::ids::{ActorId, ElementId};
use super::update::Update;
use crate::ShapeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UndoError {
    #[error("nothing to undo or redo")]
    Unavailable,
}

/// Undo scope configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoConfig {
    /// Oldest entries are evicted past this depth.
    pub max_depth: usize,
    /// Updates closer together than this merge into one entry.
    pub capture_timeout: Duration,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_depth: 100,
            capture_timeout: Duration::from_millis(500),
        }
    }
}

impl UndoConfig {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_capture_timeout(mut self, capture_timeout: Duration) -> Self {
        self.capture_timeout = capture_timeout;
        self
    }
}

#[derive(Debug, Clone)]
struct StackItem {
    inserted: Vec<ElementId>,
    deleted: Vec<ElementId>,
    last_change: Instant,
}

impl StackItem {
    fn new(now: Instant) -> Self {
        Self {
            inserted: Vec::new(),
            deleted: Vec::new(),
            last_change: now,
        }
    }

    fn absorb(&mut self, update: &Update) {
        for (id, _) in update.inserts() {
            self.inserted.push(id.clone());
        }
        for id in update.deletes() {
            // deleting something this entry inserted cancels out
            match self.inserted.iter().position(|inserted| inserted == id) {
                Some(i) => {
                    self.inserted.remove(i);
                }
                None => self.deleted.push(id.clone()),
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

pub struct UndoManager {
    tracked: ActorId,
    config: UndoConfig,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    /// Restored element -> the element that now stands in for it.
    redone: HashMap<ElementId, ElementId>,
    capture_stopped: bool,
}

impl UndoManager {
    pub fn new(tracked: ActorId, config: UndoConfig) -> Self {
        Self {
            tracked,
            config,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            redone: HashMap::new(),
            capture_stopped: false,
        }
    }

    pub fn tracked_origin(&self) -> &ActorId {
        &self.tracked
    }

    pub fn config(&self) -> &UndoConfig {
        &self.config
    }

    /// Record an update produced locally. Returns false if it was ignored.
    pub fn record_local(&mut self, update: &Update) -> bool {
        if update.origin != self.tracked || update.is_empty() {
            return false;
        }
        let now = Instant::now();
        self.redo_stack.clear();

        let merge = !self.capture_stopped
            && self
                .undo_stack
                .last()
                .is_some_and(|top| now.duration_since(top.last_change) < self.config.capture_timeout);
        self.capture_stopped = false;

        if !merge {
            self.undo_stack.push(StackItem::new(now));
            if self.undo_stack.len() > self.config.max_depth {
                self.undo_stack.remove(0);
            }
        }
        if let Some(top) = self.undo_stack.last_mut() {
            top.absorb(update);
            top.last_change = now;
            if top.is_empty() {
                self.undo_stack.pop();
            }
        }
        true
    }

    /// Force the next recorded update into a fresh entry.
    pub fn stop_capturing(&mut self) {
        self.capture_stopped = true;
    }

    pub fn undo(&mut self, doc: &mut Document) -> Result<Update, UndoError> {
        while let Some(item) = self.undo_stack.pop() {
            let (update, inverse) = apply_inverse(doc, &item, &mut self.redone);
            if !update.is_empty() {
                log::debug!("Undo applied {} ops", update.len());
                self.redo_stack.push(inverse);
                self.capture_stopped = true;
                return Ok(update);
            }
        }
        Err(UndoError::Unavailable)
    }

    pub fn redo(&mut self, doc: &mut Document) -> Result<Update, UndoError> {
        while let Some(item) = self.redo_stack.pop() {
            let (update, inverse) = apply_inverse(doc, &item, &mut self.redone);
            if !update.is_empty() {
                log::debug!("Redo applied {} ops", update.len());
                self.undo_stack.push(inverse);
                if self.undo_stack.len() > self.config.max_depth {
                    self.undo_stack.remove(0);
                }
                self.capture_stopped = true;
                return Ok(update);
            }
        }
        Err(UndoError::Unavailable)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.redone.clear();
        self.capture_stopped = false;
    }
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoManager")
            .field("tracked", &self.tracked)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .finish()
    }
}

fn resolve(redone: &HashMap<ElementId, ElementId>, id: &ElementId) -> ElementId {
    let mut current = id;
    while let Some(next) = redone.get(current) {
        current = next;
    }
    current.clone()
}

/// Apply the inverse of `item` as one local transaction.
///
/// Returns the transmitted update and the entry that reverts it.
fn apply_inverse(
    doc: &mut Document,
    item: &StackItem,
    redone: &mut HashMap<ElementId, ElementId>,
) -> (Update, StackItem) {
    let mut inverse = StackItem::new(Instant::now());
    let mut superseded: HashSet<ShapeId> = HashSet::new();

    let update = doc.transact(|tx| {
        for id in &item.inserted {
            let target = resolve(redone, id);
            if tx.is_visible(&target) {
                tx.delete_element(&target);
                inverse.deleted.push(target);
            } else if let Some(shape) = tx.element_shape(&target) {
                // someone else removed it; leave its earlier versions alone too
                superseded.insert(shape.id().clone());
            }
        }

        for id in &item.deleted {
            let target = resolve(redone, id);
            if tx.is_visible(&target) {
                continue;
            }
            let Some(shape) = tx.element_shape(&target).cloned() else {
                continue;
            };
            if superseded.contains(shape.id()) {
                continue;
            }
            let restored = tx.insert_after(Some(target.clone()), shape);
            redone.insert(target, restored.clone());
            inverse.inserted.push(restored);
        }
    });

    (update, inverse)
}
