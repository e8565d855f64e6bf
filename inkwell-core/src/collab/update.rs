//! Updates: the unit of network transmission and of undo.

use serde::{Deserialize, Serialize};

use super::ids::{ActorId, ElementId};
use crate::Shape;

/// One primitive change against the replicated sequence.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Op {
    /// Place `shape` right after `anchor` (`None` = sequence head).
    Insert {
        id: ElementId,
        anchor: Option<ElementId>,
        shape: Shape,
    },
    /// Tombstone the element `id`.
    Delete { id: ElementId },
}

impl Op {
    pub fn element(&self) -> &ElementId {
        match self {
            Op::Insert { id, .. } | Op::Delete { id } => id,
        }
    }
}

/// An atomic delta produced by one transaction.
///
/// `origin` names the actor that produced it; `clock` is its Lamport stamp
/// (the causal-position marker), at least as large as every element id it
/// inserts.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Update {
    pub origin: ActorId,
    pub clock: u64,
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(origin: ActorId, clock: u64, ops: Vec<Op>) -> Self {
        Self { origin, clock, ops }
    }

    pub fn empty(origin: ActorId, clock: u64) -> Self {
        Self::new(origin, clock, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn inserts(&self) -> impl Iterator<Item = (&ElementId, &Shape)> {
        self.ops.iter().filter_map(|op| match op {
            Op::Insert { id, shape, .. } => Some((id, shape)),
            Op::Delete { .. } => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &ElementId> {
        self.ops.iter().filter_map(|op| match op {
            Op::Delete { id } => Some(id),
            Op::Insert { .. } => None,
        })
    }
}

/// Mutation requested by the UI, expressed against visible positions.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalOp {
    InsertAt(usize, Shape),
    ReplaceAt(usize, Shape),
    DeleteAt(usize),
    /// Append at the end of the sequence.
    Push(Shape),
}

/// Full state in update form, enough for a fresh replica to bootstrap.
///
/// A document exports itself as one synthetic update; the relay builds a
/// snapshot from its raw backlog, so a snapshot may hold many updates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub updates: Vec<Update>,
}

impl Snapshot {
    pub fn new(updates: Vec<Update>) -> Self {
        Self { updates }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(Update::is_empty)
    }
}
