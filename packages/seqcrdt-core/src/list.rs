use bytes::Bytes;
use tracing::{debug, trace};

use crate::codec::{decode_tree, encode_tree};
use crate::error::{Error, Result};
use crate::ids::{Located, Position, ReplicaId};
use crate::ops::{Anchor, Operation, OperationKind};
use crate::traits::Payload;
use crate::tree::{Entry, Placement, Segment, WaypointTree};

/// Replicated list that stores its values inside the waypoint tree.
///
/// Local edits are applied immediately and returned as operations for the caller to
/// broadcast; peers feed them to [`ListCrdt::apply_remote`] in causal order.
#[derive(Clone, Debug)]
pub struct ListCrdt<T> {
    replica_id: ReplicaId,
    tree: WaypointTree<Vec<T>>,
}

impl<T: Payload> ListCrdt<T> {
    pub fn new(replica_id: ReplicaId) -> Result<Self> {
        if replica_id.is_root() {
            return Err(Error::InvalidOperation(
                "replica id must not be empty".into(),
            ));
        }
        Ok(Self {
            replica_id,
            tree: WaypointTree::new(),
        })
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `value` so that it ends up at `index`.
    pub fn insert(&mut self, index: usize, value: T) -> Result<Operation<T>> {
        self.insert_many(index, vec![value])
    }

    /// Insert `values` as a contiguous run starting at `index`.
    pub fn insert_many(&mut self, index: usize, values: Vec<T>) -> Result<Operation<T>> {
        if values.is_empty() {
            return Err(Error::InvalidOperation("nothing to insert".into()));
        }
        let replica = self.replica_id.clone();
        let op = match self.tree.place(index, &replica)? {
            Placement::Append { waypoint, side } => {
                let counter = self.tree.waypoints[waypoint].counter;
                Operation::append(&replica, counter, side, values)
            }
            Placement::Create { parent, slot, side } => {
                let parent = &self.tree.waypoints[parent];
                let anchor = Anchor {
                    sender: (parent.sender != replica).then(|| parent.sender.clone()),
                    counter: parent.counter,
                    slot,
                    side,
                };
                let counter = self.tree.next_counter(&replica);
                Operation::create(&replica, counter, anchor, values)
            }
        };
        self.commit_local(op)
    }

    /// Delete the value at `index`.
    pub fn delete(&mut self, index: usize) -> Result<Operation<T>> {
        let position = self.position(index)?;
        let op = Operation::delete(
            &self.replica_id,
            &position.sender,
            position.counter,
            position.slot,
        );
        self.commit_local(op)
    }

    /// Delete `count` values starting at `start`, one operation per value, back to front.
    pub fn delete_range(&mut self, start: usize, count: usize) -> Result<Vec<Operation<T>>> {
        let len = self.len();
        let end = start.saturating_add(count);
        if end > len {
            return Err(Error::IndexOutOfBounds { index: end, len });
        }
        (start..end).rev().map(|index| self.delete(index)).collect()
    }

    /// Replace `delete_count` values starting at `start` by `values`.
    ///
    /// Returns the deletes followed by the insert, if any. Nothing changes when the range
    /// is out of bounds.
    pub fn splice(
        &mut self,
        start: usize,
        delete_count: usize,
        values: Vec<T>,
    ) -> Result<Vec<Operation<T>>> {
        let len = self.len();
        let end = start.saturating_add(delete_count);
        if end > len {
            return Err(Error::IndexOutOfBounds { index: end, len });
        }
        let mut ops = self.delete_range(start, delete_count)?;
        if !values.is_empty() {
            ops.push(self.insert_many(start, values)?);
        }
        Ok(ops)
    }

    /// Apply an operation received from a remote peer.
    pub fn apply_remote(&mut self, op: Operation<T>) -> Result<()> {
        self.ingest(op)
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        let cursor = self.tree.locate(index)?;
        let value = match &self.tree.waypoints[cursor.waypoint].children[cursor.entry] {
            Entry::Segment(Segment::Present(values)) => values.get(cursor.offset),
            _ => None,
        };
        value.ok_or_else(|| {
            Error::InconsistentState(format!("index {index} resolved to no value"))
        })
    }

    /// Permanent position of the value at `index`.
    pub fn position(&self, index: usize) -> Result<Position> {
        let cursor = self.tree.locate(index)?;
        Ok(self.tree.position_at(&cursor))
    }

    /// Current index of `position`, also for deleted positions.
    pub fn find(&self, position: &Position) -> Result<Located> {
        let waypoint = self.tree.lookup(&position.sender, position.counter)?;
        self.tree.find(waypoint, position.slot)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.tree.runs().flat_map(|run| run.slots.iter())
    }

    /// Present values with their positions, in list order.
    pub fn entries(&self) -> impl Iterator<Item = (Position, &T)> + '_ {
        self.tree.runs().flat_map(|run| {
            let first = Position::new(&run.waypoint.sender, run.waypoint.counter, run.start);
            run.slots
                .iter()
                .enumerate()
                .map(move |(i, value)| (first.offset(i as i64), value))
        })
    }

    pub fn save(&self) -> Bytes {
        encode_tree(&self.tree)
    }

    /// Restore a saved state. Only valid on a list that has seen no operations yet.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        if !self.tree.is_pristine() {
            return Err(Error::InvalidOperation(
                "load requires an empty list".into(),
            ));
        }
        self.tree = decode_tree(data)?;
        Ok(())
    }

    pub fn validate_invariants(&self) -> Result<()> {
        self.tree.validate_invariants()
    }

    fn commit_local(&mut self, op: Operation<T>) -> Result<Operation<T>> {
        self.ingest(op.clone())?;
        Ok(op)
    }

    fn ingest(&mut self, op: Operation<T>) -> Result<()> {
        let origin = op.origin;
        let result = match op.kind {
            OperationKind::Append {
                counter,
                side,
                values,
            } => {
                trace!(%origin, counter, ?side, count = values.len(), "apply append");
                if values.is_empty() {
                    Err(Error::InvalidOperation("empty append".into()))
                } else {
                    self.tree
                        .lookup(&origin, counter)
                        .and_then(|w| self.tree.append(w, side, Segment::Present(values)))
                }
            }
            OperationKind::Create {
                counter,
                anchor,
                values,
            } => {
                trace!(%origin, counter, ?anchor, count = values.len(), "apply create");
                self.tree.expect_counter(&origin, counter).and_then(|()| {
                    let parent = self
                        .tree
                        .lookup(anchor.resolve_sender(&origin), anchor.counter)?;
                    self.tree
                        .create(
                            &origin,
                            counter,
                            parent,
                            anchor.slot,
                            anchor.side,
                            Segment::Present(values),
                        )
                        .map(|_| ())
                })
            }
            OperationKind::Delete {
                sender,
                counter,
                slot,
            } => {
                let sender = sender.as_ref().unwrap_or(&origin);
                trace!(%origin, %sender, counter, slot, "apply delete");
                self.tree
                    .lookup(sender, counter)
                    .and_then(|w| self.tree.set_slot(w, slot, Segment::Absent(1)))
                    .map(|_| ())
            }
        };
        if let Err(err) = &result {
            debug!(%origin, %err, "rejected operation");
        }
        result
    }
}
