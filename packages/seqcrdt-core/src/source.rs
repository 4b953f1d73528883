use bytes::Bytes;
use tracing::{debug, trace};

use crate::codec::{decode_anchor, decode_tree, encode_anchor, encode_tree};
use crate::error::{Error, Result};
use crate::ids::{Located, Position, ReplicaId, Side};
use crate::ops::Anchor;
use crate::traits::SlotCount;
use crate::tree::{slot_span, Placement, Segment, WaypointTree};

/// Detached mode: hands out positions for values the caller stores elsewhere.
///
/// Creating a position does not change local state. The caller broadcasts the start
/// position and optional metadata, and every replica (including this one) feeds them to
/// [`PositionSource::receive_positions`] or [`PositionSource::receive_and_add_positions`].
#[derive(Clone, Debug)]
pub struct PositionSource {
    replica_id: ReplicaId,
    tree: WaypointTree<SlotCount>,
}

impl PositionSource {
    pub fn new(replica_id: ReplicaId) -> Result<Self> {
        Self::with_initial(replica_id, 0)
    }

    /// Starts with `initial` present positions `("", 0, 1..=initial)` shared by all replicas.
    pub fn with_initial(replica_id: ReplicaId, initial: usize) -> Result<Self> {
        if replica_id.is_root() {
            return Err(Error::InvalidOperation(
                "replica id must not be empty".into(),
            ));
        }
        let initial = (initial > 0).then_some(Segment::Present(SlotCount(initial)));
        Ok(Self {
            replica_id,
            tree: WaypointTree::with_initial(initial),
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

    pub fn create_position(&self, index: usize) -> Result<(Position, Option<Bytes>)> {
        self.create_positions(index, 1)
    }

    /// Start of `count` consecutive new positions that would land at `index`, plus the
    /// metadata needed to receive them when they open a new waypoint.
    pub fn create_positions(
        &self,
        index: usize,
        count: usize,
    ) -> Result<(Position, Option<Bytes>)> {
        if count == 0 {
            return Err(Error::InvalidOperation("nothing to create".into()));
        }
        let span = slot_span(count)?;
        match self.tree.place(index, &self.replica_id)? {
            Placement::Append { waypoint, side } => {
                let wp = &self.tree.waypoints[waypoint];
                let slot = match side {
                    Side::Right => wp.end(),
                    Side::Left => wp.start.checked_sub(span).ok_or_else(|| {
                        Error::InvalidOperation(format!("{count} slots do not fit left of slot 0"))
                    })?,
                };
                Ok((Position::new(&wp.sender, wp.counter, slot), None))
            }
            Placement::Create { parent, slot, side } => {
                let parent = &self.tree.waypoints[parent];
                let anchor = Anchor {
                    sender: (parent.sender != self.replica_id).then(|| parent.sender.clone()),
                    counter: parent.counter,
                    slot,
                    side,
                };
                let counter = self.tree.next_counter(&self.replica_id);
                Ok((
                    Position::new(&self.replica_id, counter, 0),
                    Some(encode_anchor(&anchor)),
                ))
            }
        }
    }

    /// Records `count` positions starting at `start` as known but not present.
    pub fn receive_positions(
        &mut self,
        start: &Position,
        count: usize,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.receive(start, count, metadata, Segment::Absent(count))
    }

    /// Like [`PositionSource::receive_positions`], with every new position present.
    pub fn receive_and_add_positions(
        &mut self,
        start: &Position,
        count: usize,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        self.receive(start, count, metadata, Segment::Present(SlotCount(count)))
    }

    /// Marks a known position present. Returns whether it was absent.
    pub fn add(&mut self, position: &Position) -> Result<bool> {
        self.set_presence(position, Segment::Present(SlotCount(1)))
    }

    /// Marks a known position absent. Returns whether it was present.
    pub fn delete(&mut self, position: &Position) -> Result<bool> {
        self.set_presence(position, Segment::Absent(1))
    }

    /// Position of the present slot at `index`.
    pub fn get(&self, index: usize) -> Result<Position> {
        let cursor = self.tree.locate(index)?;
        Ok(self.tree.position_at(&cursor))
    }

    pub fn find(&self, position: &Position) -> Result<Located> {
        let waypoint = self.tree.lookup(&position.sender, position.counter)?;
        self.tree.find(waypoint, position.slot)
    }

    /// Present positions in list order.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        self.tree.runs().flat_map(|run| {
            let first = Position::new(&run.waypoint.sender, run.waypoint.counter, run.start);
            (0..run.slots.0 as i64).map(move |i| first.offset(i))
        })
    }

    pub fn save(&self) -> Bytes {
        encode_tree(&self.tree)
    }

    /// Restore a saved state. Only valid before any position was received.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        if !self.tree.is_pristine() {
            return Err(Error::InvalidOperation(
                "load requires an empty position source".into(),
            ));
        }
        self.tree = decode_tree(data)?;
        Ok(())
    }

    pub fn validate_invariants(&self) -> Result<()> {
        self.tree.validate_invariants()
    }

    fn receive(
        &mut self,
        start: &Position,
        count: usize,
        metadata: Option<&[u8]>,
        segment: Segment<SlotCount>,
    ) -> Result<()> {
        let result = self.receive_inner(start, count, metadata, segment);
        if let Err(err) = &result {
            debug!(
                sender = %start.sender,
                counter = start.counter,
                slot = start.slot,
                %err,
                "rejected positions"
            );
        }
        result
    }

    fn receive_inner(
        &mut self,
        start: &Position,
        count: usize,
        metadata: Option<&[u8]>,
        segment: Segment<SlotCount>,
    ) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidOperation("no positions to receive".into()));
        }
        let span = slot_span(count)?;
        match metadata {
            Some(metadata) => {
                let anchor = decode_anchor(metadata)?;
                self.tree.expect_counter(&start.sender, start.counter)?;
                if start.slot != 0 {
                    return Err(Error::OutOfOrderSlot {
                        expected: 0,
                        got: start.slot,
                    });
                }
                trace!(
                    sender = %start.sender,
                    counter = start.counter,
                    ?anchor,
                    count,
                    "receive new waypoint"
                );
                let parent = self
                    .tree
                    .lookup(anchor.resolve_sender(&start.sender), anchor.counter)?;
                self.tree
                    .create(
                        &start.sender,
                        start.counter,
                        parent,
                        anchor.slot,
                        anchor.side,
                        segment,
                    )
                    .map(|_| ())
            }
            None => {
                let waypoint = self.tree.lookup(&start.sender, start.counter)?;
                let wp = &self.tree.waypoints[waypoint];
                let side = if start.slot == wp.end() {
                    Side::Right
                } else if start.slot.checked_add(span) == Some(wp.start) {
                    Side::Left
                } else {
                    return Err(Error::OutOfOrderSlot {
                        expected: wp.end(),
                        got: start.slot,
                    });
                };
                trace!(
                    sender = %start.sender,
                    counter = start.counter,
                    ?side,
                    count,
                    "receive append"
                );
                self.tree.append(waypoint, side, segment)
            }
        }
    }

    fn set_presence(
        &mut self,
        position: &Position,
        replacement: Segment<SlotCount>,
    ) -> Result<bool> {
        let waypoint = self.tree.lookup(&position.sender, position.counter)?;
        let changed = self
            .tree
            .set_slot(waypoint, position.slot, replacement)?
            .is_some();
        trace!(?position, changed, "set presence");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> PositionSource {
        PositionSource::new(ReplicaId::new(name.as_bytes())).unwrap()
    }

    fn create_and_receive(src: &mut PositionSource, index: usize, count: usize) -> Position {
        let (start, metadata) = src.create_positions(index, count).unwrap();
        src.receive_and_add_positions(&start, count, metadata.as_deref())
            .unwrap();
        start
    }

    #[test]
    fn creating_does_not_change_local_state() {
        let src = source("a");
        let (start, metadata) = src.create_position(0).unwrap();
        assert_eq!(start, Position::new(&ReplicaId::new("a"), 0, 0));
        assert!(metadata.is_some());
        assert!(src.is_empty());
    }

    #[test]
    fn appends_carry_no_metadata_and_infer_their_side() {
        let mut src = source("a");
        create_and_receive(&mut src, 0, 2);
        let (right, meta) = src.create_positions(2, 3).unwrap();
        assert!(meta.is_none());
        assert_eq!(right.slot, 2);
        src.receive_and_add_positions(&right, 3, None).unwrap();

        let (left, meta) = src.create_positions(0, 2).unwrap();
        assert!(meta.is_none());
        assert_eq!(left.slot, -2);
        src.receive_positions(&left, 2, None).unwrap();

        assert_eq!(src.len(), 5);
        let slots: Vec<i64> = src.positions().map(|p| p.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert!(src.add(&left).unwrap());
        assert!(!src.add(&left).unwrap());
        assert_eq!(src.get(0).unwrap(), left);
        src.validate_invariants().unwrap();
    }

    #[test]
    fn gaps_in_appended_slots_are_rejected() {
        let mut src = source("a");
        let start = create_and_receive(&mut src, 0, 1);
        let err = src.receive_positions(&start.offset(3), 1, None).unwrap_err();
        assert_eq!(err, Error::OutOfOrderSlot { expected: 1, got: 3 });
    }

    #[test]
    fn initial_positions_live_on_the_root() {
        let src = PositionSource::with_initial(ReplicaId::new("a"), 3).unwrap();
        let positions: Vec<Position> = src.positions().collect();
        let root = ReplicaId::root();
        assert_eq!(
            positions,
            vec![
                Position::new(&root, 0, 1),
                Position::new(&root, 0, 2),
                Position::new(&root, 0, 3)
            ]
        );
        assert_eq!(src.find(&positions[2]).unwrap(), Located { index: 2, present: true });
    }

    #[test]
    fn root_sentinel_cannot_be_added() {
        let mut src = source("a");
        let sentinel = Position::new(&ReplicaId::root(), 0, 0);
        assert!(matches!(src.add(&sentinel), Err(Error::InvalidOperation(_))));
    }
}
