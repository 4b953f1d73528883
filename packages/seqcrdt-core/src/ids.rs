use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unique identifier for a replica. Backed by raw bytes to support arbitrary identity formats.
///
/// The empty id is reserved for the root waypoint.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReplicaId(pub Vec<u8>);

impl ReplicaId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The reserved sender of the root waypoint.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// Which side of its parent slot a slot or waypoint hangs from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Side::Left),
            1 => Some(Side::Right),
            _ => None,
        }
    }
}

/// Permanent, portable identifier for one slot: `(sender, counter, slot)`.
///
/// Slots are signed: a waypoint grows to the right with `1, 2, ..` and to the left with
/// `-1, -2, ..`, so a position never has to be renumbered.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Position {
    pub sender: ReplicaId,
    pub counter: u64,
    pub slot: i64,
}

impl Position {
    pub fn new(sender: &ReplicaId, counter: u64, slot: i64) -> Self {
        Self {
            sender: sender.clone(),
            counter,
            slot,
        }
    }

    /// Position `offset` slots to the right of this one within the same waypoint.
    ///
    /// Saturates at the `i64` bounds; no waypoint ever owns those slots.
    pub fn offset(&self, offset: i64) -> Self {
        Self {
            sender: self.sender.clone(),
            counter: self.counter,
            slot: self.slot.saturating_add(offset),
        }
    }
}

/// Result of looking up a position: its current index and whether it is present.
///
/// For an absent position `index` is the index the slot would occupy if it were present.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Located {
    pub index: usize,
    pub present: bool,
}
