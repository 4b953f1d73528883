use crate::ids::{ReplicaId, Side};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Where a new waypoint attaches: a slot of an existing waypoint plus the side.
///
/// `sender` is omitted when it equals the origin of the enclosing message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Anchor {
    #[cfg_attr(feature = "serde", serde(default))]
    pub sender: Option<ReplicaId>,
    pub counter: u64,
    pub slot: i64,
    pub side: Side,
}

impl Anchor {
    /// Sender of the anchor waypoint, falling back to the message origin.
    pub fn resolve_sender<'a>(&'a self, origin: &'a ReplicaId) -> &'a ReplicaId {
        self.sender.as_ref().unwrap_or(origin)
    }
}

/// The list mutations exchanged between replicas in embedded mode.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperationKind<T> {
    /// Extend one of the origin's own waypoints at one end.
    Append {
        counter: u64,
        side: Side,
        values: Vec<T>,
    },
    /// Create the origin's waypoint `counter`, attached at `anchor`.
    Create {
        counter: u64,
        anchor: Anchor,
        values: Vec<T>,
    },
    /// Mark one slot absent. `sender` is omitted when it equals the origin.
    Delete {
        #[cfg_attr(feature = "serde", serde(default))]
        sender: Option<ReplicaId>,
        counter: u64,
        slot: i64,
    },
}

/// Full operation envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Operation<T> {
    pub origin: ReplicaId,
    pub kind: OperationKind<T>,
}

impl<T> Operation<T> {
    pub fn append(origin: &ReplicaId, counter: u64, side: Side, values: Vec<T>) -> Self {
        Self {
            origin: origin.clone(),
            kind: OperationKind::Append {
                counter,
                side,
                values,
            },
        }
    }

    pub fn create(origin: &ReplicaId, counter: u64, anchor: Anchor, values: Vec<T>) -> Self {
        Self {
            origin: origin.clone(),
            kind: OperationKind::Create {
                counter,
                anchor,
                values,
            },
        }
    }

    pub fn delete(origin: &ReplicaId, sender: &ReplicaId, counter: u64, slot: i64) -> Self {
        Self {
            origin: origin.clone(),
            kind: OperationKind::Delete {
                sender: (sender != origin).then(|| sender.clone()),
                counter,
                slot,
            },
        }
    }
}
