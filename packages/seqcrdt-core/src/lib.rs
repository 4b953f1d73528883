#![forbid(unsafe_code)]
//! Causal position tree for replicated lists and text.
//!
//! Every element gets a permanent position `(sender, counter, slot)` in a tree of waypoints.
//! Concurrent inserts and deletes converge to the same order on every replica as long as
//! operations are delivered in causal order. The tree can hold the values itself
//! ([`ListCrdt`]) or only hand out positions for values kept elsewhere ([`PositionSource`]).

pub mod error;
pub mod ids;
pub mod list;
pub mod ops;
pub mod source;
pub mod traits;

mod codec;
mod tree;

pub use error::{Error, Result};
pub use ids::{Located, Position, ReplicaId, Side};
pub use list::ListCrdt;
pub use ops::{Anchor, Operation, OperationKind};
pub use source::PositionSource;
pub use traits::{Payload, SlotCount, Slots};
