//! Binary layout for `save`/`load` and for detached anchor metadata.
//!
//! A saved tree is a header followed by parallel arrays, all little-endian:
//!
//! ```text
//! magic "SQCT" | version u8
//! senders: u32 count, then per sender (u32 len, bytes, u32 waypoint count), ascending
//! per non-root waypoint: u32 parent, i64 parent_slot, u8 side
//! per waypoint: i64 start, u64 total, u32 entry count
//! per entry: u8 kind (0 present, 1 absent, 2 waypoint), u64 length or waypoint index
//! contents of every present entry, in entry order
//! ```
//!
//! Waypoints are numbered root first, then by sender and counter, so equal trees save to
//! equal bytes regardless of arrival order.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ids::{ReplicaId, Side};
use crate::ops::Anchor;
use crate::traits::Slots;
use crate::tree::{Entry, Segment, Waypoint, WaypointTree, ROOT};

const MAGIC: &[u8; 4] = b"SQCT";
const VERSION: u8 = 1;

const KIND_PRESENT: u8 = 0;
const KIND_ABSENT: u8 = 1;
const KIND_WAYPOINT: u8 = 2;

/// Smallest encoding of one waypoint's fixed fields, used to bound allocations.
const MIN_WAYPOINT_BYTES: usize = 8 + 8 + 4;

fn truncated(what: &str) -> Error {
    Error::Decode(format!("truncated input while reading {what}"))
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated("u32"));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated("u64"));
    }
    Ok(buf.get_u64_le())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    Ok(get_u64(buf)? as i64)
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(truncated("byte string"));
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_len(buf: &mut Bytes) -> Result<usize> {
    usize::try_from(get_u64(buf)?).map_err(|_| Error::Decode("length overflows usize".into()))
}

fn put_replica(buf: &mut BytesMut, replica: &ReplicaId) {
    buf.put_u32_le(replica.as_bytes().len() as u32);
    buf.put_slice(replica.as_bytes());
}

fn get_replica(buf: &mut Bytes) -> Result<ReplicaId> {
    let len = get_u32(buf)? as usize;
    Ok(ReplicaId::new(take_bytes(buf, len)?.to_vec()))
}

fn get_side(buf: &mut Bytes) -> Result<Side> {
    let tag = get_u8(buf)?;
    Side::from_u8(tag).ok_or_else(|| Error::Decode(format!("invalid side tag {tag}")))
}

pub(crate) fn encode_tree<S: Slots>(tree: &WaypointTree<S>) -> Bytes {
    let mut senders: Vec<(&ReplicaId, &Vec<usize>)> = tree.by_sender.iter().collect();
    senders.sort_by(|a, b| a.0.cmp(b.0));

    let mut order = Vec::with_capacity(tree.waypoints.len());
    order.push(ROOT);
    for (_, indices) in &senders {
        order.extend(indices.iter().copied());
    }
    let mut flat = vec![0u32; tree.waypoints.len()];
    for (i, &arena) in order.iter().enumerate() {
        flat[arena] = i as u32;
    }

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);

    buf.put_u32_le(senders.len() as u32);
    for (sender, indices) in &senders {
        put_replica(&mut buf, sender);
        buf.put_u32_le(indices.len() as u32);
    }

    for &arena in &order[1..] {
        let wp = &tree.waypoints[arena];
        buf.put_u32_le(wp.parent.map_or(0, |p| flat[p]));
        buf.put_i64_le(wp.parent_slot);
        buf.put_u8(wp.side.as_u8());
    }

    for &arena in &order {
        let wp = &tree.waypoints[arena];
        buf.put_i64_le(wp.start);
        buf.put_u64_le(wp.total as u64);
        buf.put_u32_le(wp.children.len() as u32);
    }

    for &arena in &order {
        for entry in &tree.waypoints[arena].children {
            match entry {
                Entry::Segment(Segment::Present(slots)) => {
                    buf.put_u8(KIND_PRESENT);
                    buf.put_u64_le(slots.len() as u64);
                }
                Entry::Segment(Segment::Absent(n)) => {
                    buf.put_u8(KIND_ABSENT);
                    buf.put_u64_le(*n as u64);
                }
                Entry::Waypoint(c) => {
                    buf.put_u8(KIND_WAYPOINT);
                    buf.put_u64_le(u64::from(flat[*c]));
                }
            }
        }
    }

    for &arena in &order {
        for entry in &tree.waypoints[arena].children {
            if let Entry::Segment(Segment::Present(slots)) = entry {
                slots.encode(&mut buf);
            }
        }
    }

    debug!(
        waypoints = order.len(),
        present = tree.len(),
        bytes = buf.len(),
        "saved tree"
    );
    buf.freeze()
}

/// Rebuilds a tree from `encode_tree` output. Nothing is returned unless the decoded
/// structure passes the full invariant check.
pub(crate) fn decode_tree<S: Slots>(data: &[u8]) -> Result<WaypointTree<S>> {
    let mut buf = Bytes::copy_from_slice(data);
    let magic = take_bytes(&mut buf, MAGIC.len())?;
    if magic.as_ref() != MAGIC {
        return Err(Error::Decode("bad magic".into()));
    }
    let version = get_u8(&mut buf)?;
    if version != VERSION {
        return Err(Error::Decode(format!("unsupported version {version}")));
    }

    let sender_count = get_u32(&mut buf)? as usize;
    let mut senders: Vec<(ReplicaId, usize)> =
        Vec::with_capacity(sender_count.min(buf.remaining()));
    for _ in 0..sender_count {
        let sender = get_replica(&mut buf)?;
        let count = get_u32(&mut buf)? as usize;
        if sender.is_root() || count == 0 {
            return Err(Error::Decode("empty sender entry".into()));
        }
        if senders.last().is_some_and(|(prev, _)| *prev >= sender) {
            return Err(Error::Decode("senders are not strictly ascending".into()));
        }
        senders.push((sender, count));
    }

    let count = senders
        .iter()
        .try_fold(1usize, |acc, (_, n)| acc.checked_add(*n))
        .ok_or_else(|| Error::Decode("waypoint count overflows".into()))?;
    if count.saturating_mul(MIN_WAYPOINT_BYTES) > buf.remaining() {
        return Err(truncated("waypoint table"));
    }

    // Allocate every waypoint before linking anything.
    let mut waypoints: Vec<Waypoint<S>> = Vec::with_capacity(count);
    let mut by_sender: HashMap<ReplicaId, Vec<usize>> = HashMap::with_capacity(senders.len());
    waypoints.push(blank(ReplicaId::root(), 0));
    for (sender, n) in &senders {
        let indices = by_sender.entry(sender.clone()).or_default();
        for counter in 0..*n {
            indices.push(waypoints.len());
            waypoints.push(blank(sender.clone(), counter as u64));
        }
    }

    for idx in 1..count {
        let parent = get_u32(&mut buf)? as usize;
        if parent >= count || parent == idx {
            return Err(Error::Decode(format!("waypoint {idx} has invalid parent {parent}")));
        }
        let wp = &mut waypoints[idx];
        wp.parent = Some(parent);
        wp.parent_slot = get_i64(&mut buf)?;
        wp.side = get_side(&mut buf)?;
    }

    let mut entry_counts = Vec::with_capacity(count);
    for wp in waypoints.iter_mut() {
        wp.start = get_i64(&mut buf)?;
        wp.total = get_len(&mut buf)?;
        entry_counts.push(get_u32(&mut buf)? as usize);
    }

    let mut lengths: Vec<Vec<(u8, usize)>> = Vec::with_capacity(count);
    for &entries in &entry_counts {
        if entries.saturating_mul(9) > buf.remaining() {
            return Err(truncated("entries"));
        }
        let mut kinds = Vec::with_capacity(entries);
        for _ in 0..entries {
            let kind = get_u8(&mut buf)?;
            let value = get_len(&mut buf)?;
            match kind {
                KIND_PRESENT | KIND_ABSENT if value == 0 => {
                    return Err(Error::Decode("empty segment".into()))
                }
                KIND_PRESENT | KIND_ABSENT => {}
                KIND_WAYPOINT if value == ROOT || value >= count => {
                    return Err(Error::Decode(format!("invalid child reference {value}")))
                }
                KIND_WAYPOINT => {}
                other => return Err(Error::Decode(format!("invalid entry kind {other}"))),
            }
            kinds.push((kind, value));
        }
        lengths.push(kinds);
    }

    for (idx, kinds) in lengths.into_iter().enumerate() {
        let mut children = Vec::with_capacity(kinds.len());
        let mut slots = 0usize;
        for (kind, value) in kinds {
            let entry = match kind {
                KIND_PRESENT => Entry::Segment(Segment::Present(S::decode(value, &mut buf)?)),
                KIND_ABSENT => Entry::Segment(Segment::Absent(value)),
                _ => Entry::Waypoint(value),
            };
            if let Entry::Segment(seg) = &entry {
                slots = slots
                    .checked_add(seg.len())
                    .ok_or_else(|| Error::Decode("slot count overflows".into()))?;
            }
            children.push(entry);
        }
        let wp = &mut waypoints[idx];
        wp.slots = slots;
        wp.children = children;
    }

    if buf.has_remaining() {
        return Err(Error::Decode(format!("{} trailing bytes", buf.remaining())));
    }

    let tree = WaypointTree {
        waypoints,
        by_sender,
    };
    tree.validate_invariants()
        .map_err(|e| Error::Decode(format!("saved tree is inconsistent: {e}")))?;
    debug!(waypoints = count, present = tree.len(), "loaded tree");
    Ok(tree)
}

fn blank<S>(sender: ReplicaId, counter: u64) -> Waypoint<S> {
    Waypoint {
        sender,
        counter,
        parent: None,
        parent_slot: 0,
        side: Side::Right,
        start: 0,
        slots: 0,
        total: 0,
        children: Vec::new(),
    }
}

pub(crate) fn encode_anchor(anchor: &Anchor) -> Bytes {
    let mut buf = BytesMut::new();
    match &anchor.sender {
        Some(sender) => {
            buf.put_u8(1);
            put_replica(&mut buf, sender);
        }
        None => buf.put_u8(0),
    }
    buf.put_u64_le(anchor.counter);
    buf.put_i64_le(anchor.slot);
    buf.put_u8(anchor.side.as_u8());
    buf.freeze()
}

pub(crate) fn decode_anchor(data: &[u8]) -> Result<Anchor> {
    let mut buf = Bytes::copy_from_slice(data);
    let sender = match get_u8(&mut buf)? {
        0 => None,
        1 => Some(get_replica(&mut buf)?),
        other => return Err(Error::Decode(format!("invalid sender flag {other}"))),
    };
    let anchor = Anchor {
        sender,
        counter: get_u64(&mut buf)?,
        slot: get_i64(&mut buf)?,
        side: get_side(&mut buf)?,
    };
    if buf.has_remaining() {
        return Err(Error::Decode("trailing bytes after anchor".into()));
    }
    Ok(anchor)
}
