use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ids::{Located, Position, ReplicaId, Side};
use crate::traits::Slots;

/// Arena index of the root waypoint.
pub(crate) const ROOT: usize = 0;

/// A maximal run of own slots that are all present or all absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Segment<S> {
    Present(S),
    Absent(usize),
}

impl<S: Slots> Segment<S> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Segment::Present(slots) => slots.len(),
            Segment::Absent(n) => *n,
        }
    }

    pub(crate) fn is_present(&self) -> bool {
        matches!(self, Segment::Present(_))
    }

    pub(crate) fn present_len(&self) -> usize {
        match self {
            Segment::Present(slots) => slots.len(),
            Segment::Absent(_) => 0,
        }
    }

    fn split_off(&mut self, at: usize) -> Self {
        match self {
            Segment::Present(slots) => Segment::Present(slots.split_off(at)),
            Segment::Absent(n) => {
                let rest = *n - at;
                *n = at;
                Segment::Absent(rest)
            }
        }
    }

    /// Joins `other` onto the end of `self` when both have the same presence; otherwise
    /// hands it back untouched.
    fn absorb(&mut self, other: Self) -> Option<Self> {
        match (self, other) {
            (Segment::Present(a), Segment::Present(b)) => {
                a.append(b);
                None
            }
            (Segment::Absent(a), Segment::Absent(b)) => {
                *a += b;
                None
            }
            (_, other) => Some(other),
        }
    }
}

/// One entry of a waypoint's left-to-right children list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Entry<S> {
    Waypoint(usize),
    Segment(Segment<S>),
}

fn same_kind<S: Slots>(a: &Entry<S>, b: &Entry<S>) -> bool {
    matches!((a, b), (Entry::Segment(x), Entry::Segment(y)) if x.is_present() == y.is_present())
}

#[derive(Clone, Debug)]
pub(crate) struct Waypoint<S> {
    pub(crate) sender: ReplicaId,
    pub(crate) counter: u64,
    pub(crate) parent: Option<usize>,
    /// Slot of the parent this waypoint's slot 0 hangs from.
    pub(crate) parent_slot: i64,
    pub(crate) side: Side,
    /// Smallest own slot; `<= 0` since every waypoint owns slot 0.
    pub(crate) start: i64,
    /// Number of own slots, present or not.
    pub(crate) slots: usize,
    /// Present slots in this waypoint's subtree.
    pub(crate) total: usize,
    pub(crate) children: Vec<Entry<S>>,
}

impl<S> Waypoint<S> {
    /// One past the last own slot.
    pub(crate) fn end(&self) -> i64 {
        self.start
            .saturating_add(i64::try_from(self.slots).unwrap_or(i64::MAX))
    }

    pub(crate) fn contains_slot(&self, slot: i64) -> bool {
        slot >= self.start && slot < self.end()
    }

    fn key(&self) -> (&[u8], u64) {
        (self.sender.as_bytes(), self.counter)
    }

    fn first_segment(&self) -> Option<usize> {
        self.children
            .iter()
            .position(|e| matches!(e, Entry::Segment(_)))
    }

    fn last_segment(&self) -> Option<usize> {
        self.children
            .iter()
            .rposition(|e| matches!(e, Entry::Segment(_)))
    }
}

/// A slot addressed by its place in the children list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) waypoint: usize,
    pub(crate) entry: usize,
    pub(crate) offset: usize,
}

/// Where a local insert attaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Extend the local replica's own waypoint at one end.
    Append { waypoint: usize, side: Side },
    /// Start a new waypoint hanging from `slot` of `parent`.
    Create {
        parent: usize,
        slot: i64,
        side: Side,
    },
}

enum Insertion {
    At(usize),
    /// Split the segment at `entry` before `offset` and insert between the halves.
    Split { entry: usize, offset: usize },
}

fn unknown(sender: &ReplicaId, counter: u64, reason: &str) -> Error {
    Error::UnknownPosition(format!("{sender}:{counter} ({reason})"))
}

/// Width of `count` slots as a signed slot offset.
pub(crate) fn slot_span(count: usize) -> Result<i64> {
    i64::try_from(count)
        .map_err(|_| Error::InvalidOperation(format!("{count} slots exceed the slot range")))
}

/// Where an entry sits in its parent's layout, see [`WaypointTree::insertion_point`].
///
/// Regions are the front, the own slots and the tail. Inside the own-slot region, slot
/// `s` sits at `2s` and the waypoints hanging left or right of it at `2s - 1` or `2s + 1`.
struct LayoutRank<'a> {
    region: u8,
    lo: i128,
    hi: i128,
    key: Option<(&'a [u8], u64)>,
    descending: bool,
}

impl LayoutRank<'_> {
    fn precedes(&self, next: &Self) -> bool {
        if (self.region, self.hi) != (next.region, next.lo) {
            return (self.region, self.hi) < (next.region, next.lo);
        }
        match (self.key, next.key) {
            (Some(a), Some(b)) if self.descending => a > b,
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

/// Arena of waypoints shared by the embedded and detached modes.
#[derive(Clone, Debug)]
pub(crate) struct WaypointTree<S> {
    pub(crate) waypoints: Vec<Waypoint<S>>,
    /// Arena indices per sender, indexed by counter.
    pub(crate) by_sender: HashMap<ReplicaId, Vec<usize>>,
}

impl<S: Slots> WaypointTree<S> {
    pub(crate) fn new() -> Self {
        Self::with_initial(None)
    }

    /// Tree whose root already holds `initial` at slots `1..=n`.
    pub(crate) fn with_initial(initial: Option<Segment<S>>) -> Self {
        let mut root = Waypoint {
            sender: ReplicaId::root(),
            counter: 0,
            parent: None,
            parent_slot: 0,
            side: Side::Right,
            start: 0,
            slots: 1,
            total: 0,
            // Sentinel slot 0 is the left neighbour of index 0 and never present.
            children: vec![Entry::Segment(Segment::Absent(1))],
        };
        if let Some(initial) = initial.filter(|s| s.len() > 0) {
            root.slots += initial.len();
            root.total += initial.present_len();
            root.children.push(Entry::Segment(initial));
        }
        Self {
            waypoints: vec![root],
            by_sender: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waypoints[ROOT].total
    }

    /// True when nothing beyond the bare root sentinel exists.
    pub(crate) fn is_pristine(&self) -> bool {
        self.waypoints.len() == 1 && self.waypoints[ROOT].slots == 1
    }

    pub(crate) fn next_counter(&self, sender: &ReplicaId) -> u64 {
        self.by_sender.get(sender).map_or(0, |w| w.len() as u64)
    }

    /// Rejects a new waypoint whose counter is not the sender's next one.
    pub(crate) fn expect_counter(&self, sender: &ReplicaId, counter: u64) -> Result<()> {
        let expected = self.next_counter(sender);
        if counter != expected {
            return Err(Error::OutOfOrderCounter {
                sender: sender.clone(),
                expected,
                got: counter,
            });
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, sender: &ReplicaId, counter: u64) -> Result<usize> {
        if sender.is_root() {
            return if counter == 0 {
                Ok(ROOT)
            } else {
                Err(unknown(sender, counter, "root has a single waypoint"))
            };
        }
        let by_sender = self
            .by_sender
            .get(sender)
            .ok_or_else(|| unknown(sender, counter, "sender"))?;
        usize::try_from(counter)
            .ok()
            .and_then(|c| by_sender.get(c))
            .copied()
            .ok_or_else(|| unknown(sender, counter, "counter"))
    }

    /// Cursor of the present slot at `index`.
    pub(crate) fn locate(&self, index: usize) -> Result<Cursor> {
        let len = self.len();
        if index >= len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        let mut remaining = index;
        let mut waypoint = ROOT;
        'descend: loop {
            for (entry, child) in self.waypoints[waypoint].children.iter().enumerate() {
                match child {
                    Entry::Waypoint(c) => {
                        let total = self.waypoints[*c].total;
                        if remaining < total {
                            waypoint = *c;
                            continue 'descend;
                        }
                        remaining -= total;
                    }
                    Entry::Segment(Segment::Present(slots)) => {
                        if remaining < slots.len() {
                            return Ok(Cursor {
                                waypoint,
                                entry,
                                offset: remaining,
                            });
                        }
                        remaining -= slots.len();
                    }
                    Entry::Segment(Segment::Absent(_)) => {}
                }
            }
            return Err(Error::InconsistentState(format!(
                "present count of waypoint {waypoint} exceeds its contents"
            )));
        }
    }

    /// Signed slot index addressed by `cursor`.
    pub(crate) fn slot_at(&self, cursor: &Cursor) -> i64 {
        let waypoint = &self.waypoints[cursor.waypoint];
        let before: usize = waypoint.children[..cursor.entry]
            .iter()
            .map(|e| match e {
                Entry::Segment(seg) => seg.len(),
                Entry::Waypoint(_) => 0,
            })
            .sum();
        waypoint.start + (before + cursor.offset) as i64
    }

    pub(crate) fn position_at(&self, cursor: &Cursor) -> Position {
        let waypoint = &self.waypoints[cursor.waypoint];
        Position::new(&waypoint.sender, waypoint.counter, self.slot_at(cursor))
    }

    /// Entry and offset holding `slot` of `waypoint`.
    pub(crate) fn locate_slot(&self, waypoint: usize, slot: i64) -> Option<(usize, usize)> {
        let wp = &self.waypoints[waypoint];
        if !wp.contains_slot(slot) {
            return None;
        }
        let mut remaining = (slot - wp.start) as usize;
        for (entry, child) in wp.children.iter().enumerate() {
            if let Entry::Segment(seg) = child {
                if remaining < seg.len() {
                    return Some((entry, remaining));
                }
                remaining -= seg.len();
            }
        }
        None
    }

    /// Decides where an element inserted at `index` by `replica` attaches.
    ///
    /// The new element never gets a same-side sibling that already exists locally: it becomes
    /// the right child of its left neighbour when that slot has no right children, otherwise
    /// the left child of the next slot, which then is the leftmost slot of the left
    /// neighbour's right subtree.
    pub(crate) fn place(&self, index: usize, replica: &ReplicaId) -> Result<Placement> {
        let len = self.len();
        if index > len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        let left = if index == 0 {
            Cursor {
                waypoint: ROOT,
                entry: 0,
                offset: 0,
            }
        } else {
            self.locate(index - 1)?
        };
        let left_wp = &self.waypoints[left.waypoint];
        let left_slot = self.slot_at(&left);
        let segment_len = match &left_wp.children[left.entry] {
            Entry::Segment(seg) => seg.len(),
            Entry::Waypoint(_) => {
                return Err(Error::InconsistentState(
                    "cursor points at a waypoint entry".into(),
                ))
            }
        };
        let at_segment_end = left.offset + 1 == segment_len;
        let has_right_child = (left_slot >= 0 && left_slot < left_wp.end() - 1)
            || (at_segment_end
                && matches!(
                    left_wp.children.get(left.entry + 1),
                    Some(Entry::Waypoint(c))
                        if self.waypoints[*c].parent_slot == left_slot
                            && self.waypoints[*c].side == Side::Right
                ));

        if has_right_child {
            let (waypoint, slot) = if at_segment_end {
                self.leftmost_from(left.waypoint, left.entry + 1)?
            } else {
                (left.waypoint, left_slot + 1)
            };
            let target = &self.waypoints[waypoint];
            if target.sender == *replica && slot <= 0 {
                Ok(Placement::Append {
                    waypoint,
                    side: Side::Left,
                })
            } else {
                Ok(Placement::Create {
                    parent: waypoint,
                    slot,
                    side: Side::Left,
                })
            }
        } else if left_wp.sender == *replica && left_slot >= 0 {
            Ok(Placement::Append {
                waypoint: left.waypoint,
                side: Side::Right,
            })
        } else {
            Ok(Placement::Create {
                parent: left.waypoint,
                slot: left_slot,
                side: Side::Right,
            })
        }
    }

    /// First slot at or after `entry` of `waypoint`, descending into nested waypoints.
    fn leftmost_from(&self, waypoint: usize, entry: usize) -> Result<(usize, i64)> {
        let mut waypoint = waypoint;
        let mut entry = entry;
        loop {
            match self.waypoints[waypoint].children.get(entry) {
                Some(Entry::Waypoint(c)) => {
                    waypoint = *c;
                    entry = 0;
                }
                Some(Entry::Segment(_)) => {
                    let slot = self.slot_at(&Cursor {
                        waypoint,
                        entry,
                        offset: 0,
                    });
                    return Ok((waypoint, slot));
                }
                None => {
                    return Err(Error::InconsistentState(format!(
                        "waypoint {waypoint} has no slot after entry {entry}"
                    )))
                }
            }
        }
    }

    /// Adds `segment` to one end of an existing waypoint.
    ///
    /// On the right the new slots follow the current last slot directly: anything further
    /// right is either a later append or a waypoint hanging to the right of an own slot,
    /// and those sort after same-waypoint continuations.
    pub(crate) fn append(
        &mut self,
        waypoint: usize,
        side: Side,
        segment: Segment<S>,
    ) -> Result<()> {
        if waypoint == ROOT {
            return Err(Error::InvalidOperation(
                "the root waypoint cannot be extended".into(),
            ));
        }
        let count = segment.len();
        if count == 0 {
            return Err(Error::InvalidOperation("empty append".into()));
        }
        let span = slot_span(count)?;
        let present = segment.present_len();
        let wp = &mut self.waypoints[waypoint];
        let new_start = match side {
            Side::Right => wp.end().checked_add(span).map(|_| wp.start),
            Side::Left => wp.start.checked_sub(span),
        };
        let Some(new_start) = new_start else {
            return Err(Error::InvalidOperation(format!(
                "{count} more slots overflow {}:{}",
                wp.sender, wp.counter
            )));
        };
        match side {
            Side::Right => {
                let last = wp.last_segment().ok_or_else(|| {
                    Error::InconsistentState(format!("waypoint {waypoint} owns no slots"))
                })?;
                if let Entry::Segment(existing) = &mut wp.children[last] {
                    if let Some(segment) = existing.absorb(segment) {
                        wp.children.insert(last + 1, Entry::Segment(segment));
                    }
                }
            }
            Side::Left => {
                let first = wp.first_segment().ok_or_else(|| {
                    Error::InconsistentState(format!("waypoint {waypoint} owns no slots"))
                })?;
                if let Entry::Segment(existing) = &mut wp.children[first] {
                    let mut segment = segment;
                    let old = std::mem::replace(existing, Segment::Absent(0));
                    match segment.absorb(old) {
                        None => *existing = segment,
                        Some(old) => {
                            *existing = old;
                            wp.children.insert(first, Entry::Segment(segment));
                        }
                    }
                }
            }
        }
        wp.start = new_start;
        wp.slots += count;
        trace!(
            sender = %wp.sender,
            counter = wp.counter,
            ?side,
            count,
            "appended slots"
        );
        self.add_present(waypoint, present);
        Ok(())
    }

    /// Creates waypoint `(sender, counter)` with `segment` as slots `0..n`, hanging from
    /// `slot` of `parent` on `side`. Returns its arena index.
    pub(crate) fn create(
        &mut self,
        sender: &ReplicaId,
        counter: u64,
        parent: usize,
        slot: i64,
        side: Side,
        segment: Segment<S>,
    ) -> Result<usize> {
        if sender.is_root() {
            return Err(Error::InvalidOperation(
                "the empty replica id is reserved for the root".into(),
            ));
        }
        if segment.len() == 0 {
            return Err(Error::InvalidOperation("empty waypoint".into()));
        }
        slot_span(segment.len())?;
        self.expect_counter(sender, counter)?;
        let parent_wp = &self.waypoints[parent];
        if !parent_wp.contains_slot(slot) {
            return Err(Error::MalformedParent(format!(
                "slot {slot} is outside {}:{} (slots {}..{})",
                parent_wp.sender,
                parent_wp.counter,
                parent_wp.start,
                parent_wp.end()
            )));
        }
        if parent == ROOT && slot == 0 && side == Side::Left {
            return Err(Error::MalformedParent(
                "nothing may precede the root sentinel".into(),
            ));
        }
        let insertion = self.insertion_point(parent, slot, side, (sender.as_bytes(), counter))?;

        let index = self.waypoints.len();
        let present = segment.present_len();
        let slots = segment.len();
        let children = &mut self.waypoints[parent].children;
        match insertion {
            Insertion::At(at) => children.insert(at, Entry::Waypoint(index)),
            Insertion::Split { entry, offset } => {
                if let Entry::Segment(seg) = &mut children[entry] {
                    let tail = seg.split_off(offset);
                    children.insert(entry + 1, Entry::Segment(tail));
                    children.insert(entry + 1, Entry::Waypoint(index));
                }
            }
        }
        self.waypoints.push(Waypoint {
            sender: sender.clone(),
            counter,
            parent: Some(parent),
            parent_slot: slot,
            side,
            start: 0,
            slots,
            total: 0,
            children: vec![Entry::Segment(segment)],
        });
        self.by_sender.entry(sender.clone()).or_default().push(index);
        debug!(%sender, counter, parent, slot, ?side, slots, "created waypoint");
        self.add_present(index, present);
        Ok(index)
    }

    /// Index in `parent.children` for a new waypoint keyed by `key`.
    ///
    /// Layout of a waypoint's entries, with `Lw(s)`/`Rw(s)` the waypoints hanging left/right
    /// of slot `s`:
    ///
    /// ```text
    /// Lw(0) Lw(-1) .. Lw(min) min Rw(min) .. -1 Rw(-1) 0 Lw(1) 1 .. Lw(max) max Rw(max) .. Rw(0)
    /// ```
    ///
    /// Within one group siblings are ordered by ascending `(sender, counter)` reading outward
    /// from the slot, so left groups run in descending order left to right.
    fn insertion_point(
        &self,
        parent: usize,
        slot: i64,
        side: Side,
        key: (&[u8], u64),
    ) -> Result<Insertion> {
        let parent_wp = &self.waypoints[parent];
        let children = &parent_wp.children;
        let sibling = |entry: Option<&Entry<S>>| match entry {
            Some(Entry::Waypoint(c)) => Some(&self.waypoints[*c]),
            _ => None,
        };
        let missing = || {
            Error::InconsistentState(format!(
                "waypoint {}:{} lost slot {slot}",
                parent_wp.sender, parent_wp.counter
            ))
        };

        match side {
            Side::Right if slot < 0 => {
                let (entry, offset) = self.locate_slot(parent, slot).ok_or_else(missing)?;
                let len = match &children[entry] {
                    Entry::Segment(seg) => seg.len(),
                    Entry::Waypoint(_) => return Err(missing()),
                };
                if offset + 1 < len {
                    return Ok(Insertion::Split {
                        entry,
                        offset: offset + 1,
                    });
                }
                let mut at = entry + 1;
                while let Some(c) = sibling(children.get(at)) {
                    if c.parent_slot == slot && c.side == Side::Right && c.key() < key {
                        at += 1;
                    } else {
                        break;
                    }
                }
                Ok(Insertion::At(at))
            }
            Side::Left if slot > 0 => {
                let (entry, offset) = self.locate_slot(parent, slot).ok_or_else(missing)?;
                if offset > 0 {
                    return Ok(Insertion::Split { entry, offset });
                }
                let mut at = entry;
                while at > 0 {
                    match sibling(children.get(at - 1)) {
                        Some(c)
                            if c.parent_slot == slot && c.side == Side::Left && c.key() < key =>
                        {
                            at -= 1
                        }
                        _ => break,
                    }
                }
                Ok(Insertion::At(at))
            }
            Side::Right => {
                let mut at = parent_wp.last_segment().ok_or_else(missing)? + 1;
                while let Some(c) = sibling(children.get(at)) {
                    if c.parent_slot > slot || (c.parent_slot == slot && c.key() < key) {
                        at += 1;
                    } else {
                        break;
                    }
                }
                Ok(Insertion::At(at))
            }
            Side::Left => {
                let first = parent_wp.first_segment().ok_or_else(missing)?;
                let mut at = 0;
                while at < first {
                    match sibling(children.get(at)) {
                        Some(c)
                            if c.parent_slot > slot
                                || (c.parent_slot == slot && c.key() > key) =>
                        {
                            at += 1
                        }
                        _ => break,
                    }
                }
                Ok(Insertion::At(at))
            }
        }
    }

    /// Replaces `slot` of `waypoint` by the one-slot `replacement`, splitting and merging
    /// segments as needed.
    ///
    /// Returns the replaced one-slot segment, or `None` when the slot already had the
    /// presence of `replacement`.
    pub(crate) fn set_slot(
        &mut self,
        waypoint: usize,
        slot: i64,
        replacement: Segment<S>,
    ) -> Result<Option<Segment<S>>> {
        if waypoint == ROOT && slot == 0 {
            return Err(Error::InvalidOperation(
                "the root sentinel cannot change presence".into(),
            ));
        }
        debug_assert_eq!(replacement.len(), 1);
        let (entry, offset) = self.locate_slot(waypoint, slot).ok_or_else(|| {
            let wp = &self.waypoints[waypoint];
            unknown(&wp.sender, wp.counter, "slot")
        })?;
        let becomes_present = replacement.is_present();
        let children = &mut self.waypoints[waypoint].children;
        let Entry::Segment(current) = &mut children[entry] else {
            return Err(Error::InconsistentState(
                "slot lookup landed on a waypoint entry".into(),
            ));
        };
        if current.is_present() == becomes_present {
            return Ok(None);
        }

        let tail = if offset + 1 < current.len() {
            Some(current.split_off(offset + 1))
        } else {
            None
        };
        let (previous, at) = if offset > 0 {
            let previous = current.split_off(offset);
            children.insert(entry + 1, Entry::Segment(replacement));
            (previous, entry + 1)
        } else {
            (std::mem::replace(current, replacement), entry)
        };
        if let Some(tail) = tail {
            children.insert(at + 1, Entry::Segment(tail));
        }
        coalesce(children, at);

        if becomes_present {
            self.add_present(waypoint, 1);
        } else {
            self.remove_present(waypoint, 1);
        }
        Ok(Some(previous))
    }

    /// Current index of `slot` of `waypoint`, counting present slots to its left.
    pub(crate) fn find(&self, waypoint: usize, slot: i64) -> Result<Located> {
        let wp = &self.waypoints[waypoint];
        if !wp.contains_slot(slot) {
            return Err(unknown(&wp.sender, wp.counter, "slot"));
        }
        let mut index = 0;
        let mut present = false;
        let mut remaining = (slot - wp.start) as usize;
        for child in &wp.children {
            match child {
                Entry::Waypoint(c) => index += self.waypoints[*c].total,
                Entry::Segment(seg) => {
                    if remaining < seg.len() {
                        present = seg.is_present();
                        if present {
                            index += remaining;
                        }
                        break;
                    }
                    remaining -= seg.len();
                    index += seg.present_len();
                }
            }
        }

        let mut current = waypoint;
        while let Some(parent) = self.waypoints[current].parent {
            for child in &self.waypoints[parent].children {
                match child {
                    Entry::Waypoint(c) if *c == current => break,
                    Entry::Waypoint(c) => index += self.waypoints[*c].total,
                    Entry::Segment(seg) => index += seg.present_len(),
                }
            }
            current = parent;
        }
        Ok(Located { index, present })
    }

    /// Present runs in list order.
    pub(crate) fn runs(&self) -> Runs<'_, S> {
        Runs {
            tree: self,
            stack: vec![Frame {
                waypoint: ROOT,
                entry: 0,
                slot: self.waypoints[ROOT].start,
            }],
        }
    }

    fn add_present(&mut self, from: usize, count: usize) {
        if count == 0 {
            return;
        }
        let mut current = Some(from);
        while let Some(w) = current {
            self.waypoints[w].total += count;
            current = self.waypoints[w].parent;
        }
    }

    fn remove_present(&mut self, from: usize, count: usize) {
        let mut current = Some(from);
        while let Some(w) = current {
            self.waypoints[w].total -= count;
            current = self.waypoints[w].parent;
        }
    }

    /// Validate structural invariants: parent links, single ownership, acyclicity, merged
    /// segments, exact present counts and sibling order. Intended for tests and after `load`.
    pub(crate) fn validate_invariants(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InconsistentState(msg));
        let count = self.waypoints.len();
        let mut references = vec![0usize; count];

        for (idx, wp) in self.waypoints.iter().enumerate() {
            if (idx == ROOT) != wp.parent.is_none() {
                return bad(format!("waypoint {idx} has an unexpected parent link"));
            }
            let mut slots = 0;
            let mut total = 0;
            for (pos, child) in wp.children.iter().enumerate() {
                if pos > 0 && same_kind(&wp.children[pos - 1], child) {
                    return bad(format!("waypoint {idx} has unmerged segments at {pos}"));
                }
                match child {
                    Entry::Waypoint(c) => {
                        let Some(child_wp) = self.waypoints.get(*c) else {
                            return bad(format!("waypoint {idx} references missing {c}"));
                        };
                        if child_wp.parent != Some(idx) {
                            return bad(format!("child {c} does not point back to {idx}"));
                        }
                        references[*c] += 1;
                        total += child_wp.total;
                    }
                    Entry::Segment(seg) => {
                        if seg.len() == 0 {
                            return bad(format!("waypoint {idx} has an empty segment"));
                        }
                        slots += seg.len();
                        total += seg.present_len();
                    }
                }
            }
            if slots == 0 || slots != wp.slots {
                return bad(format!("waypoint {idx} owns {slots} slots, expected {}", wp.slots));
            }
            if slot_span(slots).ok().and_then(|n| wp.start.checked_add(n)).is_none() {
                return bad(format!("waypoint {idx} slots overflow the slot range"));
            }
            if wp.start > 0 || wp.end() <= 0 {
                return bad(format!("waypoint {idx} does not own slot 0"));
            }
            if total != wp.total {
                return bad(format!(
                    "waypoint {idx} caches {} present slots, counted {total}",
                    wp.total
                ));
            }
            if let Some(parent) = wp.parent {
                if !self.waypoints[parent].contains_slot(wp.parent_slot) {
                    return bad(format!("waypoint {idx} hangs from a missing parent slot"));
                }
            }
        }

        if references[ROOT] != 0 {
            return bad("root is referenced as a child".into());
        }
        if let Some(idx) = (1..count).find(|&i| references[i] != 1) {
            return bad(format!("waypoint {idx} is referenced {} times", references[idx]));
        }
        for start in 0..count {
            let mut current = self.waypoints[start].parent;
            let mut steps = 0;
            while let Some(p) = current {
                steps += 1;
                if steps > count {
                    return bad(format!("cycle through waypoint {start}"));
                }
                current = self.waypoints[p].parent;
            }
        }
        if !matches!(
            self.waypoints[ROOT].children.first(),
            Some(Entry::Segment(Segment::Absent(_)))
        ) {
            return bad("root sentinel is not the first entry".into());
        }

        for (sender, indices) in &self.by_sender {
            for (counter, &idx) in indices.iter().enumerate() {
                let wp = &self.waypoints[idx];
                if wp.sender != *sender || wp.counter != counter as u64 {
                    return bad(format!("sender table entry {sender}:{counter} is stale"));
                }
            }
        }
        let registered: usize = self.by_sender.values().map(Vec::len).sum();
        if registered + 1 != count {
            return bad(format!("{registered} registered waypoints, {} allocated", count - 1));
        }
        (0..count).try_for_each(|idx| self.validate_layout(idx))
    }

    /// Checks that every child of `idx` sits where [`Self::insertion_point`] puts it.
    fn validate_layout(&self, idx: usize) -> Result<()> {
        let wp = &self.waypoints[idx];
        let mut slot = i128::from(wp.start);
        let mut prev: Option<LayoutRank<'_>> = None;
        for (pos, child) in wp.children.iter().enumerate() {
            let rank = match child {
                Entry::Segment(seg) => {
                    let len = seg.len() as i128;
                    let first = slot;
                    slot += len;
                    LayoutRank {
                        region: 1,
                        lo: 2 * first,
                        hi: 2 * (slot - 1),
                        key: None,
                        descending: false,
                    }
                }
                Entry::Waypoint(c) => {
                    let child = &self.waypoints[*c];
                    let s = i128::from(child.parent_slot);
                    let (region, at, descending) = match child.side {
                        Side::Left if s <= 0 => (0, -s, true),
                        Side::Left => (1, 2 * s - 1, true),
                        Side::Right if s < 0 => (1, 2 * s + 1, false),
                        Side::Right => (2, -s, false),
                    };
                    LayoutRank {
                        region,
                        lo: at,
                        hi: at,
                        key: Some(child.key()),
                        descending,
                    }
                }
            };
            if prev.as_ref().is_some_and(|p| !p.precedes(&rank)) {
                return Err(Error::InconsistentState(format!(
                    "entry {pos} of waypoint {idx} is out of order"
                )));
            }
            prev = Some(rank);
        }
        Ok(())
    }
}

/// Merges the entry at `at` with equal-kind neighbours.
fn coalesce<S: Slots>(children: &mut Vec<Entry<S>>, at: usize) {
    if at + 1 < children.len() && same_kind(&children[at], &children[at + 1]) {
        if let Entry::Segment(next) = children.remove(at + 1) {
            if let Entry::Segment(current) = &mut children[at] {
                let _ = current.absorb(next);
            }
        }
    }
    if at > 0 && same_kind(&children[at - 1], &children[at]) {
        if let Entry::Segment(current) = children.remove(at) {
            if let Entry::Segment(prev) = &mut children[at - 1] {
                let _ = prev.absorb(current);
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Frame {
    waypoint: usize,
    entry: usize,
    slot: i64,
}

/// A present run produced by [`Runs`].
pub(crate) struct Run<'a, S> {
    pub(crate) waypoint: &'a Waypoint<S>,
    pub(crate) start: i64,
    pub(crate) slots: &'a S,
}

/// Depth-first walk over present runs with an explicit stack.
pub(crate) struct Runs<'a, S> {
    tree: &'a WaypointTree<S>,
    stack: Vec<Frame>,
}

impl<'a, S: Slots> Iterator for Runs<'a, S> {
    type Item = Run<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        let tree: &'a WaypointTree<S> = self.tree;
        loop {
            let frame = self.stack.last_mut()?;
            let waypoint = &tree.waypoints[frame.waypoint];
            let Some(entry) = waypoint.children.get(frame.entry) else {
                self.stack.pop();
                continue;
            };
            frame.entry += 1;
            match entry {
                Entry::Waypoint(c) => {
                    let child = &tree.waypoints[*c];
                    if child.total > 0 {
                        self.stack.push(Frame {
                            waypoint: *c,
                            entry: 0,
                            slot: child.start,
                        });
                    }
                }
                Entry::Segment(Segment::Absent(n)) => frame.slot += *n as i64,
                Entry::Segment(Segment::Present(slots)) => {
                    let start = frame.slot;
                    frame.slot += slots.len() as i64;
                    return Some(Run {
                        waypoint,
                        start,
                        slots,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SlotCount;

    fn present(n: usize) -> Segment<SlotCount> {
        Segment::Present(SlotCount(n))
    }

    fn rid(name: &str) -> ReplicaId {
        ReplicaId::new(name.as_bytes())
    }

    fn apply(tree: &mut WaypointTree<SlotCount>, replica: &ReplicaId, index: usize) -> Placement {
        let placement = tree.place(index, replica).unwrap();
        match placement {
            Placement::Append { waypoint, side } => {
                tree.append(waypoint, side, present(1)).unwrap()
            }
            Placement::Create { parent, slot, side } => {
                let counter = tree.next_counter(replica);
                tree.create(replica, counter, parent, slot, side, present(1))
                    .unwrap();
            }
        }
        tree.validate_invariants().unwrap();
        placement
    }

    fn order(tree: &WaypointTree<SlotCount>) -> Vec<(String, u64, i64)> {
        tree.runs()
            .flat_map(|run| {
                let sender = String::from_utf8_lossy(run.waypoint.sender.as_bytes()).into_owned();
                let counter = run.waypoint.counter;
                (0..run.slots.len() as i64)
                    .map(move |i| (sender.clone(), counter, run.start + i))
            })
            .collect()
    }

    #[test]
    fn sequential_typing_reuses_one_waypoint() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        assert_eq!(
            apply(&mut tree, &a, 0),
            Placement::Create {
                parent: ROOT,
                slot: 0,
                side: Side::Right
            }
        );
        for i in 1..5 {
            let placement = apply(&mut tree, &a, i);
            assert!(matches!(placement, Placement::Append { side: Side::Right, .. }));
        }
        assert_eq!(tree.waypoints.len(), 2);
        assert_eq!(tree.len(), 5);
        let slots: Vec<i64> = order(&tree).into_iter().map(|(_, _, s)| s).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn typing_at_the_front_prepends_with_negative_slots() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        apply(&mut tree, &a, 0);
        for _ in 0..3 {
            assert!(matches!(apply(&mut tree, &a, 0), Placement::Append { side: Side::Left, .. }));
        }
        let slots: Vec<i64> = order(&tree).into_iter().map(|(_, _, s)| s).collect();
        assert_eq!(slots, vec![-3, -2, -1, 0]);
        assert_eq!(tree.waypoints[1].start, -3);
    }

    #[test]
    fn insert_between_own_slots_becomes_left_child_of_right_neighbour() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        let b = rid("b");
        for i in 0..3 {
            apply(&mut tree, &a, i);
        }
        let placement = apply(&mut tree, &b, 1);
        assert_eq!(
            placement,
            Placement::Create {
                parent: 1,
                slot: 1,
                side: Side::Left
            }
        );
        let senders: Vec<String> = order(&tree).into_iter().map(|(s, _, _)| s).collect();
        assert_eq!(senders, vec!["a", "b", "a", "a"]);
    }

    #[test]
    fn concurrent_right_children_sort_by_sender() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        apply(&mut tree, &a, 0);
        // Three replicas all append after "a" without seeing each other.
        for name in ["c", "b", "d"] {
            tree.create(&rid(name), 0, 1, 0, Side::Right, present(1)).unwrap();
        }
        tree.validate_invariants().unwrap();
        let senders: Vec<String> = order(&tree).into_iter().map(|(s, _, _)| s).collect();
        assert_eq!(senders, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn concurrent_left_children_sort_outward_by_sender() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        apply(&mut tree, &a, 0);
        apply(&mut tree, &a, 1);
        for name in ["c", "b", "d"] {
            tree.create(&rid(name), 0, 1, 1, Side::Left, present(1)).unwrap();
        }
        tree.validate_invariants().unwrap();
        let senders: Vec<String> = order(&tree).into_iter().map(|(s, _, _)| s).collect();
        // Reading leftward from slot 1: b, c, d.
        assert_eq!(senders, vec!["a", "d", "c", "b", "a"]);
    }

    #[test]
    fn right_groups_of_lower_slots_sort_after_higher_slots() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        for i in 0..3 {
            apply(&mut tree, &a, i);
        }
        tree.create(&rid("x"), 0, 1, 0, Side::Right, present(1)).unwrap();
        tree.create(&rid("y"), 0, 1, 2, Side::Right, present(1)).unwrap();
        tree.create(&rid("z"), 0, 1, 1, Side::Right, present(1)).unwrap();
        tree.validate_invariants().unwrap();
        let senders: Vec<String> = order(&tree).into_iter().map(|(s, _, _)| s).collect();
        assert_eq!(senders, vec!["a", "a", "a", "y", "z", "x"]);
    }

    #[test]
    fn set_slot_splits_and_merges_segments() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        let w = tree.create(&a, 0, ROOT, 0, Side::Right, present(5)).unwrap();

        assert!(tree.set_slot(w, 2, Segment::Absent(1)).unwrap().is_some());
        assert_eq!(
            tree.waypoints[w].children,
            vec![
                Entry::Segment(present(2)),
                Entry::Segment(Segment::Absent(1)),
                Entry::Segment(present(2)),
            ]
        );
        assert!(tree.set_slot(w, 3, Segment::Absent(1)).unwrap().is_some());
        assert!(tree.set_slot(w, 3, Segment::Absent(1)).unwrap().is_none());
        assert_eq!(tree.waypoints[w].children[1], Entry::Segment(Segment::Absent(2)));
        assert!(tree.set_slot(w, 2, present(1)).unwrap().is_some());
        assert!(tree.set_slot(w, 3, present(1)).unwrap().is_some());
        assert_eq!(tree.waypoints[w].children, vec![Entry::Segment(present(5))]);
        assert_eq!(tree.len(), 5);
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn find_counts_present_slots_to_the_left() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        let b = rid("b");
        for i in 0..4 {
            apply(&mut tree, &a, i);
        }
        apply(&mut tree, &b, 2);
        let wa = tree.lookup(&a, 0).unwrap();
        let wb = tree.lookup(&b, 0).unwrap();
        assert_eq!(tree.find(wa, 3).unwrap(), Located { index: 4, present: true });
        assert_eq!(tree.find(wb, 0).unwrap(), Located { index: 2, present: true });
        tree.set_slot(wa, 1, Segment::Absent(1)).unwrap();
        assert_eq!(tree.find(wa, 1).unwrap(), Located { index: 1, present: false });
        assert_eq!(tree.find(wb, 0).unwrap(), Located { index: 1, present: true });
        assert!(matches!(tree.find(wa, 9), Err(Error::UnknownPosition(_))));
    }

    #[test]
    fn rejected_create_leaves_tree_untouched() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        tree.create(&a, 0, ROOT, 0, Side::Right, present(2)).unwrap();
        let before = tree.waypoints.len();

        let err = tree.create(&a, 3, 1, 0, Side::Right, present(1)).unwrap_err();
        assert!(matches!(err, Error::OutOfOrderCounter { expected: 1, got: 3, .. }));
        let err = tree.create(&rid("b"), 0, 1, 7, Side::Right, present(1)).unwrap_err();
        assert!(matches!(err, Error::MalformedParent(_)));
        let err = tree.create(&rid("b"), 0, ROOT, 0, Side::Left, present(1)).unwrap_err();
        assert!(matches!(err, Error::MalformedParent(_)));

        assert_eq!(tree.waypoints.len(), before);
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn siblings_out_of_layout_order_fail_validation() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let a = rid("a");
        apply(&mut tree, &a, 0);
        apply(&mut tree, &a, 1);
        for name in ["b", "c"] {
            tree.create(&rid(name), 0, 1, 0, Side::Right, present(1)).unwrap();
        }
        tree.create(&rid("d"), 0, 1, 1, Side::Left, present(1)).unwrap();
        tree.validate_invariants().unwrap();
        let wb = tree.lookup(&rid("b"), 0).unwrap();
        let wc = tree.lookup(&rid("c"), 0).unwrap();
        assert_eq!(tree.waypoints[1].children[3], Entry::Waypoint(wb));
        assert_eq!(tree.waypoints[1].children[4], Entry::Waypoint(wc));

        let mut swapped = tree.clone();
        swapped.waypoints[1].children.swap(3, 4);
        assert!(matches!(swapped.validate_invariants(), Err(Error::InconsistentState(_))));

        let mut moved = tree.clone();
        let tail = moved.waypoints[1].children.remove(3);
        moved.waypoints[1].children.insert(0, tail);
        assert!(matches!(moved.validate_invariants(), Err(Error::InconsistentState(_))));
    }

    #[test]
    fn appends_that_overflow_the_slot_range_are_rejected() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let w = tree.create(&rid("a"), 0, ROOT, 0, Side::Right, present(1)).unwrap();
        let err = tree.append(w, Side::Left, Segment::Absent(usize::MAX)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        tree.waypoints[w].start = i64::MIN + 1;
        let err = tree.append(w, Side::Left, Segment::Absent(2)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(tree.waypoints[w].start, i64::MIN + 1);
        assert_eq!(tree.waypoints[w].slots, 1);
    }

    #[test]
    fn deep_alternating_chain_is_walked_iteratively() {
        let mut tree = WaypointTree::<SlotCount>::new();
        let replicas = [rid("a"), rid("b")];
        for i in 0..2_000 {
            apply(&mut tree, &replicas[i % 2], 0);
        }
        assert_eq!(tree.len(), 2_000);
        assert_eq!(tree.runs().map(|r| r.slots.len()).sum::<usize>(), 2_000);
        let deepest = tree.waypoints.len() - 1;
        assert_eq!(tree.find(deepest, 0).unwrap().index, 0);
    }
}
