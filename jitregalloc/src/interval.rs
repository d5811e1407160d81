//! Live ranges and live intervals.
//!
//! A [LiveInterval] is the set of program positions at which a value must be kept somewhere,
//! represented as sorted, disjoint, half-open [LiveRange]s, plus the positions at which the value
//! is actually read or written ("uses"). Splitting an interval at a position produces a new
//! interval (a "split child") holding everything from that position onwards. All the split
//! children of an interval are recorded by the original ("parent") interval, so that code can
//! later ask "which fragment of this value covers position P?".

use crate::{
    ir::{LocalIdx, Ty},
    regs::{RegClass, Register, REGS_PER_CLASS},
};
use index_vec::IndexVec;
use std::{collections::BTreeMap, fmt};
use strum::EnumCount;

index_vec::define_index_type! {
    pub struct IntervalIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

/// The number of fixed intervals, one per physical register, which precede all other intervals.
pub const NUM_FIXED: usize = REGS_PER_CLASS * RegClass::COUNT;

/// A half-open range `[start, end)` of program positions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    pub fn new(start: u32, end: u32) -> Self {
        assert!(start < end, "Invalid range [{start}, {end})");
        Self { start, end }
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Clone, Debug)]
pub struct LiveInterval {
    ranges: Vec<LiveRange>,
    uses: Vec<u32>,
    /// The register assigned to this interval, if any.
    pub reg: Option<Register>,
    /// The spill slot assigned to this interval, if any.
    pub spill_offset: Option<i32>,
    fixed: bool,
    ty: Ty,
    local: Option<LocalIdx>,
    /// The interval this one was split from. Unsplit intervals are their own parent.
    parent: IntervalIdx,
    /// Only populated for parents: every split child, keyed by its start.
    children: BTreeMap<u32, IntervalIdx>,
}

impl LiveInterval {
    fn new(iidx: IntervalIdx, ty: Ty, local: Option<LocalIdx>, fixed: bool) -> Self {
        Self {
            ranges: Vec::new(),
            uses: Vec::new(),
            reg: None,
            spill_offset: None,
            fixed,
            ty,
            local,
            parent: iidx,
            children: BTreeMap::new(),
        }
    }

    /// Add `[start, end)` to this interval, merging it with any ranges it overlaps or touches.
    pub fn add_range(&mut self, start: u32, end: u32) {
        assert!(start < end);
        let i = self.ranges.partition_point(|r| r.end < start);
        let (mut s, mut e) = (start, end);
        let mut j = i;
        while j < self.ranges.len() && self.ranges[j].start <= end {
            s = s.min(self.ranges[j].start);
            e = e.max(self.ranges[j].end);
            j += 1;
        }
        self.ranges.splice(i..j, [LiveRange::new(s, e)]);
    }

    /// Record that the value is (re)defined at `pos`. Intervals are built bottom-up, so the first
    /// range either already contains `pos` (and is cut down to start there) or begins after it (in
    /// which case the definition is dead until the start of that range).
    pub fn set_start(&mut self, pos: u32) {
        match self.ranges.first_mut() {
            Some(r) if r.start <= pos => {
                debug_assert!(pos < r.end);
                r.start = pos;
            }
            _ => self.ranges.insert(0, LiveRange::new(pos, pos + 1)),
        }
    }

    pub fn add_use(&mut self, pos: u32) {
        if let Err(i) = self.uses.binary_search(&pos) {
            self.uses.insert(i, pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// # Panics
    ///
    /// If the interval is empty.
    pub fn start(&self) -> u32 {
        match self.ranges.first() {
            Some(r) => r.start,
            None => panic!("Empty interval has no start"),
        }
    }

    /// # Panics
    ///
    /// If the interval is empty.
    pub fn end(&self) -> u32 {
        match self.ranges.last() {
            Some(r) => r.end,
            None => panic!("Empty interval has no end"),
        }
    }

    pub fn ranges(&self) -> &[LiveRange] {
        &self.ranges
    }

    pub fn uses(&self) -> &[u32] {
        &self.uses
    }

    pub fn uses_count(&self) -> usize {
        self.uses.len()
    }

    pub fn first_use(&self) -> Option<u32> {
        self.uses.first().copied()
    }

    /// The first use at or after `pos`.
    pub fn next_use_from(&self, pos: u32) -> Option<u32> {
        let i = self.uses.partition_point(|u| *u < pos);
        self.uses.get(i).copied()
    }

    /// Does one of this interval's ranges contain `pos`?
    pub fn overlaps_pos(&self, pos: u32) -> bool {
        let i = self.ranges.partition_point(|r| r.end <= pos);
        i < self.ranges.len() && self.ranges[i].start <= pos
    }

    /// The first position covered by both `self` and `other`, if any.
    pub fn overlap_position(&self, other: &LiveInterval) -> Option<u32> {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.end <= b.start {
                i += 1;
            } else if b.end <= a.start {
                j += 1;
            } else {
                return Some(a.start.max(b.start));
            }
        }
        None
    }

    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.overlap_position(other).is_some()
    }

    /// Extend the end of the last range to `end`.
    pub fn extend_end(&mut self, end: u32) {
        match self.ranges.last_mut() {
            Some(r) if r.end < end => r.end = end,
            Some(_) => (),
            None => panic!("Cannot extend an empty interval"),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_spilled(&self) -> bool {
        self.reg.is_none() && self.spill_offset.is_some()
    }

    pub fn class(&self) -> RegClass {
        self.ty.class()
    }

    pub fn ty(&self) -> Ty {
        self.ty
    }

    pub fn local(&self) -> Option<LocalIdx> {
        self.local
    }

    pub fn parent(&self) -> IntervalIdx {
        self.parent
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

impl fmt::Display for LiveInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self
            .ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "{ranges}")?;
        if !self.uses.is_empty() {
            write!(
                f,
                " uses: {}",
                self.uses
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
        }
        match (self.reg, self.spill_offset) {
            (Some(reg), _) => write!(f, " -> {reg}"),
            (None, Some(off)) => write!(f, " -> [{off}]"),
            (None, None) => Ok(()),
        }
    }
}

/// The arena holding every interval of a function: the [NUM_FIXED] fixed intervals first, then one
/// interval per local, then split children in the order they are created.
#[derive(Debug)]
pub struct Intervals {
    ivs: IndexVec<IntervalIdx, LiveInterval>,
}

impl Intervals {
    pub fn new() -> Self {
        let mut ivs = IndexVec::with_capacity(NUM_FIXED);
        for i in 0..NUM_FIXED {
            let reg = Register::from_flat_index(i);
            let iidx = IntervalIdx::from_usize(i);
            let mut iv = LiveInterval::new(iidx, Ty::widest(reg.class), None, true);
            iv.reg = Some(reg);
            ivs.push(iv);
        }
        Self { ivs }
    }

    pub fn push_local(&mut self, local: LocalIdx, ty: Ty) -> IntervalIdx {
        let iidx = IntervalIdx::from_usize(self.ivs.len());
        self.ivs.push(LiveInterval::new(iidx, ty, Some(local), false))
    }

    /// The fixed interval of `reg`.
    pub fn fixed(&self, reg: Register) -> IntervalIdx {
        IntervalIdx::from_usize(reg.flat_index())
    }

    pub fn len(&self) -> usize {
        self.ivs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ivs.is_empty()
    }

    pub fn iter_enumerated(&self) -> impl Iterator<Item = (IntervalIdx, &LiveInterval)> {
        self.ivs.iter_enumerated()
    }

    /// Split `iidx` at `pos`: `iidx` keeps everything before `pos` and the returned split child
    /// holds everything at or after it.
    ///
    /// # Panics
    ///
    /// If `iidx` is fixed or if `pos` is not strictly within the interval.
    pub fn split(&mut self, iidx: IntervalIdx, pos: u32) -> IntervalIdx {
        let iv = &mut self.ivs[iidx];
        assert!(!iv.fixed, "Tried to split a fixed interval");
        if pos <= iv.start() || pos >= iv.end() {
            panic!(
                "Tried to split interval at {pos}, outside of ({}, {})",
                iv.start(),
                iv.end()
            );
        }

        let i = iv.ranges.partition_point(|r| r.end <= pos);
        let mut ranges = iv.ranges.split_off(i);
        if ranges[0].start < pos {
            iv.ranges.push(LiveRange::new(ranges[0].start, pos));
            ranges[0].start = pos;
        }
        let j = iv.uses.partition_point(|u| *u < pos);
        let uses = iv.uses.split_off(j);

        let (ty, local, parent) = (iv.ty, iv.local, iv.parent);
        let child = IntervalIdx::from_usize(self.ivs.len());
        let start = ranges[0].start;
        self.ivs.push(LiveInterval {
            ranges,
            uses,
            reg: None,
            spill_offset: None,
            fixed: false,
            ty,
            local,
            parent,
            children: BTreeMap::new(),
        });
        self.ivs[parent].children.insert(start, child);
        child
    }

    /// The fragment of `iidx`'s value (i.e. its parent or one of the parent's split children)
    /// whose ranges contain `pos`.
    pub fn split_child(&self, iidx: IntervalIdx, pos: u32) -> Option<IntervalIdx> {
        let parent = self.ivs[iidx].parent;
        // Fragments are ordered: every position of one fragment precedes every position of the
        // next. Only the last one starting at or before `pos` can contain it.
        if let Some((_, c)) = self.ivs[parent].children.range(..=pos).next_back() {
            if self.ivs[*c].overlaps_pos(pos) {
                return Some(*c);
            }
        }
        if self.ivs[parent].overlaps_pos(pos) {
            return Some(parent);
        }
        None
    }

    /// All fragments of `parent`'s value, in position order.
    pub fn fragments(&self, parent: IntervalIdx) -> Vec<IntervalIdx> {
        debug_assert_eq!(self.ivs[parent].parent, parent);
        let mut frags = vec![parent];
        frags.extend(self.ivs[parent].children.values().copied());
        frags
    }

    /// The spill slot of any spilled fragment of `iidx`'s value.
    pub fn sibling_spill_offset(&self, iidx: IntervalIdx) -> Option<i32> {
        let parent = self.ivs[iidx].parent;
        self.fragments(parent)
            .into_iter()
            .find_map(|x| self.ivs[x].spill_offset)
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<IntervalIdx> for Intervals {
    type Output = LiveInterval;

    fn index(&self, iidx: IntervalIdx) -> &LiveInterval {
        &self.ivs[iidx]
    }
}

impl std::ops::IndexMut<IntervalIdx> for Intervals {
    fn index_mut(&mut self, iidx: IntervalIdx) -> &mut LiveInterval {
        &mut self.ivs[iidx]
    }
}

impl fmt::Display for Intervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (iidx, iv) in self.ivs.iter_enumerated() {
            if iv.is_empty() {
                continue;
            }
            match (iv.fixed, iv.local) {
                (true, _) => write!(f, "{}", Register::from_flat_index(iidx.index()))?,
                (false, Some(l)) => write!(f, "%{}", l.index())?,
                (false, None) => write!(f, "?")?,
            }
            if iv.parent != iidx {
                write!(f, " (split {})", iidx.index())?;
            }
            writeln!(f, ": {iv}")?;
        }
        Ok(())
    }
}
