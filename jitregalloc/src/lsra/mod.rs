//! A linear scan register allocator with interval splitting.
//!
//! Intervals are processed in order of increasing start position. Each is given a register that
//! is free for its whole lifetime if possible; failing that, one that is free for a prefix of it
//! (the rest being split off and processed later); failing that, the register whose other users
//! are next needed furthest away is taken from them. Values are never allocated to registers for
//! positions without a use unless doing so is free: split fragments with no uses are spilled.
//!
//! After allocation, every local operand is rewritten to the register of the fragment covering
//! it, and moves are inserted wherever a value changes location: between adjacent fragments
//! within a block, and along control flow edges whose ends disagree (see [resolve]).

mod build;
mod resolve;

use crate::{
    copy_resolver::ScratchSlots,
    errors::RegAllocError,
    interval::{IntervalIdx, Intervals, NUM_FIXED},
    ir::{Function, LocalIdx, Opcode},
    log::{log_event, log_ir, should_log_ir, IRPhase},
    numbering::{split_position, Numbering},
    regs::{RegClass, RegSet, Register, RegisterMasks, REGS_PER_CLASS},
    stack::StackAllocator,
    AllocationResult, RegisterAllocator,
};
use index_vec::IndexVec;
use vob::Vob;

/// The full linear scan allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearScan;

impl RegisterAllocator for LinearScan {
    fn allocate(
        &self,
        f: &mut Function,
        stack: &mut StackAllocator,
        masks: &RegisterMasks,
    ) -> Result<AllocationResult, RegAllocError> {
        crate::prepare(f, stack)?;
        let num = Numbering::new(f);
        let lv = build::build_intervals(f, &num, masks);
        let mut ra = LinearScanState::new(lv.ivs, masks, stack);
        ra.run();
        if should_log_ir(IRPhase::Intervals) {
            log_ir(&format!("--- Intervals ---\n{}\n", ra.ivs));
        }
        let LinearScanState { ivs, used, .. } = ra;

        rewrite(f, &num, &ivs, &lv.local_ivs);
        let mut scratch = ScratchSlots::new();
        resolve::insert_split_copies(f, &num, &ivs, &lv.local_ivs, stack, &mut scratch);
        resolve::resolve_edges(f, &num, &ivs, &lv.live_in, stack, &mut scratch);
        crate::finish(f);

        Ok(AllocationResult {
            used_int_regs: used[RegClass::Int.index()].bits(),
            used_vec_regs: used[RegClass::Vec.index()].bits(),
            spill_region_size: stack.size(),
            max_call_args: lv.max_call_args,
        })
    }
}

struct LinearScanState<'a> {
    ivs: Intervals,
    masks: &'a RegisterMasks,
    stack: &'a mut StackAllocator,
    /// Intervals that hold a register and cover the current position.
    active: Vob,
    /// Intervals that hold a register but have a lifetime hole at the current position.
    inactive: Vob,
    /// Intervals still to be processed, sorted by start. Everything before `next` is done.
    unhandled: Vec<IntervalIdx>,
    next: usize,
    /// The registers handed out, per class.
    used: [RegSet; 2],
}

impl<'a> LinearScanState<'a> {
    fn new(ivs: Intervals, masks: &'a RegisterMasks, stack: &'a mut StackAllocator) -> Self {
        let mut active = Vob::from_elem(false, ivs.len());
        for (iidx, iv) in ivs.iter_enumerated().take(NUM_FIXED) {
            if !iv.is_empty() {
                active.set(iidx.index(), true);
            }
        }
        let mut unhandled = ivs
            .iter_enumerated()
            .skip(NUM_FIXED)
            .filter(|(_, iv)| !iv.is_empty())
            .map(|(iidx, _)| iidx)
            .collect::<Vec<_>>();
        unhandled.sort_by_key(|iidx| ivs[*iidx].start());
        let inactive = Vob::from_elem(false, ivs.len());
        Self {
            ivs,
            masks,
            stack,
            active,
            inactive,
            unhandled,
            next: 0,
            used: [RegSet::blank(); 2],
        }
    }

    fn run(&mut self) {
        while let Some(cur) = self.unhandled.get(self.next).copied() {
            self.next += 1;
            self.allocate_interval(cur);
        }
    }

    fn allocate_interval(&mut self, cur: IntervalIdx) {
        let start = self.ivs[cur].start();
        self.expire(start);
        if self.ivs[cur].uses_count() == 0 {
            self.spill(cur);
            return;
        }
        if !self.try_allocate_free_reg(cur) {
            self.allocate_blocked_reg(cur);
        }
    }

    /// Update the active and inactive sets for the position `pos`.
    fn expire(&mut self, pos: u32) {
        for i in self.active.iter_set_bits(..).collect::<Vec<_>>() {
            let iv = &self.ivs[IntervalIdx::from_usize(i)];
            if iv.end() <= pos {
                self.active.set(i, false);
            } else if !iv.overlaps_pos(pos) {
                self.active.set(i, false);
                self.inactive.set(i, true);
            }
        }
        for i in self.inactive.iter_set_bits(..).collect::<Vec<_>>() {
            let iv = &self.ivs[IntervalIdx::from_usize(i)];
            if iv.end() <= pos {
                self.inactive.set(i, false);
            } else if iv.overlaps_pos(pos) {
                self.inactive.set(i, false);
                self.active.set(i, true);
            }
        }
    }

    /// The register held by an active or inactive interval.
    fn holder_reg(&self, i: usize) -> Register {
        match self.ivs[IntervalIdx::from_usize(i)].reg {
            Some(r) => r,
            None => panic!("Interval {i} is active without a register"),
        }
    }

    /// The same-class intervals in `set` and their registers.
    fn holders(&self, set: &Vob, class: RegClass) -> Vec<(IntervalIdx, u8)> {
        set.iter_set_bits(..)
            .map(|i| (IntervalIdx::from_usize(i), self.holder_reg(i)))
            .filter(|(_, r)| r.class == class)
            .map(|(iidx, r)| (iidx, r.index))
            .collect()
    }

    fn initial_positions(&self, class: RegClass) -> [u32; REGS_PER_CLASS] {
        let mut pos = [0; REGS_PER_CLASS];
        for r in self.masks.class(class).available.iter() {
            pos[usize::from(r)] = u32::MAX;
        }
        pos
    }

    fn try_allocate_free_reg(&mut self, cur: IntervalIdx) -> bool {
        let class = self.ivs[cur].class();
        let (start, end) = (self.ivs[cur].start(), self.ivs[cur].end());
        let mut free_until = self.initial_positions(class);
        for (_, r) in self.holders(&self.active, class) {
            free_until[usize::from(r)] = 0;
        }
        for (iidx, r) in self.holders(&self.inactive, class) {
            if let Some(pos) = self.ivs[iidx].overlap_position(&self.ivs[cur]) {
                let r = usize::from(r);
                free_until[r] = free_until[r].min(pos);
            }
        }

        let (reg, free) = pick_max(&free_until);
        if free >= end {
            self.assign(cur, Register::new(class, reg));
            return true;
        }
        let split_pos = split_position(free);
        if split_pos <= start {
            return false;
        }
        let rest = self.split(cur, split_pos);
        self.assign(cur, Register::new(class, reg));
        if self.ivs[rest].uses_count() > 0 {
            self.insert_unhandled(rest);
        } else {
            self.spill(rest);
        }
        true
    }

    fn allocate_blocked_reg(&mut self, cur: IntervalIdx) {
        let class = self.ivs[cur].class();
        let (start, end) = (self.ivs[cur].start(), self.ivs[cur].end());
        let first_use = match self.ivs[cur].first_use() {
            Some(x) => x,
            None => panic!("Interval {} has no uses", cur.index()),
        };
        let from = split_position(start);
        let mut use_pos = self.initial_positions(class);
        let mut blocked = self.initial_positions(class);
        for (iidx, r) in self.holders(&self.active, class) {
            let r = usize::from(r);
            let iv = &self.ivs[iidx];
            if iv.is_fixed() {
                use_pos[r] = 0;
                blocked[r] = 0;
            } else if let Some(u) = iv.next_use_from(from) {
                use_pos[r] = use_pos[r].min(u);
            }
        }
        for (iidx, r) in self.holders(&self.inactive, class) {
            let r = usize::from(r);
            let iv = &self.ivs[iidx];
            let Some(pos) = iv.overlap_position(&self.ivs[cur]) else {
                continue;
            };
            if iv.is_fixed() {
                blocked[r] = blocked[r].min(pos);
                use_pos[r] = use_pos[r].min(pos);
            } else if let Some(u) = iv.next_use_from(from) {
                use_pos[r] = use_pos[r].min(u);
            }
        }
        for r in 0..REGS_PER_CLASS {
            // A holder needed at the current position cannot be evicted, and a fixed interval
            // that claims the register before any move could be inserted makes it unusable.
            if use_pos[r] <= start || (blocked[r] < end && split_position(blocked[r]) <= start) {
                use_pos[r] = 0;
            }
        }

        let (reg, up) = pick_max(&use_pos);
        if up < first_use {
            // Every register is needed again before `cur` is: spill `cur` up to its first use.
            let split_pos = split_position(first_use);
            if split_pos > start {
                let rest = self.split(cur, split_pos);
                self.insert_unhandled(rest);
                self.spill(cur);
                return;
            }
            if up == 0 {
                panic!(
                    "No register available for {} at {start}",
                    self.describe(cur)
                );
            }
        }

        if blocked[usize::from(reg)] < end {
            let rest = self.split(cur, split_position(blocked[usize::from(reg)]));
            if self.ivs[rest].uses_count() > 0 {
                self.insert_unhandled(rest);
            } else {
                self.spill(rest);
            }
        }
        let reg = Register::new(class, reg);
        self.assign(cur, reg);
        self.evict(cur, reg);
    }

    /// Take `reg` away from every other interval that would overlap `cur`.
    fn evict(&mut self, cur: IntervalIdx, reg: Register) {
        let start = self.ivs[cur].start();
        let at = split_position(start);
        let mut victims = Vec::new();
        for i in self.active.iter_set_bits(..) {
            let iidx = IntervalIdx::from_usize(i);
            if iidx != cur && !self.ivs[iidx].is_fixed() && self.ivs[iidx].reg == Some(reg) {
                victims.push(iidx);
            }
        }
        for i in self.inactive.iter_set_bits(..) {
            let iidx = IntervalIdx::from_usize(i);
            if !self.ivs[iidx].is_fixed()
                && self.ivs[iidx].reg == Some(reg)
                && self.ivs[iidx].overlaps(&self.ivs[cur])
            {
                victims.push(iidx);
            }
        }

        for victim in victims {
            self.active.set(victim.index(), false);
            self.inactive.set(victim.index(), false);
            let piece = if self.ivs[victim].start() < at {
                self.split(victim, at)
            } else {
                self.ivs[victim].reg = None;
                victim
            };
            match self.ivs[piece].next_use_from(at) {
                None => self.spill(piece),
                Some(u) => {
                    let before_use = split_position(u);
                    if before_use > self.ivs[piece].start() {
                        let rest = self.split(piece, before_use);
                        self.spill(piece);
                        self.insert_unhandled(rest);
                    } else {
                        self.insert_unhandled(piece);
                    }
                }
            }
            log_event!(
                "linear-scan: evicted {} from {reg} at {start}",
                self.describe(victim)
            );
        }
    }

    fn assign(&mut self, iidx: IntervalIdx, reg: Register) {
        self.ivs[iidx].reg = Some(reg);
        self.used[reg.class.index()].set(reg.index);
        self.active.set(iidx.index(), true);
    }

    fn spill(&mut self, iidx: IntervalIdx) {
        let iv = &self.ivs[iidx];
        assert!(!iv.is_fixed(), "Tried to spill a fixed interval");
        assert_eq!(
            iv.uses_count(),
            0,
            "Tried to spill {} which has uses",
            self.describe(iidx)
        );
        let off = match self.ivs.sibling_spill_offset(iidx) {
            Some(off) => off,
            None => {
                let off = self.stack.allocate(iv.ty());
                log_event!("linear-scan: spilling {} to [{off}]", self.describe(iidx));
                off
            }
        };
        let iv = &mut self.ivs[iidx];
        iv.reg = None;
        iv.spill_offset = Some(off);
    }

    fn split(&mut self, iidx: IntervalIdx, pos: u32) -> IntervalIdx {
        let child = self.ivs.split(iidx, pos);
        self.active.resize(self.ivs.len(), false);
        self.inactive.resize(self.ivs.len(), false);
        child
    }

    /// Insert `iidx` into the unhandled list after every interval starting at or before it.
    fn insert_unhandled(&mut self, iidx: IntervalIdx) {
        let start = self.ivs[iidx].start();
        let ivs = &self.ivs;
        let i = self.next
            + self.unhandled[self.next..].partition_point(|x| ivs[*x].start() <= start);
        self.unhandled.insert(i, iidx);
    }

    fn describe(&self, iidx: IntervalIdx) -> String {
        match self.ivs[iidx].local() {
            Some(l) => format!("%{} ({})", l.index(), self.ivs[iidx]),
            None => format!("{}", self.ivs[iidx]),
        }
    }
}

/// The register with the greatest value in `xs`, preferring the lowest index on ties.
fn pick_max(xs: &[u32; REGS_PER_CLASS]) -> (u8, u32) {
    let mut best = 0;
    for (i, x) in xs.iter().enumerate().skip(1) {
        if *x > xs[best] {
            best = i;
        }
    }
    (u8::try_from(best).unwrap(), xs[best])
}

/// Replace every local operand with the register of the fragment covering it: sources at the
/// instruction's position and destinations one after it.
fn rewrite(
    f: &mut Function,
    num: &Numbering,
    ivs: &Intervals,
    local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>,
) {
    let reg_at = |l: LocalIdx, pos: u32| -> Register {
        let Some(iidx) = local_ivs[l] else {
            panic!("%{} has no interval", l.index())
        };
        let frag = match ivs.split_child(iidx, pos) {
            Some(x) => x,
            None => panic!("%{} is not live at {pos}", l.index()),
        };
        let iv = &ivs[frag];
        match iv.reg {
            Some(r) => r,
            None if iv.is_spilled() => panic!("%{} is spilled at {pos}", l.index()),
            None => panic!("%{} has no location at {pos}", l.index()),
        }
    };
    for b in num.order() {
        for n in f.block_nodes(*b) {
            let pos = num.pos(n);
            let (inst, locals) = f.inst_and_locals_mut(n);
            debug_assert_ne!(inst.opcode, Opcode::Phi);
            inst.rewrite_reads(locals, |l| reg_at(l, pos));
            inst.rewrite_write(locals, |l| reg_at(l, pos + 1));
        }
    }
}
