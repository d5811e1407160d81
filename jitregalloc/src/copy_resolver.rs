//! Sequentialising parallel moves.
//!
//! At a split point or a block edge several values may need to move between locations "at the
//! same time". A [CopyResolver] collects such a set of moves and emits an instruction sequence
//! with the same effect: register-to-stack spills first (they only read registers), then
//! register-to-register copies ordered so that no copy overwrites a register a later copy still
//! reads, and finally stack-to-register fills (which only write registers that nothing else reads).
//! Register cycles are broken by routing one value through a scratch stack slot.

use crate::{
    interval::LiveInterval,
    ir::{Inst, Operand, Ty},
    regs::Register,
    stack::StackAllocator,
};
use std::cmp::Reverse;
use vob::Vob;

/// Where a value lives.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Loc {
    Reg(Register),
    /// A spill slot, as a frame offset.
    Stack(i32),
}

impl Loc {
    /// The location of `iv`.
    ///
    /// # Panics
    ///
    /// If `iv` has neither a register nor a spill slot.
    pub fn of(iv: &LiveInterval) -> Self {
        match (iv.reg, iv.spill_offset) {
            (Some(r), _) => Loc::Reg(r),
            (None, Some(off)) => Loc::Stack(off),
            (None, None) => panic!("Interval {iv} has no location"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Move {
    src: Loc,
    dst: Loc,
    ty: Ty,
}

/// The 16 byte scratch slots used to break register cycles, allocated on first use and shared by
/// every [CopyResolver] of a function.
#[derive(Debug, Default)]
pub struct ScratchSlots {
    slots: Vec<i32>,
}

impl ScratchSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&mut self, i: usize, stack: &mut StackAllocator) -> i32 {
        while self.slots.len() <= i {
            self.slots.push(stack.allocate(Ty::V128));
        }
        self.slots[i]
    }
}

#[derive(Debug, Default)]
pub struct CopyResolver {
    moves: Vec<Move>,
}

impl CopyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a move of the value in `from` to wherever `to` keeps it.
    pub fn add_split(&mut self, from: &LiveInterval, to: &LiveInterval) {
        self.add_move(Loc::of(from), Loc::of(to), from.ty());
    }

    /// Add a move from `src` to `dst`. Moves between identical locations are ignored.
    ///
    /// # Panics
    ///
    /// If another move already writes to `dst`.
    pub fn add_move(&mut self, src: Loc, dst: Loc, ty: Ty) {
        if src == dst {
            return;
        }
        assert!(
            self.moves.iter().all(|m| m.dst != dst),
            "Two moves to {dst:?}"
        );
        self.moves.push(Move { src, dst, ty });
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Produce the instructions implementing this set of moves, consuming the resolver.
    pub fn sequence(self, stack: &mut StackAllocator, scratch: &mut ScratchSlots) -> Vec<Inst> {
        let mut spills = Vec::new();
        let mut copies = Vec::new();
        let mut fills = Vec::new();
        for Move { src, dst, ty } in self.moves {
            match (src, dst) {
                (Loc::Reg(r), Loc::Stack(off)) => spills.push(Inst::spill(off, r, ty)),
                (Loc::Reg(s), Loc::Reg(d)) => copies.push((s, d, ty)),
                (Loc::Stack(off), Loc::Reg(r)) => fills.push(Inst::fill(r, ty, off)),
                (Loc::Stack(s), Loc::Stack(d)) => {
                    panic!("Stack to stack move from {s} to {d}")
                }
            }
        }

        let mut scratch_fills = Vec::new();
        let mut k = 0;
        loop {
            match toposort(&copies) {
                Ok(ordered) => {
                    copies.sort_by_key(|(s, d, _)| {
                        Reverse((ordered[s.flat_index()], ordered[d.flat_index()]))
                    });
                    break;
                }
                Err(break_reg) => {
                    // Save the value `break_reg` is meant to receive before any copy runs and
                    // restore it into `break_reg` after they have all run.
                    let i = copies
                        .iter()
                        .position(|(_, d, _)| *d == break_reg)
                        .unwrap_or_else(|| panic!("No copy into {break_reg}"));
                    let (src, dst, ty) = copies.remove(i);
                    let off = scratch.get(k, stack);
                    k += 1;
                    spills.push(Inst::spill(off, src, ty));
                    scratch_fills.push(Inst::fill(dst, ty, off));
                }
            }
        }

        let mut seq = spills;
        seq.extend(
            copies
                .into_iter()
                .map(|(s, d, ty)| Inst::copy(Operand::Reg(d, ty), Operand::Reg(s, ty))),
        );
        seq.extend(scratch_fills);
        seq.extend(fills);
        seq
    }
}

/// Topologically sort the registers in `copies` with Kahn's algorithm, where registers are nodes
/// and copies are edges. On success, returns each register's position in the order. On failure
/// (i.e. there is a cycle), returns a register within, or reachable from, a cycle.
fn toposort(copies: &[(Register, Register, Ty)]) -> Result<Vec<usize>, Register> {
    const NUM_REGS: usize = crate::interval::NUM_FIXED;
    let mut nodes = Vob::from_elem(false, NUM_REGS);
    let mut indegrees = vec![0; NUM_REGS];
    for (s, d, _) in copies {
        nodes.set(s.flat_index(), true);
        nodes.set(d.flat_index(), true);
        indegrees[d.flat_index()] += 1;
    }

    let mut queue = nodes
        .iter_set_bits(..)
        .filter(|x| indegrees[*x] == 0)
        .collect::<Vec<_>>();
    let mut ordered = vec![usize::MAX; NUM_REGS];
    let mut n = 0;
    while let Some(x) = queue.pop() {
        ordered[x] = n;
        n += 1;
        for (s, d, _) in copies {
            if s.flat_index() == x {
                let d = d.flat_index();
                assert!(indegrees[d] > 0);
                indegrees[d] -= 1;
                if indegrees[d] == 0 {
                    queue.push(d);
                }
            }
        }
    }

    if n == nodes.iter_set_bits(..).count() {
        Ok(ordered)
    } else {
        let i = indegrees
            .iter()
            .position(|degree| *degree > 0)
            .unwrap_or_else(|| panic!("Cycle without a register"));
        Err(Register::from_flat_index(i))
    }
}
