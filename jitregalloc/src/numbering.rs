//! Linear program positions.
//!
//! Instructions are numbered in reverse postorder, [INSTRUCTION_GAP] positions apart, starting at
//! 0. An instruction at position `P` reads its operands at `P` and writes its destination at
//! `P + 1`, so a value last read by an instruction and a value written by it do not overlap. Moves
//! for a split at (even) position `S` execute immediately before the instruction at `S`. An empty
//! block is given one dummy slot so that every block covers at least one position.

use crate::{
    interval::Intervals,
    ir::{BlockIdx, Function, NodeIdx, Opcode},
    regs::{RegClass, RegisterMasks, Register, REGS_PER_CLASS},
};
use index_vec::IndexVec;
use strum::EnumCount;
use vob::Vob;

pub const INSTRUCTION_GAP: u32 = 2;

/// The latest position at or before `pos` at which moves can be inserted.
pub fn split_position(pos: u32) -> u32 {
    pos & !(INSTRUCTION_GAP - 1)
}

/// What occupies the slot at an even position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    Inst(NodeIdx),
    /// The dummy slot of an empty block.
    Empty(BlockIdx),
}

#[derive(Debug)]
pub struct Numbering {
    order: Vec<BlockIdx>,
    /// The `[start, end)` positions of each block. Unreachable blocks are `(0, 0)`.
    block_ranges: IndexVec<BlockIdx, (u32, u32)>,
    /// The position of each (pre-existing) node.
    node_pos: IndexVec<NodeIdx, Option<u32>>,
    /// The slot at each position `/ INSTRUCTION_GAP`.
    slots: Vec<Slot>,
    /// Each block's index in `order`.
    linear_idx: IndexVec<BlockIdx, Option<usize>>,
    /// One bit per slot: set if the slot is the first of its block.
    block_starts: Vob,
}

impl Numbering {
    pub fn new(f: &Function) -> Self {
        let order = f.reverse_postorder();
        let mut block_ranges = IndexVec::from_vec(vec![(0, 0); f.num_blocks()]);
        let mut node_pos = IndexVec::from_vec(vec![None; f.num_nodes()]);
        let mut linear_idx = IndexVec::from_vec(vec![None; f.num_blocks()]);
        let mut slots = Vec::new();
        let mut block_starts = Vob::new();
        for (i, b) in order.iter().enumerate() {
            linear_idx[*b] = Some(i);
            let start = slot_pos(slots.len());
            block_starts.resize(slots.len(), false);
            block_starts.push(true);
            let nodes = f.block_nodes(*b);
            if nodes.is_empty() {
                slots.push(Slot::Empty(*b));
            }
            for n in nodes {
                node_pos[n] = Some(slot_pos(slots.len()));
                slots.push(Slot::Inst(n));
            }
            block_ranges[*b] = (start, slot_pos(slots.len()));
        }
        block_starts.resize(slots.len(), false);
        Self {
            order,
            block_ranges,
            node_pos,
            slots,
            linear_idx,
            block_starts,
        }
    }

    /// The blocks in linear (reverse postorder) order.
    pub fn order(&self) -> &[BlockIdx] {
        &self.order
    }

    /// The position of the node `n`.
    ///
    /// # Panics
    ///
    /// If `n` was inserted after numbering.
    pub fn pos(&self, n: NodeIdx) -> u32 {
        match self.node_pos.get(n).copied().flatten() {
            Some(p) => p,
            None => panic!("Node {} has no position", n.index()),
        }
    }

    pub fn block_range(&self, b: BlockIdx) -> (u32, u32) {
        self.block_ranges[b]
    }

    pub fn linear_idx(&self, b: BlockIdx) -> Option<usize> {
        self.linear_idx[b]
    }

    /// The slot at the even position `pos`.
    pub fn slot(&self, pos: u32) -> Slot {
        debug_assert_eq!(pos % INSTRUCTION_GAP, 0);
        self.slots[(pos / INSTRUCTION_GAP) as usize]
    }

    /// Is `pos` the first position of a block?
    pub fn is_block_start(&self, pos: u32) -> bool {
        pos % INSTRUCTION_GAP == 0 && self.block_starts[(pos / INSTRUCTION_GAP) as usize]
    }
}

fn slot_pos(slot: usize) -> u32 {
    u32::try_from(slot).unwrap() * INSTRUCTION_GAP
}

/// Add the ranges during which each physical register is claimed by the IR itself to the fixed
/// intervals in `ivs`, returning the largest number of arguments passed to a call.
///
/// A register written at `P` and next read at `Q` in the same block is claimed for `[P + 1, Q +
/// 1)`; one read with no earlier write in its block is claimed from the block's start; one written
/// and never read is claimed for `[P + 1, P + 2)`. A call at `P` claims every caller-saved
/// register for `[P + 1, P + 2)`.
pub fn add_fixed_ranges(
    f: &Function,
    num: &Numbering,
    ivs: &mut Intervals,
    masks: &RegisterMasks,
) -> u32 {
    let mut max_call_args = 0;
    let caller_saved = [RegClass::Int, RegClass::Vec]
        .into_iter()
        .flat_map(|class| {
            masks
                .class(class)
                .caller_saved
                .iter()
                .map(move |i| Register::new(class, i))
        })
        .collect::<Vec<_>>();
    for b in num.order() {
        let (bstart, _) = num.block_range(*b);
        // For each register, the end of the range claimed by a read later in the block.
        let mut live_until = [None; REGS_PER_CLASS * RegClass::COUNT];
        for n in f.block_nodes(*b).into_iter().rev() {
            let pos = num.pos(n);
            let inst = f.inst(n);
            if inst.opcode == Opcode::Call {
                max_call_args = max_call_args.max(u32::try_from(inst.srcs.len()).unwrap());
                for r in &caller_saved {
                    let iidx = ivs.fixed(*r);
                    ivs[iidx].add_range(pos + 1, pos + 2);
                }
            }
            if let Some(r) = inst.written_reg() {
                let end = live_until[r.flat_index()].take().unwrap_or(pos + 2);
                let iidx = ivs.fixed(r);
                ivs[iidx].add_range(pos + 1, end);
            }
            for r in inst.read_regs() {
                live_until[r.flat_index()].get_or_insert(pos + 1);
            }
        }
        for (i, end) in live_until.iter().enumerate() {
            if let Some(end) = end {
                let iidx = ivs.fixed(Register::from_flat_index(i));
                ivs[iidx].add_range(bstart, *end);
            }
        }
    }
    max_call_args
}
