//! Inserting the moves implied by splitting.
//!
//! Within a block, a value moves when one of its fragments ends exactly where the next begins.
//! Across a control flow edge `B -> S`, a value live into `S` moves if the fragment covering the
//! end of `B` differs from the one covering the start of `S`. Edge moves are placed at the end of
//! `B` if that is the only place control goes from `B`; else at the start of `S` if `B` is the
//! only place control comes from; else (a critical edge) in a new block on the edge.

use crate::{
    copy_resolver::{CopyResolver, ScratchSlots},
    interval::{IntervalIdx, Intervals},
    ir::{BlockIdx, Function, Inst, LocalIdx},
    log::log_event,
    numbering::{Numbering, Slot},
    stack::StackAllocator,
};
use index_vec::IndexVec;
use std::collections::BTreeMap;
use vob::Vob;

pub(super) fn insert_split_copies(
    f: &mut Function,
    num: &Numbering,
    ivs: &Intervals,
    local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>,
    stack: &mut StackAllocator,
    scratch: &mut ScratchSlots,
) {
    // All moves at the same position are parallel.
    let mut resolvers = BTreeMap::<u32, CopyResolver>::new();
    for parent in local_ivs.iter().flatten() {
        if !ivs[*parent].has_children() {
            continue;
        }
        let frags = ivs.fragments(*parent);
        for w in frags.windows(2) {
            let (a, b) = (&ivs[w[0]], &ivs[w[1]]);
            let pos = b.start();
            if a.end() == pos && !num.is_block_start(pos) {
                resolvers.entry(pos).or_default().add_split(a, b);
            }
        }
    }

    for (pos, cr) in resolvers {
        if cr.is_empty() {
            continue;
        }
        let seq = cr.sequence(stack, scratch);
        match num.slot(pos) {
            Slot::Inst(n) => {
                for inst in seq {
                    f.insert_before(n, inst);
                }
            }
            Slot::Empty(b) => {
                for inst in seq {
                    f.push(b, inst);
                }
            }
        }
    }
}

pub(super) fn resolve_edges(
    f: &mut Function,
    num: &Numbering,
    ivs: &Intervals,
    live_in: &IndexVec<BlockIdx, Vob>,
    stack: &mut StackAllocator,
    scratch: &mut ScratchSlots,
) {
    for b in num.order() {
        let (_, bend) = num.block_range(*b);
        let succs = f.block(*b).succs().to_vec();
        for s in succs {
            let (sstart, _) = num.block_range(s);
            let mut cr = CopyResolver::new();
            for i in live_in[s].iter_set_bits(..) {
                let parent = IntervalIdx::from_usize(i);
                if !ivs[parent].has_children() {
                    continue;
                }
                let (Some(from), Some(to)) = (
                    ivs.split_child(parent, bend - 1),
                    ivs.split_child(parent, sstart),
                ) else {
                    panic!("Interval {i} is live into bb{} but not covered", s.index());
                };
                if from != to {
                    cr.add_split(&ivs[from], &ivs[to]);
                }
            }
            if cr.is_empty() {
                continue;
            }
            let seq = cr.sequence(stack, scratch);
            if f.block(*b).succs().len() <= 1 {
                for inst in seq {
                    f.insert_before_terminator(*b, inst);
                }
            } else if f.block(s).preds().len() == 1 {
                prepend(f, s, seq);
            } else {
                let new = f.split_edge(*b, s);
                log_event!(
                    "linear-scan: split critical edge bb{} -> bb{} with bb{}",
                    b.index(),
                    s.index(),
                    new.index()
                );
                for inst in seq {
                    f.push(new, inst);
                }
            }
        }
    }
}

/// Insert `seq`, in order, at the start of `b`.
fn prepend(f: &mut Function, b: BlockIdx, seq: Vec<Inst>) {
    match f.block(b).first() {
        Some(first) => {
            for inst in seq {
                f.insert_before(first, inst);
            }
        }
        None => {
            for inst in seq {
                f.push(b, inst);
            }
        }
    }
}
