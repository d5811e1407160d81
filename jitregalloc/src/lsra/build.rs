//! Liveness analysis and interval building.

use crate::{
    interval::{IntervalIdx, Intervals, NUM_FIXED},
    ir::{BlockIdx, Function, LocalIdx},
    numbering::{add_fixed_ranges, Numbering},
    regs::RegisterMasks,
};
use index_vec::IndexVec;
use vob::Vob;

pub(super) struct Liveness {
    pub ivs: Intervals,
    /// Each local's interval. Locals that never occur have none.
    pub local_ivs: IndexVec<LocalIdx, Option<IntervalIdx>>,
    /// For each block, the set of (unsplit) intervals live on entry.
    pub live_in: IndexVec<BlockIdx, Vob>,
    pub max_call_args: u32,
}

/// Compute the live interval of every local in `f` and the fixed interval of every register.
pub(super) fn build_intervals(f: &Function, num: &Numbering, masks: &RegisterMasks) -> Liveness {
    let mut ivs = Intervals::new();
    let max_call_args = add_fixed_ranges(f, num, &mut ivs, masks);

    // Number the locals in the order they are first seen.
    let mut local_ivs = IndexVec::from_vec(vec![None; f.num_locals()]);
    for b in num.order() {
        for n in f.block_nodes(*b) {
            let inst = f.inst(n);
            for l in inst.read_locals().into_iter().chain(inst.written_local()) {
                if local_ivs[l].is_none() {
                    local_ivs[l] = Some(ivs.push_local(l, f.local_ty(l)));
                }
            }
        }
    }

    let live_in = live_sets(f, num, &local_ivs, ivs.len());

    for b in num.order().iter().rev() {
        let (bstart, bend) = num.block_range(*b);
        for succ in f.block(*b).succs() {
            for iidx in live_in[*succ].iter_set_bits(..) {
                ivs[IntervalIdx::from_usize(iidx)].add_range(bstart, bend);
            }
        }
        for n in f.block_nodes(*b).into_iter().rev() {
            let pos = num.pos(n);
            let inst = f.inst(n);
            if let Some(l) = inst.written_local() {
                let iidx = local_iv(&local_ivs, l);
                ivs[iidx].set_start(pos + 1);
                ivs[iidx].add_use(pos + 1);
            }
            for l in inst.read_locals() {
                let iidx = local_iv(&local_ivs, l);
                ivs[iidx].add_range(bstart, pos + 1);
                ivs[iidx].add_use(pos);
            }
        }
    }

    Liveness {
        ivs,
        local_ivs,
        live_in,
        max_call_args,
    }
}

fn local_iv(local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>, l: LocalIdx) -> IntervalIdx {
    match local_ivs[l] {
        Some(iidx) => iidx,
        None => panic!("%{} has no interval", l.index()),
    }
}

/// Iterate the classic backwards dataflow equations to a fixed point, returning each block's
/// live-in set (indexed by interval).
fn live_sets(
    f: &Function,
    num: &Numbering,
    local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>,
    nivs: usize,
) -> IndexVec<BlockIdx, Vob> {
    let empty = Vob::from_elem(false, nivs);
    let mut gen = IndexVec::from_vec(vec![empty.clone(); f.num_blocks()]);
    let mut kill = IndexVec::from_vec(vec![empty.clone(); f.num_blocks()]);
    for b in num.order() {
        for n in f.block_nodes(*b) {
            let inst = f.inst(n);
            for l in inst.read_locals() {
                let i = local_iv(local_ivs, l).index();
                if !kill[*b][i] {
                    gen[*b].set(i, true);
                }
            }
            if let Some(l) = inst.written_local() {
                kill[*b].set(local_iv(local_ivs, l).index(), true);
            }
        }
    }

    let mut live_in = IndexVec::from_vec(vec![empty.clone(); f.num_blocks()]);
    let mut changed = true;
    while changed {
        changed = false;
        // Postorder visits successors before predecessors (back edges aside), so this usually
        // converges in two iterations.
        for b in num.order().iter().rev() {
            let mut new = empty.clone();
            for succ in f.block(*b).succs() {
                new.or(&live_in[*succ]);
            }
            for i in kill[*b].iter_set_bits(..) {
                new.set(i, false);
            }
            new.or(&gen[*b]);
            if new != live_in[*b] {
                live_in[*b] = new;
                changed = true;
            }
        }
    }
    debug_assert!(live_in
        .iter()
        .all(|x| x.iter_set_bits(..NUM_FIXED).next().is_none()));
    live_in
}
