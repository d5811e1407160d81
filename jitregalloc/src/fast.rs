//! A single pass linear scan allocator that never splits.
//!
//! Every local gets one range, from its first to its last occurrence in linear order (extended
//! over loops), and lives either in one register or in one spill slot for all of it. Spilled
//! locals are accessed through a few registers reserved as temporaries: filled before each
//! instruction that reads them and spilled after each instruction that writes them. Since no value
//! ever changes location, no moves are needed on control flow edges.

use crate::{
    copy_resolver::Loc,
    errors::RegAllocError,
    interval::{IntervalIdx, Intervals},
    ir::{BlockIdx, Function, Inst, LocalIdx, Ty},
    log::{log_event, Verbosity, LOG},
    numbering::{add_fixed_ranges, Numbering},
    regs::{RegClass, RegSet, Register, RegisterMasks},
    stack::StackAllocator,
    AllocationResult, RegisterAllocator,
};
use index_vec::IndexVec;
use smallvec::SmallVec;

/// The most registers per class reserved as spill temporaries.
const MAX_TEMPS: u32 = 4;

type Temps = SmallVec<[Register; MAX_TEMPS as usize]>;

/// The fast linear scan allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastLinearScan;

impl RegisterAllocator for FastLinearScan {
    fn allocate(
        &self,
        f: &mut Function,
        stack: &mut StackAllocator,
        masks: &RegisterMasks,
    ) -> Result<AllocationResult, RegAllocError> {
        crate::prepare(f, stack)?;
        let num = Numbering::new(f);
        let (ivs, local_ivs) = build_intervals(f, &num, masks);
        let mut ra = FastState::new(ivs, masks, temp_demand(f), stack);
        ra.run(&local_ivs);
        ra.rewrite(f, &num, &local_ivs);
        crate::finish(f);

        Ok(AllocationResult {
            used_int_regs: ra.used[RegClass::Int.index()].bits(),
            used_vec_regs: ra.used[RegClass::Vec.index()].bits(),
            spill_region_size: ra.stack.size(),
            max_call_args: 0,
        })
    }
}

/// Build one single-range interval per local, and the fixed intervals.
fn build_intervals(
    f: &Function,
    num: &Numbering,
    masks: &RegisterMasks,
) -> (Intervals, IndexVec<LocalIdx, Option<IntervalIdx>>) {
    let mut ivs = Intervals::new();
    add_fixed_ranges(f, num, &mut ivs, masks);
    let mut local_ivs: IndexVec<LocalIdx, Option<IntervalIdx>> =
        IndexVec::from_vec(vec![None; f.num_locals()]);
    for b in num.order() {
        for n in f.block_nodes(*b) {
            let pos = num.pos(n);
            let inst = f.inst(n);
            for l in inst.read_locals() {
                occur(&mut ivs, &mut local_ivs, l, f.local_ty(l), 0, pos + 1);
            }
            if let Some(l) = inst.written_local() {
                occur(&mut ivs, &mut local_ivs, l, f.local_ty(l), pos + 1, pos + 2);
            }
        }

        let (_, bend) = num.block_range(*b);
        for s in f.block(*b).succs() {
            if !is_back_edge(num, *b, *s) {
                continue;
            }
            let (sstart, _) = num.block_range(*s);
            for iidx in local_ivs.iter().flatten() {
                let iv = &mut ivs[*iidx];
                if iv.start() <= sstart && iv.end() > sstart {
                    iv.extend_end(bend);
                }
            }
        }
    }
    (ivs, local_ivs)
}

/// Record an occurrence of `l` covering `[start, end)`: the first creates its interval, later
/// ones extend it.
fn occur(
    ivs: &mut Intervals,
    local_ivs: &mut IndexVec<LocalIdx, Option<IntervalIdx>>,
    l: LocalIdx,
    ty: Ty,
    start: u32,
    end: u32,
) {
    match local_ivs[l] {
        Some(iidx) => ivs[iidx].extend_end(end),
        None => {
            let iidx = ivs.push_local(l, ty);
            ivs[iidx].add_range(start, end);
            local_ivs[l] = Some(iidx);
        }
    }
}

fn is_back_edge(num: &Numbering, from: BlockIdx, to: BlockIdx) -> bool {
    matches!(
        (num.linear_idx(from), num.linear_idx(to)),
        (Some(x), Some(y)) if y <= x
    )
}

/// Per class, the most distinct locals any one instruction of `f` mentions. A spilled destination
/// reuses the temporary of a spilled source of its class, so it only counts when no local of its
/// class is read.
fn temp_demand(f: &Function) -> [u32; 2] {
    let mut demand = [0; 2];
    for b in f.block_indices() {
        for n in f.block_nodes(b) {
            let inst = f.inst(n);
            let mut reads = SmallVec::<[LocalIdx; 4]>::new();
            for l in inst.read_locals() {
                if !reads.contains(&l) {
                    reads.push(l);
                }
            }
            let mut per_class = [0; 2];
            for l in &reads {
                per_class[f.local_ty(*l).class().index()] += 1;
            }
            if let Some(l) = inst.written_local() {
                let c = f.local_ty(l).class().index();
                per_class[c] = per_class[c].max(1);
            }
            for (d, x) in demand.iter_mut().zip(per_class) {
                *d = (*d).max(x);
            }
        }
    }
    demand
}

/// The registers of `class` reserved as spill temporaries, highest index first.
///
/// Half the class's registers (at most [MAX_TEMPS]) are reserved, or more if an instruction needs
/// more temporaries than that, but at least one register is always left for intervals.
fn spill_temps(masks: &RegisterMasks, class: RegClass, demand: u32) -> Temps {
    let avail = masks.class(class).available;
    let n = (avail.count() / 2)
        .max(demand)
        .min(MAX_TEMPS)
        .min(avail.count().saturating_sub(1));
    let mut rest = avail;
    let mut temps = Temps::new();
    for _ in 0..n {
        if let Some(r) = rest.highest() {
            rest.unset(r);
            temps.push(Register::new(class, r));
        }
    }
    if temps.is_empty() && !avail.is_empty() {
        LOG.log(
            Verbosity::Warning,
            &format!("fast: too few {class} registers to reserve spill temporaries"),
        );
    }
    temps
}

struct FastState<'a> {
    ivs: Intervals,
    stack: &'a mut StackAllocator,
    /// Per class, the registers intervals can be assigned.
    allocatable: [RegSet; 2],
    temps: [Temps; 2],
    used: [RegSet; 2],
}

impl<'a> FastState<'a> {
    fn new(
        ivs: Intervals,
        masks: &RegisterMasks,
        demand: [u32; 2],
        stack: &'a mut StackAllocator,
    ) -> Self {
        let temps = [
            spill_temps(masks, RegClass::Int, demand[0]),
            spill_temps(masks, RegClass::Vec, demand[1]),
        ];
        let mut allocatable = [masks.int.available, masks.vec.available];
        for (a, ts) in allocatable.iter_mut().zip(temps.iter()) {
            for t in ts {
                a.unset(t.index);
            }
        }
        Self {
            ivs,
            stack,
            allocatable,
            temps,
            used: [RegSet::blank(); 2],
        }
    }

    /// Is `reg` claimed by the IR at any point during `cur`?
    fn fixed_blocks(&self, reg: Register, cur: IntervalIdx) -> bool {
        self.ivs[self.ivs.fixed(reg)].overlaps(&self.ivs[cur])
    }

    fn run(&mut self, local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>) {
        let mut unhandled = local_ivs.iter().flatten().copied().collect::<Vec<_>>();
        unhandled.sort_by_key(|iidx| self.ivs[*iidx].start());
        let mut active = Vec::<IntervalIdx>::new();
        for cur in unhandled {
            let start = self.ivs[cur].start();
            active.retain(|x| self.ivs[*x].end() > start);

            let class = self.ivs[cur].class();
            let mut free = self.allocatable[class.index()];
            for x in &active {
                if let Some(r) = self.ivs[*x].reg {
                    if r.class == class {
                        free.unset(r.index);
                    }
                }
            }
            for r in free.iter() {
                if self.fixed_blocks(Register::new(class, r), cur) {
                    free.unset(r);
                }
            }
            if let Some(r) = free.highest() {
                self.assign(cur, Register::new(class, r));
                active.push(cur);
                continue;
            }

            let victim = active
                .iter()
                .filter_map(|x| match self.ivs[*x].reg {
                    Some(r) if r.class == class && !self.fixed_blocks(r, cur) => Some((*x, r)),
                    _ => None,
                })
                .max_by_key(|(x, _)| self.ivs[*x].end());
            match victim {
                Some((v, reg)) if self.ivs[v].end() > self.ivs[cur].end() => {
                    active.retain(|x| *x != v);
                    self.spill(v);
                    self.assign(cur, reg);
                    active.push(cur);
                }
                _ => self.spill(cur),
            }
        }
    }

    fn assign(&mut self, iidx: IntervalIdx, reg: Register) {
        self.ivs[iidx].reg = Some(reg);
        self.used[reg.class.index()].set(reg.index);
    }

    fn spill(&mut self, iidx: IntervalIdx) {
        let off = self.stack.allocate(self.ivs[iidx].ty());
        let iv = &mut self.ivs[iidx];
        iv.reg = None;
        iv.spill_offset = Some(off);
        if let Some(l) = iv.local() {
            log_event!("fast: spilling %{} ({iv}) to [{off}]", l.index());
        }
    }

    /// Replace every local with its register, accessing spilled locals through temporaries.
    fn rewrite(
        &mut self,
        f: &mut Function,
        num: &Numbering,
        local_ivs: &IndexVec<LocalIdx, Option<IntervalIdx>>,
    ) {
        let loc = |ivs: &Intervals, l: LocalIdx| -> Loc {
            let Some(iidx) = local_ivs[l] else {
                panic!("%{} has no interval", l.index())
            };
            match (ivs[iidx].reg, ivs[iidx].spill_offset) {
                (Some(r), _) => Loc::Reg(r),
                (None, Some(off)) => Loc::Stack(off),
                (None, None) => panic!("%{} was never allocated", l.index()),
            }
        };
        // Per class, where the round-robin over temporaries starts for the next instruction.
        let mut next_temp = [0; 2];
        for b in num.order() {
            for n in f.block_nodes(*b) {
                let pos = num.pos(n);
                let inst = f.inst(n);
                let mut named = inst.read_regs();
                named.extend(inst.written_reg());

                let mut reads = SmallVec::<[(LocalIdx, Register); 4]>::new();
                let mut fills = SmallVec::<[Inst; 4]>::new();
                for l in inst.read_locals() {
                    if reads.iter().any(|(x, _)| *x == l) {
                        continue;
                    }
                    if let Loc::Stack(off) = loc(&self.ivs, l) {
                        let ty = f.local_ty(l);
                        let exclude = reads.iter().map(|(_, r)| *r).collect::<Temps>();
                        let t = self.temp(ty, pos, &named, &exclude, &next_temp, l);
                        reads.push((l, t));
                        fills.push(Inst::fill(t, ty, off));
                    }
                }
                let mut spill = None;
                if let Some(l) = inst.written_local() {
                    if let Loc::Stack(off) = loc(&self.ivs, l) {
                        let ty = f.local_ty(l);
                        // The destination is written after every read, so it may share a
                        // temporary with one.
                        let t = match reads.iter().find(|(x, _)| *x == l) {
                            Some((_, t)) => *t,
                            None => self.temp(ty, pos, &named, &Temps::new(), &next_temp, l),
                        };
                        spill = Some((l, t, Inst::spill(off, t, ty)));
                    }
                }

                let mut used_temps = [false; 2];
                for t in reads.iter().map(|(_, t)| t).chain(spill.iter().map(|(_, t, _)| t)) {
                    used_temps[t.class.index()] = true;
                    self.used[t.class.index()].set(t.index);
                }
                for (i, used) in used_temps.iter().enumerate() {
                    if *used {
                        next_temp[i] = (next_temp[i] + 1) % self.temps[i].len();
                    }
                }

                let ivs = &self.ivs;
                let (inst, locals) = f.inst_and_locals_mut(n);
                inst.rewrite_reads(locals, |l| match loc(ivs, l) {
                    Loc::Reg(r) => r,
                    Loc::Stack(_) => match reads.iter().find(|(x, _)| *x == l) {
                        Some((_, t)) => *t,
                        None => panic!("%{} has no temporary at {pos}", l.index()),
                    },
                });
                inst.rewrite_write(locals, |l| match (loc(ivs, l), &spill) {
                    (Loc::Reg(r), _) => r,
                    (Loc::Stack(_), Some((_, t, _))) => *t,
                    (Loc::Stack(_), None) => panic!("%{} has no temporary at {pos}", l.index()),
                });
                for fill in fills {
                    f.insert_before(n, fill);
                }
                if let Some((_, _, inst)) = spill {
                    f.insert_after(n, inst);
                }
            }
        }
    }

    /// A spill temporary of `ty`'s class for `l` at the instruction at `pos`: one that is neither
    /// in `exclude` nor claimed by the instruction itself.
    fn temp(
        &self,
        ty: Ty,
        pos: u32,
        named: &[Register],
        exclude: &[Register],
        next_temp: &[usize; 2],
        l: LocalIdx,
    ) -> Register {
        let class = ty.class();
        let temps = &self.temps[class.index()];
        (0..temps.len())
            .map(|i| temps[(next_temp[class.index()] + i) % temps.len()])
            .find(|t| {
                let fixed = &self.ivs[self.ivs.fixed(*t)];
                !named.contains(t)
                    && !exclude.contains(t)
                    && !fixed.overlaps_pos(pos)
                    && !fixed.overlaps_pos(pos + 1)
            })
            .unwrap_or_else(|| panic!("No spill temporary available for %{} at {pos}", l.index()))
    }
}
