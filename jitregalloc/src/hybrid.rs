//! A local register allocator.
//!
//! No live ranges are computed. Blocks are visited in reverse postorder and each block starts with
//! an empty register file: a value is given a register when an instruction needs it and keeps it
//! until it is exhausted (all the instructions mentioning it have been allocated), evicted, or the
//! block ends. Values that cross blocks live in their spill slots between blocks, so no moves are
//! ever needed on control flow edges.
//!
//! A value is *block-local* if every instruction mentioning it is in one block and the first of
//! them defines it. Such values never need to be written to their spill slot once they are
//! exhausted.

use crate::{
    errors::RegAllocError,
    ir::{BlockIdx, Function, Inst, LocalIdx, NodeIdx, Opcode, Ty},
    log::log_event,
    regs::{RegClass, RegSet, Register, RegisterMasks, REGS_PER_CLASS},
    stack::StackAllocator,
    AllocationResult, RegisterAllocator,
};
use index_vec::IndexVec;
use smallvec::SmallVec;

/// The hybrid local allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hybrid;

impl RegisterAllocator for Hybrid {
    fn allocate(
        &self,
        f: &mut Function,
        stack: &mut StackAllocator,
        masks: &RegisterMasks,
    ) -> Result<AllocationResult, RegAllocError> {
        crate::prepare(f, stack)?;
        let order = f.reverse_postorder();
        let mut ra = HybridState::new(f, &order, masks, stack);
        for b in order {
            ra.alloc_block(f, b);
        }
        crate::finish(f);

        Ok(AllocationResult {
            used_int_regs: ra.used[RegClass::Int.index()].bits(),
            used_vec_regs: ra.used[RegClass::Vec.index()].bits(),
            spill_region_size: ra.stack.size(),
            max_call_args: 0,
        })
    }
}

#[derive(Clone, Debug)]
struct LocalInfo {
    ty: Ty,
    /// How many instructions mention the local.
    occurrences: u32,
    /// How many of those have been allocated so far.
    seen: u32,
    /// How many instructions define the local.
    defs: u32,
    block_local: bool,
    reg: Option<Register>,
    slot: Option<i32>,
    /// Does the register hold a value not yet written to the spill slot?
    dirty: bool,
}

impl LocalInfo {
    fn exhausted(&self) -> bool {
        self.seen == self.occurrences
    }

    /// Can the value be read again after the current point, other than by instructions still to
    /// be allocated? That happens when a value defined in more than one place is carried round a
    /// loop.
    fn reread_via_slot(&self) -> bool {
        !self.block_local && self.defs > 1
    }
}

/// The distinct locals an instruction reads.
fn distinct_reads(inst: &Inst) -> SmallVec<[LocalIdx; 4]> {
    let mut ls = SmallVec::<[LocalIdx; 4]>::new();
    for l in inst.read_locals() {
        if !ls.contains(&l) {
            ls.push(l);
        }
    }
    ls
}

/// Count occurrences and definitions of every local and work out which are block-local.
fn local_infos(f: &Function, order: &[BlockIdx]) -> IndexVec<LocalIdx, LocalInfo> {
    let mut infos = f
        .locals()
        .iter()
        .map(|ty| LocalInfo {
            ty: *ty,
            occurrences: 0,
            seen: 0,
            defs: 0,
            block_local: false,
            reg: None,
            slot: None,
            dirty: false,
        })
        .collect::<IndexVec<LocalIdx, _>>();
    let mut home = IndexVec::<LocalIdx, Option<BlockIdx>>::from_vec(vec![None; f.num_locals()]);
    for b in order {
        for n in f.block_nodes(*b) {
            let inst = f.inst(n);
            let reads = distinct_reads(inst);
            let written = inst.written_local();
            let mut mentioned = reads.clone();
            if let Some(l) = written {
                infos[l].defs += 1;
                if !mentioned.contains(&l) {
                    mentioned.push(l);
                }
            }
            for l in mentioned {
                infos[l].occurrences += 1;
                match home[l] {
                    None => {
                        home[l] = Some(*b);
                        infos[l].block_local = written == Some(l) && !reads.contains(&l);
                    }
                    Some(h) if h != *b => infos[l].block_local = false,
                    Some(_) => (),
                }
            }
        }
    }
    infos
}

/// For each instruction in `nodes`, the registers the IR itself uses while it executes: the ones
/// it names, and the ones written before it and read after it.
fn fixed_in_use(f: &Function, nodes: &[NodeIdx]) -> Vec<[RegSet; 2]> {
    let mut live = [RegSet::blank(); 2];
    let mut busy = vec![[RegSet::blank(); 2]; nodes.len()];
    for (i, n) in nodes.iter().enumerate().rev() {
        let inst = f.inst(*n);
        let mut b = live;
        if let Some(r) = inst.written_reg() {
            b[r.class.index()].set(r.index);
            live[r.class.index()].unset(r.index);
        }
        for r in inst.read_regs() {
            b[r.class.index()].set(r.index);
            live[r.class.index()].set(r.index);
        }
        busy[i] = b;
    }
    busy
}

struct HybridState<'a> {
    masks: &'a RegisterMasks,
    stack: &'a mut StackAllocator,
    infos: IndexVec<LocalIdx, LocalInfo>,
    /// The local each register holds, per class.
    holders: [[Option<LocalIdx>; REGS_PER_CLASS]; 2],
    used: [RegSet; 2],
}

impl<'a> HybridState<'a> {
    fn new(
        f: &Function,
        order: &[BlockIdx],
        masks: &'a RegisterMasks,
        stack: &'a mut StackAllocator,
    ) -> Self {
        Self {
            masks,
            stack,
            infos: local_infos(f, order),
            holders: [[None; REGS_PER_CLASS]; 2],
            used: [RegSet::blank(); 2],
        }
    }

    fn alloc_block(&mut self, f: &mut Function, b: BlockIdx) {
        let nodes = f.block_nodes(b);
        let busy = fixed_in_use(f, &nodes);
        for (n, busy) in nodes.iter().zip(busy) {
            self.alloc_inst(f, *n, busy);
        }

        let has_succs = !f.block(b).succs().is_empty();
        let mut spills = Vec::new();
        for class in [RegClass::Int, RegClass::Vec] {
            for i in 0..REGS_PER_CLASS {
                let Some(l) = self.holders[class.index()][i].take() else {
                    continue;
                };
                let reg = Register::new(class, u8::try_from(i).unwrap());
                let info = &self.infos[l];
                if has_succs && !info.block_local && info.dirty {
                    self.spill(l, reg, &mut spills);
                }
                let info = &mut self.infos[l];
                info.reg = None;
                info.dirty = false;
            }
        }
        for inst in spills {
            f.insert_before_terminator(b, inst);
        }
    }

    fn alloc_inst(&mut self, f: &mut Function, n: NodeIdx, busy: [RegSet; 2]) {
        let inst = f.inst(n);
        let reads = distinct_reads(inst);
        let written = inst.written_local();
        let is_call = inst.opcode == Opcode::Call;
        let mut before = Vec::new();
        let mut after = Vec::new();

        for class in [RegClass::Int, RegClass::Vec] {
            for r in busy[class.index()].iter() {
                self.evict(Register::new(class, r), &mut before);
            }
            if is_call {
                for r in self.masks.class(class).caller_saved.iter() {
                    self.evict(Register::new(class, r), &mut before);
                }
            }
        }

        // Registers already holding one of this instruction's sources must not be taken by
        // another source.
        let mut in_use = [RegSet::blank(); 2];
        for l in &reads {
            if let Some(r) = self.infos[*l].reg {
                in_use[r.class.index()].set(r.index);
            }
        }
        let mut read_regs = SmallVec::<[(LocalIdx, Register); 4]>::new();
        for l in &reads {
            let r = match self.infos[*l].reg {
                Some(r) => r,
                None => {
                    let r = self.choose_reg(self.infos[*l].ty.class(), busy, in_use, &mut before);
                    self.fill(*l, r, &mut before);
                    r
                }
            };
            in_use[r.class.index()].set(r.index);
            read_regs.push((*l, r));
        }

        for l in &reads {
            self.infos[*l].seen += 1;
        }
        if let Some(l) = written.filter(|l| !reads.contains(l)) {
            self.infos[l].seen += 1;
        }
        for l in &reads {
            if Some(*l) != written && self.infos[*l].exhausted() {
                self.release(*l, &mut before);
            }
        }

        let write_reg = written.map(|l| {
            let r = match self.infos[l].reg {
                Some(r) => r,
                None => {
                    // Sources are read before the destination is written, so any of their
                    // registers may be reused.
                    let none = [RegSet::blank(); 2];
                    let r = self.choose_reg(self.infos[l].ty.class(), busy, none, &mut before);
                    self.take(l, r);
                    r
                }
            };
            self.infos[l].dirty = true;
            if self.infos[l].exhausted() {
                self.release(l, &mut after);
            }
            r
        });

        let (inst, locals) = f.inst_and_locals_mut(n);
        inst.rewrite_reads(locals, |l| match read_regs.iter().find(|(x, _)| *x == l) {
            Some((_, r)) => *r,
            None => panic!("%{} was not given a register", l.index()),
        });
        if let Some(r) = write_reg {
            inst.rewrite_write(locals, |_| r);
        }
        for inst in before {
            f.insert_before(n, inst);
        }
        for inst in after.into_iter().rev() {
            f.insert_after(n, inst);
        }
    }

    /// A register of `class` for the current instruction: never one in `busy` or `in_use`. A free
    /// one if possible, otherwise one taken from its holder, preferring holders that are not
    /// block-local.
    fn choose_reg(
        &mut self,
        class: RegClass,
        busy: [RegSet; 2],
        in_use: [RegSet; 2],
        before: &mut Vec<Inst>,
    ) -> Register {
        let ci = class.index();
        let cands = self
            .masks
            .class(class)
            .available
            .difference(busy[ci])
            .difference(in_use[ci]);
        let mut free = RegSet::blank();
        let mut non_local = RegSet::blank();
        for r in cands.iter() {
            match self.holders[ci][usize::from(r)] {
                None => free.set(r),
                Some(l) if !self.infos[l].block_local => non_local.set(r),
                Some(_) => (),
            }
        }
        let r = match free.highest().or(non_local.highest()).or(cands.highest()) {
            Some(r) => Register::new(class, r),
            None => panic!("No register available for a {class} value"),
        };
        self.evict(r, before);
        r
    }

    /// Make `l` the holder of `reg`.
    fn take(&mut self, l: LocalIdx, reg: Register) {
        self.holders[reg.class.index()][usize::from(reg.index)] = Some(l);
        self.used[reg.class.index()].set(reg.index);
        self.infos[l].reg = Some(reg);
    }

    fn fill(&mut self, l: LocalIdx, reg: Register, out: &mut Vec<Inst>) {
        let info = &self.infos[l];
        let Some(off) = info.slot else {
            panic!("%{} is read before being written", l.index())
        };
        out.push(Inst::fill(reg, info.ty, off));
        self.take(l, reg);
        self.infos[l].dirty = false;
    }

    /// Write `l`, held in `reg`, to its spill slot.
    fn spill(&mut self, l: LocalIdx, reg: Register, out: &mut Vec<Inst>) {
        let ty = self.infos[l].ty;
        let off = match self.infos[l].slot {
            Some(off) => off,
            None => {
                let off = self.stack.allocate(ty);
                log_event!("hybrid: spilling %{} to [{off}]", l.index());
                self.infos[l].slot = Some(off);
                off
            }
        };
        out.push(Inst::spill(off, reg, ty));
        self.infos[l].dirty = false;
    }

    /// Take `reg` away from its holder, if any, saving the value if it can still be read.
    fn evict(&mut self, reg: Register, out: &mut Vec<Inst>) {
        let Some(l) = self.holders[reg.class.index()][usize::from(reg.index)] else {
            return;
        };
        let info = &self.infos[l];
        if info.dirty && (!info.exhausted() || info.reread_via_slot()) {
            self.spill(l, reg, out);
        }
        self.holders[reg.class.index()][usize::from(reg.index)] = None;
        self.infos[l].reg = None;
    }

    /// Free the register of the exhausted local `l`.
    fn release(&mut self, l: LocalIdx, out: &mut Vec<Inst>) {
        debug_assert!(self.infos[l].exhausted());
        if let Some(reg) = self.infos[l].reg {
            self.evict(reg, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        testing::{alloc_and_check, alloc_and_match, masks},
        AllocatorKind, RegisterMasks,
    };

    fn hybrid_match(s: &str, masks: &RegisterMasks, ptn: &str) {
        alloc_and_match(AllocatorKind::Hybrid, s, masks, ptn);
    }

    #[test]
    fn straight_line() {
        hybrid_match(
            "
          bb0:
            %0: i64 = copy 1
            %1: i64 = add %0, 2
            rax = copy %1
            return rax
        ",
            &RegisterMasks::sysv(),
            "
          bb0:
            r15 = copy 1
            r15 = add r15, 2
            rax = copy r15
            return rax
        ",
        );
    }

    #[test]
    fn values_cross_blocks_in_slots() {
        hybrid_match(
            "
          bb0 -> bb1, bb2:
            %0: i64 = copy 1
            branch_if %0
          bb1 -> bb2:
            %1: i64 = add %0, 2
            store i64 [%1], %1
            branch
          bb2:
            rax = copy %0
            return rax
        ",
            &RegisterMasks::sysv(),
            "
          bb0 -> bb1, bb2:
            r15 = copy 1
            spill -8, r15
            branch_if r15
          bb1 -> bb2:
            r15 = fill -8
            r14 = add r15, 2
            store i64 [r14], r14
            branch
          bb2:
            r15 = fill -8
            rax = copy r15
            return rax
        ",
        );
    }

    #[test]
    fn caller_saved_spilled_around_call() {
        hybrid_match(
            "
          bb0:
            rdi = copy 2
            %0: i64 = copy 1
            rax = call rdi
            %1: i64 = add %0, rax
            rax = copy %1
            return rax
        ",
            &masks(&["rax", "rcx", "rdi"], &["rax", "rcx", "rdi"], &[]),
            "
          bb0:
            rdi = copy 2
            rcx = copy 1
            spill -8, rcx
            rax = call rdi
            rdi = fill -8
            rdi = add rdi, rax
            rax = copy rdi
            return rax
        ",
        );
    }

    #[test]
    fn loop_carried_redefinition() {
        alloc_and_check(
            AllocatorKind::Hybrid,
            "
          bb0 -> bb1:
            %0: i64 = copy 0
            branch
          bb1 -> bb1, bb2:
            %0: i64 = add %0, 1
            %1: i64 = cmp %0, 10
            branch_if %1
          bb2:
            rax = copy %0
            return rax
        ",
            &RegisterMasks::sysv(),
        );
    }

    #[test]
    fn pressure_and_phis() {
        let (_, res) = alloc_and_check(
            AllocatorKind::Hybrid,
            "
          bb0 -> bb1, bb2:
            %0: i64 = copy 1
            %1: i64 = copy 2
            %2: i64 = copy 3
            branch_if %0
          bb1 -> bb3:
            %3: i64 = add %0, %1
            %4: i64 = add %3, %2
            branch
          bb2 -> bb3:
            %5: i64 = add %2, %1
            branch
          bb3:
            %6: i64 = phi %4, %5
            %7: i64 = add %6, %0
            rax = copy %7
            return rax
        ",
            &masks(&["rax", "rcx"], &[], &[]),
        );
        assert!(res.spill_region_size > 0);
        assert_eq!(res.max_call_args, 0);
    }

    #[test]
    #[should_panic(expected = "No register available")]
    fn too_few_registers() {
        alloc_and_check(
            AllocatorKind::Hybrid,
            "
          bb0:
            %0: i64 = copy 1
            %1: i64 = copy 2
            %2: i64 = add %0, %1
            rax = copy %2
            return rax
        ",
            &masks(&["rax"], &[], &[]),
        );
    }
}
