//! Check that a [Function] is well-formed enough for the allocators to work on it.
//!
//! The allocators assume the properties checked here throughout, so anything violating them is
//! rejected before any allocation begins.

use super::{AddrReg, BlockIdx, Function, NodeIdx, Opcode, Operand};
use crate::{errors::RegAllocError, regs::RegClass};
use index_vec::IndexVec;
use vob::Vob;

/// The most bytes all of a function's `stack_alloc`s may reserve together, leaving the rest of
/// the `i32` frame offset range for spill slots.
const MAX_STACK_ALLOC: i64 = 1 << 30;

impl Function {
    pub fn check_well_formed(&self) -> Result<(), RegAllocError> {
        if self.blocks.is_empty() {
            return Err(self.err(None, "function has no blocks"));
        }
        let rpo = self.reverse_postorder();
        if rpo.len() != self.blocks.len() {
            let mut reachable = Vob::from_elem(false, self.blocks.len());
            for b in &rpo {
                reachable.set(b.index(), true);
            }
            let unreachable = reachable.iter_unset_bits(..).next().unwrap_or(0);
            return Err(self.err(
                None,
                &format!("bb{unreachable} is not reachable from the entry block"),
            ));
        }

        let mut stack_allocs = 0;
        for b in self.block_indices() {
            self.check_block(b)?;
            for n in self.block_nodes(b) {
                let inst = self.inst(n);
                if inst.opcode == Opcode::StackAlloc {
                    stack_allocs += inst.srcs[0].as_const().unwrap_or(0);
                    if stack_allocs > MAX_STACK_ALLOC {
                        return Err(self.err(
                            Some(n),
                            &format!("stack_allocs exceed {MAX_STACK_ALLOC} bytes"),
                        ));
                    }
                }
            }
        }
        self.check_defined(&rpo)
    }

    fn err(&self, n: Option<NodeIdx>, msg: &str) -> RegAllocError {
        match n {
            Some(n) => RegAllocError::MalformedIR(format!(
                "bb{}: '{}': {msg}",
                self.node_block(n).index(),
                self.display_inst(n)
            )),
            None => RegAllocError::MalformedIR(msg.to_owned()),
        }
    }

    fn check_block(&self, b: BlockIdx) -> Result<(), RegAllocError> {
        let block = &self.blocks[b];
        let nodes = self.block_nodes(b);
        let mut seen_non_phi = false;
        for (i, n) in nodes.iter().enumerate() {
            let inst = self.inst(*n);
            if inst.opcode.is_terminator() && i + 1 != nodes.len() {
                return Err(self.err(Some(*n), "terminator is not the last instruction"));
            }
            if inst.opcode == Opcode::Phi {
                if seen_non_phi {
                    return Err(self.err(Some(*n), "phi node after a non-phi node"));
                }
                if inst.srcs.len() != block.preds.len() {
                    return Err(self.err(
                        Some(*n),
                        &format!(
                            "phi node has {} sources but block has {} predecessors",
                            inst.srcs.len(),
                            block.preds.len()
                        ),
                    ));
                }
            } else {
                seen_non_phi = true;
            }
            self.check_operands(*n)?;
        }

        let expected_succs = match self.terminator(b).map(|n| self.inst(n).opcode) {
            Some(Opcode::Branch) => 1..=1,
            Some(Opcode::BranchIf) => 2..=2,
            Some(Opcode::Return) => 0..=0,
            _ => 0..=1,
        };
        if !expected_succs.contains(&block.succs.len()) {
            return Err(self.err(
                None,
                &format!(
                    "bb{} has {} successors, which its terminator cannot branch to",
                    b.index(),
                    block.succs.len()
                ),
            ));
        }
        Ok(())
    }

    fn check_operands(&self, n: NodeIdx) -> Result<(), RegAllocError> {
        let inst = self.inst(n);
        let check = |op: &Operand| -> Result<(), RegAllocError> {
            match op {
                Operand::Reg(r, ty) if r.class != ty.class() => Err(self.err(
                    Some(n),
                    &format!("register {r} cannot hold a value of type {ty}"),
                )),
                Operand::Mem(m) => {
                    for ar in m.base.iter().chain(m.index.iter()) {
                        let class = match ar {
                            AddrReg::Local(l) => self.local_ty(*l).class(),
                            AddrReg::Reg(r) => r.class,
                        };
                        if class != RegClass::Int {
                            return Err(self.err(Some(n), "addresses must be integers"));
                        }
                    }
                    Ok(())
                }
                Operand::Local(l) if l.index() >= self.num_locals() => {
                    Err(self.err(Some(n), "unknown local"))
                }
                _ => Ok(()),
            }
        };
        for op in inst.srcs.iter().chain(inst.dst.iter()) {
            check(op)?;
        }
        match &inst.dst {
            Some(Operand::Const(_)) | Some(Operand::Mem(_)) => {
                return Err(self.err(Some(n), "destinations must be locals or registers"))
            }
            _ => (),
        }

        match inst.opcode {
            Opcode::Call => {
                if inst.written_local().is_some() || !inst.read_locals().is_empty() {
                    return Err(self.err(
                        Some(n),
                        "call arguments and results must be in physical registers",
                    ));
                }
            }
            Opcode::StackAlloc => {
                let size = inst.srcs.first().and_then(|x| x.as_const());
                if inst.dst.is_none()
                    || inst.srcs.len() != 1
                    || !size.is_some_and(|x| x > 0 && x <= MAX_STACK_ALLOC)
                {
                    return Err(self.err(Some(n), "stack_alloc takes a positive constant size"));
                }
            }
            Opcode::Fill => {
                if inst.written_reg().is_none()
                    || inst.srcs.len() != 1
                    || inst.srcs[0].as_const().is_none()
                {
                    return Err(self.err(Some(n), "fill must be 'reg = fill offset'"));
                }
            }
            Opcode::Spill => {
                if inst.dst.is_some()
                    || inst.srcs.len() != 2
                    || inst.srcs[0].as_const().is_none()
                    || inst.srcs[1].as_reg().is_none()
                {
                    return Err(self.err(Some(n), "spill must be 'spill offset, reg'"));
                }
            }
            Opcode::BranchIf => {
                if inst.srcs.len() != 1 {
                    return Err(self.err(Some(n), "branch_if takes one condition"));
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// Check that every local is defined on every path to each of its uses.
    fn check_defined(&self, rpo: &[BlockIdx]) -> Result<(), RegAllocError> {
        let nlocals = self.num_locals();
        let mut defs = IndexVec::<BlockIdx, Vob>::new();
        for b in self.block_indices() {
            let mut v = Vob::from_elem(false, nlocals);
            for n in self.block_nodes(b) {
                if let Some(l) = self.inst(n).written_local() {
                    v.set(l.index(), true);
                }
            }
            defs.push(v);
        }

        // `out[b]` is the set of locals definitely defined at the end of `b`.
        let mut out = IndexVec::<BlockIdx, Vob>::new();
        for b in self.block_indices() {
            if b.index() == 0 {
                out.push(defs[b].clone());
            } else {
                out.push(Vob::from_elem(true, nlocals));
            }
        }
        let mut changed = true;
        while changed {
            changed = false;
            for b in rpo.iter().skip(1) {
                let mut new = self.defined_on_entry(*b, &out);
                new.or(&defs[*b]);
                if new != out[*b] {
                    out[*b] = new;
                    changed = true;
                }
            }
        }

        for b in rpo {
            let mut defined = if b.index() == 0 {
                Vob::from_elem(false, nlocals)
            } else {
                self.defined_on_entry(*b, &out)
            };
            for n in self.block_nodes(*b) {
                let inst = self.inst(n);
                if inst.opcode == Opcode::Phi {
                    for (op, pred) in inst.srcs.iter().zip(self.blocks[*b].preds.iter()) {
                        if let Some(l) = op.as_local() {
                            if !out[*pred][l.index()] {
                                return Err(self.err(
                                    Some(n),
                                    &format!(
                                        "%{} is not defined at the end of bb{}",
                                        l.index(),
                                        pred.index()
                                    ),
                                ));
                            }
                        }
                    }
                } else {
                    for l in inst.read_locals() {
                        if !defined[l.index()] {
                            return Err(self.err(
                                Some(n),
                                &format!("%{} may be used before it is defined", l.index()),
                            ));
                        }
                    }
                }
                if let Some(l) = inst.written_local() {
                    defined.set(l.index(), true);
                }
            }
        }
        Ok(())
    }

    fn defined_on_entry(&self, b: BlockIdx, out: &IndexVec<BlockIdx, Vob>) -> Vob {
        let mut v = Vob::from_elem(true, self.num_locals());
        for p in &self.blocks[b].preds {
            v.and(&out[*p]);
        }
        v
    }
}
