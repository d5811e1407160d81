//! The IR that the register allocators consume and rewrite.
//!
//! Before allocation, values are [Operand::Local]s: an unbounded set of virtual values, each with
//! a [Ty]. Allocation rewrites every local into an [Operand::Reg] and inserts [Opcode::Fill],
//! [Opcode::Spill], and [Opcode::Copy] instructions where values move between locations.
//!
//! A [Function] is a control flow graph of [Block]s where each block is a doubly linked list of
//! nodes held in a single arena: node indexes are stable, so inserting instructions never
//! invalidates a [NodeIdx] held elsewhere.

mod cfg;
#[cfg(test)]
mod parser;
mod well_formed;

use crate::regs::{RegClass, Register};
use index_vec::IndexVec;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use strum::{Display, EnumString};

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    pub struct LocalIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Ty {
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl Ty {
    pub fn class(self) -> RegClass {
        match self {
            Ty::I32 | Ty::I64 => RegClass::Int,
            Ty::F32 | Ty::F64 | Ty::V128 => RegClass::Vec,
        }
    }

    pub fn byte_size(self) -> u32 {
        match self {
            Ty::I32 | Ty::F32 => 4,
            Ty::I64 | Ty::F64 => 8,
            Ty::V128 => 16,
        }
    }

    /// The widest type of `class`: what a register of that class is assumed to hold.
    pub fn widest(class: RegClass) -> Self {
        match class {
            RegClass::Int => Ty::I64,
            RegClass::Vec => Ty::V128,
        }
    }
}

/// A register used to form an address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddrReg {
    Local(LocalIdx),
    Reg(Register),
}

/// A memory operand `ty [base + index * scale + disp]`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MemOperand {
    pub ty: Ty,
    pub base: Option<AddrReg>,
    pub index: Option<AddrReg>,
    pub scale: u8,
    pub disp: i32,
}

impl MemOperand {
    fn addr_regs(&self) -> impl Iterator<Item = &AddrReg> {
        self.base.iter().chain(self.index.iter())
    }

    fn addr_regs_mut(&mut self) -> impl Iterator<Item = &mut AddrReg> {
        self.base.iter_mut().chain(self.index.iter_mut())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operand {
    /// A virtual value.
    Local(LocalIdx),
    /// A physical register holding a value of the given type.
    Reg(Register, Ty),
    Const(i64),
    Mem(MemOperand),
}

impl Operand {
    pub fn as_local(&self) -> Option<LocalIdx> {
        match self {
            Operand::Local(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<Register> {
        match self {
            Operand::Reg(r, _) => Some(*r),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            Operand::Const(c) => Some(*c),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    Copy,
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Cmp,
    /// `dst = load mem`
    Load,
    /// `store mem, val`
    Store,
    /// `[dst =] call args...`. After pre-allocation lowering, a call's destination and arguments
    /// are all physical registers.
    Call,
    /// `dst = stack_alloc size`: reserve `size` bytes of the frame; rewritten to the offset.
    StackAlloc,
    /// `dst = phi s0, ..., sn`: one source per predecessor, in predecessor order.
    Phi,
    /// `reg = fill offset`
    Fill,
    /// `spill offset, reg`
    Spill,
    Branch,
    /// `branch_if cond`: to the first successor if `cond` is non-zero, otherwise the second.
    BranchIf,
    Return,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::BranchIf | Opcode::Return)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inst {
    pub opcode: Opcode,
    pub dst: Option<Operand>,
    pub srcs: SmallVec<[Operand; 3]>,
}

impl Inst {
    pub fn new(opcode: Opcode, dst: Option<Operand>, srcs: &[Operand]) -> Self {
        Self {
            opcode,
            dst,
            srcs: SmallVec::from_slice(srcs),
        }
    }

    pub fn copy(dst: Operand, src: Operand) -> Self {
        Self {
            opcode: Opcode::Copy,
            dst: Some(dst),
            srcs: smallvec![src],
        }
    }

    /// Load the stack slot at frame offset `off` into `reg`.
    pub fn fill(reg: Register, ty: Ty, off: i32) -> Self {
        Self {
            opcode: Opcode::Fill,
            dst: Some(Operand::Reg(reg, ty)),
            srcs: smallvec![Operand::Const(i64::from(off))],
        }
    }

    /// Store `reg` into the stack slot at frame offset `off`.
    pub fn spill(off: i32, reg: Register, ty: Ty) -> Self {
        Self {
            opcode: Opcode::Spill,
            dst: None,
            srcs: smallvec![Operand::Const(i64::from(off)), Operand::Reg(reg, ty)],
        }
    }

    /// The locals this instruction reads, including those forming memory addresses. A local may
    /// appear more than once.
    pub fn read_locals(&self) -> SmallVec<[LocalIdx; 4]> {
        let mut ls = SmallVec::new();
        for op in &self.srcs {
            match op {
                Operand::Local(l) => ls.push(*l),
                Operand::Mem(m) => {
                    for ar in m.addr_regs() {
                        if let AddrReg::Local(l) = ar {
                            ls.push(*l);
                        }
                    }
                }
                Operand::Reg(..) | Operand::Const(_) => (),
            }
        }
        ls
    }

    pub fn written_local(&self) -> Option<LocalIdx> {
        self.dst.as_ref().and_then(|x| x.as_local())
    }

    /// The physical registers this instruction reads.
    pub fn read_regs(&self) -> SmallVec<[Register; 4]> {
        let mut rs = SmallVec::new();
        for op in &self.srcs {
            match op {
                Operand::Reg(r, _) => rs.push(*r),
                Operand::Mem(m) => {
                    for ar in m.addr_regs() {
                        if let AddrReg::Reg(r) = ar {
                            rs.push(*r);
                        }
                    }
                }
                Operand::Local(_) | Operand::Const(_) => (),
            }
        }
        rs
    }

    pub fn written_reg(&self) -> Option<Register> {
        self.dst.as_ref().and_then(|x| x.as_reg())
    }

    /// Replace every local this instruction reads with the register `f` returns for it.
    pub fn rewrite_reads<F>(&mut self, locals: &IndexVec<LocalIdx, Ty>, mut f: F)
    where
        F: FnMut(LocalIdx) -> Register,
    {
        for op in self.srcs.iter_mut() {
            match op {
                Operand::Local(l) => *op = Operand::Reg(f(*l), locals[*l]),
                Operand::Mem(m) => {
                    for ar in m.addr_regs_mut() {
                        if let AddrReg::Local(l) = ar {
                            *ar = AddrReg::Reg(f(*l));
                        }
                    }
                }
                Operand::Reg(..) | Operand::Const(_) => (),
            }
        }
    }

    /// Replace the local this instruction writes (if any) with the register `f` returns for it.
    pub fn rewrite_write<F>(&mut self, locals: &IndexVec<LocalIdx, Ty>, mut f: F)
    where
        F: FnMut(LocalIdx) -> Register,
    {
        if let Some(Operand::Local(l)) = self.dst {
            self.dst = Some(Operand::Reg(f(l), locals[l]));
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub inst: Inst,
    block: BlockIdx,
    prev: Option<NodeIdx>,
    next: Option<NodeIdx>,
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    first: Option<NodeIdx>,
    last: Option<NodeIdx>,
    preds: SmallVec<[BlockIdx; 2]>,
    succs: SmallVec<[BlockIdx; 2]>,
}

impl Block {
    pub fn preds(&self) -> &[BlockIdx] {
        &self.preds
    }

    pub fn succs(&self) -> &[BlockIdx] {
        &self.succs
    }

    pub fn first(&self) -> Option<NodeIdx> {
        self.first
    }

    pub fn last(&self) -> Option<NodeIdx> {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// A function: block 0 is the entry.
#[derive(Clone, Debug, Default)]
pub struct Function {
    blocks: IndexVec<BlockIdx, Block>,
    nodes: IndexVec<NodeIdx, Node>,
    locals: IndexVec<LocalIdx, Ty>,
}

impl Function {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self) -> BlockIdx {
        self.blocks.push(Block::default())
    }

    /// Add the edge `from -> to`. Edges are ordered: `to`'s predecessor list grows in the order
    /// edges are added, which determines the order of phi sources.
    pub fn add_edge(&mut self, from: BlockIdx, to: BlockIdx) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    pub fn new_local(&mut self, ty: Ty) -> LocalIdx {
        self.locals.push(ty)
    }

    pub fn local_ty(&self, l: LocalIdx) -> Ty {
        self.locals[l]
    }

    pub fn locals(&self) -> &IndexVec<LocalIdx, Ty> {
        &self.locals
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn block(&self, b: BlockIdx) -> &Block {
        &self.blocks[b]
    }

    pub fn block_indices(&self) -> impl Iterator<Item = BlockIdx> {
        (0..self.blocks.len()).map(BlockIdx::from_usize)
    }

    pub fn inst(&self, n: NodeIdx) -> &Inst {
        &self.nodes[n].inst
    }

    pub fn inst_mut(&mut self, n: NodeIdx) -> &mut Inst {
        &mut self.nodes[n].inst
    }

    /// Mutable access to the instruction at `n` alongside the function's local types.
    pub fn inst_and_locals_mut(&mut self, n: NodeIdx) -> (&mut Inst, &IndexVec<LocalIdx, Ty>) {
        (&mut self.nodes[n].inst, &self.locals)
    }

    pub fn node_block(&self, n: NodeIdx) -> BlockIdx {
        self.nodes[n].block
    }

    pub fn next(&self, n: NodeIdx) -> Option<NodeIdx> {
        self.nodes[n].next
    }

    pub fn prev(&self, n: NodeIdx) -> Option<NodeIdx> {
        self.nodes[n].prev
    }

    /// The nodes of `b` in order. Collected eagerly so the caller may mutate the function while
    /// walking them.
    pub fn block_nodes(&self, b: BlockIdx) -> Vec<NodeIdx> {
        let mut ns = Vec::new();
        let mut cur = self.blocks[b].first;
        while let Some(n) = cur {
            ns.push(n);
            cur = self.nodes[n].next;
        }
        ns
    }

    /// The block's terminator, if its last instruction is one.
    pub fn terminator(&self, b: BlockIdx) -> Option<NodeIdx> {
        self.blocks[b]
            .last
            .filter(|n| self.nodes[*n].inst.opcode.is_terminator())
    }

    fn new_node(&mut self, b: BlockIdx, inst: Inst) -> NodeIdx {
        self.nodes.push(Node {
            inst,
            block: b,
            prev: None,
            next: None,
        })
    }

    /// Append `inst` to the end of `b`.
    pub fn push(&mut self, b: BlockIdx, inst: Inst) -> NodeIdx {
        match self.blocks[b].last {
            Some(last) => self.insert_after(last, inst),
            None => {
                let n = self.new_node(b, inst);
                self.blocks[b].first = Some(n);
                self.blocks[b].last = Some(n);
                n
            }
        }
    }

    /// Prepend `inst` to the start of `b`.
    pub fn push_front(&mut self, b: BlockIdx, inst: Inst) -> NodeIdx {
        match self.blocks[b].first {
            Some(first) => self.insert_before(first, inst),
            None => self.push(b, inst),
        }
    }

    pub fn insert_before(&mut self, n: NodeIdx, inst: Inst) -> NodeIdx {
        let b = self.nodes[n].block;
        let new = self.new_node(b, inst);
        let prev = self.nodes[n].prev;
        self.nodes[new].prev = prev;
        self.nodes[new].next = Some(n);
        self.nodes[n].prev = Some(new);
        match prev {
            Some(p) => self.nodes[p].next = Some(new),
            None => self.blocks[b].first = Some(new),
        }
        new
    }

    pub fn insert_after(&mut self, n: NodeIdx, inst: Inst) -> NodeIdx {
        let b = self.nodes[n].block;
        let new = self.new_node(b, inst);
        let next = self.nodes[n].next;
        self.nodes[new].prev = Some(n);
        self.nodes[new].next = next;
        self.nodes[n].next = Some(new);
        match next {
            Some(x) => self.nodes[x].prev = Some(new),
            None => self.blocks[b].last = Some(new),
        }
        new
    }

    /// Insert `inst` at the end of `b` but before its terminator, if it has one.
    pub fn insert_before_terminator(&mut self, b: BlockIdx, inst: Inst) -> NodeIdx {
        match self.terminator(b) {
            Some(t) => self.insert_before(t, inst),
            None => self.push(b, inst),
        }
    }

    /// Unlink `n` from its block. The node's slot in the arena is not reused.
    pub fn remove(&mut self, n: NodeIdx) {
        let b = self.nodes[n].block;
        let (prev, next) = (self.nodes[n].prev, self.nodes[n].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.blocks[b].first = next,
        }
        match next {
            Some(x) => self.nodes[x].prev = prev,
            None => self.blocks[b].last = prev,
        }
        self.nodes[n].prev = None;
        self.nodes[n].next = None;
    }
}

struct DisplayMem<'a>(&'a MemOperand);

impl fmt::Display for DisplayMem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        let addr_reg = |ar: &AddrReg| match ar {
            AddrReg::Local(l) => format!("%{}", l.index()),
            AddrReg::Reg(r) => r.to_string(),
        };
        let mut parts = Vec::new();
        if let Some(base) = &m.base {
            parts.push(addr_reg(base));
        }
        if let Some(index) = &m.index {
            if m.scale == 1 {
                parts.push(addr_reg(index));
            } else {
                parts.push(format!("{} * {}", addr_reg(index), m.scale));
            }
        }
        if m.disp != 0 || parts.is_empty() {
            parts.push(m.disp.to_string());
        }
        write!(f, "{} [{}]", m.ty, parts.join(" + "))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Local(l) => write!(f, "%{}", l.index()),
            Operand::Reg(r, _) => write!(f, "{r}"),
            Operand::Const(c) => write!(f, "{c}"),
            Operand::Mem(m) => write!(f, "{}", DisplayMem(m)),
        }
    }
}

impl Function {
    /// Display a single instruction.
    pub fn display_inst(&self, n: NodeIdx) -> String {
        let inst = &self.nodes[n].inst;
        let mut s = String::new();
        match &inst.dst {
            Some(Operand::Local(l)) => {
                s.push_str(&format!("%{}: {} = ", l.index(), self.locals[*l]))
            }
            Some(x) => s.push_str(&format!("{x} = ")),
            None => (),
        }
        s.push_str(&inst.opcode.to_string());
        if !inst.srcs.is_empty() {
            s.push(' ');
            s.push_str(
                &inst
                    .srcs
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        s
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bidx, b) in self.blocks.iter_enumerated() {
            write!(f, "bb{}", bidx.index())?;
            if !b.succs.is_empty() {
                write!(
                    f,
                    " -> {}",
                    b.succs
                        .iter()
                        .map(|x| format!("bb{}", x.index()))
                        .collect::<Vec<_>>()
                        .join(", ")
                )?;
            }
            writeln!(f, ":")?;
            for n in self.block_nodes(bidx) {
                writeln!(f, "  {}", self.display_inst(n))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use parser::str_to_func;
