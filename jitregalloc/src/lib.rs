//! Register allocation for a JIT code generator.
//!
//! The allocators in this crate map the unbounded set of virtual values ("locals") in an
//! [ir::Function] onto the physical registers described by [RegisterMasks], placing values that
//! do not fit in spill slots handed out by a [StackAllocator]. Allocation rewrites the function in
//! place: every local operand becomes a register operand, and fill, spill, and copy instructions
//! are inserted where values move.
//!
//! Three allocators with different cost/quality trade-offs are provided:
//!
//!   * [LinearScan]: linear scan with interval splitting, lifetime holes, and move resolution
//!     across control flow edges (splitting critical edges where needed).
//!   * [FastLinearScan]: a single pass linear scan that never splits intervals and accesses
//!     spilled values through reserved temporary registers.
//!   * [Hybrid]: a local allocator that keeps values in registers within a block and in their
//!     spill slots across blocks.
//!
//! Upstream code is expected to have placed call arguments and results in physical registers.

mod copy_resolver;
mod errors;
mod fast;
mod hybrid;
mod interval;
pub mod ir;
mod log;
mod lsra;
mod numbering;
mod phi;
pub mod regs;
mod stack;
#[cfg(test)]
mod testing;

pub use errors::RegAllocError;
pub use fast::FastLinearScan;
pub use hybrid::Hybrid;
pub use lsra::LinearScan;
pub use phi::eliminate_phis;
pub use regs::{ClassMasks, RegClass, RegSet, Register, RegisterMasks};
pub use stack::StackAllocator;

use ir::{Function, Opcode, Operand};
use log::{log_event, log_ir, should_log_ir, IRPhase};
use std::{env, error::Error};
use strum_macros::{Display, EnumString};

/// What an allocator tells its caller about the code it produced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationResult {
    /// The integer registers the allocator assigned to locals (including temporaries).
    pub used_int_regs: u16,
    /// The vector registers the allocator assigned to locals (including temporaries).
    pub used_vec_regs: u16,
    /// The size in bytes of the spill area.
    pub spill_region_size: u32,
    /// The largest number of arguments passed to any call. Only computed by [LinearScan].
    pub max_call_args: u32,
}

pub trait RegisterAllocator: Send + Sync {
    /// Allocate registers for `f`, rewriting it in place.
    ///
    /// If `f` is not well-formed, an error is returned and `f` is left untouched.
    fn allocate(
        &self,
        f: &mut Function,
        stack: &mut StackAllocator,
        masks: &RegisterMasks,
    ) -> Result<AllocationResult, RegAllocError>;
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum AllocatorKind {
    LinearScan,
    Fast,
    Hybrid,
}

impl AllocatorKind {
    pub fn allocator(self) -> Box<dyn RegisterAllocator> {
        match self {
            AllocatorKind::LinearScan => Box::new(LinearScan),
            AllocatorKind::Fast => Box::new(FastLinearScan),
            AllocatorKind::Hybrid => Box::new(Hybrid),
        }
    }
}

/// Allocate registers for `f` with the allocator `kind`.
pub fn allocate(
    kind: AllocatorKind,
    f: &mut Function,
    stack: &mut StackAllocator,
    masks: &RegisterMasks,
) -> Result<AllocationResult, RegAllocError> {
    let res = kind.allocator().allocate(f, stack, masks)?;
    log_event!(
        "{kind}: int regs {:#06x}, vec regs {:#06x}, spill area {} bytes",
        res.used_int_regs,
        res.used_vec_regs,
        res.spill_region_size
    );
    Ok(res)
}

/// The allocator selected by the `JITRA_ALLOCATOR` environment variable (`linear-scan`, `fast`,
/// or `hybrid`), defaulting to [LinearScan].
pub fn default_allocator() -> Result<Box<dyn RegisterAllocator>, Box<dyn Error>> {
    Ok(allocator_kind(env::var("JITRA_ALLOCATOR").ok().as_deref())?.allocator())
}

fn allocator_kind(s: Option<&str>) -> Result<AllocatorKind, RegAllocError> {
    match s {
        None => Ok(AllocatorKind::LinearScan),
        Some(s) => s.parse::<AllocatorKind>().map_err(|_| {
            RegAllocError::Config(format!(
                "JITRA_ALLOCATOR must be one of `linear-scan`, `fast`, or `hybrid`, not `{s}`"
            ))
        }),
    }
}

/// The steps common to every allocator before allocation proper: reject malformed IR, eliminate
/// phis, and reserve the stack space requested by `stack_alloc`s (rewriting each one's size
/// operand to the frame offset of its allocation).
pub(crate) fn prepare(f: &mut Function, stack: &mut StackAllocator) -> Result<(), RegAllocError> {
    if should_log_ir(IRPhase::PreRA) {
        log_ir(&format!("--- Before register allocation ---\n{f}\n"));
    }
    f.check_well_formed()?;
    eliminate_phis(f);
    if should_log_ir(IRPhase::PostPhi) {
        log_ir(&format!("--- After phi elimination ---\n{f}\n"));
    }
    for b in f.block_indices().collect::<Vec<_>>() {
        for n in f.block_nodes(b) {
            let inst = f.inst_mut(n);
            if inst.opcode == Opcode::StackAlloc {
                if let Some(Operand::Const(nbytes)) = inst.srcs.first().copied() {
                    // `check_well_formed` guarantees the size fits.
                    let off = stack.allocate_bytes(u32::try_from(nbytes).unwrap());
                    inst.srcs[0] = Operand::Const(i64::from(off));
                }
            }
        }
    }
    Ok(())
}

/// The steps common to every allocator after allocation.
pub(crate) fn finish(f: &Function) {
    debug_assert!(f.block_indices().all(|b| f
        .block_nodes(b)
        .into_iter()
        .all(|n| f.inst(n).read_locals().is_empty() && f.inst(n).written_local().is_none())));
    if should_log_ir(IRPhase::PostRA) {
        log_ir(&format!("--- After register allocation ---\n{f}\n"));
    }
}
