//! Test helpers: pattern matching and an allocation checker.
//!
//! The checker symbolically executes an allocated function, tracking which local each register
//! and spill slot holds, and compares every instruction that existed before allocation with its
//! original form. It fails if an instruction reads a register that does not hold the local it
//! read before allocation: this catches values placed in the wrong location, two values sharing
//! a register, a value assumed to survive a call in a caller-saved register, and missing or
//! misordered resolution moves.

use crate::{
    copy_resolver::Loc,
    ir::{AddrReg, BlockIdx, Function, Inst, LocalIdx, NodeIdx, Opcode, Operand},
    regs::{RegClass, Register, RegisterMasks},
    stack::StackAllocator,
    AllocationResult, AllocatorKind,
};
use fm::{FMBuilder, FMatcher};
use index_vec::IndexVec;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    /// Use `{{name}}` to match non-literal strings in tests.
    static ref PTN_RE: Regex = {
        Regex::new(r"\{\{.+?\}\}").unwrap()
    };

    static ref PTN_RE_IGNORE: Regex = {
        Regex::new(r"\{\{_}\}").unwrap()
    };

    static ref TEXT_RE: Regex = {
        Regex::new(r"[a-zA-Z0-9\._\-]+").unwrap()
    };
}

pub(crate) fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Masks where only `int` (and `vec`) registers are available, with `int_caller_saved` of the
/// integer registers caller saved and the rest callee saved. Every vector register is caller
/// saved.
pub(crate) fn masks(int: &[&str], int_caller_saved: &[&str], vec: &[&str]) -> RegisterMasks {
    let set = |names: &[&str]| {
        let mut rs = crate::RegSet::blank();
        for n in names {
            rs.set(Register::from_name(n).unwrap().index);
        }
        rs
    };
    let (int, int_cs, vec) = (set(int), set(int_caller_saved), set(vec));
    RegisterMasks::new(
        crate::ClassMasks {
            available: int,
            caller_saved: int_cs,
            callee_saved: int.difference(int_cs),
        },
        crate::ClassMasks {
            available: vec,
            caller_saved: vec,
            callee_saved: crate::RegSet::blank(),
        },
    )
    .unwrap()
}

/// Parse `s`, allocate it with `kind`, and check the result. Returns the allocated function.
pub(crate) fn alloc_and_check(
    kind: AllocatorKind,
    s: &str,
    masks: &RegisterMasks,
) -> (Function, AllocationResult) {
    let mut f = crate::ir::str_to_func(s);
    f.check_well_formed().unwrap();
    crate::eliminate_phis(&mut f);
    let orig = f.clone();
    let mut stack = StackAllocator::new();
    let res = kind.allocator().allocate(&mut f, &mut stack, masks).unwrap();
    if let Err(e) = check_allocation(&orig, &f, masks) {
        panic!("{e}\n\nBefore:\n{orig}\nAfter:\n{f}");
    }
    assert_eq!(res.spill_region_size, stack.size());
    for (class, used) in [
        (RegClass::Int, res.used_int_regs),
        (RegClass::Vec, res.used_vec_regs),
    ] {
        let avail = masks.class(class).available.bits();
        assert_eq!(used & !avail, 0, "{class} registers used outside {avail:#x}");
    }
    (f, res)
}

/// Like [alloc_and_check] but also match the allocated function against the [fm] pattern `ptn`.
pub(crate) fn alloc_and_match(kind: AllocatorKind, s: &str, masks: &RegisterMasks, ptn: &str) {
    let (f, _) = alloc_and_check(kind, s, masks);
    let out = f.to_string();
    if let Err(e) = fmatcher(ptn).matches(&out) {
        panic!("{e}");
    }
}

type State = BTreeMap<Loc, LocalIdx>;

/// Check that `alloc`, the result of allocating `orig`, computes the same values as `orig`.
///
/// `orig` must be phi-free and `alloc` must share its node numbering: nodes above
/// `orig.num_nodes()` are treated as inserted by the allocator.
pub(crate) fn check_allocation(
    orig: &Function,
    alloc: &Function,
    masks: &RegisterMasks,
) -> Result<(), String> {
    let mut entry: IndexVec<BlockIdx, Option<State>> =
        IndexVec::from_vec(vec![None; alloc.num_blocks()]);
    entry[BlockIdx::from_usize(0)] = Some(State::new());
    let mut work = vec![BlockIdx::from_usize(0)];
    while let Some(b) = work.pop() {
        let Some(state) = entry[b].clone() else {
            continue;
        };
        let out = transfer(orig, alloc, masks, b, state, false)?;
        for s in alloc.block(b).succs() {
            let new = match &entry[*s] {
                None => out.clone(),
                Some(old) => old
                    .iter()
                    .filter(|(loc, l)| out.get(*loc) == Some(*l))
                    .map(|(loc, l)| (*loc, *l))
                    .collect(),
            };
            if entry[*s].as_ref() != Some(&new) {
                entry[*s] = Some(new);
                work.push(*s);
            }
        }
    }
    for b in alloc.block_indices() {
        match entry[b].clone() {
            Some(state) => {
                transfer(orig, alloc, masks, b, state, true)?;
            }
            None => return Err(format!("bb{} is unreachable", b.index())),
        }
    }
    Ok(())
}

fn transfer(
    orig: &Function,
    alloc: &Function,
    masks: &RegisterMasks,
    b: BlockIdx,
    mut state: State,
    check: bool,
) -> Result<State, String> {
    for n in alloc.block_nodes(b) {
        let inst = alloc.inst(n);
        if n.index() < orig.num_nodes() {
            let o = orig.inst(n);
            if check {
                check_reads(&state, o, inst).map_err(|e| at(alloc, b, n, &e))?;
            }
            if o.opcode == Opcode::Call {
                state.retain(|loc, _| !matches!(loc, Loc::Reg(r) if masks.is_caller_saved(*r)));
            }
            if let Some(l) = o.written_local() {
                let Some(r) = inst.written_reg() else {
                    let msg = format!("%{} not written to a register", l.index());
                    return Err(at(alloc, b, n, &msg));
                };
                state.retain(|_, x| *x != l);
                state.insert(Loc::Reg(r), l);
            } else if let Some(r) = o.written_reg() {
                state.remove(&Loc::Reg(r));
            }
        } else {
            let (src, dst) = inserted_move(inst).map_err(|e| at(alloc, b, n, &e))?;
            match state.get(&src).copied() {
                Some(l) => {
                    state.insert(dst, l);
                }
                None => {
                    state.remove(&dst);
                }
            }
        }
    }
    Ok(state)
}

fn at(f: &Function, b: BlockIdx, n: NodeIdx, msg: &str) -> String {
    format!("bb{}: '{}': {msg}", b.index(), f.display_inst(n))
}

/// Check that every local `o` reads is in the register `inst` reads in its place.
fn check_reads(state: &State, o: &Inst, inst: &Inst) -> Result<(), String> {
    if o.opcode != inst.opcode || o.srcs.len() != inst.srcs.len() {
        return Err("instruction changed shape".to_owned());
    }
    let check = |l: &LocalIdx, r: Option<Register>| match r {
        Some(r) if state.get(&Loc::Reg(r)) == Some(l) => Ok(()),
        Some(r) => Err(format!(
            "%{} read from {r}, which holds {}",
            l.index(),
            match state.get(&Loc::Reg(r)) {
                Some(x) => format!("%{}", x.index()),
                None => "nothing".to_owned(),
            }
        )),
        None => Err(format!("%{} not rewritten to a register", l.index())),
    };
    for (os, s) in o.srcs.iter().zip(inst.srcs.iter()) {
        match (os, s) {
            (Operand::Local(l), s) => check(l, s.as_reg())?,
            (Operand::Mem(om), Operand::Mem(m)) => {
                for (oa, a) in [(om.base, m.base), (om.index, m.index)] {
                    if let Some(AddrReg::Local(l)) = oa {
                        let r = match a {
                            Some(AddrReg::Reg(r)) => Some(r),
                            _ => None,
                        };
                        check(&l, r)?;
                    }
                }
            }
            (Operand::Mem(_), _) => return Err("memory operand changed shape".to_owned()),
            _ => (),
        }
    }
    Ok(())
}

/// The source and destination of an instruction inserted by an allocator.
fn inserted_move(inst: &Inst) -> Result<(Loc, Loc), String> {
    let off = |op: &Operand| {
        op.as_const()
            .and_then(|x| i32::try_from(x).ok())
            .ok_or_else(|| "bad offset".to_owned())
    };
    match (inst.opcode, inst.dst.as_ref(), inst.srcs.as_slice()) {
        (Opcode::Copy, Some(Operand::Reg(d, _)), [Operand::Reg(s, _)]) => {
            Ok((Loc::Reg(*s), Loc::Reg(*d)))
        }
        (Opcode::Fill, Some(Operand::Reg(d, _)), [o]) => Ok((Loc::Stack(off(o)?), Loc::Reg(*d))),
        (Opcode::Spill, None, [o, Operand::Reg(s, _)]) => Ok((Loc::Reg(*s), Loc::Stack(off(o)?))),
        _ => Err("unexpected inserted instruction".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::str_to_func;

    fn check(orig: &str, alloc: &str) -> Result<(), String> {
        let orig = str_to_func(orig);
        let alloc = str_to_func(alloc);
        check_allocation(&orig, &alloc, &RegisterMasks::sysv())
    }

    const ORIG: &str = "
      bb0:
        %0: i64 = copy 1
        %1: i64 = copy 2
        %2: i64 = add %0, %1
        rax = copy %2
        call rax
        rax = copy %0
        return rax
    ";

    #[test]
    fn accepts_good_allocation() {
        check(
            ORIG,
            "
          bb0:
            rbx = copy 1
            rcx = copy 2
            rcx = add rbx, rcx
            rax = copy rcx
            call rax
            rax = copy rbx
            return rax
        ",
        )
        .unwrap();
    }

    #[test]
    fn rejects_double_occupancy() {
        let e = check(
            ORIG,
            "
          bb0:
            rbx = copy 1
            rbx = copy 2
            rcx = add rbx, rbx
            rax = copy rcx
            call rax
            rax = copy rbx
            return rax
        ",
        )
        .unwrap_err();
        assert!(e.contains("%0 read from rbx, which holds %1"), "{e}");
    }

    #[test]
    fn rejects_caller_saved_across_call() {
        let e = check(
            ORIG,
            "
          bb0:
            rsi = copy 1
            rcx = copy 2
            rcx = add rsi, rcx
            rax = copy rcx
            call rax
            rax = copy rsi
            return rax
        ",
        )
        .unwrap_err();
        assert!(e.contains("%0 read from rsi, which holds nothing"), "{e}");
    }
}
