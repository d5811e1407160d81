//! Phi elimination.
//!
//! Each `%d = phi s0, s1, ...` in block `B` is replaced by a fresh temporary `%t`: the phi node
//! itself becomes `%d = copy %t` and `%t = copy si` is inserted at the end (before the
//! terminator) of `B`'s `i`th predecessor. Routing every source through a temporary means the
//! parallel semantics of a group of phis are preserved without any ordering between the copies:
//! no copy in a predecessor can overwrite a value another phi still needs to read.

use crate::ir::{Function, Inst, Opcode, Operand, Ty};

/// Replace every phi node in `f` with copies.
pub fn eliminate_phis(f: &mut Function) {
    for b in f.block_indices().collect::<Vec<_>>() {
        for n in f.block_nodes(b) {
            if f.inst(n).opcode != Opcode::Phi {
                break;
            }
            let phi = f.inst(n).clone();
            let Some(dst) = phi.dst else {
                panic!("Phi node without a destination in bb{}", b.index())
            };
            let ty = phi_ty(f, &dst);
            let tmp = Operand::Local(f.new_local(ty));
            let preds = f.block(b).preds().to_vec();
            assert_eq!(preds.len(), phi.srcs.len());
            for (src, pred) in phi.srcs.iter().zip(preds) {
                f.insert_before_terminator(pred, Inst::copy(tmp, *src));
            }
            *f.inst_mut(n) = Inst::copy(dst, tmp);
        }
    }
}

fn phi_ty(f: &Function, dst: &Operand) -> Ty {
    match dst {
        Operand::Local(l) => f.local_ty(*l),
        Operand::Reg(_, ty) => *ty,
        Operand::Const(_) | Operand::Mem(_) => panic!("A phi must define a local or register"),
    }
}
