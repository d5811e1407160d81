//! A parser for the textual form of [Function]s, suitable for creating IR for testing purposes.
//!
//! The input format is the same as the one [Function]'s `Display` implementation produces with one
//! addition: blank lines and `;` comments are ignored. Blocks may be labelled with any `bbN`
//! label: they are numbered in the order they appear. Register operands are assumed to hold a
//! value of the widest type of their class.

use super::{AddrReg, BlockIdx, Function, Inst, LocalIdx, MemOperand, Opcode, Operand, Ty};
use crate::regs::Register;
use index_vec::IndexVec;
use lrlex::{lrlex_mod, DefaultLexerTypes, LRNonStreamingLexer};
use lrpar::{lrpar_mod, NonStreamingLexer, Span};
use smallvec::SmallVec;
use std::{collections::HashMap, str::FromStr};

lrlex_mod!("ir/ir.l");
lrpar_mod!("ir/ir.y");

struct FuncParser<'lexer, 'input: 'lexer> {
    lexer: &'lexer LRNonStreamingLexer<'lexer, 'input, DefaultLexerTypes<u32>>,
}

impl<'lexer, 'input: 'lexer> FuncParser<'lexer, 'input> {
    fn err_span(&self, span: Span, msg: &str) -> ! {
        let ((line_off, col), _) = self.lexer.line_col(span);
        let code = self
            .lexer
            .span_lines_str(span)
            .split('\n')
            .next()
            .unwrap()
            .trim();
        panic!("Line {line_off}, column {col}:\n  {code}\n{msg}");
    }

    fn p_local(&self, span: Span) -> LocalIdx {
        let s = &self.lexer.span_str(span)[1..];
        LocalIdx::from_usize(
            s.parse::<usize>()
                .unwrap_or_else(|e| self.err_span(span, &e.to_string())),
        )
    }

    fn p_reg(&self, span: Span) -> Register {
        let s = self.lexer.span_str(span);
        Register::from_name(s).unwrap_or_else(|| self.err_span(span, &format!("No such register {s}")))
    }

    fn p_ty(&self, span: Span) -> Ty {
        let s = self.lexer.span_str(span);
        Ty::from_str(s).unwrap_or_else(|_| self.err_span(span, &format!("No such type {s}")))
    }

    fn p_int(&self, span: Span) -> i64 {
        self.lexer
            .span_str(span)
            .parse::<i64>()
            .unwrap_or_else(|e| self.err_span(span, &e.to_string()))
    }

    fn p_addr_reg(&self, span: Span, is_local: bool) -> AddrReg {
        if is_local {
            AddrReg::Local(self.p_local(span))
        } else {
            AddrReg::Reg(self.p_reg(span))
        }
    }

    fn p_mem(&self, ty: Span, terms: Vec<AAddr>) -> MemOperand {
        let mut mem = MemOperand {
            ty: self.p_ty(ty),
            base: None,
            index: None,
            scale: 1,
            disp: 0,
        };
        for term in terms {
            let (span, is_local, scale) = match term {
                AAddr::Local(span, scale) => (span, true, scale),
                AAddr::Reg(span, scale) => (span, false, scale),
                AAddr::Int(span) => {
                    mem.disp = i32::try_from(self.p_int(span))
                        .unwrap_or_else(|e| self.err_span(span, &e.to_string()));
                    continue;
                }
            };
            let ar = self.p_addr_reg(span, is_local);
            match scale {
                Some(scale_span) => {
                    if mem.index.is_some() {
                        self.err_span(span, "Memory operand already has an index");
                    }
                    mem.index = Some(ar);
                    mem.scale = u8::try_from(self.p_int(scale_span))
                        .unwrap_or_else(|e| self.err_span(scale_span, &e.to_string()));
                }
                None if mem.base.is_none() => mem.base = Some(ar),
                None if mem.index.is_none() => mem.index = Some(ar),
                None => self.err_span(span, "Too many registers in memory operand"),
            }
        }
        mem
    }

    fn build(self, ablocks: Vec<ABlock>) -> Function {
        let mut f = Function::new();

        let mut labels = HashMap::new();
        for ablock in &ablocks {
            let label = self.lexer.span_str(ablock.label);
            if labels.insert(label, f.add_block()).is_some() {
                self.err_span(ablock.label, &format!("Duplicate block {label}"));
            }
        }
        let block = |span: Span| -> BlockIdx {
            let label = self.lexer.span_str(span);
            *labels
                .get(label)
                .unwrap_or_else(|| self.err_span(span, &format!("No such block {label}")))
        };

        // Locals can be used before their (textual) definition, so types are gathered first.
        let mut tys: HashMap<LocalIdx, Ty> = HashMap::new();
        for ablock in &ablocks {
            for ainst in &ablock.insts {
                if let Some(ADst::Local(span, ty)) = &ainst.dst {
                    let l = self.p_local(*span);
                    let ty = self.p_ty(*ty);
                    if let Some(old) = tys.insert(l, ty) {
                        if old != ty {
                            self.err_span(*span, "Local redefined with a different type");
                        }
                    }
                }
            }
        }
        let num_locals = tys.keys().map(|l| l.index() + 1).max().unwrap_or(0);
        let mut locals = IndexVec::<LocalIdx, Ty>::new();
        for i in 0..num_locals {
            locals.push(*tys.get(&LocalIdx::from_usize(i)).unwrap_or(&Ty::I64));
        }
        for ty in locals {
            f.new_local(ty);
        }

        for ablock in ablocks {
            let bidx = block(ablock.label);
            for succ in &ablock.succs {
                f.add_edge(bidx, block(*succ));
            }
            for AInst { dst, opcode, srcs } in ablock.insts {
                let op = Opcode::from_str(self.lexer.span_str(opcode)).unwrap_or_else(|_| {
                    self.err_span(opcode, &format!("No such opcode {}", self.lexer.span_str(opcode)))
                });
                let dst = dst.map(|x| match x {
                    ADst::Local(span, _) => Operand::Local(self.p_local(span)),
                    ADst::Reg(span) => {
                        let reg = self.p_reg(span);
                        Operand::Reg(reg, Ty::widest(reg.class))
                    }
                });
                let srcs = srcs
                    .into_iter()
                    .map(|x| match x {
                        AOperand::Local(span) => {
                            let l = self.p_local(span);
                            if l.index() >= num_locals {
                                self.err_span(span, "Local is never defined");
                            }
                            Operand::Local(l)
                        }
                        AOperand::Int(span) => Operand::Const(self.p_int(span)),
                        AOperand::Reg(span) => {
                            let reg = self.p_reg(span);
                            Operand::Reg(reg, Ty::widest(reg.class))
                        }
                        AOperand::Mem(ty, terms) => Operand::Mem(self.p_mem(ty, terms)),
                    })
                    .collect::<SmallVec<_>>();
                f.push(
                    bidx,
                    Inst {
                        opcode: op,
                        dst,
                        srcs,
                    },
                );
            }
        }
        f
    }
}

/// Parse the string `s` into a [Function].
///
/// # Panics
///
/// If `s` is not parsable.
pub(crate) fn str_to_func(s: &str) -> Function {
    let lexerdef = ir_l::lexerdef();
    let lexer = lexerdef.lexer(s);
    let (res, errs) = ir_y::parse(&lexer);
    if !errs.is_empty() {
        for e in errs {
            eprintln!("{}", e.pp(&lexer, &ir_y::token_epp));
        }
        panic!("Could not parse input");
    }
    let Some(ablocks) = res else {
        panic!("No AST produced")
    };
    FuncParser { lexer: &lexer }.build(ablocks)
}

impl FromStr for Function {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(str_to_func(s))
    }
}

struct ABlock {
    label: Span,
    succs: Vec<Span>,
    insts: Vec<AInst>,
}

struct AInst {
    dst: Option<ADst>,
    opcode: Span,
    srcs: Vec<AOperand>,
}

enum ADst {
    /// `%n: ty`
    Local(Span, Span),
    Reg(Span),
}

enum AOperand {
    Local(Span),
    Int(Span),
    Reg(Span),
    /// `ty [terms...]`
    Mem(Span, Vec<AAddr>),
}

enum AAddr {
    /// A local, with an optional scale.
    Local(Span, Option<Span>),
    Reg(Span, Option<Span>),
    Int(Span),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blocks() {
        let f = str_to_func(
            "
          bb0 -> bb2, bb1:
            %0: i64 = copy 3 ; a comment
            branch_if %0

          bb1 -> bb2:
            branch
          bb2:
            %1: i64 = phi %0, %0
            return %1
        ",
        );
        assert_eq!(f.num_blocks(), 3);
        assert_eq!(f.num_locals(), 2);
        let b0 = BlockIdx::from_usize(0);
        let b2 = BlockIdx::from_usize(2);
        assert_eq!(f.block(b0).succs(), &[b2, BlockIdx::from_usize(1)]);
        assert_eq!(f.block(b2).preds(), &[b0, BlockIdx::from_usize(1)]);
        let phi = f.block(b2).first().unwrap();
        assert_eq!(f.inst(phi).opcode, Opcode::Phi);
        assert_eq!(f.inst(phi).srcs.len(), 2);
    }

    #[test]
    fn parse_mem() {
        let f = str_to_func(
            "
          bb0:
            %0: i64 = copy 0
            %1: i32 = load i32 [%0 * 4 + rbx + -12]
            return
        ",
        );
        let n = f.block_nodes(BlockIdx::from_usize(0))[1];
        match &f.inst(n).srcs[0] {
            Operand::Mem(m) => {
                assert_eq!(m.ty, Ty::I32);
                assert_eq!(m.index, Some(AddrReg::Local(LocalIdx::from_usize(0))));
                assert_eq!(m.scale, 4);
                assert_eq!(m.base, Some(AddrReg::Reg(Register::from_name("rbx").unwrap())));
                assert_eq!(m.disp, -12);
            }
            _ => panic!(),
        }
    }

    #[test]
    #[should_panic(expected = "No such register")]
    fn bad_register() {
        str_to_func(
            "
          bb0:
            eax = copy 1
        ",
        );
    }
}
