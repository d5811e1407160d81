use cfgrammar::yacc::YaccKind;
use lrlex::CTLexerBuilder;

fn main() {
    // The IR parser is only used in tests, but cargo has no test-only build scripts.
    CTLexerBuilder::new()
        .lrpar_config(|ctp| {
            ctp.yacckind(YaccKind::Grmtools)
                .grammar_in_src_dir("ir/ir.y")
                .unwrap()
        })
        .lexer_in_src_dir("ir/ir.l")
        .unwrap()
        .build()
        .unwrap();
}
