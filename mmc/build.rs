use cfgrammar::yacc::YaccKind;
use lrlex::CTLexerBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // the dangling else is the only shift/reduce conflict; shifting is what we want.
    CTLexerBuilder::new()
        .rust_edition(lrlex::RustEdition::Rust2021)
        .lrpar_config(|ctp| {
            ctp.yacckind(YaccKind::Grmtools)
                .rust_edition(lrpar::RustEdition::Rust2021)
                .error_on_conflicts(false)
                .grammar_in_src_dir("minimatlab.y")
                .unwrap()
        })
        .lexer_in_src_dir("minimatlab.l")?
        .build()?;
    Ok(())
}
