use itertools::Itertools;
use lrlex::lrlex_mod;
use lrpar::lrpar_mod;

use crate::{
    absyn::ExternalDecl,
    errors::{Result, TranslateError},
};

lrlex_mod!("minimatlab.l");
lrpar_mod!("minimatlab.y");

/// Parses a whole translation unit. Every lexing and parsing error is rendered,
/// one per line, into a single `Syntax` error.
pub fn parse(input: &str) -> Result<Vec<ExternalDecl>> {
    let lexerdef = minimatlab_l::lexerdef();
    let lexer = lexerdef.lexer(input);
    let (res, errs) = minimatlab_y::parse(&lexer);
    if !errs.is_empty() {
        let msg = errs
            .iter()
            .map(|e| e.pp(&lexer, &minimatlab_y::token_epp))
            .join("\n");
        return Err(TranslateError::Syntax(msg));
    }
    match res {
        Some(Ok(unit)) => Ok(unit),
        _ => Err(TranslateError::Syntax("unable to parse input".to_string())),
    }
}
