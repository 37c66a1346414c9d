// minimatlab is a lib crate so that the `tests` folder and the `mmc` binary can reach
// every stage of the pipeline.
pub mod absyn;
pub mod assem;
pub mod errors;
pub mod expression;
pub mod frame;
pub mod interner;
pub mod ir;
pub mod parsing;
pub mod semant;
pub mod symtab;
pub mod translator;
pub mod types;
pub mod util;

use tracing::info;

use crate::{
    assem::{x86_64::X86Asm, Codegen},
    errors::Result,
    translator::Translator,
};

/// Parses `input` and builds its symbol tables and quads.
pub fn translate(file: &str, input: &str, trace_tacos: bool) -> Result<Translator> {
    let unit = parsing::parse(input)?;
    let mut mic = Translator::new(file);
    mic.trace_tacos = trace_tacos;
    semant::translate(input, &unit, &mut mic)?;
    info!(file, quads = mic.quads.len(), tables = mic.tables.len(), "translated");
    Ok(mic)
}

/// Full pipeline down to x86-64 assembly text.
pub fn compile(file: &str, input: &str, trace_tacos: bool) -> Result<String> {
    let mic = translate(file, input, trace_tacos)?;
    X86Asm::code_gen(&mic)
}
