pub mod x86_64;

use std::fmt;

use crate::{errors::Result, translator::Translator, types::DataType};

pub trait Codegen {
    /// Lowers every function and global of the session to assembly text.
    fn code_gen(mic: &Translator) -> Result<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Memory,
    Immediate,
    /// A rip relative symbol whose address is the value, e.g. a string literal.
    Address,
}

/// An operand resolved against the current activation record.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub text: String,
    pub ty: DataType,
    pub mode: Mode,
}

impl Location {
    pub fn memory(text: String, ty: DataType) -> Self {
        Location {
            text,
            ty,
            mode: Mode::Memory,
        }
    }

    pub fn immediate(value: i64, ty: DataType) -> Self {
        Location {
            text: format!("${}", value),
            ty,
            mode: Mode::Immediate,
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.mode == Mode::Immediate
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}
