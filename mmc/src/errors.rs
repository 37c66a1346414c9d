use thiserror::Error;

/// Everything that aborts the translation of one input file.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Not a .mm file")]
    BadInputFile(String),

    #[error("duplicate symbol `{0}`")]
    DuplicateSymbol(String),

    #[error("undefined symbol `{0}`")]
    UndefinedSymbol(String),

    #[error("cannot leave the global scope")]
    NoActiveScope,

    #[error("{0}")]
    Syntax(String),

    #[error("line:{line},col:{col} error: {msg}")]
    Semantic { line: usize, col: usize, msg: String },

    #[error("cannot generate code for quad {index}: {msg}")]
    Unsupported { index: usize, msg: String },

    #[error("the frame of `{0}` does not fit in 2 GiB")]
    FrameTooLarge(String),

    #[error("jump at quad {0} has no valid target")]
    UnresolvedJump(usize),

    #[error("quad {0} does not exist")]
    BadPatch(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fmt(#[from] std::fmt::Error),
}

pub type Result<T> = std::result::Result<T, TranslateError>;
