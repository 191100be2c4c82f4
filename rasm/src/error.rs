//! Assembler diagnostics. Every variant carries the 1-based source line that
//! provoked it (spec.md §7 "emit line number and text; abort"), except
//! [`AsmError::UnresolvedLabel`], which is only detectable at link time once
//! every line has already been consumed.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    #[error("line {line}: syntax error: {text:?}")]
    Syntax { line: usize, text: String },

    #[error("line {line}: unknown mnemonic {mnemonic:?}")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("line {line}: unknown register {register:?}")]
    UnknownRegister { line: usize, register: String },

    #[error("line {line}: invalid immediate {text:?}")]
    InvalidImmediate { line: usize, text: String },

    #[error("line {line}: displacement {value} does not fit in 16 signed bits")]
    DisplacementOutOfRange { line: usize, value: i64 },

    #[error("line {line}: wrong operand shape for {mnemonic}: {text:?}")]
    OperandShape {
        line: usize,
        mnemonic: String,
        text: String,
    },

    #[error("line {line}: duplicate label {name:?}")]
    DuplicateLabel { line: usize, name: String },

    #[error("line {line}: local label {name:?} has no enclosing top-level label")]
    OrphanLocalLabel { line: usize, name: String },

    #[error("unresolved label {name:?}")]
    UnresolvedLabel { name: String },
}
