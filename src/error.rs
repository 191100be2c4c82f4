//! Error types shared by the decoder, interpreter and JIT back-ends.

use thiserror::Error;

/// Failures surfaced while decoding or executing an assembled image.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("memory access out of range at address {address:#x}{}", pc_suffix(*pc))]
    MemoryFault { address: u64, pc: Option<u64> },

    #[error("invalid opcode byte {byte:#04x} at offset {offset:#x}")]
    InvalidOpcode { byte: u8, offset: u64 },

    #[error("invalid access mode bits {bits:#04b} at offset {offset:#x}")]
    InvalidAccessMode { bits: u8, offset: u64 },

    #[error("truncated instruction at offset {offset:#x}: need {needed} bytes, have {available}")]
    TruncatedInstruction {
        offset: u64,
        needed: usize,
        available: usize,
    },

    #[error("CALL/JMP target {target:#x} is not a valid instruction offset")]
    InvalidJumpTarget { target: u64 },

    #[error("requested JIT backend does not match host architecture ({host})")]
    BackendMismatch { host: &'static str },

    #[error("failed to provision executable JIT page: {0}")]
    JitProvisioning(#[from] nix::Error),
}

fn pc_suffix(pc: Option<u64>) -> String {
    match pc {
        Some(pc) => format!(" (pc={:#x})", pc),
        None => String::new(),
    }
}
