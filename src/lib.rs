//! `rvm` — a register-based virtual machine: instruction set, byte
//! decoder, linear memory, a portable interpreter and native JIT
//! back-ends for AArch64 and x86-64.
//!
//! The companion crates [`rasm`](../rasm/index.html) (assembler) and
//! [`hexio`](../hexio/index.html) (hex image I/O) build on top of the
//! types defined here; `rvmctl` ties them together into a single CLI.

pub mod constants;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod interpreter;
pub mod isa;
pub mod jit;
pub mod memory;
pub mod vm;

pub use error::VmError;
pub use vm::{ExecutionBackend, Prologue, Vm, VmExit};
