//! Instruction opcode set, access modes and the register file.
//!
//! Instruction Formats (wire, big-endian):
//!
//! | Form               | Layout                        | Width |
//! |--------------------|--------------------------------|------|
//! | `REG` no-operand    | `[opcode]`                     | 1    |
//! | `REG` one-register  | `[opcode][reg<<4]`             | 2    |
//! | `REG` two-register  | `[opcode][dst<<4\|src]`        | 2    |
//! | `REG_IDX`           | `[opcode][dst<<4\|src][disp16]`| 4    |
//! | `IMM` one-immediate | `[opcode][imm64]`              | 9    |
//! | `IMM` reg-immediate | `[opcode][reg<<4][imm64]`      | 10   |

use num::traits::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;
use util::EnumFromStr;
use util_derive::EnumFromStr;

use crate::constants;

/// The opcode portion (6 bits) of the leading instruction byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, ToPrimitive, FromPrimitive, EnumFromStr)]
pub enum Instruction {
    /// `LOAD dst, [base+disp]` — `dst <- mem64[base + disp]`, little-endian.
    Load,
    /// `STORE [base+disp], src` — `mem64[base + disp] <- src`.
    Store,
    /// `MOV dst, src` — `dst <- src`.
    Mov,
    /// `ADD dst, src` — signed addition, wraps modulo 2^64.
    Add,
    /// `SUB dst, src` — signed subtraction, wraps modulo 2^64.
    Sub,
    /// `AND dst, src` — bitwise and.
    And,
    /// `OR dst, src` — bitwise or.
    Or,
    /// `XOR dst, src` — bitwise xor.
    Xor,
    /// `NOT reg` — `reg <- !reg`.
    Not,
    /// `CMP a, b` — signed compare; sets exactly one of `EQ`/`LT`/`GT`.
    Cmp,
    /// `PUSH r` — `SP <- SP - 8; mem64[SP] <- r`.
    Push,
    /// `POP r` — `r <- mem64[SP]; SP <- SP + 8`.
    Pop,
    /// `CALL imm` — pushes the return address, `PC <- imm`.
    Call,
    /// `RET` — pops a return address into `PC`.
    Ret,
    /// `JMP imm` — unconditional `PC <- imm`.
    Jmp,
    /// `JMPEQ imm` — jumps if `EQ`.
    JmpEq,
    /// `JMPNE imm` — jumps if not `EQ`.
    JmpNe,
    /// `JMPGT imm` — jumps if `GT`.
    JmpGt,
    /// `JMPLT imm` — jumps if `LT`.
    JmpLt,
    /// `JMPGE imm` — jumps if `GT` or `EQ`.
    JmpGe,
    /// `JMPLE imm` — jumps if `LT` or `EQ`.
    JmpLe,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The 2-bit access-mode suffix packed into the leading opcode byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, ToPrimitive, FromPrimitive)]
pub enum AccessMode {
    /// Register-register, register-only, or no-operand form.
    Reg = 0,
    /// Register-immediate or immediate-only form.
    Imm = 1,
    /// `register + register + 16-bit signed displacement`; `LOAD`/`STORE` only.
    RegIdx = 2,
}

/// General-purpose register file: `R0..=R13` plus the stack pointer `SP`,
/// filling the 4-bit register field exactly (16 values). `PC` is VM-internal
/// state and is never an encodable register operand — see DESIGN.md.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, ToPrimitive, FromPrimitive, EnumFromStr)]
pub enum RegisterId {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    SP,
    /// Reserved; decodes but is never produced by the assembler. Kept so the
    /// register field has a full, unambiguous 4-bit range (all 16 values map
    /// to a named register) rather than leaving decode holes.
    RESERVED,
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl RegisterId {
    #[inline]
    pub fn index(self) -> usize {
        ToPrimitive::to_usize(&self).unwrap()
    }
}

#[inline]
pub fn opcode_byte(instr: Instruction, mode: AccessMode) -> u8 {
    let instr_bits = ToPrimitive::to_u8(&instr).unwrap();
    let mode_bits = ToPrimitive::to_u8(&mode).unwrap();
    (instr_bits << constants::ACCESS_MODE_BITS) | (mode_bits & constants::ACCESS_MODE_MASK)
}

#[inline]
pub fn split_opcode_byte(byte: u8) -> (Option<Instruction>, Option<AccessMode>) {
    let instr_bits = byte >> constants::ACCESS_MODE_BITS;
    let mode_bits = byte & constants::ACCESS_MODE_MASK;
    (
        FromPrimitive::from_u8(instr_bits),
        FromPrimitive::from_u8(mode_bits),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_byte_roundtrip() {
        for instr in [
            Instruction::Load,
            Instruction::Store,
            Instruction::Mov,
            Instruction::Cmp,
            Instruction::JmpLe,
        ] {
            for mode in [AccessMode::Reg, AccessMode::Imm, AccessMode::RegIdx] {
                let byte = opcode_byte(instr, mode);
                let (decoded_instr, decoded_mode) = split_opcode_byte(byte);
                assert_eq!(decoded_instr, Some(instr));
                assert_eq!(decoded_mode, Some(mode));
            }
        }
    }

    #[test]
    fn register_from_str_matches_uppercase_name() {
        // Register names are matched verbatim in uppercase; callers
        // (the assembler) uppercase operand text before parsing so that
        // source-level register references stay case-insensitive.
        use std::str::FromStr;
        assert_eq!(RegisterId::from_str("SP"), Ok(RegisterId::SP));
        assert_eq!(RegisterId::from_str("R3"), Ok(RegisterId::R3));
        assert!(RegisterId::from_str("sp").is_err());
    }
}
