//! Stateless byte decoder shared by the interpreter and the JIT
//! translators: `decode(bytes, cursor)` turns the opcode byte at `cursor`
//! into a [`DecodedInstr`] plus the number of bytes it occupied, without
//! touching VM state.

use byteorder::{BigEndian, ByteOrder};

use crate::error::VmError;
use crate::isa::{split_opcode_byte, AccessMode, Instruction, RegisterId};

/// The operand shape carried by a decoded instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operands {
    None,
    Reg(RegisterId),
    RegReg(RegisterId, RegisterId),
    RegRegDisp(RegisterId, RegisterId, i16),
    Imm(u64),
    RegImm(RegisterId, u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DecodedInstr {
    pub instr: Instruction,
    pub operands: Operands,
}

fn register(byte: u8, offset: u64) -> Result<RegisterId, VmError> {
    num::FromPrimitive::from_u8(byte).ok_or(VmError::InvalidOpcode { byte, offset })
}

fn need(bytes: &[u8], cursor: usize, count: usize, offset: u64) -> Result<(), VmError> {
    if bytes.len() - cursor < count {
        Err(VmError::TruncatedInstruction {
            offset,
            needed: count,
            available: bytes.len() - cursor,
        })
    } else {
        Ok(())
    }
}

/// Decodes the instruction at `cursor`, returning it alongside its total
/// encoded width in bytes.
pub fn decode(bytes: &[u8], cursor: usize) -> Result<(DecodedInstr, usize), VmError> {
    let offset = cursor as u64;
    need(bytes, cursor, 1, offset)?;
    let opcode = bytes[cursor];
    let (instr, mode) = split_opcode_byte(opcode);
    let instr = instr.ok_or(VmError::InvalidOpcode { byte: opcode, offset })?;
    let mode = mode.ok_or(VmError::InvalidAccessMode {
        bits: opcode & crate::constants::ACCESS_MODE_MASK,
        offset,
    })?;

    use Instruction::*;
    let (operands, width) = match (instr, mode) {
        (Ret, AccessMode::Reg) => (Operands::None, 1),

        (Not, AccessMode::Reg) | (Push, AccessMode::Reg) | (Pop, AccessMode::Reg) => {
            need(bytes, cursor, 2, offset)?;
            let reg = register(bytes[cursor + 1] >> 4, offset)?;
            (Operands::Reg(reg), 2)
        }

        (Load, AccessMode::RegIdx) | (Store, AccessMode::RegIdx) => {
            need(bytes, cursor, 4, offset)?;
            let dst = register(bytes[cursor + 1] >> 4, offset)?;
            let src = register(bytes[cursor + 1] & 0x0f, offset)?;
            let disp = BigEndian::read_i16(&bytes[cursor + 2..cursor + 4]);
            (Operands::RegRegDisp(dst, src, disp), 4)
        }

        (Mov, AccessMode::Reg)
        | (Add, AccessMode::Reg)
        | (Sub, AccessMode::Reg)
        | (And, AccessMode::Reg)
        | (Or, AccessMode::Reg)
        | (Xor, AccessMode::Reg)
        | (Cmp, AccessMode::Reg) => {
            need(bytes, cursor, 2, offset)?;
            let dst = register(bytes[cursor + 1] >> 4, offset)?;
            let src = register(bytes[cursor + 1] & 0x0f, offset)?;
            (Operands::RegReg(dst, src), 2)
        }

        (Mov, AccessMode::Imm)
        | (Add, AccessMode::Imm)
        | (Sub, AccessMode::Imm)
        | (And, AccessMode::Imm)
        | (Or, AccessMode::Imm)
        | (Xor, AccessMode::Imm)
        | (Cmp, AccessMode::Imm) => {
            need(bytes, cursor, 10, offset)?;
            let reg = register(bytes[cursor + 1] >> 4, offset)?;
            let imm = BigEndian::read_u64(&bytes[cursor + 2..cursor + 10]);
            (Operands::RegImm(reg, imm), 10)
        }

        (Call, AccessMode::Imm)
        | (Jmp, AccessMode::Imm)
        | (JmpEq, AccessMode::Imm)
        | (JmpNe, AccessMode::Imm)
        | (JmpGt, AccessMode::Imm)
        | (JmpLt, AccessMode::Imm)
        | (JmpGe, AccessMode::Imm)
        | (JmpLe, AccessMode::Imm) => {
            need(bytes, cursor, 9, offset)?;
            let imm = BigEndian::read_u64(&bytes[cursor + 1..cursor + 9]);
            (Operands::Imm(imm), 9)
        }

        _ => return Err(VmError::InvalidOpcode { byte: opcode, offset }),
    };

    Ok((DecodedInstr { instr, operands }, width))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder;

    #[test]
    fn decodes_reg_idx_form() {
        let bytes = encoder::encode_reg_idx(Instruction::Load, RegisterId::R0, RegisterId::SP, -4);
        let (decoded, width) = decode(&bytes, 0).unwrap();
        assert_eq!(width, 4);
        assert_eq!(decoded.instr, Instruction::Load);
        assert_eq!(
            decoded.operands,
            Operands::RegRegDisp(RegisterId::R0, RegisterId::SP, -4)
        );
    }

    #[test]
    fn decodes_reg_imm_form() {
        let bytes = encoder::encode_reg_imm(Instruction::Mov, RegisterId::R1, 42);
        let (decoded, width) = decode(&bytes, 0).unwrap();
        assert_eq!(width, 10);
        assert_eq!(decoded.operands, Operands::RegImm(RegisterId::R1, 42));
    }

    #[test]
    fn truncated_instruction_faults() {
        let bytes = encoder::encode_imm1(Instruction::Jmp, 7);
        assert!(decode(&bytes[..4], 0).is_err());
    }

    #[test]
    fn mismatched_access_mode_is_rejected() {
        // RET is only valid in REG mode; forcing IMM on its opcode bits
        // must not silently decode as something else.
        let byte = crate::isa::opcode_byte(Instruction::Ret, crate::isa::AccessMode::Imm);
        assert!(decode(&[byte, 0, 0, 0, 0, 0, 0, 0, 0], 0).is_err());
    }
}
