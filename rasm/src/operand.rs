//! Operand-grammar parsing for registers, immediates and `LOAD`/`STORE`
//! memory references (spec.md §4.1, §6 EBNF).
//!
//! Immediates are parsed straight to their 64-bit wire bit pattern rather
//! than kept as a separate signed/unsigned value: a negative decimal
//! literal's two's-complement `u64` pattern and an "unsigned" encoding of
//! the same bits are identical, so there is nothing for a later encoding
//! step to do differently per instruction (confirmed against `asm.py`'s own
//! `gen_i`, which reduces to the same `int.to_bytes` output either way for a
//! given 64-bit value). See DESIGN.md.

use std::convert::TryFrom;
use std::str::FromStr;

use rvm::isa::RegisterId;

use crate::error::AsmError;

pub fn parse_register(tok: &str, line: usize) -> Result<RegisterId, AsmError> {
    RegisterId::from_str(&tok.trim().to_ascii_uppercase()).map_err(|_| AsmError::UnknownRegister {
        line,
        register: tok.to_string(),
    })
}

/// Parses `-?[0-9]+` or `0x[0-9a-fA-F]+` (spec.md §6 `immediate`) into its
/// 64-bit wire bit pattern.
pub fn parse_immediate_bits(tok: &str, line: usize) -> Result<u64, AsmError> {
    let t = tok.trim();
    if let Some(hex) = strip_hex_prefix(t) {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid(line, tok));
    }
    if t.starts_with('+') || t.is_empty() {
        return Err(invalid(line, tok));
    }
    t.parse::<i64>().map(|v| v as u64).map_err(|_| invalid(line, tok))
}

fn strip_hex_prefix(t: &str) -> Option<&str> {
    t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))
}

fn invalid(line: usize, tok: &str) -> AsmError {
    AsmError::InvalidImmediate {
        line,
        text: tok.to_string(),
    }
}

/// Either a resolved immediate bit pattern or a label name awaiting a link-time
/// address (spec.md §4.1 "Immediate-only instructions: an immediate literal or
/// a label name").
pub enum ImmOrLabel {
    Imm(u64),
    Label(String),
}

pub fn parse_imm_or_label(tok: &str, line: usize) -> ImmOrLabel {
    match parse_immediate_bits(tok, line) {
        Ok(value) => ImmOrLabel::Imm(value),
        Err(_) => ImmOrLabel::Label(tok.trim().to_string()),
    }
}

/// A parsed `[reg (+|- imm)?]` memory reference (spec.md §6 `mem-ref`).
pub struct MemRef {
    pub base: RegisterId,
    pub disp: i16,
}

pub fn parse_mem_ref(tok: &str, line: usize) -> Result<MemRef, AsmError> {
    let t = tok.trim();
    let inner = t
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| AsmError::Syntax {
            line,
            text: tok.to_string(),
        })?
        .trim();

    match inner.find(['+', '-']) {
        Some(pos) => {
            let (reg_part, rest) = inner.split_at(pos);
            let sign = &rest[..1];
            let magnitude_text = rest[1..].trim();
            let base = parse_register(reg_part, line)?;
            let magnitude = parse_disp_magnitude(magnitude_text, line)?;
            let signed = if sign == "-" {
                -(magnitude as i64)
            } else {
                magnitude as i64
            };
            let disp = i16::try_from(signed).map_err(|_| AsmError::DisplacementOutOfRange {
                line,
                value: signed,
            })?;
            Ok(MemRef { base, disp })
        }
        None => {
            let base = parse_register(inner, line)?;
            Ok(MemRef { base, disp: 0 })
        }
    }
}

fn parse_disp_magnitude(tok: &str, line: usize) -> Result<u64, AsmError> {
    if let Some(hex) = strip_hex_prefix(tok) {
        u64::from_str_radix(hex, 16).map_err(|_| invalid(line, tok))
    } else {
        tok.parse::<u64>().map_err(|_| invalid(line, tok))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_decimal_is_two_complement() {
        assert_eq!(parse_immediate_bits("-1", 0).unwrap(), u64::MAX);
    }

    #[test]
    fn hex_is_unsigned() {
        assert_eq!(parse_immediate_bits("0xFF", 0).unwrap(), 0xFF);
    }

    #[test]
    fn mem_ref_without_displacement() {
        let mem = parse_mem_ref("[R0]", 0).unwrap();
        assert_eq!(mem.base, RegisterId::R0);
        assert_eq!(mem.disp, 0);
    }

    #[test]
    fn mem_ref_with_negative_displacement() {
        let mem = parse_mem_ref("[SP - 8]", 0).unwrap();
        assert_eq!(mem.base, RegisterId::SP);
        assert_eq!(mem.disp, -8);
    }

    #[test]
    fn mem_ref_with_hex_displacement() {
        let mem = parse_mem_ref("[R1+0x10]", 0).unwrap();
        assert_eq!(mem.disp, 0x10);
    }

    #[test]
    fn displacement_overflow_is_rejected() {
        assert!(parse_mem_ref("[R0+100000]", 0).is_err());
    }
}
