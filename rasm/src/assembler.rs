//! Assembler state and the two-pass label resolver (spec.md §4.1, §4.3).
//!
//! The assembler context is a single struct threaded through every encoding
//! operation (spec.md §9 "Global assembler state... encapsulate as a single
//! assembler context value"), not process-wide state.

use std::collections::HashMap;

use log::{debug, warn};
use rvm::encoder;
use rvm::isa::Instruction;
use rvm::vm::Prologue;

use crate::error::AsmError;
use crate::mnemonic::parse_mnemonic;
use crate::operand::{self, ImmOrLabel};

/// Marks a label as local to its enclosing top-level label (spec.md §3
/// "Label namespace").
const LOCAL_MARKER: char = '.';
const SCOPE_SEPARATOR: &str = ":";

/// Bootstrapping prologue assembled before user input (spec.md §4.1). The
/// `sys_write`/`sys_print_u64` stubs are this implementation's resolution of
/// spec.md §9's open question about the I/O trap convention: each reserves a
/// distinct, addressable `CALL` target the interpreter/JIT intercept before
/// ordinary call dispatch (see `rvm::interpreter::dispatch_syscall`); the
/// `ret` body is never actually reached; it exists only so the label has a
/// concrete, single-byte-wide instruction and the following label gets a
/// distinct address.
const PROLOGUE_ASM: &str = "
sys_enter:
    jmp sys_enter
sys_write:
    ret
sys_print_u64:
    ret
";

/// Output of [`assemble`]: the encoded instruction stream (one buffer per
/// instruction, ready for [`hexio::write_instructions`]), the label table in
/// address order, and the prologue offsets the VM needs to recognize the
/// halt/entry/syscall addresses.
pub struct AssembledProgram {
    pub instructions: Vec<Vec<u8>>,
    pub labels: Vec<(u64, String)>,
    pub prologue: Prologue,
}

impl AssembledProgram {
    /// Concatenates the per-instruction buffers into one flat hex-image byte
    /// stream, the shape `rvm::Vm::new` and `rvm::jit::scan` expect.
    pub fn image(&self) -> Vec<u8> {
        self.instructions.concat()
    }
}

struct Assembler {
    instructions: Vec<Vec<u8>>,
    program_size: u64,
    label_addr: HashMap<String, u64>,
    /// qualified label name -> `(instruction index, byte offset of the
    /// imm64 placeholder within that instruction)` awaiting a patch.
    label_refs: HashMap<String, Vec<(usize, usize)>>,
    label_cur_top_level: Option<String>,
    label_defs_ordered: Vec<(u64, String)>,
}

impl Assembler {
    fn new() -> Assembler {
        Assembler {
            instructions: Vec::new(),
            program_size: 0,
            label_addr: HashMap::new(),
            label_refs: HashMap::new(),
            label_cur_top_level: None,
            label_defs_ordered: Vec::new(),
        }
    }

    fn push(&mut self, bytes: Vec<u8>) -> usize {
        let idx = self.instructions.len();
        self.program_size += bytes.len() as u64;
        self.instructions.push(bytes);
        idx
    }

    fn is_local(name: &str) -> bool {
        name.starts_with(LOCAL_MARKER)
    }

    fn qualify(&self, name: &str, line: usize) -> Result<String, AsmError> {
        if Self::is_local(name) {
            match &self.label_cur_top_level {
                Some(top) => Ok(format!("{}{}{}", top, SCOPE_SEPARATOR, name)),
                None => Err(AsmError::OrphanLocalLabel {
                    line,
                    name: name.to_string(),
                }),
            }
        } else {
            Ok(name.to_string())
        }
    }

    fn define_label(&mut self, name: &str, line: usize) -> Result<(), AsmError> {
        if !Self::is_local(name) {
            self.label_cur_top_level = Some(name.to_string());
        }
        let qualified = self.qualify(name, line)?;
        if self.label_addr.contains_key(&qualified) {
            return Err(AsmError::DuplicateLabel {
                line,
                name: qualified,
            });
        }
        debug!("label {} @ {:#x}", qualified, self.program_size);
        self.label_addr.insert(qualified.clone(), self.program_size);
        self.label_defs_ordered.push((self.program_size, qualified));
        Ok(())
    }

    fn reference_label(
        &mut self,
        name: &str,
        instr_idx: usize,
        byte_offset: usize,
        line: usize,
    ) -> Result<(), AsmError> {
        let qualified = self.qualify(name, line)?;
        self.label_refs
            .entry(qualified)
            .or_default()
            .push((instr_idx, byte_offset));
        Ok(())
    }

    /// Pass B: patches every recorded placeholder in place. The placeholder
    /// is exactly zero, so the patch is a bitwise OR (spec.md §4.3).
    fn link(&mut self) -> Result<(), AsmError> {
        let refs = std::mem::take(&mut self.label_refs);
        for (name, sites) in refs {
            let addr = self
                .label_addr
                .get(&name)
                .copied()
                .ok_or_else(|| AsmError::UnresolvedLabel { name: name.clone() })?;
            for (instr_idx, byte_offset) in sites {
                encoder::patch_imm64(&mut self.instructions[instr_idx], byte_offset, addr);
            }
        }
        Ok(())
    }

    fn warn_unreferenced_labels(&self, referenced: &std::collections::HashSet<String>) {
        for (_, name) in &self.label_defs_ordered {
            if !referenced.contains(name) {
                warn!("label {:?} is defined but never referenced", name);
            }
        }
    }

    fn process_source(&mut self, text: &str, start_line: usize) -> Result<(), AsmError> {
        for (i, raw_line) in text.lines().enumerate() {
            self.process_raw_line(raw_line, start_line + i)?;
        }
        Ok(())
    }

    fn process_raw_line(&mut self, raw: &str, line: usize) -> Result<(), AsmError> {
        let stripped = strip_comment(raw);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        if let Some(name) = trimmed.strip_suffix(':') {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(AsmError::Syntax {
                    line,
                    text: raw.to_string(),
                });
            }
            return self.define_label(name, line);
        }

        self.process_instruction_line(trimmed, line)
    }

    fn process_instruction_line(&mut self, text: &str, line: usize) -> Result<(), AsmError> {
        let mnemonic_tok = first_token(text);
        if mnemonic_tok.is_empty() || !mnemonic_tok.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AsmError::Syntax {
                line,
                text: text.to_string(),
            });
        }
        let instr = parse_mnemonic(mnemonic_tok).ok_or_else(|| AsmError::UnknownMnemonic {
            line,
            mnemonic: mnemonic_tok.to_string(),
        })?;
        let rest = text[mnemonic_tok.len()..].trim();
        self.encode_instruction(instr, mnemonic_tok, rest, line)
    }

    fn encode_instruction(
        &mut self,
        instr: Instruction,
        mnemonic: &str,
        rest: &str,
        line: usize,
    ) -> Result<(), AsmError> {
        use Instruction::*;

        match instr {
            Ret => {
                self.expect_no_operands(rest, mnemonic, line)?;
                self.push(encoder::encode_reg0(Ret));
            }

            Not | Push | Pop => {
                let reg = operand::parse_register(rest, line)?;
                self.push(encoder::encode_reg1(instr, reg));
            }

            Load => {
                let (dst_tok, src_tok) = split_two_operands(rest, mnemonic, line)?;
                let dst = operand::parse_register(dst_tok, line)?;
                let mem = operand::parse_mem_ref(src_tok, line)?;
                self.push(encoder::encode_reg_idx(Load, dst, mem.base, mem.disp));
            }
            Store => {
                let (dst_tok, src_tok) = split_two_operands(rest, mnemonic, line)?;
                let mem = operand::parse_mem_ref(dst_tok, line)?;
                let src = operand::parse_register(src_tok, line)?;
                self.push(encoder::encode_reg_idx(Store, mem.base, src, mem.disp));
            }

            Mov | Add | Sub | And | Or | Xor | Cmp => {
                self.encode_dst_src(instr, mnemonic, rest, line)?;
            }

            Call | Jmp | JmpEq | JmpNe | JmpGt | JmpLt | JmpGe | JmpLe => {
                match operand::parse_imm_or_label(rest, line) {
                    ImmOrLabel::Imm(value) => {
                        self.push(encoder::encode_imm1(instr, value));
                    }
                    ImmOrLabel::Label(name) => {
                        let idx = self.push(encoder::encode_imm1(instr, 0));
                        // `[opcode][imm64]`: the placeholder starts at byte 1.
                        self.reference_label(&name, idx, 1, line)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn encode_dst_src(
        &mut self,
        instr: Instruction,
        mnemonic: &str,
        rest: &str,
        line: usize,
    ) -> Result<(), AsmError> {
        let (dst_tok, src_tok) = split_two_operands(rest, mnemonic, line)?;
        let dst = operand::parse_register(dst_tok, line)?;
        if let Ok(src_reg) = operand::parse_register(src_tok, line) {
            self.push(encoder::encode_reg2(instr, dst, src_reg));
        } else {
            let imm = operand::parse_immediate_bits(src_tok, line)?;
            self.push(encoder::encode_reg_imm(instr, dst, imm));
        }
        Ok(())
    }

    fn expect_no_operands(&self, rest: &str, mnemonic: &str, line: usize) -> Result<(), AsmError> {
        if rest.is_empty() {
            Ok(())
        } else {
            Err(AsmError::OperandShape {
                line,
                mnemonic: mnemonic.to_string(),
                text: rest.to_string(),
            })
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn first_token(text: &str) -> &str {
    match text.find(char::is_whitespace) {
        Some(pos) => &text[..pos],
        None => text,
    }
}

fn split_two_operands<'a>(
    rest: &'a str,
    mnemonic: &str,
    line: usize,
) -> Result<(&'a str, &'a str), AsmError> {
    let comma = rest.find(',').ok_or_else(|| AsmError::OperandShape {
        line,
        mnemonic: mnemonic.to_string(),
        text: rest.to_string(),
    })?;
    Ok((rest[..comma].trim(), rest[comma + 1..].trim()))
}

/// Assembles `source` into a complete program: the bootstrap prologue first,
/// then `source` itself, then the link pass (spec.md §4.1, §4.3).
pub fn assemble(source: &str) -> Result<AssembledProgram, AsmError> {
    let mut asm = Assembler::new();

    asm.process_source(PROLOGUE_ASM, 0)?;
    let sys_enter = asm.label_addr[rvm::constants::SYS_ENTER_LABEL];
    let sys_write = asm.label_addr[rvm::constants::SYS_WRITE_LABEL];
    let sys_print_u64 = asm.label_addr[rvm::constants::SYS_PRINT_U64_LABEL];
    let entry = asm.program_size;
    // The prologue's own scope must not leak into the user program: a local
    // label at the very top of `source` with no preceding top-level label of
    // its own must still be an error, not silently scoped under `sys_print_u64`.
    asm.label_cur_top_level = None;

    asm.process_source(source, 1)?;

    let referenced: std::collections::HashSet<String> = asm.label_refs.keys().cloned().collect();
    asm.link()?;
    asm.warn_unreferenced_labels(&referenced);

    Ok(AssembledProgram {
        instructions: asm.instructions,
        labels: asm.label_defs_ordered,
        prologue: Prologue {
            sys_enter,
            entry,
            sys_write,
            sys_print_u64,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use rvm::constants;

    #[test]
    fn prologue_offsets_match_the_fixed_constants_vm_cli_relies_on() {
        let program = assemble("").unwrap();
        assert_eq!(program.prologue.sys_enter, constants::PROLOGUE_SYS_ENTER_OFFSET);
        assert_eq!(program.prologue.sys_write, constants::PROLOGUE_SYS_WRITE_OFFSET);
        assert_eq!(
            program.prologue.sys_print_u64,
            constants::PROLOGUE_SYS_PRINT_U64_OFFSET
        );
        assert_eq!(program.prologue.entry, constants::PROLOGUE_ENTRY_OFFSET);
    }
}
