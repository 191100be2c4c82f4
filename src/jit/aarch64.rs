//! AArch64 JIT back-end: hand-encoded AAPCS64 machine code, translated from
//! the same [`ScannedInstr`] list the x86-64 back-end consumes, in the same
//! single linear pass.
//!
//! Guest registers stay memory-resident behind a pinned base pointer, same
//! tradeoff [`super::x86_64`] makes — there are 16 guest registers and only
//! ten callee-saved AAPCS64 GPRs available to pin context in. Pinned for the
//! life of a translated function (AAPCS64 callee-saved, pushed in the
//! prologue and popped in the shared exit trampoline):
//!
//! * `x19` — `&mut [u64; 16]` guest register file
//! * `x20` — guest memory base pointer
//! * `x21` — guest memory length
//! * `x22` — `*mut FaultSlot`
//! * `x23` — dynamic-jump table (`RET` targets aren't known until run time)
//! * `x24` — `*mut u8` FLAGS byte, materialized in memory same as the x86-64
//!   back-end
//! * `x29`/`x30` — frame pointer / link register, saved and restored like any
//!   other callee-saved register; generated code never reads them except
//!   through the epilogue's restore
//!
//! `LOAD`/`STORE`/`PUSH`/`POP` and the two reserved syscalls are emitted as
//! `BLR` calls into the helpers in [`super`], same division of labor as the
//! x86-64 back-end.
//!
//! Unlike x86-64, a freshly written executable page is not guaranteed
//! instruction-cache coherent on AArch64 — `run` walks the written range
//! with `dc cvau`/`ic ivau` before the first call into it.

use crate::error::VmError;
use crate::isa::{Instruction, RegisterId};
use crate::jit::{self, ExecPage, FaultSlot, PatchTarget, ScannedInstr};
use crate::memory::Storage;
use crate::vm::{Vm, VmExit};
use crate::{decoder::Operands, isa::AccessMode};

#[allow(dead_code)]
const _UNUSED: Option<AccessMode> = None;

pub fn run(vm: &mut Vm) -> Result<VmExit, VmError> {
    if !cfg!(target_arch = "aarch64") {
        return Err(VmError::BackendMismatch { host: std::env::consts::ARCH });
    }

    let instrs = jit::scan(vm.memory.data(), vm.prologue.entry, vm.image_len)?;
    let (code, translation_map) = translate(vm, &instrs)?;

    let mut page = ExecPage::new(code.len().max(1))?;
    page.as_mut_slice()[..code.len()].copy_from_slice(&code);
    sync_icache(page.as_mut_slice());
    page.seal()?;

    let mem_len = vm.memory.length();
    let mut jump_table = vec![u64::MAX; mem_len as usize];
    let base = page.entry_ptr() as usize;
    for (&guest_off, &host_off) in &translation_map {
        if (guest_off as usize) < jump_table.len() {
            jump_table[guest_off as usize] = (base + host_off) as u64;
        }
    }

    let mut fault = FaultSlot(None);
    let mut flags_byte: u8 = 0;

    type Entry = unsafe extern "C" fn(*mut u64, *mut u8, u64, *mut FaultSlot, *const u64, *mut u8) -> u64;
    let entry: Entry = unsafe { std::mem::transmute(page.entry_ptr()) };

    unsafe {
        entry(
            vm.registers.as_mut_ptr(),
            vm.memory.as_mut_ptr(),
            mem_len,
            &mut fault as *mut FaultSlot,
            jump_table.as_ptr(),
            &mut flags_byte as *mut u8,
        );
    }

    if let Some(err) = fault.0 {
        return Err(err);
    }

    vm.flags.eq = flags_byte & 0b001 != 0;
    vm.flags.lt = flags_byte & 0b010 != 0;
    vm.flags.gt = flags_byte & 0b100 != 0;
    Ok(vm.exit())
}

/// Walks the page a cache-line at a time, cleaning data cache and
/// invalidating instruction cache, then issues the two `dsb`s and final
/// `isb` the architecture requires before fetched instructions are
/// guaranteed to observe the write.
#[cfg(target_arch = "aarch64")]
fn sync_icache(code: &mut [u8]) {
    let start = code.as_ptr() as usize;
    let end = start + code.len();
    let line = icache_line_size();
    let mut addr = start - (start % line);
    while addr < end {
        unsafe {
            std::arch::asm!(
                "dc cvau, {0}",
                in(reg) addr,
            );
        }
        addr += line;
    }
    unsafe { std::arch::asm!("dsb ish") };

    let mut addr = start - (start % line);
    while addr < end {
        unsafe {
            std::arch::asm!(
                "ic ivau, {0}",
                in(reg) addr,
            );
        }
        addr += line;
    }
    unsafe {
        std::arch::asm!("dsb ish");
        std::arch::asm!("isb");
    }
}

/// The smaller of `CTR_EL0`'s reported D-cache and I-cache line sizes, used
/// as a conservative step for both the `dc cvau` and `ic ivau` sweeps
/// below (`IminLine` is bits[3:0], `DminLine` is bits[19:16], both in words).
#[cfg(target_arch = "aarch64")]
fn icache_line_size() -> usize {
    let ctr: u64;
    unsafe {
        std::arch::asm!("mrs {0}, ctr_el0", out(reg) ctr);
    }
    let i_line = 4usize << (ctr & 0xf);
    let d_line = 4usize << ((ctr >> 16) & 0xf);
    i_line.min(d_line)
}

#[cfg(not(target_arch = "aarch64"))]
fn sync_icache(_code: &mut [u8]) {}

// -- Raw A64 encoders ---------------------------------------------------
//
// Registers are plain `u8` indices (0..=30 general purpose, 31 meaning
// either XZR or SP depending on instruction class, same overload the
// architecture itself uses). There is no register allocator here: every
// helper below takes the exact register numbers the caller already decided
// on, same as the x86-64 back-end's `R` encoders.

fn movz64(buf: &mut Vec<u8>, rd: u8, imm16: u16) {
    let word = 0xD280_0000u32 | ((imm16 as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn movk64(buf: &mut Vec<u8>, rd: u8, imm16: u16, shift: u8) {
    let hw = (shift / 16) as u32;
    let word = 0xF280_0000u32 | (hw << 21) | ((imm16 as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn movz32(buf: &mut Vec<u8>, rd: u8, imm16: u16) {
    let word = 0x5280_0000u32 | ((imm16 as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// Loads a full 64-bit constant through `MOVZ` + three `MOVK`s.
fn mov_imm64(buf: &mut Vec<u8>, rd: u8, imm: u64) {
    movz64(buf, rd, (imm & 0xffff) as u16);
    movk64(buf, rd, ((imm >> 16) & 0xffff) as u16, 16);
    movk64(buf, rd, ((imm >> 32) & 0xffff) as u16, 32);
    movk64(buf, rd, ((imm >> 48) & 0xffff) as u16, 48);
}

/// `LDR Xt, [Xn, #imm]`, unsigned offset scaled by 8. `imm` must be a
/// non-negative multiple of 8 within the 12-bit scaled field's range
/// (0..=32760) — always true here since every offset is either a guest
/// register-file slot (`0..=120`) or zero.
fn ldr_imm(buf: &mut Vec<u8>, rt: u8, rn: u8, imm: i32) {
    debug_assert!(imm >= 0 && imm % 8 == 0 && imm <= 32760);
    let imm12 = (imm / 8) as u32;
    let word = 0xF940_0000u32 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn str_imm(buf: &mut Vec<u8>, rt: u8, rn: u8, imm: i32) {
    debug_assert!(imm >= 0 && imm % 8 == 0 && imm <= 32760);
    let imm12 = (imm / 8) as u32;
    let word = 0xF900_0000u32 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn ldrb_imm0(buf: &mut Vec<u8>, wt: u8, xn: u8) {
    let word = 0x3940_0000u32 | ((xn as u32) << 5) | (wt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn strb_imm0(buf: &mut Vec<u8>, wt: u8, xn: u8) {
    let word = 0x3900_0000u32 | ((xn as u32) << 5) | (wt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// `LDR Xt, [Xn, Xm, LSL #3]` — the dynamic jump-table lookup.
fn ldr_reg_lsl3(buf: &mut Vec<u8>, rt: u8, rn: u8, rm: u8) {
    let word = 0xF860_7800u32 | ((rm as u32) << 16) | ((rn as u32) << 5) | (rt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn mov_reg(buf: &mut Vec<u8>, rd: u8, rm: u8) {
    // ORR Xd, XZR, Xm
    let word = 0xAA00_03E0u32 | ((rm as u32) << 16) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn dp_shifted(buf: &mut Vec<u8>, base: u32, rd: u8, rn: u8, rm: u8, amount: u8) {
    let word = base | ((rm as u32) << 16) | ((amount as u32) << 10) | ((rn as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn add_reg(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8) {
    dp_shifted(buf, 0x8B00_0000, rd, rn, rm, 0);
}
fn sub_reg(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8) {
    dp_shifted(buf, 0xCB00_0000, rd, rn, rm, 0);
}
fn and_reg(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8) {
    dp_shifted(buf, 0x8A00_0000, rd, rn, rm, 0);
}
fn orr_reg(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8) {
    dp_shifted(buf, 0xAA00_0000, rd, rn, rm, 0);
}
fn eor_reg(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8) {
    dp_shifted(buf, 0xCA00_0000, rd, rn, rm, 0);
}
fn orr_reg_lsl(buf: &mut Vec<u8>, rd: u8, rn: u8, rm: u8, amount: u8) {
    dp_shifted(buf, 0xAA00_0000, rd, rn, rm, amount);
}

fn mvn_reg(buf: &mut Vec<u8>, rd: u8, rm: u8) {
    // ORN Xd, XZR, Xm
    let word = 0xAA20_03E0u32 | ((rm as u32) << 16) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn add_imm12(buf: &mut Vec<u8>, rd: u8, rn: u8, imm12: u16) {
    let word = 0x9100_0000u32 | ((imm12 as u32) << 10) | ((rn as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}
fn sub_imm12(buf: &mut Vec<u8>, rd: u8, rn: u8, imm12: u16) {
    let word = 0xD100_0000u32 | ((imm12 as u32) << 10) | ((rn as u32) << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// `CMP Xn, Xm` (`SUBS XZR, Xn, Xm`), signed 64-bit compare.
fn cmp_reg(buf: &mut Vec<u8>, rn: u8, rm: u8) {
    dp_shifted(buf, 0xEB00_0000, 31, rn, rm, 0);
}

/// `TST Xn, Xm` (`ANDS XZR, Xn, Xm`), 64-bit.
fn tst_reg(buf: &mut Vec<u8>, rn: u8, rm: u8) {
    dp_shifted(buf, 0xEA00_0000, 31, rn, rm, 0);
}

/// `TST Wn, Wm` (`ANDS WZR, Wn, Wm`), 32-bit — used on syscall-helper fault
/// bytes and flags-mask tests, which both live in the low 32 bits.
fn tst_w(buf: &mut Vec<u8>, rn: u8, rm: u8) {
    let word = 0x6A00_0000u32 | ((rm as u32) << 16) | (31u32 << 0) | ((rn as u32) << 5);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// Isolates and tests the low byte of `src`. AArch64 has no byte-sized
/// general-register ALU form the way x86-64's `TEST al,al` does, and the
/// AAPCS64 `u8` return convention leaves the rest of the register
/// unspecified, so the mask is explicit rather than folded into a
/// word-sized `TST`. Leaves `D` clobbered and `Z` set iff the byte is zero.
fn test_fault_byte(buf: &mut Vec<u8>, src: u8) {
    mov_imm64(buf, C, 0xff);
    and_reg(buf, D, src, C);
    tst_reg(buf, D, D);
}

const COND_EQ: u8 = 0b0000;
const COND_NE: u8 = 0b0001;
const COND_HS: u8 = 0b0010;
const COND_LT: u8 = 0b1011;
const COND_GT: u8 = 0b1100;

/// `CSET Xd, cond` (`CSINC Xd, XZR, XZR, invert(cond)`).
fn cset(buf: &mut Vec<u8>, rd: u8, cond: u8) {
    let inverted = cond ^ 1;
    let word = 0x9A80_0400u32 | (31u32 << 16) | ((inverted as u32) << 12) | (31u32 << 5) | (rd as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn br(buf: &mut Vec<u8>, rn: u8) {
    let word = 0xD61F_0000u32 | ((rn as u32) << 5);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn blr(buf: &mut Vec<u8>, rn: u8) {
    let word = 0xD63F_0000u32 | ((rn as u32) << 5);
    buf.extend_from_slice(&word.to_le_bytes());
}

fn ret(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&0xD65F_03C0u32.to_le_bytes());
}

/// `STP Xt, Xt2, [SP, #-16]!`
fn stp_pre16(buf: &mut Vec<u8>, rt: u8, rt2: u8) {
    let imm7 = (-2i32 as u32) & 0x7f; // -16/8
    let word = 0xA980_0000u32 | (imm7 << 15) | ((rt2 as u32) << 10) | (31u32 << 5) | (rt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// `LDP Xt, Xt2, [SP], #16`
fn ldp_post16(buf: &mut Vec<u8>, rt: u8, rt2: u8) {
    let imm7 = 2u32; // 16/8
    let word = 0xA8C0_0000u32 | (imm7 << 15) | ((rt2 as u32) << 10) | (31u32 << 5) | (rt as u32);
    buf.extend_from_slice(&word.to_le_bytes());
}

/// Placeholder unconditional branch (`B`), `imm26 = 0`. Patched later by
/// OR-ing in the relative word offset.
fn b_placeholder(buf: &mut Vec<u8>) -> usize {
    let at = buf.len();
    buf.extend_from_slice(&0x1400_0000u32.to_le_bytes());
    at
}

/// Placeholder conditional branch (`B.cond`), `imm19 = 0`.
fn b_cond_placeholder(buf: &mut Vec<u8>, cond: u8) -> usize {
    let at = buf.len();
    let word = 0x5400_0000u32 | (cond as u32);
    buf.extend_from_slice(&word.to_le_bytes());
    at
}

fn patch_branch(buf: &mut [u8], at: usize, target: usize, conditional: bool) {
    let rel_words = (target as i64 - at as i64) / 4;
    let mut word = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
    if conditional {
        word |= ((rel_words as u32) & 0x7ffff) << 5;
    } else {
        word |= (rel_words as u32) & 0x3ff_ffff;
    }
    buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
}

// -- Translation ----------------------------------------------------------

// Scratch register assignment, mirroring the x86-64 back-end's
// rax/rcx/rdx/r8/r9/r10/r11 roles.
const A: u8 = 9; // value / primary accumulator
const C: u8 = 10; // second operand
const D: u8 = 11; // fault flag / third operand
const T0: u8 = 12;
const T1: u8 = 13;
const FN_PTR: u8 = 14; // call target
const RET_TARGET: u8 = 15; // RET's popped target, survives past its own load call
const SCRATCH_PAIR: u8 = 16; // discarded half of an LDP restore

// Pinned callee-saved context registers.
const REGFILE: u8 = 19;
const MEMORY: u8 = 20;
const MEMLEN: u8 = 21;
const FAULT: u8 = 22;
const JUMPTBL: u8 = 23;
const FLAGS: u8 = 24;

fn reg_disp(r: RegisterId) -> i32 {
    (r.index() as i32) * 8
}

fn translate(
    vm: &Vm,
    instrs: &[ScannedInstr],
) -> Result<(Vec<u8>, std::collections::HashMap<u64, usize>), VmError> {
    let mut buf = Vec::new();
    let mut map = std::collections::HashMap::new();
    let mut patches: Vec<(usize, PatchTarget, bool)> = Vec::new();

    stp_pre16(&mut buf, 19, 20);
    stp_pre16(&mut buf, 21, 22);
    stp_pre16(&mut buf, 23, 24);
    stp_pre16(&mut buf, 29, 30);
    mov_reg(&mut buf, REGFILE, 0);
    mov_reg(&mut buf, MEMORY, 1);
    mov_reg(&mut buf, MEMLEN, 2);
    mov_reg(&mut buf, FAULT, 3);
    mov_reg(&mut buf, JUMPTBL, 4);
    mov_reg(&mut buf, FLAGS, 5);

    for scanned in instrs {
        map.insert(scanned.offset, buf.len());
        let fallthrough = scanned.offset + scanned.width as u64;
        emit_one(vm, &mut buf, scanned, fallthrough, &mut patches);
    }

    let exit_offset = buf.len();
    ldp_post16(&mut buf, 29, 30);
    ldp_post16(&mut buf, 23, 24);
    ldp_post16(&mut buf, 21, 22);
    ldp_post16(&mut buf, 19, 20);
    movz32(&mut buf, 0, 0);
    ret(&mut buf);

    for (at, target, conditional) in patches {
        let resolved = match target {
            PatchTarget::Exit => exit_offset,
            PatchTarget::Guest(addr) => *map
                .get(&addr)
                .ok_or(VmError::InvalidJumpTarget { target: addr })?,
        };
        patch_branch(&mut buf, at, resolved, conditional);
    }

    Ok((buf, map))
}

fn emit_one(
    vm: &Vm,
    buf: &mut Vec<u8>,
    scanned: &ScannedInstr,
    fallthrough: u64,
    patches: &mut Vec<(usize, PatchTarget, bool)>,
) {
    use Instruction::*;

    match (scanned.instr.instr, scanned.instr.operands) {
        (Load, Operands::RegRegDisp(dst, src, disp)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(src));
            if disp != 0 {
                mov_imm64(buf, C, disp as i64 as u64);
                add_reg(buf, A, A, C);
            }
            mov_reg(buf, 3, A); // addr
            mov_reg(buf, 0, MEMORY);
            mov_reg(buf, 1, MEMLEN);
            mov_reg(buf, 2, FAULT);
            mov_imm64(buf, FN_PTR, jit::jit_mem_load as usize as u64);
            blr(buf, FN_PTR);
            test_fault_byte(buf, 1);
            let at = b_cond_placeholder(buf, COND_NE);
            patches.push((at, PatchTarget::Exit, true));
            str_imm(buf, 0, REGFILE, reg_disp(dst));
        }
        (Store, Operands::RegRegDisp(dst, src, disp)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(dst));
            if disp != 0 {
                mov_imm64(buf, C, disp as i64 as u64);
                add_reg(buf, A, A, C);
            }
            ldr_imm(buf, T0, REGFILE, reg_disp(src));
            mov_reg(buf, 3, A);
            mov_reg(buf, 4, T0);
            mov_reg(buf, 0, MEMORY);
            mov_reg(buf, 1, MEMLEN);
            mov_reg(buf, 2, FAULT);
            mov_imm64(buf, FN_PTR, jit::jit_mem_store as usize as u64);
            blr(buf, FN_PTR);
            test_fault_byte(buf, 0);
            let at = b_cond_placeholder(buf, COND_NE);
            patches.push((at, PatchTarget::Exit, true));
        }

        (Mov, Operands::RegReg(dst, src)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(src));
            str_imm(buf, A, REGFILE, reg_disp(dst));
        }
        (Mov, Operands::RegImm(dst, imm)) => {
            mov_imm64(buf, A, imm);
            str_imm(buf, A, REGFILE, reg_disp(dst));
        }

        (Add, Operands::RegReg(dst, src)) => alu_regreg(buf, add_reg, dst, src),
        (Add, Operands::RegImm(dst, imm)) => alu_regimm(buf, add_reg, dst, imm),
        (Sub, Operands::RegReg(dst, src)) => alu_regreg(buf, sub_reg, dst, src),
        (Sub, Operands::RegImm(dst, imm)) => alu_regimm(buf, sub_reg, dst, imm),
        (And, Operands::RegReg(dst, src)) => alu_regreg(buf, and_reg, dst, src),
        (And, Operands::RegImm(dst, imm)) => alu_regimm(buf, and_reg, dst, imm),
        (Or, Operands::RegReg(dst, src)) => alu_regreg(buf, orr_reg, dst, src),
        (Or, Operands::RegImm(dst, imm)) => alu_regimm(buf, orr_reg, dst, imm),
        (Xor, Operands::RegReg(dst, src)) => alu_regreg(buf, eor_reg, dst, src),
        (Xor, Operands::RegImm(dst, imm)) => alu_regimm(buf, eor_reg, dst, imm),

        (Not, Operands::Reg(reg)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(reg));
            mvn_reg(buf, A, A);
            str_imm(buf, A, REGFILE, reg_disp(reg));
        }

        (Cmp, Operands::RegReg(a, b)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(a));
            ldr_imm(buf, C, REGFILE, reg_disp(b));
            emit_cmp(buf);
        }
        (Cmp, Operands::RegImm(a, imm)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(a));
            mov_imm64(buf, C, imm);
            emit_cmp(buf);
        }

        (Push, Operands::Reg(reg)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));
            sub_imm12(buf, A, A, 8);
            stp_pre16(buf, A, 31); // spill new SP across the call (xzr pads to 16 bytes)
            ldr_imm(buf, T0, REGFILE, reg_disp(reg)); // value
            mov_reg(buf, 3, A); // addr, read before the call clobbers A
            mov_reg(buf, 4, T0);
            mov_reg(buf, 0, MEMORY);
            mov_reg(buf, 1, MEMLEN);
            mov_reg(buf, 2, FAULT);
            mov_imm64(buf, FN_PTR, jit::jit_mem_store as usize as u64);
            blr(buf, FN_PTR);
            test_fault_byte(buf, 0);
            ldp_post16(buf, A, SCRATCH_PAIR); // restore new SP; LDP does not touch flags
            let at = b_cond_placeholder(buf, COND_NE);
            patches.push((at, PatchTarget::Exit, true));
            str_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));
        }
        (Pop, Operands::Reg(reg)) => {
            ldr_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));
            mov_reg(buf, 3, A);
            mov_reg(buf, 0, MEMORY);
            mov_reg(buf, 1, MEMLEN);
            mov_reg(buf, 2, FAULT);
            mov_imm64(buf, FN_PTR, jit::jit_mem_load as usize as u64);
            blr(buf, FN_PTR);
            test_fault_byte(buf, 1);
            let at = b_cond_placeholder(buf, COND_NE);
            patches.push((at, PatchTarget::Exit, true));
            str_imm(buf, 0, REGFILE, reg_disp(reg));
            ldr_imm(buf, C, REGFILE, reg_disp(RegisterId::SP));
            add_imm12(buf, C, C, 8);
            str_imm(buf, C, REGFILE, reg_disp(RegisterId::SP));
        }

        (Call, Operands::Imm(target)) => emit_call(vm, buf, target, fallthrough, patches),
        (Ret, Operands::None) => emit_ret(vm, buf, patches),

        (Jmp, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, None),
        (JmpEq, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b001, COND_NE))),
        (JmpNe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b001, COND_EQ))),
        (JmpGt, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b100, COND_NE))),
        (JmpLt, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b010, COND_NE))),
        (JmpGe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b101, COND_NE))),
        (JmpLe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b011, COND_NE))),

        _ => unreachable!("decoder only emits operand shapes matching their instruction"),
    }
}

fn alu_regreg(buf: &mut Vec<u8>, op: fn(&mut Vec<u8>, u8, u8, u8), dst: RegisterId, src: RegisterId) {
    ldr_imm(buf, A, REGFILE, reg_disp(dst));
    ldr_imm(buf, C, REGFILE, reg_disp(src));
    op(buf, A, A, C);
    str_imm(buf, A, REGFILE, reg_disp(dst));
}

fn alu_regimm(buf: &mut Vec<u8>, op: fn(&mut Vec<u8>, u8, u8, u8), dst: RegisterId, imm: u64) {
    ldr_imm(buf, A, REGFILE, reg_disp(dst));
    mov_imm64(buf, C, imm);
    op(buf, A, A, C);
    str_imm(buf, A, REGFILE, reg_disp(dst));
}

/// `A - C`, three flag bits combined into `[FLAGS]` (`EQ | LT<<1 | GT<<2`).
fn emit_cmp(buf: &mut Vec<u8>) {
    cmp_reg(buf, A, C);
    cset(buf, T0, COND_EQ);
    cset(buf, T1, COND_LT);
    cset(buf, D, COND_GT);
    orr_reg_lsl(buf, T1, 31, T1, 1);
    orr_reg_lsl(buf, D, 31, D, 2);
    orr_reg(buf, T0, T0, T1);
    orr_reg(buf, T0, T0, D);
    strb_imm0(buf, T0, FLAGS);
}

fn emit_jump(
    buf: &mut Vec<u8>,
    patches: &mut Vec<(usize, PatchTarget, bool)>,
    vm: &Vm,
    target: u64,
    cond: Option<(u8, u8)>,
) {
    let dest = if target == vm.prologue.sys_enter {
        PatchTarget::Exit
    } else {
        PatchTarget::Guest(target)
    };
    match cond {
        None => {
            let at = b_placeholder(buf);
            patches.push((at, dest, false));
        }
        Some((mask, cc)) => {
            ldrb_imm0(buf, T0, FLAGS);
            movz32(buf, T1, mask as u16);
            tst_w(buf, T0, T1);
            let at = b_cond_placeholder(buf, cc);
            patches.push((at, dest, true));
        }
    }
}

fn emit_call(
    vm: &Vm,
    buf: &mut Vec<u8>,
    target: u64,
    fallthrough: u64,
    patches: &mut Vec<(usize, PatchTarget, bool)>,
) {
    if target == vm.prologue.sys_write {
        ldr_imm(buf, A, REGFILE, reg_disp(RegisterId::R1)); // ptr
        ldr_imm(buf, C, REGFILE, reg_disp(RegisterId::R0)); // len
        mov_reg(buf, 3, A);
        mov_reg(buf, 4, C);
        mov_reg(buf, 0, MEMORY);
        mov_reg(buf, 1, MEMLEN);
        mov_reg(buf, 2, FAULT);
        mov_imm64(buf, FN_PTR, jit::jit_sys_write as usize as u64);
        blr(buf, FN_PTR);
        test_fault_byte(buf, 0);
        let at = b_cond_placeholder(buf, COND_NE);
        patches.push((at, PatchTarget::Exit, true));
        return;
    }
    if target == vm.prologue.sys_print_u64 {
        ldr_imm(buf, 0, REGFILE, reg_disp(RegisterId::R0));
        mov_imm64(buf, FN_PTR, jit::jit_sys_print_u64 as usize as u64);
        blr(buf, FN_PTR);
        return;
    }

    ldr_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));
    sub_imm12(buf, A, A, 8);
    stp_pre16(buf, A, 31);
    mov_imm64(buf, T0, fallthrough);
    mov_reg(buf, 3, A);
    mov_reg(buf, 4, T0);
    mov_reg(buf, 0, MEMORY);
    mov_reg(buf, 1, MEMLEN);
    mov_reg(buf, 2, FAULT);
    mov_imm64(buf, FN_PTR, jit::jit_mem_store as usize as u64);
    blr(buf, FN_PTR);
    test_fault_byte(buf, 0);
    ldp_post16(buf, A, SCRATCH_PAIR);
    let at = b_cond_placeholder(buf, COND_NE);
    patches.push((at, PatchTarget::Exit, true));
    str_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));

    emit_jump(buf, patches, vm, target, None);
}

/// `RET`'s target is a runtime value popped off the guest stack, dispatched
/// through the jump table pinned in `x23` rather than patched like
/// `JMP`/`CALL`, except for the one target the jump table never covers:
/// `sys_enter`, which `Vm::new` pre-pushes as the top-level call frame's
/// return address and both back-ends treat as halt rather than a real
/// instruction offset.
fn emit_ret(vm: &Vm, buf: &mut Vec<u8>, patches: &mut Vec<(usize, PatchTarget, bool)>) {
    ldr_imm(buf, A, REGFILE, reg_disp(RegisterId::SP));
    mov_reg(buf, 3, A);
    mov_reg(buf, 0, MEMORY);
    mov_reg(buf, 1, MEMLEN);
    mov_reg(buf, 2, FAULT);
    mov_imm64(buf, FN_PTR, jit::jit_mem_load as usize as u64);
    blr(buf, FN_PTR);
    test_fault_byte(buf, 1);
    let at = b_cond_placeholder(buf, COND_NE);
    patches.push((at, PatchTarget::Exit, true));

    mov_reg(buf, RET_TARGET, 0);

    ldr_imm(buf, C, REGFILE, reg_disp(RegisterId::SP));
    add_imm12(buf, C, C, 8);
    str_imm(buf, C, REGFILE, reg_disp(RegisterId::SP));

    mov_imm64(buf, C, vm.prologue.sys_enter);
    cmp_reg(buf, RET_TARGET, C);
    let halt_at = b_cond_placeholder(buf, COND_EQ);
    patches.push((halt_at, PatchTarget::Exit, true));

    cmp_reg(buf, RET_TARGET, MEMLEN);
    let oob_at = b_cond_placeholder(buf, COND_HS);

    ldr_reg_lsl3(buf, A, JUMPTBL, RET_TARGET);
    mov_imm64(buf, C, u64::MAX);
    cmp_reg(buf, A, C);
    let invalid_at = b_cond_placeholder(buf, COND_EQ);
    br(buf, A);

    invalid_jump_trampoline(buf, oob_at, patches);
    invalid_jump_trampoline(buf, invalid_at, patches);
}

fn invalid_jump_trampoline(buf: &mut Vec<u8>, jcc_at: usize, patches: &mut Vec<(usize, PatchTarget, bool)>) {
    let here = buf.len();
    patch_branch(buf, jcc_at, here, true);
    mov_reg(buf, 1, RET_TARGET);
    mov_reg(buf, 0, FAULT);
    mov_imm64(buf, FN_PTR, jit::jit_invalid_jump as usize as u64);
    blr(buf, FN_PTR);
    let at = b_placeholder(buf);
    patches.push((at, PatchTarget::Exit, false));
}

#[cfg(all(test, target_arch = "aarch64"))]
mod test {
    use super::*;
    use crate::encoder;
    use crate::isa::RegisterId;
    use crate::vm::Prologue;

    fn prologue_at(sys_enter: u64) -> Prologue {
        Prologue {
            sys_enter,
            entry: 0,
            sys_write: u64::MAX,
            sys_print_u64: u64::MAX,
        }
    }

    #[test]
    fn mov_add_then_halt() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 5));
        image.extend(encoder::encode_reg_imm(Instruction::Add, RegisterId::R0, 37));
        let sys_enter = image.len() as u64;

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R0.index()], 42);
    }

    #[test]
    fn cmp_and_conditional_jump() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 3));
        image.extend(encoder::encode_reg_imm(Instruction::Cmp, RegisterId::R0, 3));
        let skip_target_slot = image.len();
        image.extend(encoder::encode_imm1(Instruction::JmpEq, 0));
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R1, 99));
        let sys_enter = image.len() as u64;
        encoder::patch_imm64(&mut image, skip_target_slot + 1, sys_enter);

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R1.index()], 0);
        assert!(exit.flags.eq);
    }

    #[test]
    fn push_pop_round_trips_through_stack() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0xabcd));
        image.extend(encoder::encode_reg1(Instruction::Push, RegisterId::R0));
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0));
        image.extend(encoder::encode_reg1(Instruction::Pop, RegisterId::R1));
        let sys_enter = image.len() as u64;

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R1.index()], 0xabcd);
    }

    #[test]
    fn memory_round_trip() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0x1000));
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R1, 0xDEADBEEF));
        image.extend(encoder::encode_reg_idx(Instruction::Store, RegisterId::R0, RegisterId::R1, 8));
        image.extend(encoder::encode_reg_idx(Instruction::Load, RegisterId::R2, RegisterId::R0, 8));
        let sys_enter = image.len() as u64;

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R2.index()], 0xDEADBEEF);
    }

    #[test]
    fn call_ret_leaves_callee_result_in_place() {
        let mut image = Vec::new();
        let call_slot = image.len();
        image.extend(encoder::encode_imm1(Instruction::Call, 0));
        let sys_enter = image.len() as u64;
        // Separates `sys_enter` from `f`'s code with a decodable (if
        // unreached — `CALL` redirects `PC` straight to `f`, it never falls
        // through) instruction, unlike the interpreter's equivalent test,
        // which can get away with a bare placeholder byte since it never
        // decodes past `sys_enter` once `PC` reaches it.
        image.extend(encoder::encode_reg0(Instruction::Ret));
        let f_addr = image.len() as u64;
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 7));
        image.extend(encoder::encode_reg0(Instruction::Ret));
        encoder::patch_imm64(&mut image, call_slot + 1, f_addr);

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R0.index()], 7);
    }

    #[test]
    fn out_of_range_load_faults() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0xFFFF_FFFF));
        image.extend(encoder::encode_reg_idx(Instruction::Load, RegisterId::R1, RegisterId::R0, 0));
        let sys_enter = image.len() as u64;

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        assert!(run(&mut vm).is_err());
    }
}
