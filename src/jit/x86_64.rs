//! x86-64 JIT back-end: hand-encoded SysV AMD64 machine code, one guest
//! instruction translated to a short run of host instructions in a single
//! linear pass, patched once the full translation map is known.
//!
//! Guest registers live in the `Vm::registers` array, addressed through a
//! pinned base pointer rather than mapped onto host registers one-to-one —
//! there are 16 guest registers and only six callee-saved host GPRs to pin
//! context in, so the register file stays memory-resident and every guest
//! instruction loads/stores through it, the same tradeoff `Storage` already
//! makes explicit for guest memory. Pinned for the life of a translated
//! function (SysV callee-saved, pushed in the prologue and popped in the
//! shared exit trampoline):
//!
//! * `r14` — `&mut [u64; 16]` guest register file
//! * `r15` — guest memory base pointer
//! * `r12` — guest memory length
//! * `r13` — `*mut FaultSlot`
//! * `rbp` — dynamic-jump table (`RET` targets aren't known until run time)
//! * `rbx` — `*mut u8` FLAGS byte (materialized in memory, not a register,
//!   per the asymmetry the portable interpreter doesn't have to make)
//!
//! `LOAD`/`STORE`/`PUSH`/`POP` and the two reserved syscalls are emitted as
//! calls into the helpers in [`super`] rather than inlined bounds checks —
//! the point of translating is dispatch overhead, not reimplementing
//! `Storage` in raw instructions.

use crate::error::VmError;
use crate::isa::{Instruction, RegisterId};
use crate::jit::{self, ExecPage, FaultSlot, PatchTarget, ScannedInstr};
use crate::memory::Storage;
use crate::vm::{Vm, VmExit};
use crate::{decoder::Operands, isa::AccessMode};

#[allow(dead_code)]
const _UNUSED: Option<AccessMode> = None; // silence unused-import if Operands-only match needs no AccessMode here

pub fn run(vm: &mut Vm) -> Result<VmExit, VmError> {
    if !cfg!(target_arch = "x86_64") {
        return Err(VmError::BackendMismatch { host: std::env::consts::ARCH });
    }

    let instrs = jit::scan(vm.memory.data(), vm.prologue.entry, vm.image_len)?;
    let (code, translation_map) = translate(vm, &instrs)?;

    let mut page = ExecPage::new(code.len().max(1))?;
    page.as_mut_slice()[..code.len()].copy_from_slice(&code);
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

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum R {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl R {
    fn b(self) -> u8 {
        self as u8
    }
    fn low3(self) -> u8 {
        self.b() & 7
    }
    fn ext(self) -> bool {
        self.b() >= 8
    }
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8)
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Encodes a `[base + disp]` memory operand, handling the two ModRM/SIB
/// corner cases: `RSP`/`R12` as base always needs a SIB byte (low 3 bits
/// `100` mean "SIB follows", not "use RSP"), and `RBP`/`R13` as base with
/// `disp == 0` would otherwise be read as RIP-relative / no-base addressing
/// (low 3 bits `101` with `mod == 00`), so it is forced to `mod == 01` with
/// an explicit zero `disp8`.
fn mem_operand(buf: &mut Vec<u8>, reg_field: u8, base: R, disp: i32) {
    let base_low = base.low3();
    let need_sib = base_low == 0b100;
    let force_disp8 = base_low == 0b101 && disp == 0;
    let (md, disp_bytes): (u8, Vec<u8>) = if disp == 0 && !force_disp8 {
        (0b00, vec![])
    } else if let Ok(d8) = i8::try_from(disp) {
        (0b01, vec![d8 as u8])
    } else {
        (0b10, disp.to_le_bytes().to_vec())
    };
    if need_sib {
        buf.push(modrm(md, reg_field, 0b100));
        buf.push(0x24); // scale=00 index=none(100) base=RSP/R12(100)
    } else {
        buf.push(modrm(md, reg_field, base_low));
    }
    buf.extend(disp_bytes);
}

/// `[base + index*scale]`, used only for the dynamic jump-table lookup.
fn mem_index_operand(buf: &mut Vec<u8>, reg_field: u8, base: R, index: R, scale: u8, disp: i32) {
    let base_low = base.low3();
    let scale_bits = match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!(),
    };
    let force_disp8 = base_low == 0b101 && disp == 0;
    let (md, disp_bytes): (u8, Vec<u8>) = if disp == 0 && !force_disp8 {
        (0b00, vec![])
    } else if let Ok(d8) = i8::try_from(disp) {
        (0b01, vec![d8 as u8])
    } else {
        (0b10, disp.to_le_bytes().to_vec())
    };
    buf.push(modrm(md, reg_field, 0b100));
    buf.push((scale_bits << 6) | (index.low3() << 3) | base_low);
    buf.extend(disp_bytes);
}

fn push64(buf: &mut Vec<u8>, r: R) {
    if r.ext() {
        buf.push(0x41);
    }
    buf.push(0x50 + r.low3());
}

fn pop64(buf: &mut Vec<u8>, r: R) {
    if r.ext() {
        buf.push(0x41);
    }
    buf.push(0x58 + r.low3());
}

fn mov_rr(buf: &mut Vec<u8>, dst: R, src: R) {
    buf.push(rex(true, src.ext(), false, dst.ext()));
    buf.push(0x89);
    buf.push(modrm(0b11, src.b(), dst.b()));
}

fn mov_r_imm64(buf: &mut Vec<u8>, dst: R, imm: u64) {
    buf.push(rex(true, false, false, dst.ext()));
    buf.push(0xB8 + dst.low3());
    buf.extend_from_slice(&imm.to_le_bytes());
}

fn load_mem(buf: &mut Vec<u8>, dst: R, base: R, disp: i32) {
    buf.push(rex(true, dst.ext(), false, base.ext()));
    buf.push(0x8B);
    mem_operand(buf, dst.b(), base, disp);
}

fn store_mem(buf: &mut Vec<u8>, base: R, disp: i32, src: R) {
    buf.push(rex(true, src.ext(), false, base.ext()));
    buf.push(0x89);
    mem_operand(buf, src.b(), base, disp);
}

fn store_mem8(buf: &mut Vec<u8>, base: R, disp: i32, src: R) {
    buf.push(rex(false, src.ext(), false, base.ext()));
    buf.push(0x88);
    mem_operand(buf, src.b(), base, disp);
}

fn load_mem8_zx(buf: &mut Vec<u8>, dst: R, base: R, disp: i32) {
    buf.push(rex(true, dst.ext(), false, base.ext()));
    buf.push(0x0F);
    buf.push(0xB6);
    mem_operand(buf, dst.b(), base, disp);
}

fn alu_rr(buf: &mut Vec<u8>, op: u8, dst: R, src: R) {
    buf.push(rex(true, src.ext(), false, dst.ext()));
    buf.push(op);
    buf.push(modrm(0b11, src.b(), dst.b()));
}

fn alu_r_imm32(buf: &mut Vec<u8>, ext: u8, dst: R, imm: i32) {
    buf.push(rex(true, false, false, dst.ext()));
    buf.push(0x81);
    buf.push(modrm(0b11, ext, dst.b()));
    buf.extend_from_slice(&imm.to_le_bytes());
}

fn not_r(buf: &mut Vec<u8>, dst: R) {
    buf.push(rex(true, false, false, dst.ext()));
    buf.push(0xF7);
    buf.push(modrm(0b11, 2, dst.b()));
}

fn setcc(buf: &mut Vec<u8>, cc: u8, dst: R) {
    if dst.ext() {
        buf.push(0x41);
    }
    buf.push(0x0F);
    buf.push(0x90 | cc);
    buf.push(modrm(0b11, 0, dst.low3()));
}

fn movzx_r8(buf: &mut Vec<u8>, dst: R, src: R) {
    buf.push(rex(true, dst.ext(), false, src.ext()));
    buf.push(0x0F);
    buf.push(0xB6);
    buf.push(modrm(0b11, dst.b(), src.b()));
}

fn shl_imm8(buf: &mut Vec<u8>, dst: R, imm: u8) {
    buf.push(rex(true, false, false, dst.ext()));
    buf.push(0xC1);
    buf.push(modrm(0b11, 4, dst.b()));
    buf.push(imm);
}

fn test_r8_imm8(buf: &mut Vec<u8>, r: R, imm: u8) {
    if r.ext() {
        buf.push(0x41);
    }
    buf.push(0xF6);
    buf.push(modrm(0b11, 0, r.low3()));
    buf.push(imm);
}

fn test_r8_self(buf: &mut Vec<u8>, r: R) {
    if r.ext() {
        buf.push(0x45);
    }
    buf.push(0x84);
    buf.push(modrm(0b11, r.b(), r.b()));
}

fn call_r(buf: &mut Vec<u8>, r: R) {
    if r.ext() {
        buf.push(0x41);
    }
    buf.push(0xFF);
    buf.push(modrm(0b11, 2, r.b()));
}

fn jmp_r(buf: &mut Vec<u8>, r: R) {
    if r.ext() {
        buf.push(0x41);
    }
    buf.push(0xFF);
    buf.push(modrm(0b11, 4, r.b()));
}

fn jmp_rel32(buf: &mut Vec<u8>) -> usize {
    buf.push(0xE9);
    let at = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    at
}

fn jcc_rel32(buf: &mut Vec<u8>, cc: u8) -> usize {
    buf.push(0x0F);
    buf.push(0x80 | cc);
    let at = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    at
}

fn patch_rel32(buf: &mut [u8], at: usize, target: usize) {
    let rel = target as i64 - (at as i64 + 4);
    buf[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
}

const JNZ: u8 = 0x5;
const JZ: u8 = 0x4;
const JAE: u8 = 0x3;

const CC_EQ: u8 = 0x4;
const CC_LT: u8 = 0xC;
const CC_GT: u8 = 0xF;

fn reg_disp(r: RegisterId) -> i32 {
    (r.index() as i32) * 8
}

fn translate(
    vm: &Vm,
    instrs: &[ScannedInstr],
) -> Result<(Vec<u8>, std::collections::HashMap<u64, usize>), VmError> {
    let mut buf = Vec::new();
    let mut map = std::collections::HashMap::new();
    let mut patches: Vec<(usize, PatchTarget)> = Vec::new();

    // Prologue: pin callee-saved context registers.
    for r in [R::Rbx, R::Rbp, R::R12, R::R13, R::R14, R::R15] {
        push64(&mut buf, r);
    }
    mov_rr(&mut buf, R::R14, R::Rdi);
    mov_rr(&mut buf, R::R15, R::Rsi);
    mov_rr(&mut buf, R::R12, R::Rdx);
    mov_rr(&mut buf, R::R13, R::Rcx);
    mov_rr(&mut buf, R::Rbp, R::R8);
    mov_rr(&mut buf, R::Rbx, R::R9);

    for scanned in instrs {
        map.insert(scanned.offset, buf.len());
        let fallthrough = scanned.offset + scanned.width as u64;
        emit_one(vm, &mut buf, scanned, fallthrough, &mut patches);
    }

    let exit_offset = buf.len();
    for r in [R::R15, R::R14, R::R13, R::R12, R::Rbp, R::Rbx] {
        pop64(&mut buf, r);
    }
    buf.push(0xC3); // ret

    for (at, target) in patches {
        let resolved = match target {
            PatchTarget::Exit => exit_offset,
            PatchTarget::Guest(addr) => *map
                .get(&addr)
                .ok_or(VmError::InvalidJumpTarget { target: addr })?,
        };
        patch_rel32(&mut buf, at, resolved);
    }

    Ok((buf, map))
}

fn emit_one(
    vm: &Vm,
    buf: &mut Vec<u8>,
    scanned: &ScannedInstr,
    fallthrough: u64,
    patches: &mut Vec<(usize, PatchTarget)>,
) {
    use Instruction::*;

    match (scanned.instr.instr, scanned.instr.operands) {
        (Load, Operands::RegRegDisp(dst, src, disp)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(src));
            if disp != 0 {
                alu_r_imm32(buf, 0, R::Rax, disp as i32);
            }
            mov_rr(buf, R::Rcx, R::Rax);
            mov_rr(buf, R::Rdi, R::R15);
            mov_rr(buf, R::Rsi, R::R12);
            mov_rr(buf, R::Rdx, R::R13);
            mov_r_imm64(buf, R::R10, jit::jit_mem_load as usize as u64);
            call_r(buf, R::R10);
            test_r8_self(buf, R::Rdx);
            let at = jcc_rel32(buf, JNZ);
            patches.push((at, PatchTarget::Exit));
            store_mem(buf, R::R14, reg_disp(dst), R::Rax);
        }
        (Store, Operands::RegRegDisp(dst, src, disp)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(dst));
            if disp != 0 {
                alu_r_imm32(buf, 0, R::Rax, disp as i32);
            }
            load_mem(buf, R::R8, R::R14, reg_disp(src));
            mov_rr(buf, R::Rcx, R::Rax);
            mov_rr(buf, R::Rdi, R::R15);
            mov_rr(buf, R::Rsi, R::R12);
            mov_rr(buf, R::Rdx, R::R13);
            mov_r_imm64(buf, R::R10, jit::jit_mem_store as usize as u64);
            call_r(buf, R::R10);
            test_r8_self(buf, R::Rax);
            let at = jcc_rel32(buf, JNZ);
            patches.push((at, PatchTarget::Exit));
        }

        (Mov, Operands::RegReg(dst, src)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(src));
            store_mem(buf, R::R14, reg_disp(dst), R::Rax);
        }
        (Mov, Operands::RegImm(dst, imm)) => {
            mov_r_imm64(buf, R::Rax, imm);
            store_mem(buf, R::R14, reg_disp(dst), R::Rax);
        }

        (Add, Operands::RegReg(dst, src)) => alu_regreg(buf, 0x01, dst, src),
        (Add, Operands::RegImm(dst, imm)) => alu_regimm(buf, 0x01, dst, imm),
        (Sub, Operands::RegReg(dst, src)) => alu_regreg(buf, 0x29, dst, src),
        (Sub, Operands::RegImm(dst, imm)) => alu_regimm(buf, 0x29, dst, imm),
        (And, Operands::RegReg(dst, src)) => alu_regreg(buf, 0x21, dst, src),
        (And, Operands::RegImm(dst, imm)) => alu_regimm(buf, 0x21, dst, imm),
        (Or, Operands::RegReg(dst, src)) => alu_regreg(buf, 0x09, dst, src),
        (Or, Operands::RegImm(dst, imm)) => alu_regimm(buf, 0x09, dst, imm),
        (Xor, Operands::RegReg(dst, src)) => alu_regreg(buf, 0x31, dst, src),
        (Xor, Operands::RegImm(dst, imm)) => alu_regimm(buf, 0x31, dst, imm),

        (Not, Operands::Reg(reg)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(reg));
            not_r(buf, R::Rax);
            store_mem(buf, R::R14, reg_disp(reg), R::Rax);
        }

        (Cmp, Operands::RegReg(a, b)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(a));
            load_mem(buf, R::Rcx, R::R14, reg_disp(b));
            emit_cmp(buf);
        }
        (Cmp, Operands::RegImm(a, imm)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(a));
            mov_r_imm64(buf, R::Rcx, imm);
            emit_cmp(buf);
        }

        (Push, Operands::Reg(reg)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(RegisterId::SP));
            alu_r_imm32(buf, 5, R::Rax, 8); // sub rax, 8
            push64(buf, R::Rax); // spill new SP across the call
            load_mem(buf, R::R8, R::R14, reg_disp(reg)); // value
            load_mem(buf, R::Rcx, R::Rsp, 0); // addr = peek new SP
            mov_rr(buf, R::Rdi, R::R15);
            mov_rr(buf, R::Rsi, R::R12);
            mov_rr(buf, R::Rdx, R::R13);
            mov_r_imm64(buf, R::R10, jit::jit_mem_store as usize as u64);
            call_r(buf, R::R10);
            test_r8_self(buf, R::Rax);
            pop64(buf, R::Rax); // rax = new SP, flags from the test untouched by pop
            let at = jcc_rel32(buf, JNZ);
            patches.push((at, PatchTarget::Exit));
            store_mem(buf, R::R14, reg_disp(RegisterId::SP), R::Rax);
        }
        (Pop, Operands::Reg(reg)) => {
            load_mem(buf, R::Rax, R::R14, reg_disp(RegisterId::SP));
            mov_rr(buf, R::Rcx, R::Rax);
            mov_rr(buf, R::Rdi, R::R15);
            mov_rr(buf, R::Rsi, R::R12);
            mov_rr(buf, R::Rdx, R::R13);
            mov_r_imm64(buf, R::R10, jit::jit_mem_load as usize as u64);
            call_r(buf, R::R10);
            test_r8_self(buf, R::Rdx);
            let at = jcc_rel32(buf, JNZ);
            patches.push((at, PatchTarget::Exit));
            store_mem(buf, R::R14, reg_disp(reg), R::Rax);
            load_mem(buf, R::Rcx, R::R14, reg_disp(RegisterId::SP));
            alu_r_imm32(buf, 0, R::Rcx, 8); // add rcx, 8
            store_mem(buf, R::R14, reg_disp(RegisterId::SP), R::Rcx);
        }

        (Call, Operands::Imm(target)) => emit_call(vm, buf, target, fallthrough, patches),
        (Ret, Operands::None) => emit_ret(vm, buf, patches),

        (Jmp, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, None),
        (JmpEq, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b001, JNZ))),
        (JmpNe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b001, JZ))),
        (JmpGt, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b100, JNZ))),
        (JmpLt, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b010, JNZ))),
        (JmpGe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b101, JNZ))),
        (JmpLe, Operands::Imm(target)) => emit_jump(buf, patches, vm, target, Some((0b011, JNZ))),

        _ => unreachable!("decoder only emits operand shapes matching their instruction"),
    }
}

fn alu_regreg(buf: &mut Vec<u8>, op: u8, dst: RegisterId, src: RegisterId) {
    load_mem(buf, R::Rax, R::R14, reg_disp(dst));
    load_mem(buf, R::Rcx, R::R14, reg_disp(src));
    alu_rr(buf, op, R::Rax, R::Rcx);
    store_mem(buf, R::R14, reg_disp(dst), R::Rax);
}

fn alu_regimm(buf: &mut Vec<u8>, op: u8, dst: RegisterId, imm: u64) {
    load_mem(buf, R::Rax, R::R14, reg_disp(dst));
    mov_r_imm64(buf, R::Rcx, imm);
    alu_rr(buf, op, R::Rax, R::Rcx);
    store_mem(buf, R::R14, reg_disp(dst), R::Rax);
}

/// `rax - rcx`, three flag bits combined into `[rbx]` (EQ | LT<<1 | GT<<2).
fn emit_cmp(buf: &mut Vec<u8>) {
    alu_rr(buf, 0x39, R::Rax, R::Rcx); // cmp rax, rcx
    setcc(buf, CC_EQ, R::R8);
    movzx_r8(buf, R::R8, R::R8);
    setcc(buf, CC_LT, R::R9);
    movzx_r8(buf, R::R9, R::R9);
    shl_imm8(buf, R::R9, 1);
    setcc(buf, CC_GT, R::R10);
    movzx_r8(buf, R::R10, R::R10);
    shl_imm8(buf, R::R10, 2);
    mov_rr(buf, R::R11, R::R8);
    alu_rr(buf, 0x09, R::R11, R::R9);
    alu_rr(buf, 0x09, R::R11, R::R10);
    store_mem8(buf, R::Rbx, 0, R::R11);
}

fn emit_jump(
    buf: &mut Vec<u8>,
    patches: &mut Vec<(usize, PatchTarget)>,
    vm: &Vm,
    target: u64,
    cond: Option<(u8, u8)>,
) {
    let dest = if target == vm.prologue.sys_enter {
        PatchTarget::Exit
    } else {
        PatchTarget::Guest(target)
    };
    let at = match cond {
        None => jmp_rel32(buf),
        Some((mask, cc)) => {
            load_mem8_zx(buf, R::R8, R::Rbx, 0);
            test_r8_imm8(buf, R::R8, mask);
            jcc_rel32(buf, cc)
        }
    };
    patches.push((at, dest));
}

fn emit_call(
    vm: &Vm,
    buf: &mut Vec<u8>,
    target: u64,
    fallthrough: u64,
    patches: &mut Vec<(usize, PatchTarget)>,
) {
    if target == vm.prologue.sys_write {
        load_mem(buf, R::Rcx, R::R14, reg_disp(RegisterId::R1)); // ptr
        load_mem(buf, R::R8, R::R14, reg_disp(RegisterId::R0)); // len
        mov_rr(buf, R::Rdi, R::R15);
        mov_rr(buf, R::Rsi, R::R12);
        mov_rr(buf, R::Rdx, R::R13);
        mov_r_imm64(buf, R::R10, jit::jit_sys_write as usize as u64);
        call_r(buf, R::R10);
        test_r8_self(buf, R::Rax);
        let at = jcc_rel32(buf, JNZ);
        patches.push((at, PatchTarget::Exit));
        return;
    }
    if target == vm.prologue.sys_print_u64 {
        load_mem(buf, R::Rdi, R::R14, reg_disp(RegisterId::R0));
        mov_r_imm64(buf, R::R10, jit::jit_sys_print_u64 as usize as u64);
        call_r(buf, R::R10);
        return;
    }

    load_mem(buf, R::Rax, R::R14, reg_disp(RegisterId::SP));
    alu_r_imm32(buf, 5, R::Rax, 8);
    push64(buf, R::Rax);
    mov_r_imm64(buf, R::R8, fallthrough);
    load_mem(buf, R::Rcx, R::Rsp, 0);
    mov_rr(buf, R::Rdi, R::R15);
    mov_rr(buf, R::Rsi, R::R12);
    mov_rr(buf, R::Rdx, R::R13);
    mov_r_imm64(buf, R::R10, jit::jit_mem_store as usize as u64);
    call_r(buf, R::R10);
    test_r8_self(buf, R::Rax);
    pop64(buf, R::Rax);
    let at = jcc_rel32(buf, JNZ);
    patches.push((at, PatchTarget::Exit));
    store_mem(buf, R::R14, reg_disp(RegisterId::SP), R::Rax);

    emit_jump(buf, patches, vm, target, None);
}

/// `RET`'s target is a runtime value popped off the guest stack, so unlike
/// `JMP`/`CALL` it cannot be patched against the static translation map —
/// it dispatches through the jump table pinned in `rbp` instead, except for
/// the one target the jump table never covers: `sys_enter`, which `Vm::new`
/// pre-pushes as the top-level call frame's return address and both back-ends
/// treat as halt rather than a real instruction offset.
fn emit_ret(vm: &Vm, buf: &mut Vec<u8>, patches: &mut Vec<(usize, PatchTarget)>) {
    load_mem(buf, R::Rax, R::R14, reg_disp(RegisterId::SP));
    mov_rr(buf, R::Rcx, R::Rax);
    mov_rr(buf, R::Rdi, R::R15);
    mov_rr(buf, R::Rsi, R::R12);
    mov_rr(buf, R::Rdx, R::R13);
    mov_r_imm64(buf, R::R10, jit::jit_mem_load as usize as u64);
    call_r(buf, R::R10);
    test_r8_self(buf, R::Rdx);
    let at = jcc_rel32(buf, JNZ);
    patches.push((at, PatchTarget::Exit));

    let target = R::R9; // survives: no further calls before it's consumed
    mov_rr(buf, target, R::Rax);

    load_mem(buf, R::Rcx, R::R14, reg_disp(RegisterId::SP));
    alu_r_imm32(buf, 0, R::Rcx, 8);
    store_mem(buf, R::R14, reg_disp(RegisterId::SP), R::Rcx);

    mov_r_imm64(buf, R::R11, vm.prologue.sys_enter);
    alu_rr(buf, 0x39, target, R::R11); // cmp target, r11
    let halt_at = jcc_rel32(buf, JZ);
    patches.push((halt_at, PatchTarget::Exit));

    // Bounds-check against the pinned memory length before indexing the
    // jump table — an out-of-range index would read past the `Vec` Rust
    // allocated it in.
    alu_rr(buf, 0x39, target, R::R12); // cmp target, r12
    let oob_at = jcc_rel32(buf, JAE);

    mem_index_operand_load(buf, R::Rax, R::Rbp, target, 8, 0); // rax = jump_table[target]
    mov_r_imm64(buf, R::R11, u64::MAX);
    alu_rr(buf, 0x39, R::Rax, R::R11); // cmp rax, -1
    let invalid_at = jcc_rel32(buf, JZ);
    jmp_r(buf, R::Rax);

    patch_rel32_later(buf, oob_at, patches, target);
    patch_rel32_later(buf, invalid_at, patches, target);
}

fn mem_index_operand_load(buf: &mut Vec<u8>, dst: R, base: R, index: R, scale: u8, disp: i32) {
    buf.push(rex(true, dst.ext(), index.ext(), base.ext()));
    buf.push(0x8B);
    mem_index_operand(buf, dst.b(), base, index, scale, disp);
}

/// Both the out-of-range and the "not a decoded instruction boundary"
/// paths land here: record the fault via [`jit::jit_invalid_jump`] and
/// unwind through the shared exit trampoline.
fn patch_rel32_later(buf: &mut Vec<u8>, jcc_at: usize, patches: &mut Vec<(usize, PatchTarget)>, target: R) {
    let here = buf.len();
    patch_rel32(buf, jcc_at, here);
    mov_rr(buf, R::Rsi, target);
    mov_rr(buf, R::Rdi, R::R13);
    mov_r_imm64(buf, R::R10, jit::jit_invalid_jump as usize as u64);
    call_r(buf, R::R10);
    let at = jmp_rel32(buf);
    patches.push((at, PatchTarget::Exit));
}

/// Back-end equivalence (spec.md §8): every scenario here also appears in
/// `interpreter::test`, hand-encoded identically, and is asserted to leave
/// the same registers/flags — run only on x86-64 hosts, where this back-end
/// can actually execute.
#[cfg(all(test, target_arch = "x86_64"))]
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
