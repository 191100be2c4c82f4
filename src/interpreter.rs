//! Portable dispatch-loop execution backend. Semantics here are the
//! reference: the JIT back-ends must produce identical observable state
//! for the same program.

use std::io::Write;

use crate::decoder::{self, Operands};
use crate::error::VmError;
use crate::isa::{Instruction, RegisterId};
use crate::memory::Storage;
use crate::vm::{Vm, VmExit};

/// Runs `vm` to completion on the interpreter backend.
pub fn run(vm: &mut Vm) -> Result<VmExit, VmError> {
    loop {
        if vm.pc == vm.prologue.sys_enter {
            return Ok(vm.exit());
        }

        let (decoded, width) = decoder::decode(vm.memory.data(), vm.pc as usize)?;
        let next_pc = vm.pc + width as u64;
        vm.pc = next_pc;

        step(vm, decoded.instr, decoded.operands, next_pc)?;
    }
}

fn step(vm: &mut Vm, instr: Instruction, operands: Operands, fallthrough_pc: u64) -> Result<(), VmError> {
    use Instruction::*;

    match (instr, operands) {
        (Load, Operands::RegRegDisp(dst, src, disp)) => {
            let addr = displace(vm.reg(src), disp);
            let value = vm.memory.read_u64(addr)?;
            vm.set_reg(dst, value);
        }
        (Store, Operands::RegRegDisp(dst, src, disp)) => {
            let addr = displace(vm.reg(dst), disp);
            vm.memory.write_u64(addr, vm.reg(src))?;
        }

        (Mov, Operands::RegReg(dst, src)) => vm.set_reg(dst, vm.reg(src)),
        (Mov, Operands::RegImm(dst, imm)) => vm.set_reg(dst, imm),

        (Add, Operands::RegReg(dst, src)) => {
            vm.set_reg(dst, vm.reg(dst).wrapping_add(vm.reg(src)))
        }
        (Add, Operands::RegImm(dst, imm)) => vm.set_reg(dst, vm.reg(dst).wrapping_add(imm)),

        (Sub, Operands::RegReg(dst, src)) => {
            vm.set_reg(dst, vm.reg(dst).wrapping_sub(vm.reg(src)))
        }
        (Sub, Operands::RegImm(dst, imm)) => vm.set_reg(dst, vm.reg(dst).wrapping_sub(imm)),

        (And, Operands::RegReg(dst, src)) => vm.set_reg(dst, vm.reg(dst) & vm.reg(src)),
        (And, Operands::RegImm(dst, imm)) => vm.set_reg(dst, vm.reg(dst) & imm),

        (Or, Operands::RegReg(dst, src)) => vm.set_reg(dst, vm.reg(dst) | vm.reg(src)),
        (Or, Operands::RegImm(dst, imm)) => vm.set_reg(dst, vm.reg(dst) | imm),

        (Xor, Operands::RegReg(dst, src)) => vm.set_reg(dst, vm.reg(dst) ^ vm.reg(src)),
        (Xor, Operands::RegImm(dst, imm)) => vm.set_reg(dst, vm.reg(dst) ^ imm),

        (Not, Operands::Reg(reg)) => vm.set_reg(reg, !vm.reg(reg)),

        (Cmp, Operands::RegReg(a, b)) => {
            vm.flags.set_from_cmp(vm.reg(a) as i64, vm.reg(b) as i64)
        }
        (Cmp, Operands::RegImm(a, imm)) => {
            vm.flags.set_from_cmp(vm.reg(a) as i64, imm as i64)
        }

        (Push, Operands::Reg(reg)) => {
            let sp = vm.reg(RegisterId::SP).wrapping_sub(crate::constants::CELL_BYTES);
            vm.memory.write_u64(sp, vm.reg(reg))?;
            vm.set_reg(RegisterId::SP, sp);
        }
        (Pop, Operands::Reg(reg)) => {
            let sp = vm.reg(RegisterId::SP);
            let value = vm.memory.read_u64(sp)?;
            vm.set_reg(reg, value);
            vm.set_reg(RegisterId::SP, sp.wrapping_add(crate::constants::CELL_BYTES));
        }

        (Call, Operands::Imm(target)) => {
            if let Some(result) = dispatch_syscall(vm, target)? {
                return Ok(result);
            }
            let sp = vm.reg(RegisterId::SP).wrapping_sub(crate::constants::CELL_BYTES);
            vm.memory.write_u64(sp, fallthrough_pc)?;
            vm.set_reg(RegisterId::SP, sp);
            vm.pc = target;
        }
        (Ret, Operands::None) => {
            let sp = vm.reg(RegisterId::SP);
            let target = vm.memory.read_u64(sp)?;
            vm.set_reg(RegisterId::SP, sp.wrapping_add(crate::constants::CELL_BYTES));
            vm.pc = target;
        }

        (Jmp, Operands::Imm(target)) => vm.pc = target,
        (JmpEq, Operands::Imm(target)) if vm.flags.eq => vm.pc = target,
        (JmpNe, Operands::Imm(target)) if !vm.flags.eq => vm.pc = target,
        (JmpGt, Operands::Imm(target)) if vm.flags.gt => vm.pc = target,
        (JmpLt, Operands::Imm(target)) if vm.flags.lt => vm.pc = target,
        (JmpGe, Operands::Imm(target)) if vm.flags.gt || vm.flags.eq => vm.pc = target,
        (JmpLe, Operands::Imm(target)) if vm.flags.lt || vm.flags.eq => vm.pc = target,
        (JmpEq, Operands::Imm(_))
        | (JmpNe, Operands::Imm(_))
        | (JmpGt, Operands::Imm(_))
        | (JmpLt, Operands::Imm(_))
        | (JmpGe, Operands::Imm(_))
        | (JmpLe, Operands::Imm(_)) => {} // condition not met, fall through

        _ => unreachable!("decoder only emits operand shapes matching their instruction"),
    }

    Ok(())
}

fn displace(base: u64, disp: i16) -> u64 {
    base.wrapping_add(disp as i64 as u64)
}

/// Intercepts `CALL`s to the reserved prologue syscall labels before
/// ordinary call dispatch. Returns `Some(exit)` only for the case where the
/// syscall itself ends execution (none currently do; kept as an extension
/// point for the two traps below, which always resume after servicing).
fn dispatch_syscall(vm: &mut Vm, target: u64) -> Result<Option<VmExit>, VmError> {
    if target == vm.prologue.sys_write {
        let len = vm.reg(RegisterId::R0);
        let ptr = vm.reg(RegisterId::R1);
        let bytes = vm.memory.borrow_slice(ptr, len)?;
        std::io::stdout().write_all(bytes).ok();
        return_from_syscall(vm)?;
        Ok(None)
    } else if target == vm.prologue.sys_print_u64 {
        let value = vm.reg(RegisterId::R0);
        println!("{}", value as i64);
        return_from_syscall(vm)?;
        Ok(None)
    } else {
        Ok(None)
    }
}

/// Both reserved syscalls behave like an ordinary `CALL`/`RET` pair: the
/// caller's `CALL` already advanced `PC` past itself before we got here, so
/// servicing the trap in place and leaving `PC` untouched resumes execution
/// at the instruction following the `CALL`.
fn return_from_syscall(_vm: &mut Vm) -> Result<(), VmError> {
    Ok(())
}

#[cfg(test)]
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
        image.extend(encoder::encode_reg0(Instruction::Jmp));

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
    }

    #[test]
    fn push_pop_round_trips_through_stack() {
        let mut image = Vec::new();
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0xabcd));
        image.extend(encoder::encode_reg1(Instruction::Push, RegisterId::R0));
        image.extend(encoder::encode_reg_imm(Instruction::Mov, RegisterId::R0, 0));
        image.extend(encoder::encode_reg1(Instruction::Pop, RegisterId::R1));
        let sys_enter = image.len() as u64;
        image.extend(encoder::encode_reg0(Instruction::Jmp));

        let mut vm = Vm::new(&image, 1, prologue_at(sys_enter));
        let exit = run(&mut vm).unwrap();
        assert_eq!(exit.registers[RegisterId::R1.index()], 0xabcd);
    }
}
