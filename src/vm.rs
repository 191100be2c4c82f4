//! Owns VM state — registers, stack pointer, program counter and flags —
//! and dispatches execution to the interpreter or a native JIT backend.

use crate::constants;
use crate::error::VmError;
use crate::interpreter;
use crate::jit;
use crate::memory::{Memory, Storage};

/// Condition-code register. `CMP` sets exactly one of these; the
/// conditional jumps read them. `JMPGE` is `GT || EQ`, `JMPLE` is
/// `LT || EQ`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Flags {
    pub eq: bool,
    pub lt: bool,
    pub gt: bool,
}

impl Flags {
    pub fn set_from_cmp(&mut self, a: i64, b: i64) {
        self.eq = a == b;
        self.lt = a < b;
        self.gt = a > b;
    }
}

/// Which engine executes the assembled image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecutionBackend {
    Interpreter,
    Aarch64Jit,
    X86_64Jit,
}

/// Outcome of a completed run: the register file and flags at the moment
/// `PC` reached the `sys_enter` trampoline.
#[derive(Clone, Debug)]
pub struct VmExit {
    pub registers: [u64; constants::REGISTER_COUNT],
    pub flags: Flags,
}

/// Offsets of the assembler's bootstrap prologue labels within the image,
/// resolved once at assembly time and threaded through to the VM so the
/// interpreter/JIT can recognize the halt offset, the entry point and the
/// reserved syscall trampolines without re-parsing labels at run time.
///
/// The prologue is a single `jmp $sys_enter` assembled at offset 0, before
/// any user code; user code itself starts at `entry`. `PC` never actually
/// executes the trampoline — `RET`ing from the top-level call frame lands on
/// `sys_enter`, which both backends treat as "halt" rather than translating
/// or stepping into it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Prologue {
    pub sys_enter: u64,
    pub entry: u64,
    pub sys_write: u64,
    pub sys_print_u64: u64,
}

impl Prologue {
    /// The prologue layout every `rasm`-assembled image uses, fixed by
    /// construction. Lets the VM CLI run a bare hex file straight off disk,
    /// with no label table or assembler pass required.
    pub fn standard() -> Prologue {
        Prologue {
            sys_enter: constants::PROLOGUE_SYS_ENTER_OFFSET,
            entry: constants::PROLOGUE_ENTRY_OFFSET,
            sys_write: constants::PROLOGUE_SYS_WRITE_OFFSET,
            sys_print_u64: constants::PROLOGUE_SYS_PRINT_U64_OFFSET,
        }
    }
}

/// Register-based virtual machine: a flat register file, a byte-addressable
/// [`Memory`], and the `PC`/`FLAGS` the ISA does not expose as operands.
pub struct Vm {
    pub registers: [u64; constants::REGISTER_COUNT],
    pub pc: u64,
    pub flags: Flags,
    pub memory: Memory,
    pub prologue: Prologue,
    /// Length in bytes of the assembled instruction stream (prologue
    /// included). The JIT back-ends decode this single span once, up front;
    /// the interpreter has no use for it since it decodes lazily from `PC`.
    pub image_len: u64,
}

impl Vm {
    /// Builds a VM with `image` loaded at address 0 in a fresh `memory_mib`
    /// arena, `SP` initialized to the top of memory with `sys_enter` already
    /// pushed as the top-level return address, and `PC` at `prologue.entry`.
    pub fn new(image: &[u8], memory_mib: u64, prologue: Prologue) -> Vm {
        let mut memory = Memory::with_image(memory_mib * constants::MIB, image);
        let mut registers = [0u64; constants::REGISTER_COUNT];
        let sp = memory.length() - constants::CELL_BYTES;
        memory
            .write_u64(sp, prologue.sys_enter)
            .expect("reserved stack slot is in range");
        registers[crate::isa::RegisterId::SP.index()] = sp;
        Vm {
            registers,
            pc: prologue.entry,
            flags: Flags::default(),
            memory,
            prologue,
            image_len: image.len() as u64,
        }
    }

    #[inline]
    pub fn reg(&self, id: crate::isa::RegisterId) -> u64 {
        self.registers[id.index()]
    }

    #[inline]
    pub fn set_reg(&mut self, id: crate::isa::RegisterId, value: u64) {
        self.registers[id.index()] = value;
    }

    /// Runs to completion (`PC == sys_enter_offset`) on the requested
    /// backend.
    pub fn run(&mut self, backend: ExecutionBackend) -> Result<VmExit, VmError> {
        match backend {
            ExecutionBackend::Interpreter => interpreter::run(self),
            ExecutionBackend::Aarch64Jit => jit::aarch64::run(self),
            ExecutionBackend::X86_64Jit => jit::x86_64::run(self),
        }
    }

    pub(crate) fn exit(&self) -> VmExit {
        VmExit {
            registers: self.registers,
            flags: self.flags,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sp_initializes_below_memory_top_with_sys_enter_pushed() {
        let prologue = Prologue {
            sys_enter: 0,
            entry: 9,
            sys_write: u64::MAX,
            sys_print_u64: u64::MAX,
        };
        let vm = Vm::new(&[], 1, prologue);
        let sp = vm.reg(crate::isa::RegisterId::SP);
        assert_eq!(sp, constants::MIB - constants::CELL_BYTES);
        assert_eq!(vm.memory.read_u64(sp).unwrap(), 0);
        assert_eq!(vm.pc, 9);
    }
}
