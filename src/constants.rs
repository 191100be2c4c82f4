use std::mem;

/// Number of addressable general-purpose/`SP` register slots (4-bit field).
pub const REGISTER_COUNT: usize = 16;

/// Default linear memory size if the caller does not override it (4 MiB).
pub const DEFAULT_MEMORY_MIB: u64 = 4;
pub const MIB: u64 = 1024 * 1024;

/// Bytes in the 64-bit cells used for registers, stack slots and memory
/// load/store operands.
pub const CELL_BYTES: u64 = mem::size_of::<u64>() as u64;

/// Byte width of a `REG_IDX` displacement (`i16`, big-endian on the wire).
pub const DISP_BYTES: usize = mem::size_of::<i16>();

/// Byte width of the 64-bit immediates carried by `IMM`-mode instructions.
pub const IMM_BYTES: usize = mem::size_of::<u64>();

/// Bits reserved for the access mode in the leading opcode byte.
pub const ACCESS_MODE_BITS: u32 = 2;
pub const ACCESS_MODE_MASK: u8 = 0b0000_0011;

/// Name of the synthetic top-level label the assembler's bootstrap prologue
/// defines; the VM halts when `PC` reaches it.
pub const SYS_ENTER_LABEL: &str = "sys_enter";

/// Reserved syscall labels assembled into the prologue alongside `sys_enter`.
/// `CALL`ing either is intercepted by the VM before ordinary call dispatch.
pub const SYS_WRITE_LABEL: &str = "sys_write";
pub const SYS_PRINT_U64_LABEL: &str = "sys_print_u64";

/// Byte offsets of the assembler's bootstrap prologue, fixed by construction
/// (see `rasm`'s `PROLOGUE_ASM`: a 9-byte `jmp sys_enter`, then two 1-byte
/// `ret` stubs for the reserved syscalls). Every image `rasm` produces has
/// this exact layout, so the VM CLI can load a bare hex file — with no label
/// table available — and still recover the trampoline/entry addresses
/// without re-running the assembler. `rasm`'s own test suite asserts its
/// dynamically computed prologue addresses equal these constants.
pub const PROLOGUE_SYS_ENTER_OFFSET: u64 = 0;
pub const PROLOGUE_SYS_WRITE_OFFSET: u64 = 9;
pub const PROLOGUE_SYS_PRINT_U64_OFFSET: u64 = 10;
pub const PROLOGUE_ENTRY_OFFSET: u64 = 11;
