//! Native JIT back-ends. Each architecture module translates the decoded
//! guest instruction stream into hand-encoded host machine code in a single
//! linear pass, then calls into it through [`page::ExecPage`].
//!
//! Both back-ends share three things, collected here: the shape of the
//! fault-reporting channel generated code calls back into Rust through, the
//! bounds-checked memory helpers those calls resolve to (the JIT does not
//! reimplement `Storage`'s bounds checking in raw instructions — it calls
//! back into ordinary Rust for it, same as the interpreter), and the
//! once-per-run scan that turns the guest byte stream into a list of
//! decoded instructions both back-ends iterate over to emit code.

pub mod aarch64;
mod page;
pub mod x86_64;

use crate::decoder::{self, DecodedInstr};
use crate::error::VmError;

pub use page::ExecPage;

/// Where generated code records a fault for the Rust-side caller to observe
/// once the call into the page returns. A null/zeroed slot means no fault.
#[derive(Default)]
pub struct FaultSlot(pub Option<VmError>);

/// Return shape of the bounds-checked load helper, classified by both
/// target ABIs as two integer registers (`rax:rdx` on x86-64, `x0:x1` on
/// AArch64) so generated code can branch on the fault flag immediately
/// after the call without inspecting a struct in memory.
#[repr(C)]
pub struct LoadResult {
    pub value: u64,
    pub fault: u8,
}

/// Guest-memory load, called from generated code in place of an inlined
/// bounds check. Mirrors `Storage::read_u64`.
///
/// # Safety
/// `memory` must point to `memory_len` valid, initialized bytes, and
/// `fault` must point to a live `FaultSlot` for the duration of the call.
pub unsafe extern "C" fn jit_mem_load(
    memory: *mut u8,
    memory_len: u64,
    fault: *mut FaultSlot,
    addr: u64,
) -> LoadResult {
    let slice = unsafe { std::slice::from_raw_parts(memory, memory_len as usize) };
    match checked_read(slice, addr) {
        Ok(value) => LoadResult { value, fault: 0 },
        Err(err) => {
            unsafe { (*fault).0 = Some(err) };
            LoadResult { value: 0, fault: 1 }
        }
    }
}

/// Guest-memory store, called from generated code. Mirrors
/// `Storage::write_u64`. Returns a nonzero fault flag on out-of-range
/// addresses (low byte of `rax`/`x0`, matching [`jit_mem_load`]'s shape).
///
/// # Safety
/// Same preconditions as [`jit_mem_load`], plus exclusive access to
/// `memory` for the duration of the call.
pub unsafe extern "C" fn jit_mem_store(
    memory: *mut u8,
    memory_len: u64,
    fault: *mut FaultSlot,
    addr: u64,
    value: u64,
) -> u8 {
    let slice = unsafe { std::slice::from_raw_parts_mut(memory, memory_len as usize) };
    match checked_write(slice, addr, value) {
        Ok(()) => 0,
        Err(err) => {
            unsafe { (*fault).0 = Some(err) };
            1
        }
    }
}

/// Backs `CALL sys_write`: copies `len` bytes starting at guest address
/// `ptr` to stdout. Same interception the interpreter performs in
/// `dispatch_syscall`, reached here from generated code instead.
///
/// # Safety
/// Same preconditions as [`jit_mem_load`].
pub unsafe extern "C" fn jit_sys_write(
    memory: *mut u8,
    memory_len: u64,
    fault: *mut FaultSlot,
    ptr: u64,
    len: u64,
) -> u8 {
    use std::io::Write;

    let slice = unsafe { std::slice::from_raw_parts(memory, memory_len as usize) };
    match bounds(slice.len() as u64, ptr, len) {
        Some(range) => {
            std::io::stdout().write_all(&slice[range]).ok();
            0
        }
        None => {
            unsafe { (*fault).0 = Some(VmError::MemoryFault { address: ptr, pc: None }) };
            1
        }
    }
}

/// Backs `CALL sys_print_u64`: prints `R0` reinterpreted as signed decimal.
pub unsafe extern "C" fn jit_sys_print_u64(value: u64) {
    println!("{}", value as i64);
}

/// Records an invalid dynamic jump target (`RET` landing outside any
/// decoded instruction boundary). Unlike the other helpers this is called
/// only from the one dynamic-dispatch site in each back-end — `JMP`/`CALL`
/// targets are immediates resolved at translation time instead.
pub unsafe extern "C" fn jit_invalid_jump(fault: *mut FaultSlot, target: u64) {
    unsafe { (*fault).0 = Some(VmError::InvalidJumpTarget { target }) };
}

fn bounds(len: u64, addr: u64, count: u64) -> Option<std::ops::Range<usize>> {
    let end = addr.checked_add(count)?;
    if end <= len {
        Some(addr as usize..end as usize)
    } else {
        None
    }
}

fn checked_read(memory: &[u8], addr: u64) -> Result<u64, VmError> {
    match bounds(memory.len() as u64, addr, crate::constants::CELL_BYTES) {
        Some(range) => Ok(util::Endian::read_u64(&memory[range])),
        None => Err(VmError::MemoryFault { address: addr, pc: None }),
    }
}

fn checked_write(memory: &mut [u8], addr: u64, value: u64) -> Result<(), VmError> {
    match bounds(memory.len() as u64, addr, crate::constants::CELL_BYTES) {
        Some(range) => {
            util::Endian::write_u64(&mut memory[range], value);
            Ok(())
        }
        None => Err(VmError::MemoryFault { address: addr, pc: None }),
    }
}

/// One decoded instruction plus its guest byte offset and width, as
/// produced by [`scan`].
pub(crate) struct ScannedInstr {
    pub offset: u64,
    pub instr: DecodedInstr,
    pub width: usize,
}

/// Decodes the whole `[start, image_len)` span once, up front. Both back-ends
/// translate from this list rather than decoding lazily like the
/// interpreter — a JIT needs every instruction's host offset known before it
/// can patch any jump, so there is no benefit to interleaving decode and
/// translate the way the dispatch loop does.
pub(crate) fn scan(memory: &[u8], start: u64, image_len: u64) -> Result<Vec<ScannedInstr>, VmError> {
    let mut out = Vec::new();
    let mut cursor = start as usize;
    let end = image_len as usize;
    while cursor < end {
        let (decoded, width) = decoder::decode(memory, cursor)?;
        out.push(ScannedInstr {
            offset: cursor as u64,
            instr: decoded,
            width,
        });
        cursor += width;
    }
    Ok(out)
}

/// Where a translated jump/call patches to: either the function's shared
/// exit trampoline (halt or fault, both run the same callee-saved-register
/// epilogue) or another guest instruction's translated offset.
#[derive(Clone, Copy)]
pub(crate) enum PatchTarget {
    Exit,
    Guest(u64),
}
