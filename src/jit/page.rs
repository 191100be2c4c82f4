//! W^X-respecting executable page lifecycle: a fresh anonymous mapping is
//! written as data, flipped to read-execute, and unmapped again on every
//! exit path via `Drop`.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;

use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};

use crate::error::VmError;

/// An anonymous `mmap`ed region that is writable until [`ExecPage::seal`]
/// flips it to executable, then callable as `extern "C" fn()` until
/// dropped, at which point it is `munmap`ed unconditionally.
pub struct ExecPage {
    ptr: *mut c_void,
    len: usize,
    sealed: bool,
}

impl ExecPage {
    /// Allocates `len` bytes (rounded up by the kernel to a page multiple),
    /// writable and not yet executable.
    pub fn new(len: usize) -> Result<ExecPage, VmError> {
        let length = NonZeroUsize::new(len).expect("ExecPage length must be nonzero");
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                None::<RawFd>,
                0,
            )?
        };
        Ok(ExecPage {
            ptr,
            len,
            sealed: false,
        })
    }

    /// Writable view into the page. Panics if called after [`ExecPage::seal`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.sealed, "ExecPage is already sealed read-execute");
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    /// Flips the page from writable to executable. Callers must perform any
    /// architecture-specific instruction-cache synchronization (AArch64)
    /// before invoking code in the page, since `mprotect` alone does not
    /// guarantee I-cache coherence on that architecture.
    pub fn seal(&mut self) -> Result<(), VmError> {
        unsafe {
            mprotect(self.ptr, self.len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)?;
        }
        self.sealed = true;
        Ok(())
    }

    /// Entry point of the page, valid only after [`ExecPage::seal`].
    pub fn entry_ptr(&self) -> *const c_void {
        self.ptr
    }
}

impl Drop for ExecPage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}
