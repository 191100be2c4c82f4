//! Linear guest memory: a contiguous byte arena, code image at address 0,
//! little-endian in-memory layout (distinct from the big-endian *wire*
//! encoding of immediates in the hex image — see [`crate::encoder`]).

use byteorder::ByteOrder;
use util::Endian;

use crate::constants;
use crate::error::VmError;

/// A byte-addressable storage backing the VM's address space.
///
/// Mirrors the teacher's `Storage` trait: a minimal read/write interface over
/// a range-checked byte slice, with typed helpers layered on top of
/// [`Storage::borrow_slice`]/[`Storage::borrow_slice_mut`].
pub trait Storage {
    /// Total length of the storage in bytes.
    fn length(&self) -> u64;

    /// Whether `[address, address+length)` is addressable.
    fn check_range(&self, address: u64, length: u64) -> bool;

    /// Borrows `[address, address+length)` immutably.
    ///
    /// # Examples
    /// ```
    /// use rvm::memory::{Memory, Storage};
    ///
    /// let memory = Memory::new(16);
    /// assert!(memory.borrow_slice(4, 12).is_ok());
    /// assert!(memory.borrow_slice(10, 20).is_err());
    /// ```
    fn borrow_slice(&self, address: u64, length: u64) -> Result<&[u8], VmError>;

    /// Borrows `[address, address+length)` mutably.
    fn borrow_slice_mut(&mut self, address: u64, length: u64) -> Result<&mut [u8], VmError>;

    /// Reads a little-endian 64-bit cell (the unit `LOAD`/`STORE`/`PUSH`/`POP`
    /// operate in).
    ///
    /// # Examples
    /// ```
    /// use rvm::memory::{Memory, Storage};
    ///
    /// let mut memory = Memory::new(16);
    /// memory.write_u64(0, 0xdead_beef).unwrap();
    /// assert_eq!(memory.read_u64(0).unwrap(), 0xdead_beef);
    /// ```
    fn read_u64(&self, address: u64) -> Result<u64, VmError> {
        Ok(Endian::read_u64(
            self.borrow_slice(address, constants::CELL_BYTES)?,
        ))
    }

    /// Writes a little-endian 64-bit cell.
    fn write_u64(&mut self, address: u64, value: u64) -> Result<(), VmError> {
        Endian::write_u64(
            self.borrow_slice_mut(address, constants::CELL_BYTES)?,
            value,
        );
        Ok(())
    }
}

/// The default contiguous-array implementation of [`Storage`].
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Constructs zero-initialized memory of the given length in bytes.
    pub fn new(length: u64) -> Memory {
        Memory {
            data: vec![0u8; length as usize],
        }
    }

    /// Constructs memory of `mib` mebibytes, per the VM CLI's `-m/--memory`.
    pub fn with_mib(mib: u64) -> Memory {
        Memory::new(mib * constants::MIB)
    }

    /// Copies `image` into the low end of a freshly allocated arena.
    ///
    /// # Panics
    /// Panics if `image` does not fit within `length` bytes.
    pub fn with_image(length: u64, image: &[u8]) -> Memory {
        let mut memory = Memory::new(length);
        memory.data[..image.len()].copy_from_slice(image);
        memory
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Raw pointer to the backing arena, for the JIT back-ends to pass
    /// across the Rust/generated-code boundary. The pointer stays valid for
    /// as long as `self` is not reallocated (the arena is fixed-size after
    /// construction, so this holds for the lifetime of a run).
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Storage for Memory {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn check_range(&self, address: u64, length: u64) -> bool {
        let len = self.data.len() as u64;
        address <= len && address.saturating_add(length) <= len
    }

    fn borrow_slice(&self, address: u64, length: u64) -> Result<&[u8], VmError> {
        if self.check_range(address, length) {
            let start = address as usize;
            let end = start + length as usize;
            Ok(&self.data[start..end])
        } else {
            Err(VmError::MemoryFault { address, pc: None })
        }
    }

    fn borrow_slice_mut(&mut self, address: u64, length: u64) -> Result<&mut [u8], VmError> {
        if self.check_range(address, length) {
            let start = address as usize;
            let end = start + length as usize;
            Ok(&mut self.data[start..end])
        } else {
            Err(VmError::MemoryFault { address, pc: None })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn out_of_range_access_faults() {
        let memory = Memory::new(8);
        assert!(memory.read_u64(1).is_err());
        assert!(memory.borrow_slice(0, 9).is_err());
    }

    #[test]
    fn cell_roundtrip_is_little_endian() {
        let mut memory = Memory::new(8);
        memory.write_u64(0, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(memory.data(), &[8, 7, 6, 5, 4, 3, 2, 1]);
    }
}
