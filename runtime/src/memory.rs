//! WASM linear memory management.
//!
//! The host creates the module's memory itself (it is handed to the module
//! as the `env.memory` import), sizes it from the pre-flight layout, and grows
//! it page-wise when the guest allocator asks for more heap through `sbrk`.
//! Guest pointers are dereferenced through [`GuestMemory`], a bounds-checked
//! view that is re-borrowed on every host call.

use wasmtime::{AsContext, AsContextMut, Memory, MemoryType};

use crate::session::{FaultCategory, HostFault};
use crate::RuntimeError;

/// Page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

/// Static memory layout recovered by the pre-flight scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// One past the last byte of static data.
    pub data_end: u32,
    /// Top of the shadow stack (`data_end` rounded up to 16).
    pub stack_top: u32,
    /// First address the guest allocator may hand out.
    pub heap_base: u32,
}

impl MemoryLayout {
    /// Initial memory size: the heap base rounded up to a page, plus `heap_slack`.
    pub fn initial_size(&self, heap_slack: u32) -> u64 {
        round_up_page(self.heap_base as u64) + heap_slack as u64
    }
}

/// Round a byte count up to a whole number of pages.
pub fn round_up_page(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
}

/// Linear memory for the hosted module.
///
/// Holds the engine's memory handle plus the heap break. The break only
/// moves up; there is no shrink operation.
#[derive(Debug, Clone, Copy)]
pub struct LinearMemory {
    /// Engine memory handle.
    memory: Memory,

    /// Current heap break.
    heap_end: u32,

    /// Maximum heap break in bytes.
    hard_limit: u32,
}

impl LinearMemory {
    /// Create the memory for a module with the given layout.
    pub fn new(
        mut store: impl AsContextMut,
        layout: &MemoryLayout,
        hard_limit: u32,
        heap_slack: u32,
    ) -> Result<Self, RuntimeError> {
        let initial_size = layout.initial_size(heap_slack);
        if initial_size > hard_limit as u64 {
            return Err(RuntimeError::MemoryError(format!(
                "Initial memory size {} exceeds limit {}",
                initial_size, hard_limit
            )));
        }

        let initial_pages = initial_size.div_ceil(PAGE_SIZE as u64) as u32;
        let max_pages = hard_limit / PAGE_SIZE as u32;
        let memory = Memory::new(
            store.as_context_mut(),
            MemoryType::new(initial_pages, Some(max_pages)),
        )
        .map_err(|e| RuntimeError::MemoryError(e.to_string()))?;

        log::debug!(
            "[wajs] memory {} pages (max {}), heap base {}",
            initial_pages,
            max_pages,
            layout.heap_base
        );

        Ok(LinearMemory {
            memory,
            heap_end: layout.heap_base,
            hard_limit,
        })
    }

    /// Engine memory handle.
    pub fn handle(&self) -> Memory {
        self.memory
    }

    /// Point at a different engine memory, keeping the heap break.
    pub fn rebind(&mut self, memory: Memory) {
        self.memory = memory;
    }

    /// Current heap break.
    pub fn heap_end(&self) -> u32 {
        self.heap_end
    }

    /// Maximum heap break.
    pub fn hard_limit(&self) -> u32 {
        self.hard_limit
    }

    /// Current size in bytes.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(store.as_context())
    }

    /// Move the heap break up by `increment` bytes.
    ///
    /// Returns the previous break. The underlying memory only grows when
    /// the new break passes its current length, and then by the smallest
    /// number of pages that covers the shortfall.
    pub fn grow(&mut self, mut store: impl AsContextMut, increment: u32) -> Result<u32, HostFault> {
        let previous = self.heap_end;
        let new_end = previous as u64 + increment as u64;
        if new_end > self.hard_limit as u64 {
            return Err(HostFault::new(FaultCategory::Mem, "Out of memory"));
        }

        let current = self.memory.data_size(store.as_context()) as u64;
        if new_end > current {
            let pages = (new_end - current).div_ceil(PAGE_SIZE as u64);
            self.memory
                .grow(store.as_context_mut(), pages)
                .map_err(|e| HostFault::new(FaultCategory::Mem, format!("Out of memory: {}", e)))?;
            log::debug!(
                "[wajs] sbrk {} -> {}, grew {} pages",
                previous,
                new_end,
                pages
            );
        }

        self.heap_end = new_end as u32;
        Ok(previous)
    }
}

/// Guest pointer outside of linear memory.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Memory access out of bounds: {ptr:#x} + {len} > {size}")]
pub struct OutOfBounds {
    pub ptr: u32,
    pub len: usize,
    pub size: usize,
}

/// Bounds-checked little-endian view over guest memory.
pub struct GuestMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    /// Wrap the raw memory bytes.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        GuestMemory { bytes }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole memory.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes
    }

    /// The whole memory, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Read a byte.
    pub fn read_u8(&self, ptr: u32) -> Result<u8, OutOfBounds> {
        let start = self.check_bounds(ptr, 1)?;
        Ok(self.bytes[start])
    }

    /// Read a u16 (little-endian).
    pub fn read_u16(&self, ptr: u32) -> Result<u16, OutOfBounds> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.read_bytes(ptr, 2)?);
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32(&self, ptr: u32) -> Result<u32, OutOfBounds> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(ptr, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a u64 (little-endian).
    pub fn read_u64(&self, ptr: u32) -> Result<u64, OutOfBounds> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(ptr, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn read_bytes(&self, ptr: u32, len: usize) -> Result<&[u8], OutOfBounds> {
        let start = self.check_bounds(ptr, len)?;
        Ok(&self.bytes[start..start + len])
    }

    /// Borrow everything from `ptr` to the end of memory.
    pub fn bytes_from(&self, ptr: u32) -> Result<&[u8], OutOfBounds> {
        let start = self.check_bounds(ptr, 0)?;
        Ok(&self.bytes[start..])
    }

    /// Mutably borrow `len` bytes at `ptr`.
    pub fn slice_mut(&mut self, ptr: u32, len: usize) -> Result<&mut [u8], OutOfBounds> {
        let start = self.check_bounds(ptr, len)?;
        Ok(&mut self.bytes[start..start + len])
    }

    /// Write a byte.
    pub fn write_u8(&mut self, ptr: u32, value: u8) -> Result<(), OutOfBounds> {
        self.write_bytes(ptr, &[value])
    }

    /// Write a u16 (little-endian).
    pub fn write_u16(&mut self, ptr: u32, value: u16) -> Result<(), OutOfBounds> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Write a u32 (little-endian).
    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), OutOfBounds> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Write a u64 as two little-endian words, low word first.
    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), OutOfBounds> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    /// Copy bytes into memory at `ptr`.
    pub fn write_bytes(&mut self, ptr: u32, data: &[u8]) -> Result<(), OutOfBounds> {
        self.slice_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Check if an access is within bounds; returns the start index.
    fn check_bounds(&self, ptr: u32, len: usize) -> Result<usize, OutOfBounds> {
        let start = ptr as usize;
        let oob = OutOfBounds {
            ptr,
            len,
            size: self.bytes.len(),
        };
        let end = start.checked_add(len).ok_or(oob)?;
        if end > self.bytes.len() {
            return Err(oob);
        }
        Ok(start)
    }
}
