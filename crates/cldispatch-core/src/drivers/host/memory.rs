//! Memory manager for the host driver
//!
//! Buffers are heap vectors keyed by handle id. Each device has a fixed
//! capacity, and allocations beyond what remains are refused the way a real
//! device refuses them.

use crate::driver::BufferHandle;
use crate::error::{DispatchError, Result};
use std::collections::HashMap;

/// Buffer storage for one host context
#[derive(Debug)]
pub struct MemoryManager {
    /// Buffers storage (heap-allocated)
    buffers: HashMap<u64, Vec<u8>>,

    /// Next buffer handle ID
    next_buffer_id: u64,

    /// Device capacity in bytes
    capacity: usize,

    /// Bytes currently allocated
    in_use: usize,
}

impl MemoryManager {
    /// Create a memory manager limited to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            next_buffer_id: 1,
            capacity,
            in_use: 0,
        }
    }

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate a zero-filled buffer
    pub fn allocate_buffer(&mut self, size: usize) -> Result<BufferHandle> {
        if size == 0 {
            return Err(DispatchError::allocation_failed(0, "zero-sized buffers are not allowed"));
        }
        let remaining = self.capacity - self.in_use;
        if size > remaining {
            return Err(DispatchError::allocation_failed(
                size,
                format!("device has {remaining} of {} bytes free", self.capacity),
            ));
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|e| DispatchError::allocation_failed(size, e.to_string()))?;
        storage.resize(size, 0);

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, storage);
        self.in_use += size;

        Ok(BufferHandle::new(id))
    }

    /// Free a buffer
    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let storage = self
            .buffers
            .remove(&handle.id())
            .ok_or_else(|| unknown_buffer("free_buffer", handle))?;
        self.in_use -= storage.len();
        Ok(())
    }

    /// Get buffer size
    pub fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.buffer(handle)?.len())
    }

    /// Copy `data` into the buffer at byte `offset`
    pub fn copy_to_buffer(&mut self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&handle.id())
            .ok_or_else(|| unknown_buffer("write_buffer", handle))?;
        let range = checked_range(offset, data.len(), buffer.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy from the buffer at byte `offset` into `dest`
    pub fn copy_from_buffer(&self, handle: BufferHandle, offset: usize, dest: &mut [u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        let range = checked_range(offset, dest.len(), buffer.len())?;
        dest.copy_from_slice(&buffer[range]);
        Ok(())
    }

    /// Borrow a buffer's bytes
    pub fn buffer(&self, handle: BufferHandle) -> Result<&[u8]> {
        self.buffers
            .get(&handle.id())
            .map(Vec::as_slice)
            .ok_or_else(|| unknown_buffer("buffer access", handle))
    }

    /// Mutably borrow a buffer's bytes
    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        self.buffers
            .get_mut(&handle.id())
            .map(Vec::as_mut_slice)
            .ok_or_else(|| unknown_buffer("buffer access", handle))
    }

    /// Bytes currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

fn unknown_buffer(operation: &'static str, handle: BufferHandle) -> DispatchError {
    DispatchError::driver(operation, format!("unknown buffer handle {handle}"))
}

/// Validate `offset..offset + len` against a buffer of `buffer_size` bytes
pub(crate) fn checked_range(offset: usize, len: usize, buffer_size: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= buffer_size => Ok(offset..end),
        _ => Err(DispatchError::BoundsViolation {
            offset,
            size: len,
            buffer_size,
        }),
    }
}
