//! Device buffers with fixed capacity

use crate::context::{Context, ContextRef};
use crate::driver::{AccessMode, BufferHandle};
use crate::error::{DispatchError, Result};
use cldispatch_tracing::perf_event;

/// A device-resident byte region owned by one context.
///
/// Capacity is fixed at allocation. The driver resource is freed when the
/// buffer is dropped, unless the context was released first (which frees it
/// already).
#[derive(Debug)]
pub struct Buffer {
    ctx: ContextRef,
    handle: BufferHandle,
    size: usize,
    access: AccessMode,
}

impl Buffer {
    /// Allocate `bytes` of device memory
    ///
    /// # Errors
    ///
    /// `AllocationFailed` when the device refuses the request.
    #[tracing::instrument(skip(ctx), fields(context = ctx.id()))]
    pub fn allocate(ctx: &Context, bytes: usize, access: AccessMode) -> Result<Self> {
        let handle = ctx.shared().with(|dc| dc.allocate_buffer(bytes, access))?;
        perf_event!("buffer_allocated", size_bytes = bytes, access = access.as_str());
        Ok(Self {
            ctx: ctx.downgrade(),
            handle,
            size: bytes,
            access,
        })
    }

    /// Allocate room for `len` elements of `T`
    pub fn allocate_for<T: bytemuck::Pod>(ctx: &Context, len: usize, access: AccessMode) -> Result<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| DispatchError::allocation_failed(usize::MAX, format!("{len} elements overflow usize")))?;
        Self::allocate(ctx, bytes, access)
    }

    /// Capacity in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Fail with `BoundsViolation` unless `offset..offset + len` fits
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DispatchError::BoundsViolation {
                offset,
                size: len,
                buffer_size: self.size,
            }),
        }
    }

    pub(crate) fn context_ref(&self) -> &ContextRef {
        &self.ctx
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Ok(ctx) = self.ctx.upgrade("buffer release") {
            if let Err(err) = ctx.with(|dc| dc.free_buffer(self.handle)) {
                tracing::warn!(buffer = %self.handle, error = %err, "failed to release buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{HostDeviceSpec, HostDriver, HostPlatformSpec};
    use crate::registry::{select_device, select_platform, DeviceRegistry};

    fn context_with_memory(bytes: u64) -> Context {
        let mut platform = HostPlatformSpec::reference();
        platform.devices = vec![HostDeviceSpec::cpu().with_memory(bytes)];
        let registry = DeviceRegistry::new(HostDriver::with_platforms(vec![platform]));
        let platform = select_platform(&registry.list_platforms().unwrap(), 0).unwrap();
        let device = select_device(&registry.list_devices(&platform).unwrap(), 0).unwrap();
        Context::new(&device).unwrap()
    }

    #[test]
    fn test_allocate_typed() {
        let ctx = context_with_memory(1024);
        let buffer = Buffer::allocate_for::<f32>(&ctx, 10, AccessMode::ReadOnly).unwrap();
        assert_eq!(buffer.size(), 40);
        assert_eq!(buffer.access(), AccessMode::ReadOnly);
    }

    #[test]
    fn test_allocation_beyond_capacity_fails() {
        let ctx = context_with_memory(1024);
        let err = Buffer::allocate(&ctx, 4096, AccessMode::ReadWrite).unwrap_err();
        assert!(matches!(err, DispatchError::AllocationFailed { requested: 4096, .. }));
    }

    #[test]
    fn test_drop_returns_capacity() {
        let ctx = context_with_memory(1024);
        {
            let _a = Buffer::allocate(&ctx, 1024, AccessMode::ReadWrite).unwrap();
            assert!(Buffer::allocate(&ctx, 1, AccessMode::ReadWrite).is_err());
        }
        assert!(Buffer::allocate(&ctx, 1024, AccessMode::ReadWrite).is_ok());
    }

    #[test]
    fn test_element_count_overflow() {
        let ctx = context_with_memory(1024);
        assert!(matches!(
            Buffer::allocate_for::<u64>(&ctx, usize::MAX, AccessMode::ReadWrite),
            Err(DispatchError::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_check_range() {
        let ctx = context_with_memory(1024);
        let buffer = Buffer::allocate(&ctx, 16, AccessMode::ReadWrite).unwrap();
        assert!(buffer.check_range(0, 16).is_ok());
        assert!(buffer.check_range(8, 8).is_ok());
        assert!(matches!(
            buffer.check_range(12, 8),
            Err(DispatchError::BoundsViolation {
                offset: 12,
                size: 8,
                buffer_size: 16
            })
        ));
        assert!(buffer.check_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_drop_after_release_is_silent() {
        let ctx = context_with_memory(1024);
        let buffer = Buffer::allocate(&ctx, 16, AccessMode::ReadWrite).unwrap();
        ctx.release();
        drop(buffer);
    }
}
