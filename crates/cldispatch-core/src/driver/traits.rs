//! Driver traits
//!
//! A [`Driver`] enumerates platforms and devices and opens device contexts.
//! A [`DeviceContext`] is the resource table of one context: every buffer,
//! program, kernel and queue created under it lives in that table and is
//! released when the table is dropped.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │       Registry / Context / Program / Queue      │
//! └───────────────────────┬────────────────────────┘
//!                         │ Driver + DeviceContext
//!              ┌──────────┴──────────┐
//!              ▼                     ▼
//!        ┌───────────┐         ┌───────────┐
//!        │   Host    │         │  OpenCL   │
//!        │ reference │         │ (opencl3) │
//!        └───────────┘         └───────────┘
//! ```
//!
//! Drivers trust the front layer for validation (bounds, arity, argument
//! types, dimensionality); they only report failures of the runtime itself.

use super::types::{
    AccessMode, ArgValue, BufferHandle, DeviceId, DeviceInfo, KernelHandle, PlatformId, PlatformInfo,
    ProgramHandle, QueueHandle, ReadSlot,
};
use crate::error::{DispatchError, Result};
use crate::source::KernelSignature;
use std::sync::Arc;

/// Entry point of a compute runtime
pub trait Driver: Send + Sync {
    /// Short driver name for logs (e.g. `"host"`, `"opencl"`)
    fn name(&self) -> &str;

    /// Enumerate platforms. An empty list is not an error at this level.
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Enumerate all devices of a platform.
    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>>;

    /// Open a context bound to exactly one device.
    fn create_context(&self, device: DeviceId) -> Result<Box<dyn DeviceContext>>;
}

/// Resource table of one context
pub trait DeviceContext: Send {
    /// Device this context is bound to
    fn device(&self) -> &DeviceInfo;

    // ============================================================================================
    // Buffers
    // ============================================================================================

    /// Allocate `size` bytes of device memory
    ///
    /// # Errors
    ///
    /// `AllocationFailed` when the device cannot satisfy the request.
    fn allocate_buffer(&mut self, size: usize, access: AccessMode) -> Result<BufferHandle>;

    /// Release a buffer
    fn free_buffer(&mut self, handle: BufferHandle) -> Result<()>;

    /// Buffer capacity in bytes
    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    // ============================================================================================
    // Programs and kernels
    // ============================================================================================

    /// Compile `source` for the context's device.
    ///
    /// `kernels` are the entry points found by source analysis.
    ///
    /// # Errors
    ///
    /// `BuildFailed` carrying the compiler's log.
    fn build_program(&mut self, source: &str, options: &str, kernels: &[KernelSignature]) -> Result<ProgramHandle>;

    /// Whether [`DeviceContext::kernel_signatures`] can describe a program
    /// built without analysed signatures
    fn introspects_kernels(&self) -> bool {
        false
    }

    /// Entry points of a built program as the driver's compiler reports
    /// them; `dimensions` is 0 since launch dimensionality is not reported
    fn kernel_signatures(&mut self, program: ProgramHandle) -> Result<Vec<KernelSignature>> {
        Err(DispatchError::driver(
            "kernel_signatures",
            format!("{program} cannot be introspected by this driver"),
        ))
    }

    /// Release a program
    fn free_program(&mut self, handle: ProgramHandle) -> Result<()>;

    /// Extract the named entry point
    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle>;

    /// Release a kernel
    fn free_kernel(&mut self, handle: KernelHandle) -> Result<()>;

    /// Bind one argument slot
    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: usize, value: &ArgValue) -> Result<()>;

    // ============================================================================================
    // Queues
    // ============================================================================================

    /// Create an in-order command queue
    fn create_queue(&mut self) -> Result<QueueHandle>;

    /// Release a queue (pending work is finished first)
    fn free_queue(&mut self, handle: QueueHandle) -> Result<()>;

    /// Blocking host-to-device copy; returns once the bytes are visible to
    /// every later command on `queue`
    fn write_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Deferred host-to-device copy; `data` is kept alive until the copy ran
    fn enqueue_write_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        data: Arc<[u8]>,
    ) -> Result<()>;

    /// Blocking device-to-host copy
    fn read_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Deferred device-to-host copy into `slot`
    fn enqueue_read_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        slot: Arc<ReadSlot>,
    ) -> Result<()>;

    /// Enqueue a launch over `global` work-items per dimension
    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, global: &[usize]) -> Result<()>;

    /// Block until every command submitted to `queue` has completed
    fn finish(&mut self, queue: QueueHandle) -> Result<()>;
}
