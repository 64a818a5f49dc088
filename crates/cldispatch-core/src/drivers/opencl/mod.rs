//! OpenCL driver
//!
//! Maps the driver traits onto an installed OpenCL runtime through the
//! `opencl3` crate. Compiled only with the `opencl` feature; without it a
//! stub [`OpenClDriver`] reports itself unavailable.
//!
//! # Architecture
//!
//! ```text
//! OpenClDriver
//! └── get_platforms() / get_devices(CL_DEVICE_TYPE_ALL)
//!
//! OpenClContext (one per Context)
//! ├── kernels   - Kernel objects
//! ├── programs  - built Program objects
//! ├── buffers   - Buffer<u8>
//! ├── queues    - CommandQueue + host data kept alive until finish
//! └── context   - the cl_context (dropped last)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use cldispatch_core::{DeviceRegistry, OpenClDriver};
//!
//! # fn main() -> cldispatch_core::Result<()> {
//! let registry = DeviceRegistry::new(OpenClDriver::new()?);
//! for platform in registry.list_platforms()? {
//!     println!("{}", platform.name());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{DispatchError, Result};

#[cfg(feature = "opencl")]
use crate::driver::{
    AccessMode, ArgValue, BufferHandle, DeviceClass, DeviceContext, DeviceId, DeviceInfo, Driver, KernelHandle,
    PlatformId, PlatformInfo, ProgramHandle, QueueHandle, ReadSlot,
};
#[cfg(feature = "opencl")]
use crate::source::{reported_param, AddressSpace, KernelSignature};
#[cfg(feature = "opencl")]
use std::collections::HashMap;
#[cfg(feature = "opencl")]
use std::ffi::c_void;
#[cfg(feature = "opencl")]
use std::ptr;
#[cfg(feature = "opencl")]
use std::sync::Arc;

#[cfg(feature = "opencl")]
use opencl3::command_queue::CommandQueue;
#[cfg(feature = "opencl")]
use opencl3::context::Context as ClContext;
#[cfg(feature = "opencl")]
use opencl3::device::{
    Device as ClDevice, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
#[cfg(feature = "opencl")]
use opencl3::error_codes::ClError;
#[cfg(feature = "opencl")]
use opencl3::kernel::Kernel as ClKernel;
#[cfg(feature = "opencl")]
use opencl3::memory::{Buffer as ClBuffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
#[cfg(feature = "opencl")]
use opencl3::platform::{get_platforms, Platform as ClPlatform};
#[cfg(feature = "opencl")]
use opencl3::program::Program as ClProgram;
#[cfg(feature = "opencl")]
use opencl3::types::{cl_device_id, cl_mem, CL_BLOCKING, CL_NON_BLOCKING};

/// Returned by the ICD loader when no platform is installed
#[cfg(feature = "opencl")]
const CL_PLATFORM_NOT_FOUND_KHR: i32 = -1001;

/// Returned by `clGetDeviceIDs` when a platform has no device of the type
#[cfg(feature = "opencl")]
const CL_DEVICE_NOT_FOUND: i32 = -1;

/// `clGetKernelArgInfo` address qualifiers
#[cfg(feature = "opencl")]
const CL_KERNEL_ARG_ADDRESS_GLOBAL: u32 = 0x119B;
#[cfg(feature = "opencl")]
const CL_KERNEL_ARG_ADDRESS_LOCAL: u32 = 0x119C;
#[cfg(feature = "opencl")]
const CL_KERNEL_ARG_ADDRESS_CONSTANT: u32 = 0x119D;

/// Driver backed by the system OpenCL runtime
#[cfg(feature = "opencl")]
#[derive(Debug, Default)]
pub struct OpenClDriver {
    _private: (),
}

#[cfg(feature = "opencl")]
impl OpenClDriver {
    /// Create the driver. Platform discovery happens on first enumeration.
    pub fn new() -> Result<Self> {
        Ok(Self { _private: () })
    }

    /// Whether the runtime reports at least one platform
    pub fn is_available() -> bool {
        get_platforms().map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn raw_platforms() -> Result<Vec<ClPlatform>> {
        match get_platforms() {
            Ok(platforms) => Ok(platforms),
            Err(err) if err.0 == CL_PLATFORM_NOT_FOUND_KHR => Ok(Vec::new()),
            Err(err) => Err(DispatchError::driver("clGetPlatformIDs", err)),
        }
    }
}

#[cfg(feature = "opencl")]
fn device_id_of(raw: cl_device_id) -> DeviceId {
    DeviceId::new(raw as usize as u64)
}

#[cfg(feature = "opencl")]
fn raw_device_id(id: DeviceId) -> cl_device_id {
    id.id() as usize as cl_device_id
}

#[cfg(feature = "opencl")]
fn query_device(raw: cl_device_id, platform: PlatformId) -> Result<DeviceInfo> {
    let device = ClDevice::new(raw);
    let dev_type = device
        .dev_type()
        .map_err(|e| DispatchError::driver("clGetDeviceInfo", e))?;
    let class = if dev_type & CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else if dev_type & (CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_ACCELERATOR) != 0 {
        DeviceClass::Accelerator
    } else {
        DeviceClass::Other
    };

    Ok(DeviceInfo {
        id: device_id_of(raw),
        platform,
        name: device.name().map_err(|e| DispatchError::driver("clGetDeviceInfo", e))?,
        class,
        global_mem_size: device
            .global_mem_size()
            .map_err(|e| DispatchError::driver("clGetDeviceInfo", e))?,
        max_work_group_size: device
            .max_work_group_size()
            .map_err(|e| DispatchError::driver("clGetDeviceInfo", e))?,
    })
}

#[cfg(feature = "opencl")]
impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Self::raw_platforms()?
            .into_iter()
            .map(|p| {
                let info = |r: std::result::Result<String, ClError>| {
                    r.map_err(|e| DispatchError::driver("clGetPlatformInfo", e))
                };
                Ok(PlatformInfo {
                    id: PlatformId::new(p.id() as usize as u64),
                    name: info(p.name())?,
                    vendor: info(p.vendor())?,
                    version: info(p.version())?,
                })
            })
            .collect()
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>> {
        let raw = Self::raw_platforms()?
            .into_iter()
            .find(|p| p.id() as usize as u64 == platform.id())
            .ok_or_else(|| DispatchError::driver("clGetDeviceIDs", format!("unknown {platform}")))?;

        let ids = match raw.get_devices(CL_DEVICE_TYPE_ALL) {
            Ok(ids) => ids,
            // an empty platform, not a failure
            Err(err) if err.0 == CL_DEVICE_NOT_FOUND => Vec::new(),
            Err(err) => return Err(DispatchError::driver("clGetDeviceIDs", err)),
        };
        ids.into_iter().map(|id| query_device(id, platform)).collect()
    }

    fn create_context(&self, device: DeviceId) -> Result<Box<dyn DeviceContext>> {
        let raw = raw_device_id(device);
        let cl_device = ClDevice::new(raw);
        let platform = cl_device
            .platform()
            .map_err(|e| DispatchError::driver("clGetDeviceInfo", e))?;
        let info = query_device(raw, PlatformId::new(platform as usize as u64))?;
        let context = ClContext::from_device(&cl_device).map_err(|e| DispatchError::driver("clCreateContext", e))?;

        Ok(Box::new(OpenClContext {
            kernels: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            queues: HashMap::new(),
            context,
            device: info,
            next_id: 1,
        }))
    }
}

/// Queue plus host memory that must outlive its deferred commands
#[cfg(feature = "opencl")]
struct ClQueue {
    queue: CommandQueue,
    retained_writes: Vec<Arc<[u8]>>,
    pending_reads: Vec<Arc<ReadSlot>>,
}

#[cfg(feature = "opencl")]
impl ClQueue {
    fn finish(&mut self) -> Result<()> {
        self.queue.finish().map_err(|e| DispatchError::driver("clFinish", e))?;
        self.retained_writes.clear();
        for slot in self.pending_reads.drain(..) {
            slot.mark_ready();
        }
        Ok(())
    }
}

/// Resource table of one OpenCL context.
///
/// Field order is drop order: children go before the context.
#[cfg(feature = "opencl")]
pub struct OpenClContext {
    kernels: HashMap<u64, ClKernel>,
    programs: HashMap<u64, ClProgram>,
    buffers: HashMap<u64, ClBuffer<u8>>,
    queues: HashMap<u64, ClQueue>,
    context: ClContext,
    device: DeviceInfo,
    next_id: u64,
}

#[cfg(feature = "opencl")]
impl OpenClContext {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Describe one entry point through `clGetKernelArgInfo`; the program
    /// must have been built with `-cl-kernel-arg-info`
    fn describe_kernel(program: &ClProgram, name: &str) -> Result<KernelSignature> {
        let query = |e: ClError| DispatchError::driver("clGetKernelArgInfo", e);
        let kernel = ClKernel::create(program, name).map_err(|e| DispatchError::driver("clCreateKernel", e))?;
        let arity = kernel
            .num_args()
            .map_err(|e| DispatchError::driver("clGetKernelInfo", e))?;

        let params = (0..arity)
            .map(|index| {
                let space = match kernel.get_arg_address_qualifier(index).map_err(query)? {
                    CL_KERNEL_ARG_ADDRESS_GLOBAL => AddressSpace::Global,
                    CL_KERNEL_ARG_ADDRESS_LOCAL => AddressSpace::Local,
                    CL_KERNEL_ARG_ADDRESS_CONSTANT => AddressSpace::Constant,
                    _ => AddressSpace::Private,
                };
                let type_name = kernel.get_arg_type_name(index).map_err(query)?;
                let arg_name = kernel.get_arg_name(index).map_err(query)?;
                Ok(reported_param(arg_name, space, &type_name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(KernelSignature {
            name: name.to_string(),
            params,
            dimensions: 0,
        })
    }

    fn unknown(operation: &'static str, what: impl std::fmt::Display) -> DispatchError {
        DispatchError::driver(operation, format!("unknown {what}"))
    }
}

#[cfg(feature = "opencl")]
impl DeviceContext for OpenClContext {
    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn allocate_buffer(&mut self, size: usize, access: AccessMode) -> Result<BufferHandle> {
        if size == 0 {
            return Err(DispatchError::allocation_failed(0, "zero-sized buffers are not allowed"));
        }
        let flags = match access {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        };
        // SAFETY: no host pointer is supplied, so the runtime owns the storage.
        let buffer = unsafe { ClBuffer::<u8>::create(&self.context, flags, size, ptr::null_mut()) }
            .map_err(|e| DispatchError::allocation_failed(size, e.to_string()))?;

        let id = self.next_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle::new(id))
    }

    fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| Self::unknown("clReleaseMemObject", handle))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        let buffer = self
            .buffers
            .get(&handle.id())
            .ok_or_else(|| Self::unknown("clGetMemObjectInfo", handle))?;
        buffer.size().map_err(|e| DispatchError::driver("clGetMemObjectInfo", e))
    }

    fn build_program(&mut self, source: &str, options: &str, _kernels: &[KernelSignature]) -> Result<ProgramHandle> {
        // the Err side carries the compiler's build log
        let program = ClProgram::create_and_build_from_source(&self.context, source, options)
            .map_err(DispatchError::build_failed)?;
        let id = self.next_id();
        self.programs.insert(id, program);
        Ok(ProgramHandle::new(id))
    }

    fn introspects_kernels(&self) -> bool {
        true
    }

    fn kernel_signatures(&mut self, program: ProgramHandle) -> Result<Vec<KernelSignature>> {
        let built = self
            .programs
            .get(&program.id())
            .ok_or_else(|| Self::unknown("clGetKernelArgInfo", program))?;
        built
            .kernel_names()
            .split(';')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Self::describe_kernel(built, name))
            .collect()
    }

    fn free_program(&mut self, handle: ProgramHandle) -> Result<()> {
        self.programs
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| Self::unknown("clReleaseProgram", handle))
    }

    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let built = self
            .programs
            .get(&program.id())
            .ok_or_else(|| Self::unknown("clCreateKernel", program))?;
        let kernel = ClKernel::create(built, name).map_err(|_| DispatchError::KernelNotFound {
            name: name.to_string(),
            available: built
                .kernel_names()
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })?;
        let id = self.next_id();
        self.kernels.insert(id, kernel);
        Ok(KernelHandle::new(id))
    }

    fn free_kernel(&mut self, handle: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| Self::unknown("clReleaseKernel", handle))
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: usize, value: &ArgValue) -> Result<()> {
        let cl_kernel = self
            .kernels
            .get(&kernel.id())
            .ok_or_else(|| Self::unknown("clSetKernelArg", kernel))?;
        let index = index as u32;
        let result = match value {
            ArgValue::Buffer(handle) => {
                let mem: cl_mem = self
                    .buffers
                    .get(&handle.id())
                    .ok_or_else(|| Self::unknown("clSetKernelArg", handle))?
                    .get();
                // SAFETY: `mem` is a live cl_mem owned by this context.
                unsafe { cl_kernel.set_arg(index, &mem) }
            }
            // SAFETY: the pointer and length describe the scalar's bytes.
            ArgValue::Scalar(bytes) => unsafe {
                cl_kernel.set_arg_raw(index, bytes.len(), bytes.as_ptr() as *const c_void)
            },
        };
        result.map_err(|e| DispatchError::driver("clSetKernelArg", e))
    }

    fn create_queue(&mut self) -> Result<QueueHandle> {
        #[allow(deprecated)]
        let queue =
            CommandQueue::create_default(&self.context, 0).map_err(|e| DispatchError::driver("clCreateCommandQueue", e))?;
        let id = self.next_id();
        self.queues.insert(
            id,
            ClQueue {
                queue,
                retained_writes: Vec::new(),
                pending_reads: Vec::new(),
            },
        );
        Ok(QueueHandle::new(id))
    }

    fn free_queue(&mut self, handle: QueueHandle) -> Result<()> {
        let mut queue = self
            .queues
            .remove(&handle.id())
            .ok_or_else(|| Self::unknown("clReleaseCommandQueue", handle))?;
        queue.finish()
    }

    fn write_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let q = self
            .queues
            .get_mut(&queue.id())
            .ok_or_else(|| Self::unknown("clEnqueueWriteBuffer", queue))?;
        let buf = self
            .buffers
            .get_mut(&buffer.id())
            .ok_or_else(|| Self::unknown("clEnqueueWriteBuffer", buffer))?;
        // SAFETY: blocking write; `data` outlives the call.
        unsafe { q.queue.enqueue_write_buffer(buf, CL_BLOCKING, offset, data, &[]) }
            .map_err(|e| DispatchError::driver("clEnqueueWriteBuffer", e))?;
        Ok(())
    }

    fn enqueue_write_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        data: Arc<[u8]>,
    ) -> Result<()> {
        let q = self
            .queues
            .get_mut(&queue.id())
            .ok_or_else(|| Self::unknown("clEnqueueWriteBuffer", queue))?;
        let buf = self
            .buffers
            .get_mut(&buffer.id())
            .ok_or_else(|| Self::unknown("clEnqueueWriteBuffer", buffer))?;
        // SAFETY: `data` is retained in the queue until the next finish.
        unsafe { q.queue.enqueue_write_buffer(buf, CL_NON_BLOCKING, offset, &data, &[]) }
            .map_err(|e| DispatchError::driver("clEnqueueWriteBuffer", e))?;
        q.retained_writes.push(data);
        Ok(())
    }

    fn read_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let q = self
            .queues
            .get_mut(&queue.id())
            .ok_or_else(|| Self::unknown("clEnqueueReadBuffer", queue))?;
        let buf = self
            .buffers
            .get(&buffer.id())
            .ok_or_else(|| Self::unknown("clEnqueueReadBuffer", buffer))?;
        // SAFETY: blocking read into a live slice.
        unsafe { q.queue.enqueue_read_buffer(buf, CL_BLOCKING, offset, dst, &[]) }
            .map_err(|e| DispatchError::driver("clEnqueueReadBuffer", e))?;
        Ok(())
    }

    fn enqueue_read_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        slot: Arc<ReadSlot>,
    ) -> Result<()> {
        let q = self
            .queues
            .get_mut(&queue.id())
            .ok_or_else(|| Self::unknown("clEnqueueReadBuffer", queue))?;
        let buf = self
            .buffers
            .get(&buffer.id())
            .ok_or_else(|| Self::unknown("clEnqueueReadBuffer", buffer))?;
        // SAFETY: the slot is never resized and is kept alive in
        // `pending_reads` until finish; nobody reads it before `mark_ready`.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(slot.as_mut_ptr(), slot.len());
            q.queue.enqueue_read_buffer(buf, CL_NON_BLOCKING, offset, dst, &[])
        }
        .map_err(|e| DispatchError::driver("clEnqueueReadBuffer", e))?;
        q.pending_reads.push(slot);
        Ok(())
    }

    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, global: &[usize]) -> Result<()> {
        let q = self
            .queues
            .get(&queue.id())
            .ok_or_else(|| Self::unknown("clEnqueueNDRangeKernel", queue))?;
        let k = self
            .kernels
            .get(&kernel.id())
            .ok_or_else(|| Self::unknown("clEnqueueNDRangeKernel", kernel))?;
        // SAFETY: `global` has `global.len()` entries; null offsets and local
        // sizes let the runtime choose.
        unsafe {
            q.queue.enqueue_nd_range_kernel(
                k.get(),
                global.len() as u32,
                ptr::null(),
                global.as_ptr(),
                ptr::null(),
                &[],
            )
        }
        .map_err(|e| DispatchError::driver("clEnqueueNDRangeKernel", e))?;
        Ok(())
    }

    fn finish(&mut self, queue: QueueHandle) -> Result<()> {
        self.queues
            .get_mut(&queue.id())
            .ok_or_else(|| Self::unknown("clFinish", queue))?
            .finish()
    }
}

#[cfg(feature = "opencl")]
impl Drop for OpenClContext {
    fn drop(&mut self) {
        for (id, queue) in self.queues.iter_mut() {
            if let Err(err) = queue.finish() {
                tracing::warn!(queue = id, error = %err, "failed to drain queue while releasing context");
            }
        }
    }
}

/// Stub when the `opencl` feature is off
#[cfg(not(feature = "opencl"))]
#[derive(Debug)]
pub struct OpenClDriver;

#[cfg(not(feature = "opencl"))]
impl OpenClDriver {
    pub fn new() -> Result<Self> {
        Err(DispatchError::driver(
            "OpenClDriver::new",
            "OpenCL driver requires the 'opencl' feature to be enabled",
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}

#[cfg(test)]
#[cfg(not(feature = "opencl"))]
mod stub_tests {
    use super::*;

    #[test]
    fn test_stub_reports_unavailable() {
        assert!(!OpenClDriver::is_available());
        assert!(matches!(OpenClDriver::new(), Err(DispatchError::Driver { .. })));
    }
}

#[cfg(test)]
#[cfg(feature = "opencl")]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_does_not_fail() {
        // may or may not find a platform depending on the machine
        let driver = OpenClDriver::new().unwrap();
        let platforms = driver.platforms().unwrap();
        for platform in platforms {
            let _ = driver.devices(platform.id).unwrap();
        }
    }
}
