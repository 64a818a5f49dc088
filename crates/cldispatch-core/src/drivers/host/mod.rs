//! Host reference driver
//!
//! Runs kernels on the calling thread through registered host routines.
//! Always available, deterministic, and used by the test-suite as the
//! reference every other driver is compared against.
//!
//! # Architecture
//!
//! ```text
//! HostDriver
//! ├── platforms      - configured platform/device descriptions
//! └── routines       - kernel name → HostRoutine (shared with contexts)
//!
//! HostContext (one per Context)
//! ├── MemoryManager  - buffers, capacity-limited
//! ├── programs       - built programs (signature + routine per kernel)
//! ├── kernels        - kernel objects with bound arguments
//! └── queues         - in-order HostQueue per CommandQueue
//! ```
//!
//! # Usage
//!
//! ```rust
//! use cldispatch_core::{DeviceRegistry, HostDriver};
//!
//! # fn main() -> cldispatch_core::Result<()> {
//! let registry = DeviceRegistry::new(HostDriver::new());
//! let platforms = registry.list_platforms()?;
//! assert_eq!(platforms[0].name(), "Host Reference Platform");
//! # Ok(())
//! # }
//! ```

mod memory;
mod queue;
mod routines;

pub use memory::MemoryManager;
pub use routines::{ArgFrame, HostRoutine, RoutineTable, WorkItem};

use crate::driver::{
    AccessMode, ArgValue, BufferHandle, DeviceClass, DeviceContext, DeviceId, DeviceInfo, Driver, KernelHandle,
    PlatformId, PlatformInfo, ProgramHandle, QueueHandle, ReadSlot,
};
use crate::error::{DispatchError, Result};
use crate::source::KernelSignature;
use parking_lot::RwLock;
use queue::{Command, HostQueue};
use std::collections::HashMap;
use std::sync::Arc;

/// Default capacity of the host CPU device (256 MiB)
pub const DEFAULT_CPU_MEMORY: u64 = 256 * 1024 * 1024;
/// Default capacity of the emulated accelerator (64 MiB)
pub const DEFAULT_ACCELERATOR_MEMORY: u64 = 64 * 1024 * 1024;

/// Description of one host device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceSpec {
    pub name: String,
    pub class: DeviceClass,
    pub memory_capacity: u64,
    pub max_work_group_size: usize,
}

impl HostDeviceSpec {
    pub fn cpu() -> Self {
        Self {
            name: "Host CPU".to_string(),
            class: DeviceClass::Cpu,
            memory_capacity: DEFAULT_CPU_MEMORY,
            max_work_group_size: 1024,
        }
    }

    pub fn accelerator() -> Self {
        Self {
            name: "Emulated Accelerator".to_string(),
            class: DeviceClass::Accelerator,
            memory_capacity: DEFAULT_ACCELERATOR_MEMORY,
            max_work_group_size: 256,
        }
    }

    /// Override the memory capacity
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_capacity = bytes;
        self
    }
}

/// Description of one host platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatformSpec {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<HostDeviceSpec>,
}

impl HostPlatformSpec {
    /// The default platform: a CPU device followed by an emulated accelerator
    pub fn reference() -> Self {
        Self {
            name: "Host Reference Platform".to_string(),
            vendor: "cldispatch".to_string(),
            version: concat!("cldispatch host ", env!("CARGO_PKG_VERSION")).to_string(),
            devices: vec![HostDeviceSpec::cpu(), HostDeviceSpec::accelerator()],
        }
    }

    /// Same platform with no devices
    pub fn without_devices(mut self) -> Self {
        self.devices.clear();
        self
    }
}

/// Driver executing kernels as host routines
#[derive(Debug)]
pub struct HostDriver {
    platforms: Vec<HostPlatformSpec>,
    routines: Arc<RwLock<RoutineTable>>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    /// One reference platform with the built-in routines
    pub fn new() -> Self {
        Self::with_platforms(vec![HostPlatformSpec::reference()])
    }

    /// Custom platform list with the built-in routines
    pub fn with_platforms(platforms: Vec<HostPlatformSpec>) -> Self {
        Self {
            platforms,
            routines: Arc::new(RwLock::new(RoutineTable::with_builtins())),
        }
    }

    /// A driver reporting no platforms at all
    pub fn empty() -> Self {
        Self::with_platforms(Vec::new())
    }

    /// Register (or replace) the routine executed for kernel `name`.
    ///
    /// Programs built afterwards pick it up; already built programs keep
    /// the routine they were built with.
    pub fn register_routine<F>(&self, name: impl Into<String>, routine: F)
    where
        F: Fn(&WorkItem, &mut ArgFrame<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(kernel = %name, "registering host routine");
        self.routines.write().insert(name, Arc::new(routine));
    }

    fn device_spec(&self, device: DeviceId) -> Option<(usize, &HostPlatformSpec, &HostDeviceSpec)> {
        let (platform, index) = split_device_id(device);
        let spec = self.platforms.get(platform)?;
        Some((platform, spec, spec.devices.get(index)?))
    }
}

fn device_id(platform: usize, index: usize) -> DeviceId {
    DeviceId::new(((platform as u64) << 32) | index as u64)
}

fn split_device_id(device: DeviceId) -> (usize, usize) {
    ((device.id() >> 32) as usize, (device.id() & 0xffff_ffff) as usize)
}

fn device_info(platform: usize, index: usize, spec: &HostDeviceSpec) -> DeviceInfo {
    DeviceInfo {
        id: device_id(platform, index),
        platform: PlatformId::new(platform as u64),
        name: spec.name.clone(),
        class: spec.class,
        global_mem_size: spec.memory_capacity,
        max_work_group_size: spec.max_work_group_size,
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(i, p)| PlatformInfo {
                id: PlatformId::new(i as u64),
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: p.version.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>> {
        let index = platform.id() as usize;
        let spec = self
            .platforms
            .get(index)
            .ok_or_else(|| DispatchError::driver("devices", format!("unknown {platform}")))?;
        Ok(spec
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| device_info(index, i, d))
            .collect())
    }

    fn create_context(&self, device: DeviceId) -> Result<Box<dyn DeviceContext>> {
        let (platform, _, spec) = self
            .device_spec(device)
            .ok_or_else(|| DispatchError::driver("create_context", format!("unknown {device}")))?;
        let (_, index) = split_device_id(device);
        let capacity = usize::try_from(spec.memory_capacity).unwrap_or(usize::MAX);

        Ok(Box::new(HostContext {
            device: device_info(platform, index, spec),
            memory: MemoryManager::new(capacity),
            routines: Arc::clone(&self.routines),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            queues: HashMap::new(),
            next_id: 1,
        }))
    }
}

struct HostProgram {
    kernels: HashMap<String, HostRoutine>,
    names: Vec<String>,
}

struct HostKernel {
    name: String,
    routine: HostRoutine,
    args: Vec<Option<ArgValue>>,
}

/// Resource table of one host context
pub struct HostContext {
    device: DeviceInfo,
    memory: MemoryManager,
    routines: Arc<RwLock<RoutineTable>>,
    programs: HashMap<u64, HostProgram>,
    kernels: HashMap<u64, HostKernel>,
    queues: HashMap<u64, HostQueue>,
    next_id: u64,
}

impl HostContext {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn queue_mut(&mut self, operation: &'static str, handle: QueueHandle) -> Result<&mut HostQueue> {
        self.queues
            .get_mut(&handle.id())
            .ok_or_else(|| DispatchError::driver(operation, format!("unknown {handle}")))
    }

    /// Run everything recorded on `queue` so far
    fn flush(&mut self, operation: &'static str, handle: QueueHandle) -> Result<()> {
        let queue = self
            .queues
            .get_mut(&handle.id())
            .ok_or_else(|| DispatchError::driver(operation, format!("unknown {handle}")))?;
        queue.flush(&mut self.memory)
    }
}

impl DeviceContext for HostContext {
    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn allocate_buffer(&mut self, size: usize, access: AccessMode) -> Result<BufferHandle> {
        let handle = self.memory.allocate_buffer(size)?;
        tracing::trace!(%handle, size, %access, in_use = self.memory.in_use(), "host buffer allocated");
        Ok(handle)
    }

    fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        // recorded commands against the buffer run before it goes away
        let mut flushed = Ok(());
        for queue in self.queues.values_mut().filter(|q| q.references(handle)) {
            let outcome = queue.flush(&mut self.memory);
            if flushed.is_ok() {
                flushed = outcome;
            }
        }
        let freed = self.memory.free_buffer(handle);
        flushed.and(freed)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.buffer_size(handle)
    }

    fn build_program(&mut self, _source: &str, options: &str, kernels: &[KernelSignature]) -> Result<ProgramHandle> {
        if !options.trim().is_empty() {
            tracing::debug!(options, "host driver ignores build options");
        }

        let table = self.routines.read();
        let mut log = Vec::new();
        let mut bound = HashMap::new();
        for signature in kernels {
            match table.get(&signature.name) {
                Some(routine) => {
                    bound.insert(signature.name.clone(), routine);
                }
                None => log.push(format!(
                    "error: no host routine registered for kernel '{}'",
                    signature.name
                )),
            }
        }
        drop(table);

        if !log.is_empty() {
            return Err(DispatchError::build_failed(log.join("\n")));
        }

        let id = self.next_id();
        self.programs.insert(
            id,
            HostProgram {
                kernels: bound,
                names: kernels.iter().map(|k| k.name.clone()).collect(),
            },
        );
        Ok(ProgramHandle::new(id))
    }

    fn free_program(&mut self, handle: ProgramHandle) -> Result<()> {
        self.programs
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| DispatchError::driver("free_program", format!("unknown {handle}")))
    }

    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let built = self
            .programs
            .get(&program.id())
            .ok_or_else(|| DispatchError::driver("create_kernel", format!("unknown {program}")))?;
        let routine = built.kernels.get(name).cloned().ok_or_else(|| DispatchError::KernelNotFound {
            name: name.to_string(),
            available: built.names.clone(),
        })?;

        // arity is enforced by the front layer; slots grow on demand
        let id = self.next_id();
        self.kernels.insert(
            id,
            HostKernel {
                name: name.to_string(),
                routine,
                args: Vec::new(),
            },
        );
        Ok(KernelHandle::new(id))
    }

    fn free_kernel(&mut self, handle: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&handle.id())
            .map(|_| ())
            .ok_or_else(|| DispatchError::driver("free_kernel", format!("unknown {handle}")))
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: usize, value: &ArgValue) -> Result<()> {
        let kernel = self
            .kernels
            .get_mut(&kernel.id())
            .ok_or_else(|| DispatchError::driver("set_kernel_arg", format!("unknown {kernel}")))?;
        if kernel.args.len() <= index {
            kernel.args.resize(index + 1, None);
        }
        kernel.args[index] = Some(value.clone());
        Ok(())
    }

    fn create_queue(&mut self) -> Result<QueueHandle> {
        let id = self.next_id();
        self.queues.insert(id, HostQueue::default());
        Ok(QueueHandle::new(id))
    }

    fn free_queue(&mut self, handle: QueueHandle) -> Result<()> {
        let flushed = self.flush("free_queue", handle);
        self.queues.remove(&handle.id());
        flushed
    }

    fn write_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.flush("write_buffer", queue)?;
        self.memory.copy_to_buffer(buffer, offset, data)
    }

    fn enqueue_write_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        data: Arc<[u8]>,
    ) -> Result<()> {
        self.queue_mut("enqueue_write_buffer", queue)?
            .push(Command::Write { buffer, offset, data });
        Ok(())
    }

    fn read_buffer(&mut self, queue: QueueHandle, buffer: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.flush("read_buffer", queue)?;
        self.memory.copy_from_buffer(buffer, offset, dst)
    }

    fn enqueue_read_buffer(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: usize,
        slot: Arc<ReadSlot>,
    ) -> Result<()> {
        self.queue_mut("enqueue_read_buffer", queue)?
            .push(Command::Read { buffer, offset, slot });
        Ok(())
    }

    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, global: &[usize]) -> Result<()> {
        let bound = self
            .kernels
            .get(&kernel.id())
            .ok_or_else(|| DispatchError::driver("enqueue_kernel", format!("unknown {kernel}")))?;

        let args = bound
            .args
            .iter()
            .enumerate()
            .map(|(position, arg)| {
                arg.clone().ok_or_else(|| DispatchError::UnboundArgument {
                    kernel: bound.name.clone(),
                    position,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let command = Command::Launch {
            kernel: bound.name.clone(),
            routine: Arc::clone(&bound.routine),
            args,
            global: global.to_vec(),
        };
        self.queue_mut("enqueue_kernel", queue)?.push(command);
        Ok(())
    }

    fn finish(&mut self, queue: QueueHandle) -> Result<()> {
        self.flush("finish", queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parse_kernels;

    const SCALE: &str = "__kernel void scale(__global float* v, const float k) { int i = get_global_id(0); v[i] *= k; }";

    #[test]
    fn test_reference_platform_layout() {
        let driver = HostDriver::new();
        let platforms = driver.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name, "Host Reference Platform");

        let devices = driver.devices(platforms[0].id).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].class, DeviceClass::Cpu);
        assert_eq!(devices[1].class, DeviceClass::Accelerator);
        assert_ne!(devices[0].id, devices[1].id);
    }

    #[test]
    fn test_device_ids_encode_platform() {
        let id = device_id(3, 7);
        assert_eq!(split_device_id(id), (3, 7));
    }

    #[test]
    fn test_missing_routine_fails_build() {
        let driver = HostDriver::new();
        let devices = driver.devices(PlatformId::new(0)).unwrap();
        let mut ctx = driver.create_context(devices[0].id).unwrap();

        let kernels = parse_kernels(SCALE).unwrap();
        let err = ctx.build_program(SCALE, "", &kernels).unwrap_err();
        assert_eq!(
            err.build_log(),
            Some("error: no host routine registered for kernel 'scale'")
        );
    }

    #[test]
    fn test_registered_routine_runs_deferred_until_finish() {
        let driver = HostDriver::new();
        driver.register_routine("scale", |item, frame| {
            let i = item.global_id[0];
            let k: f32 = frame.scalar(1)?;
            let v: f32 = frame.load(0, i)?;
            frame.store(0, i, v * k)
        });

        let devices = driver.devices(PlatformId::new(0)).unwrap();
        let mut ctx = driver.create_context(devices[0].id).unwrap();
        let kernels = parse_kernels(SCALE).unwrap();
        let program = ctx.build_program(SCALE, "", &kernels).unwrap();
        let kernel = ctx.create_kernel(program, "scale").unwrap();
        let queue = ctx.create_queue().unwrap();

        let buffer = ctx.allocate_buffer(8, AccessMode::ReadWrite).unwrap();
        ctx.write_buffer(queue, buffer, 0, bytemuck::cast_slice(&[1.5f32, 2.0]))
            .unwrap();
        ctx.set_kernel_arg(kernel, 0, &ArgValue::Buffer(buffer)).unwrap();
        ctx.set_kernel_arg(kernel, 1, &ArgValue::Scalar(2.0f32.to_ne_bytes().to_vec()))
            .unwrap();
        ctx.enqueue_kernel(queue, kernel, &[2]).unwrap();

        let slot = ReadSlot::new(8);
        ctx.enqueue_read_buffer(queue, buffer, 0, Arc::clone(&slot)).unwrap();
        assert!(!slot.is_ready());

        ctx.finish(queue).unwrap();
        assert!(slot.is_ready());
        let bytes = slot.take();
        let out: Vec<f32> = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        assert_eq!(out, vec![3.0, 4.0]);
    }

    #[test]
    fn test_arguments_captured_at_enqueue() {
        let driver = HostDriver::new();
        let devices = driver.devices(PlatformId::new(0)).unwrap();
        let mut ctx = driver.create_context(devices[0].id).unwrap();
        let source = crate::loader::VECTOR_ADD_SOURCE;
        let program = ctx.build_program(source, "", &parse_kernels(source).unwrap()).unwrap();
        let kernel = ctx.create_kernel(program, "simple_add").unwrap();
        let queue = ctx.create_queue().unwrap();

        let a = ctx.allocate_buffer(4, AccessMode::ReadOnly).unwrap();
        let b = ctx.allocate_buffer(4, AccessMode::ReadOnly).unwrap();
        let c1 = ctx.allocate_buffer(4, AccessMode::WriteOnly).unwrap();
        let c2 = ctx.allocate_buffer(4, AccessMode::WriteOnly).unwrap();
        ctx.write_buffer(queue, a, 0, &5i32.to_ne_bytes()).unwrap();
        ctx.write_buffer(queue, b, 0, &6i32.to_ne_bytes()).unwrap();

        ctx.set_kernel_arg(kernel, 0, &ArgValue::Buffer(a)).unwrap();
        ctx.set_kernel_arg(kernel, 1, &ArgValue::Buffer(b)).unwrap();
        ctx.set_kernel_arg(kernel, 2, &ArgValue::Buffer(c1)).unwrap();
        ctx.enqueue_kernel(queue, kernel, &[1]).unwrap();
        // rebinding after enqueue must not affect the recorded launch
        ctx.set_kernel_arg(kernel, 2, &ArgValue::Buffer(c2)).unwrap();
        ctx.finish(queue).unwrap();

        let mut out = [0u8; 4];
        ctx.read_buffer(queue, c1, 0, &mut out).unwrap();
        assert_eq!(i32::from_ne_bytes(out), 11);
        ctx.read_buffer(queue, c2, 0, &mut out).unwrap();
        assert_eq!(i32::from_ne_bytes(out), 0);
    }

    #[test]
    fn test_free_buffer_runs_pending_commands_first() {
        let driver = HostDriver::new();
        let devices = driver.devices(PlatformId::new(0)).unwrap();
        let mut ctx = driver.create_context(devices[0].id).unwrap();
        let queue = ctx.create_queue().unwrap();

        let a = ctx.allocate_buffer(4, AccessMode::ReadWrite).unwrap();
        let b = ctx.allocate_buffer(4, AccessMode::ReadWrite).unwrap();
        ctx.enqueue_write_buffer(queue, a, 0, Arc::from(1i32.to_ne_bytes().to_vec()))
            .unwrap();
        ctx.enqueue_write_buffer(queue, b, 0, Arc::from(2i32.to_ne_bytes().to_vec()))
            .unwrap();

        ctx.free_buffer(a).unwrap();
        ctx.finish(queue).unwrap();

        let mut out = [0u8; 4];
        ctx.read_buffer(queue, b, 0, &mut out).unwrap();
        assert_eq!(i32::from_ne_bytes(out), 2);
        assert!(ctx.buffer_size(a).is_err());
    }

    #[test]
    fn test_unknown_kernel_name() {
        let driver = HostDriver::new();
        let devices = driver.devices(PlatformId::new(0)).unwrap();
        let mut ctx = driver.create_context(devices[1].id).unwrap();
        let source = crate::loader::VECTOR_ADD_SOURCE;
        let program = ctx.build_program(source, "", &parse_kernels(source).unwrap()).unwrap();
        let err = ctx.create_kernel(program, "nope").unwrap_err();
        assert!(matches!(err, DispatchError::KernelNotFound { .. }));
    }
}
