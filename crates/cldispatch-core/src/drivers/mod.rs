//! Driver implementations
//!
//! - [`HostDriver`]: host reference driver, always available
//! - [`OpenClDriver`]: system OpenCL runtime (`opencl` feature)

pub mod host;
pub mod opencl;

pub use host::{
    ArgFrame, HostDeviceSpec, HostDriver, HostPlatformSpec, HostRoutine, WorkItem, DEFAULT_ACCELERATOR_MEMORY,
    DEFAULT_CPU_MEMORY,
};
pub use opencl::OpenClDriver;
