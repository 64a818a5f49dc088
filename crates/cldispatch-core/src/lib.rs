//! Heterogeneous-compute dispatch layer
//!
//! This crate provides:
//! - **Device Registry**: platform and device discovery and selection
//! - **Execution Context**: owning scope for every device resource
//! - **Program Builder**: kernel source compilation with build logs
//! - **Buffer Manager**: fixed-capacity device buffers and transfers
//! - **Kernel Dispatcher**: argument binding, index spaces and submission
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Session                           │
//! │          (vector_add / matmul reference pipelines)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ DeviceRegistry → Context → Program → Kernel              │
//! │                     ├── Buffer                           │
//! │                     └── CommandQueue (submit / drain)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Driver / DeviceContext
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌───────────┐     ┌───────────┐
//!        │   Host    │     │  OpenCL   │
//!        │ reference │     │ (feature) │
//!        └───────────┘     └───────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use cldispatch_core::{
//!     select_device, select_platform, AccessMode, Buffer, CommandQueue, Context, DeviceRegistry, IndexSpace,
//!     Program, TransferMode, VECTOR_ADD_SOURCE,
//! };
//!
//! # fn main() -> cldispatch_core::Result<()> {
//! let registry = DeviceRegistry::host();
//! let platform = select_platform(&registry.list_platforms()?, 0)?;
//! let device = select_device(&registry.list_devices(&platform)?, 0)?;
//!
//! let ctx = Context::new(&device)?;
//! let queue = CommandQueue::new(&ctx)?;
//! let program = Program::build(&ctx, VECTOR_ADD_SOURCE, &device)?;
//! let mut kernel = program.extract_kernel("simple_add")?;
//!
//! let a = Buffer::allocate_for::<i32>(&ctx, 4, AccessMode::ReadOnly)?;
//! let b = Buffer::allocate_for::<i32>(&ctx, 4, AccessMode::ReadOnly)?;
//! let c = Buffer::allocate_for::<i32>(&ctx, 4, AccessMode::WriteOnly)?;
//! queue.upload(&a, &[1, 2, 3, 4], TransferMode::Blocking)?;
//! queue.upload(&b, &[10, 20, 30, 40], TransferMode::Blocking)?;
//!
//! kernel.set_arg(0, &a)?;
//! kernel.set_arg(1, &b)?;
//! kernel.set_arg(2, &c)?;
//! queue.submit(&kernel, IndexSpace::linear(4))?;
//! queue.drain()?;
//!
//! assert_eq!(queue.download::<i32>(&c, 4)?, vec![11, 22, 33, 44]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod context;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod kernel;
pub mod loader;
pub mod program;
pub mod queue;
pub mod registry;
pub mod session;
pub mod source;

pub use buffer::Buffer;
pub use context::Context;
pub use driver::{AccessMode, DeviceClass, DeviceContext, DeviceInfo, Driver, PlatformInfo};
pub use drivers::{HostDeviceSpec, HostDriver, HostPlatformSpec, OpenClDriver};
pub use error::{DispatchError, Result};
pub use kernel::{IndexSpace, Kernel, KernelArg, Scalar};
pub use loader::{load_kernel_source, MATRIX_MUL_SOURCE, VECTOR_ADD_SOURCE};
pub use program::Program;
pub use queue::{Barrier, CommandQueue, PendingRead, QueueStats, TransferMode};
pub use registry::{select_device, select_platform, Device, DeviceRegistry, Platform};
pub use session::{DispatchConfig, Matrix, Session};
pub use source::{KernelSignature, ParamKind, ScalarType};
