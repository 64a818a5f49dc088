//! Driver seam between the dispatch layer and compute runtimes

mod traits;
mod types;

pub use traits::{DeviceContext, Driver};
pub use types::{
    AccessMode, ArgValue, BufferHandle, DeviceClass, DeviceId, DeviceInfo, KernelHandle, PlatformId, PlatformInfo,
    ProgramHandle, QueueHandle, ReadSlot,
};
