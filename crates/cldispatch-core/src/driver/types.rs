//! Handles and descriptors exchanged with drivers

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

macro_rules! driver_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Wrap a driver-issued id
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the internal ID
            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

driver_handle!(
    /// Handle to a compute platform (driver instance)
    PlatformId,
    "platform"
);
driver_handle!(
    /// Handle to a device under a platform
    DeviceId,
    "device"
);
driver_handle!(
    /// Handle to a device-resident buffer within one context
    BufferHandle,
    "buf"
);
driver_handle!(
    /// Handle to a built program within one context
    ProgramHandle,
    "prog"
);
driver_handle!(
    /// Handle to a kernel object within one context
    KernelHandle,
    "kernel"
);
driver_handle!(
    /// Handle to a command queue within one context
    QueueHandle,
    "queue"
);

/// Broad device class as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceClass {
    /// General-purpose processor
    Cpu,
    /// GPU or dedicated accelerator
    Accelerator,
    /// Anything the runtime reports that is neither
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "cpu"),
            DeviceClass::Accelerator => write!(f, "accelerator"),
            DeviceClass::Other => write!(f, "other"),
        }
    }
}

/// Platform attributes reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// Device attributes reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub platform: PlatformId,
    pub name: String,
    pub class: DeviceClass,
    /// Device memory in bytes
    pub global_mem_size: u64,
    pub max_work_group_size: usize,
}

/// How kernels may access a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read_only",
            AccessMode::WriteOnly => "write_only",
            AccessMode::ReadWrite => "read_write",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kernel argument as handed to a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Buffer bound by handle
    Buffer(BufferHandle),
    /// Scalar passed by value in native byte order
    Scalar(Vec<u8>),
}

/// Destination of a deferred device-to-host read.
///
/// The driver fills the bytes and marks the slot ready when the read
/// completes on the device; the host only looks at the bytes afterwards.
#[derive(Debug)]
pub struct ReadSlot {
    data: Mutex<Vec<u8>>,
    ready: AtomicBool,
}

impl ReadSlot {
    /// Allocate a zeroed slot of `len` bytes
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; len]),
            ready: AtomicBool::new(false),
        })
    }

    /// Slot size in bytes
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether the slot holds zero bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `bytes` into the slot and mark it ready
    pub fn complete_with(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
        self.ready.store(true, Ordering::Release);
    }

    /// Mark the slot ready after the driver wrote it in place
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether the read has completed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Raw destination pointer for drivers that write asynchronously.
    ///
    /// The vector is never resized, so the pointer stays valid for the
    /// lifetime of the slot. Callers must not touch the bytes through any
    /// other path until [`ReadSlot::mark_ready`] has been called.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data.lock().as_mut_ptr()
    }

    /// Take the bytes out of a completed slot
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(BufferHandle::new(42).to_string(), "buf42");
        assert_eq!(QueueHandle::new(1).to_string(), "queue1");
        assert_eq!(PlatformId::new(0).id(), 0);
    }

    #[test]
    fn test_read_slot_lifecycle() {
        let slot = ReadSlot::new(4);
        assert!(!slot.is_ready());
        assert_eq!(slot.len(), 4);

        slot.complete_with(&[1, 2, 3, 4]);
        assert!(slot.is_ready());
        assert_eq!(slot.take(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_access_mode_default_is_read_write() {
        assert_eq!(AccessMode::default(), AccessMode::ReadWrite);
        assert_eq!(AccessMode::ReadOnly.to_string(), "read_only");
    }
}
