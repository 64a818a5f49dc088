//! Execution context: the owning scope for device resources
//!
//! A [`Context`] owns the driver's resource table for one device. Buffers,
//! programs, kernels and queues hold a [`ContextRef`], a weak reference that
//! stops resolving once the context is released. From then on every
//! operation on those children fails with `ContextRequired`.

use crate::driver::DeviceContext;
use crate::error::{DispatchError, Result};
use crate::registry::Device;
use cldispatch_tracing::timed_block;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ContextShared {
    id: u64,
    device: Device,
    inner: Mutex<Box<dyn DeviceContext>>,
}

impl ContextShared {
    /// Run `f` with exclusive access to the driver context
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut dyn DeviceContext) -> R) -> R {
        let mut guard = self.inner.lock();
        f(guard.as_mut())
    }
}

/// An owning session bound to exactly one device
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    /// Open a context on `device`
    #[tracing::instrument(skip(device), fields(device = device.name()))]
    pub fn new(device: &Device) -> Result<Self> {
        let (inner, duration_us) = timed_block!("create_context", { device.driver().create_context(device.id()) });
        let inner = inner?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(context = id, device = device.name(), duration_us, "context created");
        Ok(Self {
            shared: Arc::new(ContextShared {
                id,
                device: device.clone(),
                inner: Mutex::new(inner),
            }),
        })
    }

    /// Device the context is bound to
    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    /// Process-unique context id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// End the session.
    ///
    /// Resources still held by the caller become inert: their operations
    /// fail with `ContextRequired` and their drops are no-ops. The driver
    /// table, and everything in it, is freed here.
    pub fn release(self) {
        tracing::info!(context = self.id(), "context released");
        drop(self);
    }

    pub(crate) fn downgrade(&self) -> ContextRef {
        ContextRef {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn shared(&self) -> &ContextShared {
        &self.shared
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("device", &self.shared.device.name())
            .finish()
    }
}

/// Non-owning link from a resource to its context
#[derive(Clone)]
pub(crate) struct ContextRef {
    id: u64,
    shared: Weak<ContextShared>,
}

impl ContextRef {
    /// Resolve the context or fail with `ContextRequired`
    pub(crate) fn upgrade(&self, operation: &'static str) -> Result<Arc<ContextShared>> {
        self.shared
            .upgrade()
            .ok_or(DispatchError::ContextRequired { operation })
    }

    /// Whether the context is still alive
    pub(crate) fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// Fail with `ContextMismatch` unless `other` is the same context
    pub(crate) fn ensure_same(&self, other: &ContextRef, operation: &'static str) -> Result<()> {
        if self.id == other.id {
            Ok(())
        } else {
            Err(DispatchError::ContextMismatch { operation })
        }
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
