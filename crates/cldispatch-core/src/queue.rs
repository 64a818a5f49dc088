//! Command queue: transfers, kernel submission and completion
//!
//! Every command gets a sequence number. [`CommandQueue::drain`] blocks until
//! everything submitted so far has completed and returns a [`Barrier`] that
//! proves it. Deferred downloads hand out a [`PendingRead`] ticket that only
//! yields data when presented with a barrier covering it.

use crate::buffer::Buffer;
use crate::context::{Context, ContextRef};
use crate::driver::{QueueHandle, ReadSlot};
use crate::error::{DispatchError, Result};
use crate::kernel::{IndexSpace, Kernel};
use bytemuck::Pod;
use cldispatch_tracing::perf_span;
use cldispatch_tracing::performance::{record_launch, record_transfer, TransferDirection};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a transfer returns before or after it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Complete before returning
    #[default]
    Blocking,
    /// Enqueue and return; completion is observed through [`CommandQueue::drain`]
    Deferred,
}

/// Proof that every command up to `sequence` on `queue` has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    queue: u64,
    sequence: u64,
}

impl Barrier {
    pub fn queue(&self) -> u64 {
        self.queue
    }

    /// Highest completed sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether this barrier covers command `sequence` of `queue`
    pub fn covers(&self, queue: u64, sequence: u64) -> bool {
        self.queue == queue && self.sequence >= sequence
    }
}

/// Counters describing a queue's activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Commands handed to the device
    pub submitted: u64,
    /// Commands known complete
    pub completed: u64,
    /// Kernel launches handed to the device
    pub launches: u64,
}

/// Result of a deferred download, redeemable after a covering drain
#[derive(Debug)]
#[must_use = "a pending read yields nothing until waited on"]
pub struct PendingRead<T: Pod> {
    queue: u64,
    sequence: u64,
    len: usize,
    slot: Arc<ReadSlot>,
    _marker: PhantomData<T>,
}

impl<T: Pod> PendingRead<T> {
    /// Sequence number of the read command
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the device has finished the read
    pub fn is_complete(&self) -> bool {
        self.slot.is_ready()
    }

    /// Take the downloaded elements.
    ///
    /// # Errors
    ///
    /// `TransferPending` unless `barrier` comes from the same queue and was
    /// produced after this read was enqueued.
    pub fn wait(self, barrier: &Barrier) -> Result<Vec<T>> {
        if !barrier.covers(self.queue, self.sequence) || !self.slot.is_ready() {
            return Err(DispatchError::TransferPending {
                queue: self.queue,
                sequence: self.sequence,
            });
        }
        let bytes = self.slot.take();
        let mut out = vec![T::zeroed(); self.len];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes);
        Ok(out)
    }
}

/// In-order command queue bound to one context and device
#[derive(Debug)]
pub struct CommandQueue {
    ctx: ContextRef,
    handle: QueueHandle,
    id: u64,
    submitted: AtomicU64,
    completed: AtomicU64,
    launches: AtomicU64,
}

impl CommandQueue {
    /// Create a queue on `ctx`
    pub fn new(ctx: &Context) -> Result<Self> {
        let handle = ctx.shared().with(|dc| dc.create_queue())?;
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(queue = id, context = ctx.id(), "command queue created");
        Ok(Self {
            ctx: ctx.downgrade(),
            handle,
            id,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        })
    }

    /// Process-unique queue id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            launches: self.launches.load(Ordering::Acquire),
        }
    }

    /// Called under the context lock once the driver accepted the command
    fn next_sequence(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn mark_completed(&self, sequence: u64) {
        self.completed.fetch_max(sequence, Ordering::AcqRel);
    }

    fn check_buffer(&self, buffer: &Buffer, operation: &'static str) -> Result<()> {
        self.ctx.ensure_same(buffer.context_ref(), operation)
    }

    /// Copy `data` to the start of `buffer`
    pub fn upload<T: Pod>(&self, buffer: &Buffer, data: &[T], mode: TransferMode) -> Result<()> {
        self.upload_at(buffer, 0, data, mode)
    }

    /// Copy `data` to `buffer` at byte `offset`.
    ///
    /// Deferred uploads copy `data` first, so the caller may reuse it
    /// immediately.
    ///
    /// # Errors
    ///
    /// `BoundsViolation` when the range exceeds the buffer, before any
    /// device work is issued.
    #[tracing::instrument(skip(self, buffer, data), fields(queue = self.id, buffer = %buffer.handle()))]
    pub fn upload_at<T: Pod>(&self, buffer: &Buffer, offset: usize, data: &[T], mode: TransferMode) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        buffer.check_range(offset, bytes.len())?;
        self.check_buffer(buffer, "upload")?;
        let ctx = self.ctx.upgrade("upload")?;

        let start = Instant::now();
        match mode {
            TransferMode::Blocking => {
                let sequence = ctx.with(|dc| {
                    dc.write_buffer(self.handle, buffer.handle(), offset, bytes)?;
                    Ok::<_, DispatchError>(self.next_sequence())
                })?;
                self.mark_completed(sequence);
            }
            TransferMode::Deferred => {
                let owned: Arc<[u8]> = Arc::from(bytes);
                ctx.with(|dc| {
                    dc.enqueue_write_buffer(self.handle, buffer.handle(), offset, owned)?;
                    Ok::<_, DispatchError>(self.next_sequence())
                })?;
            }
        }
        record_transfer(bytes.len(), TransferDirection::HostToDevice, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Blocking copy of `len` elements from the start of `buffer`
    pub fn download<T: Pod>(&self, buffer: &Buffer, len: usize) -> Result<Vec<T>> {
        self.download_at(buffer, 0, len)
    }

    /// Blocking copy of `len` elements from `buffer` at byte `offset`.
    ///
    /// Everything submitted before it completes first.
    #[tracing::instrument(skip(self, buffer), fields(queue = self.id, buffer = %buffer.handle()))]
    pub fn download_at<T: Pod>(&self, buffer: &Buffer, offset: usize, len: usize) -> Result<Vec<T>> {
        let byte_len = byte_len::<T>(len)?;
        buffer.check_range(offset, byte_len)?;
        self.check_buffer(buffer, "download")?;
        let ctx = self.ctx.upgrade("download")?;

        let start = Instant::now();
        let mut out = vec![T::zeroed(); len];
        let sequence = ctx.with(|dc| {
            dc.read_buffer(self.handle, buffer.handle(), offset, bytemuck::cast_slice_mut(&mut out))?;
            Ok::<_, DispatchError>(self.next_sequence())
        })?;
        self.mark_completed(sequence);
        record_transfer(byte_len, TransferDirection::DeviceToHost, start.elapsed().as_micros() as u64);
        Ok(out)
    }

    /// Enqueue a copy of `len` elements from the start of `buffer`; redeem
    /// the ticket with a barrier from a later [`CommandQueue::drain`]
    #[tracing::instrument(skip(self, buffer), fields(queue = self.id, buffer = %buffer.handle()))]
    pub fn download_deferred<T: Pod>(&self, buffer: &Buffer, len: usize) -> Result<PendingRead<T>> {
        let byte_len = byte_len::<T>(len)?;
        buffer.check_range(0, byte_len)?;
        self.check_buffer(buffer, "download")?;
        let ctx = self.ctx.upgrade("download")?;

        let slot = ReadSlot::new(byte_len);
        let sequence = ctx.with(|dc| {
            dc.enqueue_read_buffer(self.handle, buffer.handle(), 0, Arc::clone(&slot))?;
            Ok::<_, DispatchError>(self.next_sequence())
        })?;
        Ok(PendingRead {
            queue: self.id,
            sequence,
            len,
            slot,
            _marker: PhantomData,
        })
    }

    /// Launch `kernel` over `space`.
    ///
    /// The launch is validated in full before anything reaches the device;
    /// a rejected submission leaves [`QueueStats`] unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidIndexSpace`, `DimensionMismatch`, `UnboundArgument`,
    /// `ContextMismatch` or `ContextRequired`.
    #[tracing::instrument(skip(self, kernel, space), fields(queue = self.id, kernel = kernel.name(), space = %space))]
    pub fn submit(&self, kernel: &Kernel, space: IndexSpace) -> Result<()> {
        kernel.validate_launch(&space)?;
        self.ctx.ensure_same(kernel.context_ref(), "submit")?;
        let ctx = self.ctx.upgrade("submit")?;

        let global = space.global_work_size();
        let _span = perf_span!("kernel_submit", kernel = kernel.name(), work_items = space.work_items());
        let start = Instant::now();
        ctx.with(|dc| {
            dc.enqueue_kernel(self.handle, kernel.handle(), &global)?;
            Ok::<_, DispatchError>(self.next_sequence())
        })?;
        self.launches.fetch_add(1, Ordering::AcqRel);
        record_launch(
            kernel.name(),
            space.work_items(),
            space.dims(),
            start.elapsed().as_micros() as u64,
        );
        Ok(())
    }

    /// Block until every submitted command has completed
    #[tracing::instrument(skip(self), fields(queue = self.id))]
    pub fn drain(&self) -> Result<Barrier> {
        let ctx = self.ctx.upgrade("drain")?;
        let sequence = self.submitted.load(Ordering::Acquire);
        ctx.with(|dc| dc.finish(self.handle))?;
        self.mark_completed(sequence);
        tracing::debug!(sequence, "queue drained");
        Ok(Barrier {
            queue: self.id,
            sequence,
        })
    }
}

fn byte_len<T: Pod>(len: usize) -> Result<usize> {
    len.checked_mul(std::mem::size_of::<T>()).ok_or(DispatchError::BoundsViolation {
        offset: 0,
        size: usize::MAX,
        buffer_size: 0,
    })
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Ok(ctx) = self.ctx.upgrade("queue release") {
            if let Err(err) = ctx.with(|dc| dc.free_queue(self.handle)) {
                tracing::warn!(queue = self.id, error = %err, "failed to release command queue");
            }
        }
    }
}
