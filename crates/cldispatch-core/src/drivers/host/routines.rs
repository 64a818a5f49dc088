//! Host routines standing in for compiled kernels
//!
//! A routine is invoked once per work-item with the item's global id and an
//! [`ArgFrame`] giving typed access to the bound arguments.

use super::memory::{checked_range, MemoryManager};
use crate::driver::ArgValue;
use crate::error::{DispatchError, Result};
use bytemuck::Pod;
use std::collections::HashMap;
use std::sync::Arc;

/// Position of one work-item in the launch grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global_id: [usize; 3],
    pub global_size: [usize; 3],
    pub dims: usize,
}

/// Typed view of a launch's arguments
pub struct ArgFrame<'a> {
    kernel: &'a str,
    args: &'a [ArgValue],
    memory: &'a mut MemoryManager,
}

impl<'a> ArgFrame<'a> {
    pub(crate) fn new(kernel: &'a str, args: &'a [ArgValue], memory: &'a mut MemoryManager) -> Self {
        Self { kernel, args, memory }
    }

    fn arg(&self, position: usize) -> Result<&'a ArgValue> {
        self.args.get(position).ok_or_else(|| DispatchError::InvalidArgumentPosition {
            kernel: self.kernel.to_string(),
            position,
            arity: self.args.len(),
        })
    }

    fn buffer_arg(&self, position: usize) -> Result<crate::driver::BufferHandle> {
        match self.arg(position)? {
            ArgValue::Buffer(handle) => Ok(*handle),
            ArgValue::Scalar(_) => Err(DispatchError::type_mismatch(
                format!("{} argument {position}", self.kernel),
                "buffer",
                "scalar",
            )),
        }
    }

    /// Read element `index` of the buffer bound at `position`
    pub fn load<T: Pod>(&self, position: usize, index: usize) -> Result<T> {
        let handle = self.buffer_arg(position)?;
        let bytes = self.memory.buffer(handle)?;
        let size = std::mem::size_of::<T>();
        let range = checked_range(index.saturating_mul(size), size, bytes.len())?;
        Ok(bytemuck::pod_read_unaligned(&bytes[range]))
    }

    /// Write element `index` of the buffer bound at `position`
    pub fn store<T: Pod>(&mut self, position: usize, index: usize, value: T) -> Result<()> {
        let handle = self.buffer_arg(position)?;
        let bytes = self.memory.buffer_mut(handle)?;
        let size = std::mem::size_of::<T>();
        let range = checked_range(index.saturating_mul(size), size, bytes.len())?;
        bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Read the scalar bound at `position`
    pub fn scalar<T: Pod>(&self, position: usize) -> Result<T> {
        match self.arg(position)? {
            ArgValue::Scalar(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            ArgValue::Scalar(bytes) => Err(DispatchError::type_mismatch(
                format!("{} argument {position}", self.kernel),
                format!("{} bytes", std::mem::size_of::<T>()),
                format!("{} bytes", bytes.len()),
            )),
            ArgValue::Buffer(_) => Err(DispatchError::type_mismatch(
                format!("{} argument {position}", self.kernel),
                "scalar",
                "buffer",
            )),
        }
    }
}

/// Host implementation of one kernel entry point
pub type HostRoutine = Arc<dyn Fn(&WorkItem, &mut ArgFrame<'_>) -> Result<()> + Send + Sync>;

/// Routines by kernel name
#[derive(Clone, Default)]
pub struct RoutineTable {
    routines: HashMap<String, HostRoutine>,
}

impl RoutineTable {
    /// Table holding the built-in routines
    pub fn with_builtins() -> Self {
        let mut table = Self::default();
        table.insert("simple_add", Arc::new(simple_add));
        table.insert("matrixMul", Arc::new(matrix_mul));
        table
    }

    pub fn insert(&mut self, name: impl Into<String>, routine: HostRoutine) {
        self.routines.insert(name.into(), routine);
    }

    pub fn get(&self, name: &str) -> Option<HostRoutine> {
        self.routines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }
}

impl std::fmt::Debug for RoutineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.routines.keys().collect();
        names.sort();
        f.debug_struct("RoutineTable").field("routines", &names).finish()
    }
}

/// Run `routine` over every work-item of `global`, x fastest
pub(crate) fn execute(
    kernel: &str,
    routine: &HostRoutine,
    args: &[ArgValue],
    global: &[usize],
    memory: &mut MemoryManager,
) -> Result<()> {
    let mut global_size = [1usize; 3];
    for (slot, &extent) in global_size.iter_mut().zip(global) {
        *slot = extent;
    }

    let mut frame = ArgFrame::new(kernel, args, memory);
    for z in 0..global_size[2] {
        for y in 0..global_size[1] {
            for x in 0..global_size[0] {
                let item = WorkItem {
                    global_id: [x, y, z],
                    global_size,
                    dims: global.len(),
                };
                routine(&item, &mut frame)?;
            }
        }
    }
    Ok(())
}

/// `C[i] = A[i] + B[i]` over `int`
fn simple_add(item: &WorkItem, frame: &mut ArgFrame<'_>) -> Result<()> {
    let i = item.global_id[0];
    let a: i32 = frame.load(0, i)?;
    let b: i32 = frame.load(1, i)?;
    frame.store(2, i, a.wrapping_add(b))
}

fn width(frame: &ArgFrame<'_>, position: usize) -> Result<usize> {
    let value: i32 = frame.scalar(position)?;
    usize::try_from(value).map_err(|_| DispatchError::driver("enqueue_kernel", format!("negative width {value}")))
}

/// `C[row, col] = sum_k A[row, k] * B[k, col]` over `float`,
/// arguments `(C, A, B, wA, wB)`
fn matrix_mul(item: &WorkItem, frame: &mut ArgFrame<'_>) -> Result<()> {
    let col = item.global_id[0];
    let row = item.global_id[1];
    let wa = width(frame, 3)?;
    let wb = width(frame, 4)?;

    let mut acc = 0.0f32;
    for k in 0..wa {
        let a: f32 = frame.load(1, row * wa + k)?;
        let b: f32 = frame.load(2, k * wb + col)?;
        acc += a * b;
    }
    frame.store(0, row * wb + col, acc)
}
