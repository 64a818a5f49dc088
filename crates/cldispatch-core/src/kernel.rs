//! Kernel objects, argument binding and index spaces

use crate::buffer::Buffer;
use crate::context::ContextRef;
use crate::driver::{ArgValue, KernelHandle};
use crate::error::{DispatchError, Result};
use crate::source::{KernelSignature, ParamKind, ScalarType};
use std::fmt;

/// Shape of a launch: one work-item per index point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSpace {
    /// `n` work-items along one axis
    D1(usize),
    /// A `rows x cols` grid
    D2 { rows: usize, cols: usize },
}

impl IndexSpace {
    pub const fn linear(n: usize) -> Self {
        IndexSpace::D1(n)
    }

    pub const fn grid(rows: usize, cols: usize) -> Self {
        IndexSpace::D2 { rows, cols }
    }

    /// Number of dimensions
    pub const fn dims(&self) -> usize {
        match self {
            IndexSpace::D1(_) => 1,
            IndexSpace::D2 { .. } => 2,
        }
    }

    /// Total work-items
    pub fn work_items(&self) -> usize {
        match *self {
            IndexSpace::D1(n) => n,
            IndexSpace::D2 { rows, cols } => rows.saturating_mul(cols),
        }
    }

    /// Global size per dimension as handed to the driver.
    ///
    /// Dimension 0 is the column, dimension 1 the row.
    pub fn global_work_size(&self) -> Vec<usize> {
        match *self {
            IndexSpace::D1(n) => vec![n],
            IndexSpace::D2 { rows, cols } => vec![cols, rows],
        }
    }

    /// Fail with `InvalidIndexSpace` on any zero extent
    pub fn validate(&self) -> Result<()> {
        let zero = match *self {
            IndexSpace::D1(n) => n == 0,
            IndexSpace::D2 { rows, cols } => rows == 0 || cols == 0,
        };
        if zero {
            return Err(DispatchError::InvalidIndexSpace(format!("{self} has no work-items")));
        }
        if rows_cols_overflow(self) {
            return Err(DispatchError::InvalidIndexSpace(format!("{self} overflows usize")));
        }
        Ok(())
    }
}

fn rows_cols_overflow(space: &IndexSpace) -> bool {
    match *space {
        IndexSpace::D1(_) => false,
        IndexSpace::D2 { rows, cols } => rows.checked_mul(cols).is_none(),
    }
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSpace::D1(n) => write!(f, "1-D[{n}]"),
            IndexSpace::D2 { rows, cols } => write!(f, "2-D[{rows}x{cols}]"),
        }
    }
}

/// A by-value kernel argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Native-endian bytes as the device expects them
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Scalar::I8(v) => v.to_ne_bytes().to_vec(),
            Scalar::U8(v) => v.to_ne_bytes().to_vec(),
            Scalar::I16(v) => v.to_ne_bytes().to_vec(),
            Scalar::U16(v) => v.to_ne_bytes().to_vec(),
            Scalar::I32(v) => v.to_ne_bytes().to_vec(),
            Scalar::U32(v) => v.to_ne_bytes().to_vec(),
            Scalar::I64(v) => v.to_ne_bytes().to_vec(),
            Scalar::U64(v) => v.to_ne_bytes().to_vec(),
            Scalar::F32(v) => v.to_ne_bytes().to_vec(),
            Scalar::F64(v) => v.to_ne_bytes().to_vec(),
        }
    }

    pub const fn size(&self) -> usize {
        match self {
            Scalar::I8(_) | Scalar::U8(_) => 1,
            Scalar::I16(_) | Scalar::U16(_) => 2,
            Scalar::I32(_) | Scalar::U32(_) | Scalar::F32(_) => 4,
            Scalar::I64(_) | Scalar::U64(_) | Scalar::F64(_) => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Scalar::F32(_) | Scalar::F64(_))
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Scalar::I8(_) => "i8",
            Scalar::U8(_) => "u8",
            Scalar::I16(_) => "i16",
            Scalar::U16(_) => "u16",
            Scalar::I32(_) => "i32",
            Scalar::U32(_) => "u32",
            Scalar::I64(_) => "i64",
            Scalar::U64(_) => "u64",
            Scalar::F32(_) => "f32",
            Scalar::F64(_) => "f64",
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(value: $ty) -> Self {
                    Scalar::$variant(value)
                }
            }

            impl From<$ty> for KernelArg<'_> {
                fn from(value: $ty) -> Self {
                    KernelArg::Scalar(Scalar::$variant(value))
                }
            }
        )*
    };
}

/// Value for one kernel argument slot
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(&'a Buffer),
    Scalar(Scalar),
}

scalar_from!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32,
    u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);

impl<'a> From<&'a Buffer> for KernelArg<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        KernelArg::Buffer(buffer)
    }
}

impl From<Scalar> for KernelArg<'_> {
    fn from(value: Scalar) -> Self {
        KernelArg::Scalar(value)
    }
}

/// One extracted entry point with its argument slots
#[derive(Debug)]
pub struct Kernel {
    ctx: ContextRef,
    handle: KernelHandle,
    signature: KernelSignature,
    bound: Vec<bool>,
}

impl Kernel {
    pub(crate) fn new(ctx: ContextRef, handle: KernelHandle, signature: KernelSignature) -> Self {
        let bound = vec![false; signature.arity()];
        Self {
            ctx,
            handle,
            signature,
            bound,
        }
    }

    pub fn name(&self) -> &str {
        &self.signature.name
    }

    /// Number of argument slots
    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    /// Index-space dimensionality the kernel expects; 0 when unknown
    pub fn dimensions(&self) -> usize {
        self.signature.dimensions
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    /// Whether slot `position` has been bound
    pub fn is_bound(&self, position: usize) -> bool {
        self.bound.get(position).copied().unwrap_or(false)
    }

    pub(crate) fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub(crate) fn context_ref(&self) -> &ContextRef {
        &self.ctx
    }

    /// Bind `arg` to slot `position`.
    ///
    /// Rebinding a slot replaces the previous value; launches already
    /// submitted keep the arguments they were submitted with.
    ///
    /// # Errors
    ///
    /// - `InvalidArgumentPosition` when `position >= arity`
    /// - `TypeMismatch` when a buffer is given to a scalar slot, a scalar to
    ///   a buffer slot, or a scalar of the wrong byte size
    /// - `ContextMismatch` when the buffer belongs to another context
    /// - `ContextRequired` after the context was released
    pub fn set_arg<'a>(&mut self, position: usize, arg: impl Into<KernelArg<'a>>) -> Result<()> {
        let arg = arg.into();
        let param = self
            .signature
            .params
            .get(position)
            .ok_or_else(|| DispatchError::InvalidArgumentPosition {
                kernel: self.signature.name.clone(),
                position,
                arity: self.signature.arity(),
            })?;
        let site = || format!("{} argument {position} ('{}')", self.signature.name, param.name);

        let value = match (param.kind, arg) {
            (ParamKind::Buffer { .. }, KernelArg::Buffer(buffer)) => {
                self.ctx.ensure_same(buffer.context_ref(), "kernel argument binding")?;
                ArgValue::Buffer(buffer.handle())
            }
            (ParamKind::Buffer { .. }, KernelArg::Scalar(scalar)) => {
                return Err(DispatchError::type_mismatch(site(), param.kind, scalar.type_name()));
            }
            (ParamKind::Scalar(ty), KernelArg::Buffer(_)) => {
                return Err(DispatchError::type_mismatch(site(), ty, "buffer"));
            }
            (ParamKind::Scalar(ty), KernelArg::Scalar(scalar)) => {
                check_scalar(ty, &scalar, site)?;
                ArgValue::Scalar(scalar.to_bytes())
            }
            (ParamKind::Opaque, KernelArg::Buffer(_)) => {
                return Err(DispatchError::type_mismatch(site(), param.kind, "buffer"));
            }
            (ParamKind::Opaque, KernelArg::Scalar(scalar)) => ArgValue::Scalar(scalar.to_bytes()),
        };

        let ctx = self.ctx.upgrade("kernel argument binding")?;
        ctx.with(|dc| dc.set_kernel_arg(self.handle, position, &value))?;
        self.bound[position] = true;
        tracing::trace!(kernel = %self.signature.name, position, "argument bound");
        Ok(())
    }

    /// Check that a launch over `space` may be issued
    pub(crate) fn validate_launch(&self, space: &IndexSpace) -> Result<()> {
        space.validate()?;
        let expected = self.signature.dimensions;
        if expected != 0 && space.dims() != expected {
            return Err(DispatchError::DimensionMismatch {
                kernel: self.signature.name.clone(),
                expected: self.signature.dimensions,
                actual: space.dims(),
            });
        }
        if let Some(position) = self.bound.iter().position(|bound| !bound) {
            return Err(DispatchError::UnboundArgument {
                kernel: self.signature.name.clone(),
                position,
            });
        }
        Ok(())
    }
}

fn check_scalar(expected: ScalarType, scalar: &Scalar, site: impl Fn() -> String) -> Result<()> {
    if expected.size() != scalar.size() {
        return Err(DispatchError::type_mismatch(site(), expected, scalar.type_name()));
    }
    if expected.is_float() != scalar.is_float() {
        tracing::warn!(
            site = %site(),
            expected = %expected,
            actual = scalar.type_name(),
            "scalar argument has matching size but different numeric class"
        );
    }
    Ok(())
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Ok(ctx) = self.ctx.upgrade("kernel release") {
            if let Err(err) = ctx.with(|dc| dc.free_kernel(self.handle)) {
                tracing::warn!(kernel = %self.handle, error = %err, "failed to release kernel");
            }
        }
    }
}
