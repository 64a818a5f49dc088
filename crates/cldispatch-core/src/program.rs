//! Program builder: compile kernel source and extract entry points

use crate::context::{Context, ContextRef};
use crate::driver::{DeviceContext, ProgramHandle};
use crate::error::{DispatchError, Result};
use crate::kernel::Kernel;
use crate::registry::Device;
use crate::source::{parse_kernels, Diagnostics, KernelSignature};
use cldispatch_tracing::performance::record_build;
use std::time::Instant;

/// A compiled program owned by one context
#[derive(Debug)]
pub struct Program {
    ctx: ContextRef,
    handle: ProgramHandle,
    kernels: Vec<KernelSignature>,
    options: String,
}

impl Program {
    /// Compile `source` for `device` within `ctx`
    pub fn build(ctx: &Context, source: &str, device: &Device) -> Result<Self> {
        Self::build_with_options(ctx, source, device, "")
    }

    /// Compile with driver build options (e.g. `-cl-fast-relaxed-math`).
    ///
    /// # Errors
    ///
    /// - `ContextMismatch` if `device` is not the context's device
    /// - `BuildFailed` with a non-empty log for empty or malformed source,
    ///   or when the driver's compiler rejects it
    #[tracing::instrument(skip(ctx, source, device), fields(context = ctx.id(), bytes = source.len()))]
    pub fn build_with_options(ctx: &Context, source: &str, device: &Device, options: &str) -> Result<Self> {
        if device.id() != ctx.device().id() {
            return Err(DispatchError::ContextMismatch {
                operation: "program build",
            });
        }

        let start = Instant::now();
        let outcome = Self::compile(ctx, source, options);
        let elapsed_us = start.elapsed().as_micros() as u64;

        match &outcome {
            Ok(program) => {
                record_build(program.kernels.len(), source.len(), true, elapsed_us);
                tracing::info!(kernels = ?program.kernel_names(), "program built");
            }
            Err(err) => {
                record_build(0, source.len(), false, elapsed_us);
                tracing::warn!(error = %err, "program build failed");
            }
        }
        outcome
    }

    fn compile(ctx: &Context, source: &str, options: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(DispatchError::build_failed("error: kernel source is empty"));
        }
        let (handle, kernels) = ctx.shared().with(|dc| match parse_kernels(source) {
            Ok(kernels) => Ok((dc.build_program(source, options, &kernels)?, kernels)),
            Err(diagnostics) => build_introspected(dc, source, options, &diagnostics),
        })?;

        Ok(Self {
            ctx: ctx.downgrade(),
            handle,
            kernels,
            options: options.to_string(),
        })
    }

    /// Entry point names in declaration order
    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.iter().map(|k| k.name.as_str()).collect()
    }

    /// Signature of the named entry point
    pub fn signature(&self, name: &str) -> Option<&KernelSignature> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// Extract the named entry point as a fresh kernel object
    ///
    /// # Errors
    ///
    /// `KernelNotFound` if no entry point has that name.
    #[tracing::instrument(skip(self), fields(program = %self.handle))]
    pub fn extract_kernel(&self, name: &str) -> Result<Kernel> {
        let signature = self.signature(name).cloned().ok_or_else(|| DispatchError::KernelNotFound {
            name: name.to_string(),
            available: self.kernel_names().into_iter().map(str::to_string).collect(),
        })?;
        let ctx = self.ctx.upgrade("kernel extraction")?;
        let handle = ctx.with(|dc| dc.create_kernel(self.handle, name))?;
        tracing::debug!(kernel = name, arity = signature.arity(), dims = signature.dimensions, "kernel extracted");
        Ok(Kernel::new(self.ctx.clone(), handle, signature))
    }
}

/// Build source the analyser rejected, trusting the driver's compiler and
/// reading the entry points back from it
fn build_introspected(
    dc: &mut dyn DeviceContext,
    source: &str,
    options: &str,
    diagnostics: &Diagnostics,
) -> Result<(ProgramHandle, Vec<KernelSignature>)> {
    if !dc.introspects_kernels() {
        return Err(DispatchError::build_failed(diagnostics.to_log()));
    }

    let options = format!("{options} -cl-kernel-arg-info");
    let handle = dc.build_program(source, options.trim_start(), &[])?;
    match dc.kernel_signatures(handle) {
        Ok(kernels) if !kernels.is_empty() => {
            tracing::warn!(
                analysis = %diagnostics.to_log(),
                "source analysis failed, using kernel signatures reported by the driver"
            );
            Ok((handle, kernels))
        }
        outcome => {
            if let Err(err) = dc.free_program(handle) {
                tracing::warn!(program = %handle, error = %err, "failed to release program");
            }
            match outcome {
                Err(err) => Err(err),
                Ok(_) => Err(DispatchError::build_failed(diagnostics.to_log())),
            }
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Ok(ctx) = self.ctx.upgrade("program release") {
            if let Err(err) = ctx.with(|dc| dc.free_program(self.handle)) {
                tracing::warn!(program = %self.handle, error = %err, "failed to release program");
            }
        }
    }
}
