//! Kernel source loading

use std::fs;
use std::path::Path;

/// `simple_add`: element-wise `int` vector sum
pub const VECTOR_ADD_SOURCE: &str = include_str!("../kernels/vector_add_kernel.cl");

/// `matrixMul`: naive dense `float` product, 2-D index space
pub const MATRIX_MUL_SOURCE: &str = include_str!("../kernels/matrixMul.cl");

/// Read a kernel source file.
///
/// Any failure (missing file, unreadable, not UTF-8) yields an empty string;
/// building an empty source then fails with a diagnostic, so the problem
/// surfaces at the build step with a log.
pub fn load_kernel_source(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(source) => {
            tracing::debug!(path = %path.display(), bytes = source.len(), "kernel source loaded");
            source
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read kernel source");
            String::new()
        }
    }
}
