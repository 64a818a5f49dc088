//! Dispatch sessions and the reference pipelines
//!
//! A [`Session`] runs the full setup sequence (registry, platform, device,
//! context, queue) from a [`DispatchConfig`] and offers the two reference
//! pipelines: element-wise vector addition and dense matrix multiplication.

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{AccessMode, Driver};
use crate::drivers::HostDriver;
use crate::error::{DispatchError, Result};
use crate::kernel::IndexSpace;
use crate::program::Program;
use crate::queue::{CommandQueue, TransferMode};
use crate::registry::{select_device, select_platform, Device, DeviceRegistry, Platform};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Environment variable holding the platform index
pub const ENV_PLATFORM: &str = "CLDISPATCH_PLATFORM";
/// Environment variable holding the device index
pub const ENV_DEVICE: &str = "CLDISPATCH_DEVICE";
/// Environment variable holding driver build options
pub const ENV_BUILD_OPTIONS: &str = "CLDISPATCH_BUILD_OPTIONS";

/// Which platform and device to use, and how to build programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub platform_index: usize,
    pub device_index: usize,
    /// Passed verbatim to the driver's compiler
    pub build_options: String,
    /// Entry point used by [`Session::vector_add`]
    pub vector_add_kernel: String,
    /// Entry point used by [`Session::matmul`]
    pub matmul_kernel: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            platform_index: 0,
            device_index: 0,
            build_options: String::new(),
            vector_add_kernel: "simple_add".to_string(),
            matmul_kernel: "matrixMul".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `CLDISPATCH_PLATFORM`, `CLDISPATCH_DEVICE`
    /// and `CLDISPATCH_BUILD_OPTIONS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(index) = env_index(ENV_PLATFORM)? {
            config.platform_index = index;
        }
        if let Some(index) = env_index(ENV_DEVICE)? {
            config.device_index = index;
        }
        if let Ok(options) = env::var(ENV_BUILD_OPTIONS) {
            config.build_options = options;
        }
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DispatchError::InvalidConfig(e.to_string()))
    }

    pub fn with_device(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn with_platform(mut self, index: usize) -> Self {
        self.platform_index = index;
        self
    }
}

fn env_index(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DispatchError::InvalidConfig(format!("{key}={value:?} is not a valid index"))),
        Err(_) => Ok(None),
    }
}

/// Dense row-major `f32` matrix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Wrap `data` as a `rows x cols` matrix
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        let expected = element_count(rows, cols)?;
        if data.len() != expected {
            return Err(DispatchError::ShapeMismatch(format!(
                "{rows}x{cols} matrix needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// `ShapeMismatch` when `rows * cols` overflows
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; element_count(rows, cols)?],
        })
    }

    pub fn identity(n: usize) -> Result<Self> {
        let mut m = Self::zeros(n, n)?;
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col).copied()
        } else {
            None
        }
    }
}

fn element_count(rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols)
        .ok_or_else(|| DispatchError::ShapeMismatch(format!("{rows}x{cols} overflows usize")))
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.data.chunks(self.cols.max(1)) {
            let line: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
            writeln!(f, "{}", line.join(" "))?;
        }
        Ok(())
    }
}

/// An open dispatch session on one device
pub struct Session {
    // drop order: queue before context
    queue: CommandQueue,
    context: Context,
    platform: Platform,
    device: Device,
    config: DispatchConfig,
}

impl Session {
    /// Select platform and device, then open a context and queue
    ///
    /// # Errors
    ///
    /// `NoPlatformFound`, `NoDeviceFound`, `InvalidSelection` or a driver
    /// error from context/queue creation.
    #[tracing::instrument(skip(driver), fields(driver = driver.name()))]
    pub fn open(driver: impl Driver + 'static, config: &DispatchConfig) -> Result<Self> {
        let registry = DeviceRegistry::new(driver);
        Self::open_with(&registry, config)
    }

    /// Open on the host reference driver
    pub fn open_host(config: &DispatchConfig) -> Result<Self> {
        Self::open(HostDriver::new(), config)
    }

    /// Open on OpenCL when a platform is present, else on the host driver
    #[cfg(feature = "opencl")]
    pub fn open_preferred(config: &DispatchConfig) -> Result<Self> {
        if crate::drivers::OpenClDriver::is_available() {
            return Self::open(crate::drivers::OpenClDriver::new()?, config);
        }
        tracing::info!("no OpenCL platform present, falling back to the host driver");
        Self::open_host(config)
    }

    /// Open on the host driver (built without the `opencl` feature)
    #[cfg(not(feature = "opencl"))]
    pub fn open_preferred(config: &DispatchConfig) -> Result<Self> {
        Self::open_host(config)
    }

    /// Open using an existing registry
    pub fn open_with(registry: &DeviceRegistry, config: &DispatchConfig) -> Result<Self> {
        let platform = select_platform(&registry.list_platforms()?, config.platform_index)?;
        let device = select_device(&registry.list_devices(&platform)?, config.device_index)?;
        tracing::info!(platform = platform.name(), device = device.name(), "using device");

        let context = Context::new(&device)?;
        let queue = CommandQueue::new(&context)?;
        Ok(Self {
            queue,
            context,
            platform,
            device,
            config: config.clone(),
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build `source` with the configured options
    pub fn build(&self, source: &str) -> Result<Program> {
        Program::build_with_options(&self.context, source, &self.device, &self.config.build_options)
    }

    /// `C[i] = A[i] + B[i]` on the device
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` unless both inputs are non-empty and of equal length.
    #[tracing::instrument(skip(self, source, a, b), fields(len = a.len()))]
    pub fn vector_add(&self, source: &str, a: &[i32], b: &[i32]) -> Result<Vec<i32>> {
        if a.len() != b.len() {
            return Err(DispatchError::ShapeMismatch(format!(
                "vector lengths differ: {} vs {}",
                a.len(),
                b.len()
            )));
        }
        if a.is_empty() {
            return Err(DispatchError::ShapeMismatch("vectors are empty".to_string()));
        }

        let program = self.build(source)?;
        let mut kernel = program.extract_kernel(&self.config.vector_add_kernel)?;

        let buffer_a = Buffer::allocate_for::<i32>(&self.context, a.len(), AccessMode::ReadOnly)?;
        let buffer_b = Buffer::allocate_for::<i32>(&self.context, b.len(), AccessMode::ReadOnly)?;
        let buffer_c = Buffer::allocate_for::<i32>(&self.context, a.len(), AccessMode::WriteOnly)?;

        self.queue.upload(&buffer_a, a, TransferMode::Blocking)?;
        self.queue.upload(&buffer_b, b, TransferMode::Blocking)?;

        kernel.set_arg(0, &buffer_a)?;
        kernel.set_arg(1, &buffer_b)?;
        kernel.set_arg(2, &buffer_c)?;

        self.queue.submit(&kernel, IndexSpace::linear(a.len()))?;
        self.queue.drain()?;
        self.queue.download(&buffer_c, a.len())
    }

    /// `C = A x B` on the device
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `a.cols() != b.rows()`, either operand is empty,
    /// or a width does not fit the kernel's `int` parameters. Nothing is
    /// allocated before these checks pass.
    #[tracing::instrument(skip(self, source, a, b), fields(rows = a.rows, inner = a.cols, cols = b.cols))]
    pub fn matmul(&self, source: &str, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        if a.cols != b.rows {
            return Err(DispatchError::ShapeMismatch(format!(
                "inner dimensions differ: {}x{} times {}x{}",
                a.rows, a.cols, b.rows, b.cols
            )));
        }
        if a.data.is_empty() || b.data.is_empty() {
            return Err(DispatchError::ShapeMismatch("matrices are empty".to_string()));
        }
        let width_a = kernel_width(a.cols)?;
        let width_b = kernel_width(b.cols)?;
        let (rows, cols) = (a.rows, b.cols);

        let program = self.build(source)?;
        let mut kernel = program.extract_kernel(&self.config.matmul_kernel)?;

        let buffer_a = Buffer::allocate_for::<f32>(&self.context, a.data.len(), AccessMode::ReadOnly)?;
        let buffer_b = Buffer::allocate_for::<f32>(&self.context, b.data.len(), AccessMode::ReadOnly)?;
        let buffer_c = Buffer::allocate_for::<f32>(&self.context, rows * cols, AccessMode::WriteOnly)?;

        self.queue.upload(&buffer_a, &a.data, TransferMode::Blocking)?;
        self.queue.upload(&buffer_b, &b.data, TransferMode::Blocking)?;

        kernel.set_arg(0, &buffer_c)?;
        kernel.set_arg(1, &buffer_a)?;
        kernel.set_arg(2, &buffer_b)?;
        kernel.set_arg(3, width_a)?;
        kernel.set_arg(4, width_b)?;

        self.queue.submit(&kernel, IndexSpace::grid(rows, cols))?;
        let pending = self.queue.download_deferred::<f32>(&buffer_c, rows * cols)?;
        let barrier = self.queue.drain()?;
        Matrix::new(rows, cols, pending.wait(&barrier)?)
    }

    /// Drain outstanding work and release the context
    pub fn close(self) -> Result<()> {
        let Session { queue, context, .. } = self;
        let drained = queue.drain().map(|_| ());
        drop(queue);
        context.release();
        drained
    }
}

fn kernel_width(width: usize) -> Result<i32> {
    i32::try_from(width).map_err(|_| DispatchError::ShapeMismatch(format!("width {width} exceeds the kernel's int range")))
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("platform", &self.platform.name())
            .field("device", &self.device.name())
            .field("context", &self.context.id())
            .field("queue", &self.queue.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{MATRIX_MUL_SOURCE, VECTOR_ADD_SOURCE};
    use serial_test::serial;

    #[test]
    fn test_config_from_json_defaults_missing_fields() {
        let config = DispatchConfig::from_json_str(r#"{ "device_index": 1 }"#).unwrap();
        assert_eq!(config.device_index, 1);
        assert_eq!(config.platform_index, 0);
        assert_eq!(config.vector_add_kernel, "simple_add");
    }

    #[test]
    fn test_config_from_bad_json() {
        assert!(matches!(
            DispatchConfig::from_json_str("{ not json"),
            Err(DispatchError::InvalidConfig(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var(ENV_DEVICE, "1");
        env::set_var(ENV_BUILD_OPTIONS, "-cl-mad-enable");
        env::remove_var(ENV_PLATFORM);

        let config = DispatchConfig::from_env().unwrap();
        assert_eq!(config.device_index, 1);
        assert_eq!(config.platform_index, 0);
        assert_eq!(config.build_options, "-cl-mad-enable");

        env::set_var(ENV_PLATFORM, "first");
        assert!(matches!(DispatchConfig::from_env(), Err(DispatchError::InvalidConfig(_))));

        env::remove_var(ENV_DEVICE);
        env::remove_var(ENV_PLATFORM);
        env::remove_var(ENV_BUILD_OPTIONS);
    }

    #[test]
    fn test_matrix_shape_checked() {
        assert!(Matrix::new(2, 2, vec![1.0; 4]).is_ok());
        assert!(matches!(
            Matrix::new(2, 3, vec![1.0; 4]),
            Err(DispatchError::ShapeMismatch(_))
        ));
        let eye = Matrix::identity(3).unwrap();
        assert_eq!(eye.get(1, 1), Some(1.0));
        assert_eq!(eye.get(1, 2), Some(0.0));
        assert_eq!(eye.get(3, 0), None);
    }

    #[test]
    fn test_matrix_constructors_reject_overflow() {
        assert!(matches!(
            Matrix::zeros(usize::MAX, 2),
            Err(DispatchError::ShapeMismatch(_))
        ));
        assert!(matches!(Matrix::identity(usize::MAX), Err(DispatchError::ShapeMismatch(_))));
        assert_eq!(Matrix::zeros(0, 5).unwrap().data().len(), 0);
    }

    #[test]
    fn test_session_vector_add() {
        let session = Session::open_host(&DispatchConfig::default()).unwrap();
        let out = session.vector_add(VECTOR_ADD_SOURCE, &[1, 2, 3], &[4, 5, 6]).unwrap();
        assert_eq!(out, vec![5, 7, 9]);
        session.close().unwrap();
    }

    #[test]
    fn test_session_vector_add_length_mismatch() {
        let session = Session::open_host(&DispatchConfig::default()).unwrap();
        assert!(matches!(
            session.vector_add(VECTOR_ADD_SOURCE, &[1, 2], &[1]),
            Err(DispatchError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_session_matmul_rejects_inner_mismatch_before_allocation() {
        let session = Session::open_host(&DispatchConfig::default()).unwrap();
        let a = Matrix::zeros(2, 3).unwrap();
        let b = Matrix::zeros(2, 2).unwrap();
        assert!(matches!(
            session.matmul(MATRIX_MUL_SOURCE, &a, &b),
            Err(DispatchError::ShapeMismatch(_))
        ));
        assert_eq!(session.queue().stats().submitted, 0);
    }

    #[test]
    fn test_session_matmul_on_accelerator() {
        let session = Session::open_host(&DispatchConfig::default().with_device(1)).unwrap();
        let a = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Matrix::new(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = session.matmul(MATRIX_MUL_SOURCE, &a, &b).unwrap();
        assert_eq!((c.rows(), c.cols()), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_open_invalid_device() {
        let err = Session::open_host(&DispatchConfig::default().with_device(9)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSelection { what: "device", .. }));
    }
}
