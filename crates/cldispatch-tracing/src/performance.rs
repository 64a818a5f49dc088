//! Performance-focused tracing utilities
//!
//! Timing spans and standardised events for the three costly things a dispatch
//! session does: moving bytes across the host/device boundary, building
//! programs, and launching kernels.
//!
//! ## Example
//!
//! ```rust
//! use cldispatch_tracing::performance::{record_transfer, PerformanceSpan, TransferDirection};
//!
//! let span = PerformanceSpan::new("upload", Some(100));
//! // ... do work ...
//! drop(span); // Logs only if duration > 100μs
//!
//! record_transfer(4096, TransferDirection::HostToDevice, 250);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static PERF_ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX means "no threshold".
static PERF_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Toggle performance span output process-wide.
///
/// Called by [`crate::build_subscriber`]; spans created with an explicit
/// threshold keep their own threshold.
pub fn set_performance_tracing(enabled: bool, threshold_us: Option<u64>) {
    PERF_ENABLED.store(enabled, Ordering::Relaxed);
    PERF_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently emit timing events.
pub fn performance_tracing_enabled() -> bool {
    PERF_ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match PERF_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        t => Some(t),
    }
}

/// RAII guard that measures span duration and logs it on drop when the
/// duration reaches the threshold.
///
/// ```rust
/// use cldispatch_tracing::performance::PerformanceSpan;
///
/// {
///     let _span = PerformanceSpan::new("kernel_launch", Some(1000));
///     // ... operation code ...
/// } // Span logged only if duration > 1000μs
/// ```
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a new performance span; `threshold_us = None` falls back to the
    /// process-wide threshold.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a new performance span at the given level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self::adopt(span, name, threshold_us)
    }

    /// Time an existing span, typically one carrying extra fields.
    ///
    /// The completion event is emitted inside `span`, so the fields recorded
    /// on it travel with the duration.
    pub fn adopt(span: tracing::Span, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self {
            name: span_name.into(),
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// The underlying `tracing` span.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Name this span was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Elapsed time since span creation.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !performance_tracing_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

fn per_second(count: f64, duration_us: u64) -> f64 {
    if duration_us > 0 {
        (count / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    }
}

/// Which way bytes crossed the host/device boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::HostToDevice => "H2D",
            TransferDirection::DeviceToHost => "D2H",
        }
    }
}

/// Record a host/device transfer with bandwidth.
///
/// ```rust
/// use cldispatch_tracing::performance::{record_transfer, TransferDirection};
///
/// record_transfer(4096, TransferDirection::HostToDevice, 250);
/// ```
pub fn record_transfer(bytes: usize, direction: TransferDirection, duration_us: u64) {
    let bandwidth_mbps = per_second(bytes as f64, duration_us) / (1024.0 * 1024.0);

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction.as_str(),
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a kernel launch over `work_items` work-items.
///
/// ```rust
/// use cldispatch_tracing::performance::record_launch;
///
/// record_launch("simple_add", 10, 2, 35);
/// ```
pub fn record_launch(kernel: &str, work_items: usize, dims: usize, duration_us: u64) {
    tracing::debug!(
        event = "launch",
        kernel = kernel,
        work_items = work_items,
        dims = dims,
        duration_us = duration_us,
        items_per_sec = per_second(work_items as f64, duration_us),
        "kernel_launch"
    );
}

/// Record a program build outcome.
///
/// ```rust
/// use cldispatch_tracing::performance::record_build;
///
/// record_build(2, 512, true, 1200);
/// ```
pub fn record_build(kernels: usize, source_bytes: usize, success: bool, duration_us: u64) {
    tracing::debug!(
        event = "build",
        kernels = kernels,
        source_bytes = source_bytes,
        success = success,
        duration_us = duration_us,
        "program_build"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_performance_span_creation() {
        let span = PerformanceSpan::new("test_span", Some(1000));
        assert_eq!(span.name(), "test_span");
        assert_eq!(span.threshold_us, Some(1000));
    }

    #[test]
    fn test_performance_span_elapsed() {
        let span = PerformanceSpan::new("test_span", None);
        thread::sleep(Duration::from_millis(10));
        assert!(span.elapsed_us() >= 10_000, "elapsed should be at least 10ms");
    }

    #[test]
    fn test_performance_span_with_level() {
        let span = PerformanceSpan::with_level(Level::INFO, "test_span", Some(100));
        assert_eq!(span.name(), "test_span");
        assert_eq!(span.threshold_us, Some(100));
    }

    #[test]
    fn test_adopted_span_keeps_fields_span() {
        let span = tracing::debug_span!("perf", name = "submit", kernel = "simple_add");
        let perf = PerformanceSpan::adopt(span.clone(), "submit", None);
        assert_eq!(perf.name(), "submit");
        assert_eq!(perf.span().id(), span.id());
    }

    #[test]
    fn test_transfer_direction_labels() {
        assert_eq!(TransferDirection::HostToDevice.as_str(), "H2D");
        assert_eq!(TransferDirection::DeviceToHost.as_str(), "D2H");
    }

    #[test]
    fn test_record_events() {
        record_transfer(4096, TransferDirection::HostToDevice, 250);
        record_transfer(4096, TransferDirection::DeviceToHost, 0);
        record_launch("simple_add", 10, 1, 5);
        record_build(1, 128, false, 0);
    }

    #[test]
    fn test_per_second() {
        // 1 MiB in 1ms = 1000 MiB/s
        let mbps = per_second((1024 * 1024) as f64, 1000) / (1024.0 * 1024.0);
        assert!((mbps - 1000.0).abs() < 0.01);
        assert_eq!(per_second(10.0, 0), 0.0);
    }
}
