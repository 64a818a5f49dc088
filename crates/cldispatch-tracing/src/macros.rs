//! Instrumentation macros used across the dispatch layer

/// Open a timed span, optionally carrying `field = value` pairs.
///
/// Evaluates to a [`crate::performance::PerformanceSpan`]; keep it bound for
/// the duration of the measured work. Field values are plain expressions.
///
/// ```rust
/// use cldispatch_tracing::perf_span;
///
/// let _span = perf_span!("kernel_submit", kernel = "simple_add", work_items = 10);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::new($name, None)
    };
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::performance::PerformanceSpan::adopt(
            $crate::__tracing::debug_span!("perf", name = $name, $($field = $value),+),
            $name,
            None,
        )
    };
}

/// Emit a debug-level `event = name` record with extra fields.
///
/// ```rust
/// use cldispatch_tracing::perf_event;
///
/// perf_event!("buffer_allocated", size_bytes = 1024, access = "read_write");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {
        $crate::__tracing::debug!(event = $name, $($field = $value),+)
    };
}

/// Evaluate a block, yielding `(value, elapsed_us)` and logging the timing.
///
/// ```rust
/// use cldispatch_tracing::timed_block;
///
/// let (handle, elapsed_us) = timed_block!("create_context", { 7u64 });
/// assert_eq!(handle, 7);
/// # let _ = elapsed_us;
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let started = ::std::time::Instant::now();
        let value = $block;
        let elapsed_us = started.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, elapsed_us, "timed");
        (value, elapsed_us)
    }};
}
