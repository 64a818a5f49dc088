//! Vector addition end to end
//!
//! Selects a platform and device, builds `simple_add`, uploads two ten-element
//! vectors, launches one work-item per element and prints the sum.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example vector_addition
//!
//! # Second device of the first platform, with debug logging
//! CLDISPATCH_DEVICE=1 RUST_LOG=cldispatch_core=debug cargo run --example vector_addition
//!
//! # Kernel source from another file
//! cargo run --example vector_addition -- path/to/kernel.cl
//!
//! # Real OpenCL runtime
//! cargo run --example vector_addition --features opencl
//! ```

use cldispatch_core::{load_kernel_source, DispatchConfig, DispatchError, Session};
use cldispatch_tracing::{init_global_tracing, TracingConfig};
use std::error::Error;

const DEFAULT_KERNEL: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/vector_add_kernel.cl");

fn main() -> Result<(), Box<dyn Error>> {
    init_global_tracing(&TracingConfig::from_env())?;

    let config = DispatchConfig::from_env()?;
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_KERNEL.to_string());
    let source = load_kernel_source(&path);

    let session = Session::open_preferred(&config)?;
    println!("Using platform: {}", session.platform().name());
    println!("Using device: {}", session.device().name());

    let a: Vec<i32> = (0..10).collect();
    let b: Vec<i32> = (0..10).map(|i| i % 3).collect();

    let result = session.vector_add(&source, &a, &b);
    if let Some(log) = result.as_ref().err().and_then(DispatchError::build_log) {
        eprintln!(" Error building: {log}");
    }
    let c = result?;

    println!(" result: ");
    let line: Vec<String> = c.iter().map(|v| v.to_string()).collect();
    println!("{}", line.join(" "));

    session.close()?;
    Ok(())
}
