//! Dense matrix multiplication end to end
//!
//! Builds `matrixMul`, multiplies a `HA x WA` matrix by a `HB x WB` matrix on
//! a 2-D index space and prints all three matrices.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example matrix_mul
//!
//! # Emulated accelerator, performance events above 50us
//! CLDISPATCH_DEVICE=1 CLDISPATCH_PERF_TRACING=1 CLDISPATCH_PERF_THRESHOLD_US=50 \
//!     cargo run --example matrix_mul
//! ```

use cldispatch_core::{load_kernel_source, DispatchConfig, Matrix, Session};
use cldispatch_tracing::{init_global_tracing, TracingConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::time::Instant;

const DEFAULT_KERNEL: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/matrixMul.cl");

const HA: usize = 4;
const WA: usize = 6;
const HB: usize = WA;
const WB: usize = 3;

/// Seeded values in `[-1, 1)`
fn fill(rows: usize, cols: usize, seed: u64) -> Result<Matrix, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Ok(Matrix::new(rows, cols, data)?)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_global_tracing(&TracingConfig::from_env())?;

    let config = DispatchConfig::from_env()?;
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_KERNEL.to_string());
    let source = load_kernel_source(&path);

    let session = Session::open_preferred(&config)?;
    println!("Using platform: {}", session.platform().name());
    println!("Using device: {}", session.device().name());

    let a = fill(HA, WA, 2006)?;
    let b = fill(HB, WB, 2007)?;

    println!("\nMatrix A\n{a}");
    println!("Matrix B\n{b}");

    let start = Instant::now();
    let c = session.matmul(&source, &a, &b)?;
    let elapsed = start.elapsed();

    println!("Matrix C (Results)\n{c}");
    println!("{}x{} result in {:.3} ms", c.rows(), c.cols(), elapsed.as_secs_f64() * 1000.0);

    let stats = session.queue().stats();
    println!(
        "queue: {} commands submitted, {} completed, {} launches",
        stats.submitted, stats.completed, stats.launches
    );

    session.close()?;
    Ok(())
}
