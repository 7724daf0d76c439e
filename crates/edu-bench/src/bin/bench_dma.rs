//! DMA throughput benchmark: host buffer ↔ device window.
//!
//! Each transfer is a full blocking DMA (program SRC/DST/XFER/CMD, wait for
//! the completion interrupt). The device window is 4 KiB, so throughput is
//! dominated by per-transfer setup and interrupt latency, not bandwidth.
//!
//! Usage:
//!   cargo run --bin bench_dma
//!   cargo run --bin bench_dma -- --size 1024 --iterations 500
//!   cargo run --bin bench_dma -- --sim

use anyhow::{ensure, Result};
use edu_driver::{select_backend, BackendSelection, EduConfig, EduDevice, Session};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_SIZE: u32 = 4096;
const DEFAULT_ITERATIONS: usize = 200;
const DEFAULT_DEVICE: &str = "0000:00:04.0";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let size = parse_arg(&args, "--size", DEFAULT_SIZE);
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let pcie_address = parse_arg(&args, "--device", DEFAULT_DEVICE.to_string());
    let selection = if args.iter().any(|a| a == "--sim") {
        BackendSelection::Simulated
    } else {
        BackendSelection::Auto
    };

    println!("DMA throughput benchmark");
    println!("========================");
    println!("Transfer size  : {size} bytes");
    println!("Iterations     : {iterations}");

    let config = EduConfig::from_env()?;
    ensure!(
        size >= 1 && size as usize <= config.dma_capacity,
        "--size must be in 1..={}",
        config.dma_capacity
    );
    let backend = select_backend(selection, &pcie_address, &config)?;
    let device = EduDevice::attach(backend, &config)?;
    println!("Backend        : {}", device.backend_type());
    println!("Buffer bus addr: {:#010x}", device.dma_bus_address());
    println!();

    let session = device.open();
    let view = session.map_buffer(0, size as usize)?;
    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    view.write(0, &pattern)?;

    // Warmup
    for _ in 0..10 {
        session.dma_to_device(size)?;
        session.dma_from_device(size)?;
    }

    let h2d = time_transfers(&session, iterations, |s| s.dma_to_device(size))?;
    print_throughput("Host → device", h2d, size as usize * iterations);

    view.fill(0);
    let d2h = time_transfers(&session, iterations, |s| s.dma_from_device(size))?;
    print_throughput("Device → host", d2h, size as usize * iterations);

    if view.to_vec() != pattern {
        warn!("Buffer contents differ from the pattern after device → host transfers");
        anyhow::bail!("data mismatch after device → host transfers");
    }
    println!();
    println!("Data integrity : OK");

    device.detach();
    Ok(())
}

fn time_transfers(
    session: &Session,
    iterations: usize,
    transfer: impl Fn(&Session) -> edu_driver::Result<()>,
) -> Result<Duration> {
    let t0 = Instant::now();
    for _ in 0..iterations {
        transfer(session)?;
    }
    Ok(t0.elapsed())
}

fn print_throughput(label: &str, elapsed: Duration, bytes: usize) {
    let secs = elapsed.as_secs_f64();
    let mb_s = bytes as f64 / secs / 1e6;
    println!("  {label:<14}: {mb_s:>8.2} MB/s  ({:.1} µs total)", secs * 1e6);
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
