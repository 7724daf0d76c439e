// SPDX-License-Identifier: AGPL-3.0-only
//! Factorial round-trip latency: register write → completion interrupt → result read.
//!
//! Each sample covers the full blocking protocol: arm STATUS, write the
//! operand, sleep on the completion channel until the dispatcher thread
//! services the interrupt, then read the result back.
//!
//! Usage:
//!   cargo run --bin bench_factorial
//!   cargo run --bin bench_factorial -- --iterations 5000 --sim
//!   cargo run --bin bench_factorial -- --device 0000:00:05.0 --threads 4

use anyhow::Result;
use edu_driver::{select_backend, BackendSelection, EduConfig, EduDevice, SimConfig, SimulatedEdu};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 1000;
const DEFAULT_THREADS: usize = 1;
const DEFAULT_DEVICE: &str = "0000:00:04.0";
const OPERAND: u32 = 12; // 12! = 479001600, largest exact 32-bit factorial

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let threads = parse_arg(&args, "--threads", DEFAULT_THREADS).max(1);
    let pcie_address = parse_arg(&args, "--device", DEFAULT_DEVICE.to_string());

    println!("Factorial latency benchmark");
    println!("===========================");
    println!("Operand        : {OPERAND}");
    println!("Iterations     : {iterations} per thread");
    println!("Threads        : {threads}");

    let config = EduConfig::from_env()?;
    let device = if has_flag(&args, "--sim") {
        // Zero modelled latency: measures pure driver + dispatcher overhead.
        info!("Using zero-latency simulated device");
        let sim = SimConfig {
            factorial_latency: Duration::ZERO,
            dma_latency: Duration::ZERO,
            ..SimConfig::default()
        };
        let backend = Arc::new(SimulatedEdu::new(sim, config.dma_bits));
        EduDevice::attach(backend, &config)?
    } else {
        let backend = select_backend(BackendSelection::Auto, &pcie_address, &config)?;
        EduDevice::attach(backend, &config)?
    };
    println!("Backend        : {}", device.backend_type());
    println!();

    let session = device.open();

    // Warmup
    for _ in 0..20 {
        session.factorial(OPERAND)?;
    }

    let started = Instant::now();
    let mut latencies_us = std::thread::scope(|scope| -> Result<Vec<f64>> {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let session = device.open();
                scope.spawn(move || -> Result<Vec<f64>> {
                    let mut samples = Vec::with_capacity(iterations);
                    for _ in 0..iterations {
                        let t0 = Instant::now();
                        let result = session.factorial(OPERAND)?;
                        samples.push(t0.elapsed().as_secs_f64() * 1e6);
                        anyhow::ensure!(result == 479_001_600, "wrong result {result}");
                    }
                    Ok(samples)
                })
            })
            .collect();

        let mut all = Vec::with_capacity(iterations * threads);
        for worker in workers {
            let samples = worker
                .join()
                .map_err(|_| anyhow::anyhow!("benchmark thread panicked"))??;
            all.extend(samples);
        }
        Ok(all)
    })?;
    let wall = started.elapsed();

    latencies_us.sort_by(f64::total_cmp);
    let n = latencies_us.len();
    let mean = latencies_us.iter().sum::<f64>() / n as f64;
    let p50 = latencies_us[n / 2];
    let p95 = latencies_us[((n as f64 * 0.95) as usize).min(n - 1)];
    let p99 = latencies_us[((n as f64 * 0.99) as usize).min(n - 1)];

    println!("Round-trip latency");
    println!("------------------");
    println!("  mean : {mean:.1} µs");
    println!("  min  : {:.1} µs", latencies_us[0]);
    println!("  p50  : {p50:.1} µs");
    println!("  p95  : {p95:.1} µs");
    println!("  p99  : {p99:.1} µs");
    println!("  max  : {:.1} µs", latencies_us[n - 1]);
    println!();
    println!(
        "Aggregate      : {:.0} ops/s over {:.2} s",
        n as f64 / wall.as_secs_f64(),
        wall.as_secs_f64()
    );

    device.detach();
    Ok(())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
