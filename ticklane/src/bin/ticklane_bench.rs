//! SPSC channel and vector kernel benchmarks.
//!
//! Usage:
//!     cargo run --release --bin ticklane-bench -- [OPTIONS]
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 when `--producer-cpu` is absent
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 when `--consumer-cpu` is absent

use ticklane::bench::{self, BenchError, Invocation};
use ticklane::kernel::Kernel;

fn main() {
    if let Err(e) = run() {
        eprintln!("ticklane-bench: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), BenchError> {
    ticklane::trace::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let config = match bench::parse_args(&args, |name| std::env::var(name).ok())? {
        Invocation::Run(config) => config,
        Invocation::Help => {
            eprint!("{}", bench::USAGE);
            return Ok(());
        }
    };

    let kernel = Kernel::detect();
    println!("=== ticklane benchmarks ===");
    println!("Kernel detected: {}", kernel.isa());
    println!(
        "Timer: {}",
        if minstant::is_tsc_available() { "tsc" } else { "os clock" }
    );
    println!("-------------------------------------------");

    println!("[BENCH] Dot product ({} x {})", config.dot_len, config.dot_rounds);
    println!("{}\n", bench::run_dot_product(&config, kernel)?);

    println!(
        "[BENCH] SPSC throughput (capacity {}, {} messages)",
        bench::BENCH_CAPACITY,
        config.iterations
    );
    println!("{}\n", bench::run_throughput(&config)?);

    println!(
        "[BENCH] SPSC round trip (capacity {}, {} exchanges)",
        bench::BENCH_CAPACITY,
        config.rtt_iterations
    );
    println!("{}", bench::run_round_trip(&config)?);

    Ok(())
}
