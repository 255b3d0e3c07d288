//! Benchmark harness: dot-product kernel, SPSC throughput, SPSC round trip.
//!
//! The runners spawn their own producer/consumer threads and pin them per
//! [`CpuConfig`], so the calling thread's affinity is never changed. Every
//! value the consumer sees is checked against the expected sequence.

use std::fmt;
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::kernel::{Isa, Kernel, KernelError};
use crate::runtime::topology::{CpuConfig, PlacementStrategy, ThreadPlacement, pin_optional};
use crate::sync::poll::{Timeout, send_spinning};
use crate::sync::spsc::{self, ChannelError};
use crate::trace::{debug, info};

/// Channel capacity used by the SPSC benches.
pub const BENCH_CAPACITY: usize = 4096;

/// Payload sent through the SPSC benches.
pub type Payload = u64;

/// Error running a benchmark.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Bad command line or environment value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Channel construction failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Kernel call failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// The consumer observed a value out of sequence.
    #[error("data corruption: expected {expected}, got {got}")]
    Corruption {
        /// Next value in the sent sequence.
        expected: Payload,
        /// Value actually received.
        got: Payload,
    },
    /// A bench thread could not be spawned.
    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        /// Which side failed to start.
        role: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// A bench thread panicked.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Parameters for a benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    /// Messages pushed through the throughput bench.
    pub iterations: u64,
    /// Ping-pong exchanges in the round-trip bench.
    pub rtt_iterations: u64,
    /// Vector length for the dot-product bench.
    pub dot_len: usize,
    /// Timed dot-product calls.
    pub dot_rounds: usize,
    /// Thread pinning.
    pub cpu: CpuConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 1_000_000,
            rtt_iterations: 100_000,
            dot_len: 1024 * 1024,
            dot_rounds: 100,
            cpu: CpuConfig::Auto,
        }
    }
}

/// Result of the dot-product bench.
#[derive(Debug, Clone)]
pub struct DotReport {
    /// Kernel variant used.
    pub isa: Isa,
    /// Total multiply-adds performed.
    pub elements: u64,
    /// Wall time of the timed rounds.
    pub elapsed: Duration,
    /// Sum of all round results.
    pub result: f64,
}

impl DotReport {
    /// Average time per element, in nanoseconds.
    #[must_use]
    pub fn ns_per_element(&self) -> f64 {
        if self.elements == 0 {
            return 0.0;
        }
        self.elapsed.as_nanos() as f64 / self.elements as f64
    }
}

impl fmt::Display for DotReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  > Kernel: {}", self.isa)?;
        writeln!(f, "  > Processed {:.2} M elements", self.elements as f64 / 1e6)?;
        writeln!(f, "  > Time: {} us", self.elapsed.as_micros())?;
        writeln!(f, "  > ns per element: {:.4}", self.ns_per_element())?;
        write!(f, "  > Result: {}", self.result)
    }
}

/// Result of the throughput bench.
#[derive(Debug, Clone)]
pub struct ThroughputReport {
    /// Messages delivered in order.
    pub messages: u64,
    /// Time from first send to last receive.
    pub elapsed: Duration,
    /// How the two threads were placed.
    pub strategy: PlacementStrategy,
}

impl ThroughputReport {
    /// Delivered messages per second.
    #[must_use]
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.messages as f64 / secs
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  > Placement: {}", self.strategy)?;
        writeln!(f, "  > Messages: {}", self.messages)?;
        write!(f, "  > Throughput: {:.2} M ops/sec", self.ops_per_sec() / 1e6)
    }
}

/// Result of the round-trip bench.
#[derive(Debug, Clone)]
pub struct RoundTripReport {
    /// Completed ping-pong exchanges.
    pub round_trips: u64,
    /// Total time of all exchanges.
    pub elapsed: Duration,
    /// How the two threads were placed.
    pub strategy: PlacementStrategy,
}

impl RoundTripReport {
    /// Mean time per exchange, in nanoseconds.
    #[must_use]
    pub fn mean_ns(&self) -> u128 {
        if self.round_trips == 0 {
            return 0;
        }
        self.elapsed.as_nanos() / u128::from(self.round_trips)
    }
}

impl fmt::Display for RoundTripReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  > Placement: {}", self.strategy)?;
        writeln!(f, "  > Round trips: {}", self.round_trips)?;
        write!(f, "  > RTT: {} ns", self.mean_ns())
    }
}

/// Times `dot_rounds` dot products of two `dot_len` vectors.
///
/// # Errors
///
/// Propagates kernel errors (none expected for equal-length inputs).
pub fn run_dot_product(config: &BenchConfig, kernel: Kernel) -> Result<DotReport, BenchError> {
    let a = vec![1.0001_f64; config.dot_len];
    let b = vec![0.9999_f64; config.dot_len];

    info!(isa = %kernel.isa(), len = config.dot_len, rounds = config.dot_rounds, "dot product bench");

    // Warmup
    black_box(kernel.dot_product(&a, &b)?);

    let start = Instant::now();
    let mut result = 0.0;
    for _ in 0..config.dot_rounds {
        result += kernel.dot_product(black_box(&a), black_box(&b))?;
    }
    let elapsed = start.elapsed();

    Ok(DotReport {
        isa: kernel.isa(),
        elements: (config.dot_len as u64) * (config.dot_rounds as u64),
        elapsed,
        result: black_box(result),
    })
}

/// Streams `0..iterations` through a channel and checks the order.
///
/// # Errors
///
/// Returns [`BenchError::Corruption`] on the first out-of-sequence value, or
/// a channel/thread error.
pub fn run_throughput(config: &BenchConfig) -> Result<ThroughputReport, BenchError> {
    let placement = config.cpu.resolve();
    let iterations = config.iterations;
    info!(iterations, strategy = %placement.strategy, "throughput bench");

    let (producer, consumer) = spsc::channel::<Payload, BENCH_CAPACITY>()?;
    let ready = Arc::new(AtomicBool::new(false));
    let abort = Arc::new(AtomicBool::new(false));

    let consumer_thread = {
        let ready = Arc::clone(&ready);
        let abort = Arc::clone(&abort);
        let core = placement.consumer_core;
        spawn("consumer", move || {
            pin_optional(core);
            ready.store(true, Ordering::Release);

            for expected in 0..iterations {
                loop {
                    if let Some(value) = consumer.try_receive() {
                        if value != expected {
                            abort.store(true, Ordering::Release);
                            return Err(BenchError::Corruption {
                                expected,
                                got: value,
                            });
                        }
                        consumer.prefetch_hint();
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            Ok(Instant::now())
        })?
    };

    let producer_thread = {
        let abort = Arc::clone(&abort);
        let core = placement.producer_core;
        spawn("producer", move || {
            pin_optional(core);
            while !ready.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }

            let start = Instant::now();
            for i in 0..iterations {
                let mut item = i;
                while let Err(back) = producer.try_send(item) {
                    if abort.load(Ordering::Acquire) {
                        return start;
                    }
                    item = back;
                    std::hint::spin_loop();
                }
            }
            start
        })?
    };

    let start = join(producer_thread, "producer")?;
    let end = join(consumer_thread, "consumer")??;

    let report = ThroughputReport {
        messages: iterations,
        elapsed: end.duration_since(start),
        strategy: placement.strategy,
    };
    debug!(ops_per_sec = report.ops_per_sec(), "throughput bench done");
    Ok(report)
}

/// Bounces `rtt_iterations` values between two threads over two channels.
///
/// # Errors
///
/// Returns [`BenchError::Corruption`] if an echoed value differs from the one
/// sent, or a channel/thread error.
pub fn run_round_trip(config: &BenchConfig) -> Result<RoundTripReport, BenchError> {
    let placement: ThreadPlacement = config.cpu.resolve();
    let iterations = config.rtt_iterations;
    info!(iterations, strategy = %placement.strategy, "round-trip bench");

    let (ping_tx, ping_rx) = spsc::channel::<Payload, BENCH_CAPACITY>()?;
    let (pong_tx, pong_rx) = spsc::channel::<Payload, BENCH_CAPACITY>()?;
    let ready = Arc::new(AtomicBool::new(false));
    let abort = Arc::new(AtomicBool::new(false));

    let responder = {
        let ready = Arc::clone(&ready);
        let abort = Arc::clone(&abort);
        let core = placement.consumer_core;
        spawn("responder", move || {
            pin_optional(core);
            ready.store(true, Ordering::Release);

            for _ in 0..iterations {
                let value = loop {
                    if let Some(value) = ping_rx.try_receive() {
                        break value;
                    }
                    if abort.load(Ordering::Acquire) {
                        return;
                    }
                    std::hint::spin_loop();
                };
                // Capacity exceeds the one value in flight, so this never spins long.
                let _ = send_spinning(&pong_tx, value, Timeout::Infinite);
            }
        })?
    };

    let initiator = {
        let core = placement.producer_core;
        spawn("initiator", move || {
            pin_optional(core);
            while !ready.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }

            let start = Instant::now();
            for i in 0..iterations {
                let _ = send_spinning(&ping_tx, i, Timeout::Infinite);
                let echoed = loop {
                    if let Some(value) = pong_rx.try_receive() {
                        break value;
                    }
                    std::hint::spin_loop();
                };
                if echoed != i {
                    abort.store(true, Ordering::Release);
                    return Err(BenchError::Corruption {
                        expected: i,
                        got: echoed,
                    });
                }
            }
            Ok(start.elapsed())
        })?
    };

    let elapsed = join(initiator, "initiator")?;
    join(responder, "responder")?;
    let elapsed = elapsed?;

    Ok(RoundTripReport {
        round_trips: iterations,
        elapsed,
        strategy: placement.strategy,
    })
}

fn spawn<F, R>(role: &'static str, f: F) -> Result<JoinHandle<R>, BenchError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    thread::Builder::new()
        .name(format!("ticklane-{role}"))
        .spawn(f)
        .map_err(|source| BenchError::Spawn { role, source })
}

fn join<R>(handle: JoinHandle<R>, role: &'static str) -> Result<R, BenchError> {
    handle.join().map_err(|_| BenchError::ThreadPanicked(role))
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run the benches with this config.
    Run(BenchConfig),
    /// Print usage and exit.
    Help,
}

/// Usage text for the bench binary.
pub const USAGE: &str = r#"ticklane-bench - SPSC channel and vector kernel benchmarks

USAGE:
    ticklane-bench [OPTIONS]

OPTIONS:
    -n, --iterations <N>        Messages for the throughput bench (default: 1000000)
    -r, --rtt-iterations <N>    Exchanges for the round-trip bench (default: 100000)
        --dot-len <N>           Vector length for the dot product (default: 1048576)
        --dot-rounds <N>        Timed dot-product calls (default: 100)
    -p, --producer-cpu <ID>     Pin the producer to core ID
    -c, --consumer-cpu <ID>     Pin the consumer to core ID
        --no-pin                Disable CPU pinning
    -h, --help                  Print this help message

ENVIRONMENT:
    PRODUCER_CPU, CONSUMER_CPU  Core IDs used when the flags are absent
    RUST_LOG                    Log filter (with the `tracing` feature)
"#;

/// Parses command line arguments (program name first) into an [`Invocation`].
///
/// `env` looks up environment variables; CPU ids from the environment are
/// only used when the matching flag is absent.
///
/// # Errors
///
/// Returns [`BenchError::InvalidArgument`] for unknown flags, missing values
/// or unparsable numbers.
pub fn parse_args<F>(args: &[String], env: F) -> Result<Invocation, BenchError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = BenchConfig::default();
    let mut producer_cpu: Option<usize> = None;
    let mut consumer_cpu: Option<usize> = None;
    let mut no_pin = false;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--iterations" | "-n" => config.iterations = parse_value(args, &mut i, flag)?,
            "--rtt-iterations" | "-r" => config.rtt_iterations = parse_value(args, &mut i, flag)?,
            "--dot-len" => config.dot_len = parse_value(args, &mut i, flag)?,
            "--dot-rounds" => config.dot_rounds = parse_value(args, &mut i, flag)?,
            "--producer-cpu" | "-p" => producer_cpu = Some(parse_value(args, &mut i, flag)?),
            "--consumer-cpu" | "-c" => consumer_cpu = Some(parse_value(args, &mut i, flag)?),
            "--no-pin" => no_pin = true,
            "--help" | "-h" => return Ok(Invocation::Help),
            arg => {
                return Err(BenchError::InvalidArgument(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }

    if producer_cpu.is_none() {
        producer_cpu = env_value(&env, "PRODUCER_CPU")?;
    }
    if consumer_cpu.is_none() {
        consumer_cpu = env_value(&env, "CONSUMER_CPU")?;
    }

    config.cpu = if no_pin {
        CpuConfig::Disabled
    } else if producer_cpu.is_some() || consumer_cpu.is_some() {
        CpuConfig::Manual {
            producer_core: producer_cpu,
            consumer_core: consumer_cpu,
        }
    } else {
        CpuConfig::Auto
    };

    Ok(Invocation::Run(config))
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, BenchError>
where
    T::Err: fmt::Display,
{
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| BenchError::InvalidArgument(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|e| BenchError::InvalidArgument(format!("{flag} {raw}: {e}")))
}

fn env_value<F>(env: &F, name: &str) -> Result<Option<usize>, BenchError>
where
    F: Fn(&str) -> Option<String>,
{
    env(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| BenchError::InvalidArgument(format!("{name}={raw}: {e}")))
        })
        .transpose()
}
