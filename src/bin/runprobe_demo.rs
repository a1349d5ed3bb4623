//! runprobe demo
//!
//! Drives the full lifecycle around a simulated training loop, with fake GPU
//! telemetry and a fake profiler, so every built-in instrument has something
//! to observe.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use runprobe::collaborators::{
    Collaborators, GpuReading, GpuTelemetry, HardwareSync, PlainRenderer, ProfileReport, Profiler,
    ProfilerFactory, StopFlag,
};
use runprobe::instruments::register_builtins;
use runprobe::probe::{self, LoaderDescriptor, ProbedIter};
use runprobe::{AcquisitionError, EventBus, Overseer, Phase, ProbeConfig, ProfilerKind, Value};

/// Demo configuration
struct Config {
    /// Instrument configuration file, if any
    config_path: Option<PathBuf>,
    /// Steps to run unless stopped earlier
    steps: u64,
    /// Items per batch
    batch_size: usize,
    /// Instrument toggles given on the command line
    enable: Vec<String>,
    /// Stop after this many train-rate observations
    stop: Option<u64>,
    /// Profiler to run
    profile: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: None,
            steps: 200,
            batch_size: 32,
            enable: Vec::new(),
            stop: None,
            profile: None,
        }
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    if let Some(v) = args.get(i + 1) {
        v
    } else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, flag: &str) -> T {
    text.parse().unwrap_or_else(|_| {
        eprintln!("error: invalid number for {flag}: {text}");
        std::process::exit(1);
    })
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                config.config_path = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 2;
            }
            "--steps" | "-n" => {
                config.steps = parse_number(value_of(&args, i, "--steps"), "--steps");
                i += 2;
            }
            "--batch-size" | "-b" => {
                config.batch_size = parse_number(value_of(&args, i, "--batch-size"), "--batch-size");
                i += 2;
            }
            "--stop" => {
                config.stop = Some(parse_number(value_of(&args, i, "--stop"), "--stop"));
                i += 2;
            }
            "--profile" => {
                config.profile = Some(value_of(&args, i, "--profile").to_string());
                i += 2;
            }
            "--enable" | "-e" => {
                config
                    .enable
                    .extend(value_of(&args, i, "--enable").split(',').map(str::to_string));
                i += 2;
            }
            "--help" | "-h" => {
                println!("runprobe-demo - simulated training run under runprobe");
                println!();
                println!("USAGE:");
                println!("    runprobe-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>        Instrument configuration (JSON)");
                println!("    -n, --steps <N>            Training steps [default: 200]");
                println!("    -b, --batch-size <N>       Items per batch [default: 32]");
                println!("    -e, --enable <NAMES>       Comma-separated instruments to turn on");
                println!("        --stop <N>             Stop after N train-rate observations");
                println!("        --profile <NAME>       Profiler to run (torch, deepspeed)");
                println!("    -h, --help                 Print help information");
                println!();
                println!("Log verbosity follows RUST_LOG (default: info).");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn probe_config(args: &Config) -> Result<ProbeConfig, Box<dyn std::error::Error>> {
    let mut cfg = match &args.config_path {
        Some(path) => ProbeConfig::from_path(path)?,
        None => ProbeConfig::default(),
    };
    for name in &args.enable {
        let opts = &mut cfg.instruments;
        match name.as_str() {
            "display" => opts.display = true,
            "dash" => opts.dash = true,
            "gpu" => opts.gpu = true,
            "verify" => opts.verify = true,
            "train_rate" => opts.train_rate = true,
            "loading_rate" => opts.loading_rate = true,
            "compute_rate" => opts.compute_rate = true,
            other => return Err(format!("unknown instrument: {other}").into()),
        }
    }
    if let Some(stop) = args.stop {
        cfg.instruments.stop = stop;
    }
    if let Some(profile) = &args.profile {
        cfg.instruments.profile.clone_from(profile);
    }
    Ok(cfg.validate()?)
}

/// Two devices whose load follows the number of polls.
#[derive(Default)]
struct SimulatedGpus {
    polls: AtomicU64,
}

impl GpuTelemetry for SimulatedGpus {
    #[allow(clippy::cast_precision_loss)]
    fn poll(&self) -> Result<Vec<GpuReading>, AcquisitionError> {
        let n = self.polls.fetch_add(1, Ordering::Relaxed);
        if n % 17 == 16 {
            return Err(AcquisitionError::unavailable("simulated driver hiccup"));
        }
        Ok((0..2)
            .map(|index| GpuReading {
                index,
                name: format!("sim-{index}"),
                load: ((n + u64::from(index)) % 10) as f64 / 10.0,
                memory_used: 4 << 30,
                memory_total: 16 << 30,
                temperature: Some(60.0),
            })
            .collect())
    }
}

struct SimulatedSync;

impl HardwareSync for SimulatedSync {
    fn synchronize(&self) {
        thread::sleep(Duration::from_micros(200));
    }
}

struct CountingProfiler {
    batch_size: usize,
}

impl Profiler for CountingProfiler {
    fn start(&mut self) -> Result<(), AcquisitionError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<ProfileReport, AcquisitionError> {
        let items = self.batch_size as u64;
        Ok(ProfileReport::Totals {
            flops: items * 2_000_000,
            macs: items * 1_000_000,
            params: 1_000_000,
        })
    }
}

struct SimulatedProfilers {
    batch_size: usize,
}

impl ProfilerFactory for SimulatedProfilers {
    fn create(&self, _kind: ProfilerKind) -> Option<Box<dyn Profiler>> {
        Some(Box::new(CountingProfiler {
            batch_size: self.batch_size,
        }))
    }
}

fn train(bus: &EventBus, args: &Config, stop: &StopFlag) {
    let batches = (0..args.steps).map(|_| {
        thread::sleep(Duration::from_millis(2));
        args.batch_size
    });
    let loader = ProbedIter::new(bus, LoaderDescriptor::iterator("simulated"), batches, |len| Value::Batch {
        len: *len,
    });

    let _ = bus.publish("use_cuda", true);
    for (step, len) in loader.enumerate() {
        if stop.is_raised() {
            info!(step, "stopping early");
            break;
        }
        let mut span = probe::span(bus, probe::COMPUTE_SITE);
        thread::sleep(Duration::from_millis(3));
        span.give("batch", Value::Batch { len });
        span.finish();

        #[allow(clippy::cast_precision_loss)]
        let loss = 2.0 / (1.0 + step as f64 / 20.0);
        let _ = bus.publish("batch", Value::Batch { len });
        let _ = bus.publish("loss", loss);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let config = probe_config(&args)?;

    let stop = StopFlag::new();
    let collaborators = Collaborators::default()
        .with_gpu(SimulatedGpus::default())
        .with_renderer(PlainRenderer::stdout())
        .with_sync(SimulatedSync)
        .with_profilers(SimulatedProfilers {
            batch_size: args.batch_size,
        })
        .with_stop(stop.clone());

    let mut overseer = Overseer::new(EventBus::new(config.runtime.bus.clone()), config, collaborators)?;
    register_builtins(&mut overseer)?;

    while overseer.advance()? != Phase::LoadScript {}
    train(overseer.bus(), &args, &stop);
    overseer.run_to_end()?;

    info!("run complete");
    Ok(())
}
