use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use nonceforge_engine::{BatchConfig, InvocationConfig, Mode, WatchdogConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Fixed batch; abort on the first permanent error.
    #[value(alias = "runtime")]
    Strict,
    /// Fixed batch; record permanent errors and keep going.
    #[value(alias = "bench")]
    Lenient,
    /// Time-boxed exploration of an unbounded nonce sequence.
    #[value(alias = "explo")]
    Explore,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Strict => Mode::Strict,
            ModeArg::Lenient => Mode::Lenient,
            ModeArg::Explore => Mode::Explore,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "nonceforge",
    version,
    about = "Bounded-concurrency batch runner with a memory-pressure watchdog"
)]
pub struct Cli {
    /// First nonce of the batch.
    #[arg(long)]
    pub start_nonce: u64,

    /// Batch size for the fixed modes.
    #[arg(long)]
    pub num_nonces: u64,

    /// Maximum number of worker processes to keep in flight.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=512))]
    pub max_workers: u16,

    /// Settings JSON, passed through to the worker verbatim.
    #[arg(long)]
    pub settings: String,

    /// Randomness seed, passed through to the worker verbatim.
    #[arg(long)]
    pub rand_hash: String,

    /// Algorithm shared object handed to the worker.
    #[arg(long)]
    pub so_path: PathBuf,

    /// Per-task compute budget.
    #[arg(long)]
    pub max_fuel: u64,

    /// Directory receiving one `<nonce>.json` per task.
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Scheduling mode.
    #[arg(long, value_enum)]
    pub mode: ModeArg,

    /// Optional PTX module for GPU workers.
    #[arg(long)]
    pub ptx: Option<PathBuf>,

    /// GPU device index; also selects the VRAM watchdog.
    #[arg(long)]
    pub gpu_id: Option<u32>,

    /// Optional encrypted data blob for the worker.
    #[arg(long)]
    pub data: Option<String>,

    /// Optional hyperparameter string for the worker.
    #[arg(long)]
    pub hyperparameters: Option<String>,

    /// Batch timeout in seconds (0 disables; required in explore mode).
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Wall-clock bound for one worker process in seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    pub worker_timeout: u64,

    /// Worker executable.
    #[arg(long, env = "NONCEFORGE_WORKER_BIN", default_value = "nonce-runtime")]
    pub worker_bin: PathBuf,

    #[arg(long)]
    pub verbose: bool,

    /// Kill watermark, percent of memory in use.
    #[arg(long, default_value_t = 90.0)]
    pub mem_high: f64,

    /// Restart watermark, percent of memory in use.
    #[arg(long, default_value_t = 75.0)]
    pub mem_low: f64,

    /// Watchdog poll cadence in milliseconds (floor 10).
    #[arg(long, default_value_t = 50)]
    pub mem_interval: u64,

    /// Disable the memory watchdog.
    #[arg(long)]
    pub no_oom: bool,
}

impl Cli {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            mode: self.mode.into(),
            start_nonce: self.start_nonce,
            num_nonces: self.num_nonces,
            max_workers: self.max_workers as usize,
            worker: InvocationConfig {
                worker_bin: self.worker_bin.clone(),
                settings_json: self.settings.clone(),
                rand_hash: self.rand_hash.clone(),
                so_path: self.so_path.clone(),
                max_fuel: self.max_fuel,
                output_dir: self.output_dir.clone(),
                ptx_path: self.ptx.clone(),
                gpu_id: self.gpu_id,
                data: self.data.clone(),
                hyperparameters: self.hyperparameters.clone(),
            },
            batch_timeout: Duration::from_secs(self.timeout),
            worker_timeout: Duration::from_secs(self.worker_timeout),
            watchdog: WatchdogConfig {
                high_watermark: self.mem_high / 100.0,
                low_watermark: self.mem_low / 100.0,
                check_interval: Duration::from_millis(self.mem_interval),
                disabled: self.no_oom,
            },
        }
    }
}
