//! Public API types for the batch engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::supervisor;
use crate::watchdog::CancelCell;

/// How one worker subprocess is invoked.
///
/// Everything here is passed through to the worker command line; the engine
/// itself only interprets `output_dir` (for the idempotent skip and the
/// success signal) and `gpu_id` (which also selects the VRAM probe).
#[derive(Debug, Clone)]
pub struct InvocationConfig {
    /// Worker executable (resolved via `PATH` if not a path).
    pub worker_bin: PathBuf,
    /// Opaque settings JSON string, first positional argument.
    pub settings_json: String,
    /// Opaque randomness seed, second positional argument.
    pub rand_hash: String,
    /// Path to the algorithm shared object, fourth positional argument.
    pub so_path: PathBuf,
    /// Per-task compute budget (`--fuel`).
    pub max_fuel: u64,
    /// Directory receiving one `<nonce>.json` per task.
    pub output_dir: PathBuf,
    /// Optional PTX module path (`--ptx`). When set without `gpu_id`,
    /// device 0 is implied.
    pub ptx_path: Option<PathBuf>,
    /// Optional GPU device index (`--gpu`).
    pub gpu_id: Option<u32>,
    /// Optional encrypted data blob (`--data`).
    pub data: Option<String>,
    /// Optional hyperparameter string (`--hyperparameters`).
    pub hyperparameters: Option<String>,
}

/// Memory watchdog tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Usage fraction above which the kill phase starts.
    pub high_watermark: f64,
    /// Usage fraction below which killed nonces are readmitted.
    pub low_watermark: f64,
    /// Poll cadence; clamped to [`WatchdogConfig::MIN_CHECK_INTERVAL`].
    pub check_interval: Duration,
    /// Disable memory sensing entirely. The retry queue keeps working so
    /// that workers killed by the OS are still readmitted.
    pub disabled: bool,
}

impl WatchdogConfig {
    /// Lower bound on the poll cadence.
    pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

    /// Default poll cadence.
    pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(50);
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.90,
            low_watermark: 0.75,
            check_interval: Self::DEFAULT_CHECK_INTERVAL,
            disabled: false,
        }
    }
}

/// Scheduling mode of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fixed batch, abort on the first permanent error.
    Strict,
    /// Fixed batch, record permanent errors and keep going.
    Lenient,
    /// Unbounded nonce sequence, bounded by the batch timeout.
    Explore,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Strict => "strict",
            Mode::Lenient => "lenient",
            Mode::Explore => "explore",
        })
    }
}

/// Configuration for one batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Scheduling mode.
    pub mode: Mode,
    /// First nonce of the batch.
    pub start_nonce: u64,
    /// Batch size for the fixed modes; ignored in explore mode.
    pub num_nonces: u64,
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// Worker invocation.
    pub worker: InvocationConfig,
    /// Overall batch timeout; `Duration::ZERO` disables it. Required to be
    /// non-zero in explore mode.
    pub batch_timeout: Duration,
    /// Wall-clock bound for a single worker subprocess; `Duration::ZERO`
    /// disables it.
    pub worker_timeout: Duration,
    /// Watchdog tuning.
    pub watchdog: WatchdogConfig,
}

/// Configuration for a verifier pass over already-produced outputs.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// First nonce to verify.
    pub start_nonce: u64,
    /// Number of nonces to verify.
    pub num_nonces: u64,
    /// Upper bound on concurrently running verifier processes.
    pub max_workers: usize,
    /// Verifier executable.
    pub verifier_bin: PathBuf,
    /// Opaque settings JSON string.
    pub settings_json: String,
    /// Opaque randomness seed.
    pub rand_hash: String,
    /// Directory holding the `<nonce>.json` files to verify.
    pub output_dir: PathBuf,
    /// Optional encrypted data blob (`--data`).
    pub data: Option<String>,
    /// Optional PTX module path (`--ptx`).
    pub ptx_path: Option<PathBuf>,
    /// Optional GPU device index (`--gpu`); also selects the VRAM probe.
    pub gpu_id: Option<u32>,
    /// Watchdog tuning.
    pub watchdog: WatchdogConfig,
}

/// A configuration rejected before anything was spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The hysteresis band is inverted or empty.
    #[error("mem-low must be less than mem-high")]
    WatermarkInversion,
    /// Explore mode has no batch timeout to bound it.
    #[error("timeout is required in explore mode")]
    ExploreWithoutTimeout,
    /// A batch with zero worker slots can never make progress.
    #[error("max-workers must be at least 1")]
    ZeroWorkers,
}

/// Progress and diagnostics emitted by a running batch.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// The batch loop is up.
    Started {
        /// Scheduling mode.
        mode: Mode,
        /// First nonce.
        start_nonce: u64,
        /// Batch size; `None` in explore mode.
        num_nonces: Option<u64>,
        /// Worker slot count.
        max_workers: usize,
    },
    /// The watchdog polling loop is up.
    WatchdogStarted {
        /// Probe label (`RAM` or `VRAM`).
        label: &'static str,
        /// Memory used at startup, MiB.
        used_mib: u64,
        /// Memory total, MiB.
        total_mib: u64,
        /// Usage fraction at startup.
        fraction: f64,
        /// Kill watermark.
        high: f64,
        /// Restart watermark.
        low: f64,
        /// Poll cadence in milliseconds.
        interval_ms: u64,
    },
    /// A worker was spawned for a nonce.
    NonceStarted {
        /// The nonce.
        nonce: u64,
    },
    /// A nonce completed successfully.
    NonceCompleted {
        /// The nonce.
        nonce: u64,
        /// Time from spawn to completion.
        elapsed_ms: u64,
        /// True when the output pre-existed and no worker ran.
        already_done: bool,
    },
    /// A nonce failed transiently and went back into the retry queue.
    NonceRequeued {
        /// The nonce.
        nonce: u64,
        /// Human-readable reason.
        reason: String,
    },
    /// A nonce failed permanently.
    NonceFailed {
        /// The nonce.
        nonce: u64,
        /// The message recorded in the error summary.
        message: String,
    },
    /// The watchdog terminated a worker to relieve memory pressure.
    MemoryKill {
        /// Probe label (`RAM` or `VRAM`).
        label: &'static str,
        /// The victim nonce.
        nonce: u64,
        /// Victim age in seconds at kill time.
        age_secs: f64,
        /// Memory used, MiB.
        used_mib: u64,
        /// Memory total, MiB.
        total_mib: u64,
        /// Usage fraction that triggered the kill.
        fraction: f64,
    },
    /// The batch timeout expired.
    TimeoutReached {
        /// The configured timeout in seconds.
        seconds: u64,
    },
    /// In-flight workers are being cancelled during shutdown.
    CancellingRemaining {
        /// How many workers were still running.
        count: usize,
    },
    /// A non-fatal irregularity.
    Warning {
        /// Message.
        message: String,
    },
    /// An error that did not stop the batch by itself.
    Error {
        /// Message.
        message: String,
    },
    /// The batch is done; this is the last event.
    Completed {
        /// Nonces that succeeded.
        success: u64,
        /// Batch size; `None` in explore mode.
        total: Option<u64>,
        /// Nonces attempted (explore mode reporting).
        attempted: u64,
        /// Wall-clock duration of the run.
        elapsed_secs: f64,
    },
}

/// Final accounting of a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Nonces that succeeded (including pre-existing outputs).
    pub success: u64,
    /// Nonces attempted (meaningful in explore mode).
    pub attempted: u64,
    /// Permanent per-nonce errors (best-effort modes).
    pub errors: BTreeMap<u64, String>,
    /// The aborting error of a strict run, if any.
    pub fatal: Option<String>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Handle to a running batch: event stream, stop request, final report.
pub struct BatchHandle {
    stop: Arc<CancelCell>,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    join: tokio::task::JoinHandle<BatchReport>,
}

impl BatchHandle {
    /// Ask the batch to stop: in-flight workers are cancelled with the
    /// terminate-then-kill sequence and the partial report is returned.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Next progress event; `None` once the batch has finished.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Wait for the batch to finish and return its report.
    pub async fn wait(self) -> anyhow::Result<BatchReport> {
        match self.join.await {
            Ok(report) => Ok(report),
            Err(err) => Err(anyhow::anyhow!("batch task join error: {err}")),
        }
    }
}

fn validate_watchdog(cfg: &WatchdogConfig) -> Result<(), ConfigError> {
    if cfg.low_watermark >= cfg.high_watermark {
        return Err(ConfigError::WatermarkInversion);
    }
    Ok(())
}

/// Start a batch run. Must be called from within a tokio runtime.
pub fn start_batch(cfg: BatchConfig) -> Result<BatchHandle, ConfigError> {
    validate_watchdog(&cfg.watchdog)?;
    if cfg.max_workers == 0 {
        return Err(ConfigError::ZeroWorkers);
    }
    if cfg.mode == Mode::Explore && cfg.batch_timeout.is_zero() {
        return Err(ConfigError::ExploreWithoutTimeout);
    }

    let (event_tx, events) = mpsc::unbounded_channel();
    let stop = Arc::new(CancelCell::default());
    let join = tokio::spawn(supervisor::run_batch(cfg, event_tx, stop.clone()));
    Ok(BatchHandle { stop, events, join })
}

/// Start a verifier pass. Must be called from within a tokio runtime.
pub fn start_verify(cfg: VerifyConfig) -> Result<BatchHandle, ConfigError> {
    validate_watchdog(&cfg.watchdog)?;
    if cfg.max_workers == 0 {
        return Err(ConfigError::ZeroWorkers);
    }

    let (event_tx, events) = mpsc::unbounded_channel();
    let stop = Arc::new(CancelCell::default());
    let join = tokio::spawn(supervisor::run_verify_batch(cfg, event_tx, stop.clone()));
    Ok(BatchHandle { stop, events, join })
}
