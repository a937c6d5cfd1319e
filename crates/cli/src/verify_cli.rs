use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use nonceforge_engine::{VerifyConfig, WatchdogConfig};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "nonceforge-verify",
    version,
    about = "Verify produced outputs and annotate them with quality scores"
)]
pub struct Cli {
    /// First nonce to verify.
    #[arg(long)]
    pub start_nonce: u64,

    /// Number of nonces to verify.
    #[arg(long)]
    pub num_nonces: u64,

    /// Maximum number of verifier processes to keep in flight.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=512))]
    pub max_workers: u16,

    /// Settings JSON, passed through to the verifier verbatim.
    #[arg(long)]
    pub settings: String,

    /// Randomness seed, passed through to the verifier verbatim.
    #[arg(long)]
    pub rand_hash: String,

    /// Directory holding the `<nonce>.json` files to verify.
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Optional encrypted data blob for the verifier.
    #[arg(long)]
    pub data: Option<String>,

    /// Optional PTX module for GPU verifiers.
    #[arg(long)]
    pub ptx: Option<PathBuf>,

    /// GPU device index; also selects the VRAM watchdog.
    #[arg(long)]
    pub gpu_id: Option<u32>,

    /// Verifier executable.
    #[arg(long, env = "NONCEFORGE_VERIFIER_BIN", default_value = "nonce-verifier")]
    pub verifier_bin: PathBuf,

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
    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            start_nonce: self.start_nonce,
            num_nonces: self.num_nonces,
            max_workers: self.max_workers as usize,
            verifier_bin: self.verifier_bin.clone(),
            settings_json: self.settings.clone(),
            rand_hash: self.rand_hash.clone(),
            output_dir: self.output_dir.clone(),
            data: self.data.clone(),
            ptx_path: self.ptx.clone(),
            gpu_id: self.gpu_id,
            watchdog: WatchdogConfig {
                high_watermark: self.mem_high / 100.0,
                low_watermark: self.mem_low / 100.0,
                check_interval: Duration::from_millis(self.mem_interval),
                disabled: self.no_oom,
            },
        }
    }
}
