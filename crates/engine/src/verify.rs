//! Verifier pass: re-run each produced output through the external verifier
//! and annotate it with the reported quality score.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use nonceforge_core::outcome::{has_oom_marker, stderr_snippet, Outcome, RetryReason};
use nonceforge_core::summary::{merge_quality, output_file, parse_quality};

use crate::watchdog::{CancelCell, Watchdog};
use crate::worker::{run_supervised, ExecResult};

/// Wall-clock bound for a single verifier invocation.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// How the verifier is invoked.
pub(crate) struct VerifySpec {
    pub(crate) verifier_bin: PathBuf,
    pub(crate) settings_json: String,
    pub(crate) rand_hash: String,
    pub(crate) output_dir: PathBuf,
    pub(crate) data: Option<String>,
    pub(crate) ptx_path: Option<PathBuf>,
    pub(crate) gpu_id: Option<u32>,
}

/// Assemble the verifier argv for one nonce. Unlike the worker, the verifier
/// gets `--gpu` only when a device was configured explicitly.
pub(crate) fn verifier_args(spec: &VerifySpec, nonce: u64, output_file: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        spec.settings_json.clone().into(),
        spec.rand_hash.clone().into(),
        nonce.to_string().into(),
        output_file.to_path_buf().into_os_string(),
    ];
    if let Some(data) = &spec.data {
        args.push("--data".into());
        args.push(data.clone().into());
    }
    if let Some(ptx) = &spec.ptx_path {
        args.push("--ptx".into());
        args.push(ptx.clone().into_os_string());
    }
    if let Some(id) = spec.gpu_id {
        args.push("--gpu".into());
        args.push(id.to_string().into());
    }
    args
}

/// Verify one nonce: run the verifier, parse `quality: <n>` off its stdout,
/// and merge the score into the output file.
pub(crate) async fn verify_nonce(
    spec: Arc<VerifySpec>,
    nonce: u64,
    cancel: Arc<CancelCell>,
    watchdog: Arc<Watchdog>,
) -> Outcome {
    let output = output_file(&spec.output_dir, nonce);
    if !output.exists() {
        return Outcome::Permanent("missing file".to_string());
    }

    let mut cmd = Command::new(&spec.verifier_bin);
    cmd.args(verifier_args(&spec, nonce, &output));

    match run_supervised(cmd, nonce, true, VERIFY_TIMEOUT, &cancel, &watchdog).await {
        ExecResult::SpawnFailed(err) => {
            Outcome::Permanent(format!("spawn {}: {err}", spec.verifier_bin.display()))
        }
        ExecResult::Cancelled => Outcome::Cancelled,
        ExecResult::TimedOut => {
            Outcome::Permanent(format!("timeout after {}s", VERIFY_TIMEOUT.as_secs()))
        }
        ExecResult::Finished {
            status,
            stdout,
            stderr,
        } => {
            if let Some(sig) = status.signal() {
                if sig == 9 || sig == 15 {
                    return Outcome::Retryable(RetryReason::Signal(sig));
                }
            }
            let stderr = String::from_utf8_lossy(&stderr);
            if has_oom_marker(&stderr) {
                return Outcome::Retryable(RetryReason::OomMarker);
            }
            if !status.success() {
                let label = match status.code() {
                    Some(code) => format!("exit {code}"),
                    None => format!("signal {}", status.signal().unwrap_or(0)),
                };
                return Outcome::Permanent(format!("{label}: {}", stderr_snippet(&stderr)));
            }

            let stdout = String::from_utf8_lossy(&stdout);
            let Some(quality) = parse_quality(&stdout) else {
                return Outcome::Permanent("failed to find quality in output".to_string());
            };
            match merge_quality(&output, quality) {
                Ok(()) => Outcome::Ok,
                Err(err) => Outcome::Permanent(format!("merge quality: {err:#}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> VerifySpec {
        VerifySpec {
            verifier_bin: PathBuf::from("nonce-verifier"),
            settings_json: "{}".to_string(),
            rand_hash: "abc".to_string(),
            output_dir: PathBuf::from("/tmp/out"),
            data: None,
            ptx_path: None,
            gpu_id: None,
        }
    }

    fn strs(args: &[OsString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn argv_order_is_stable() {
        let args = verifier_args(&base_spec(), 7, Path::new("/tmp/out/7.json"));
        assert_eq!(strs(&args), vec!["{}", "abc", "7", "/tmp/out/7.json"]);
    }

    #[test]
    fn gpu_is_only_forwarded_when_configured() {
        let mut spec = base_spec();
        spec.ptx_path = Some(PathBuf::from("kernel.ptx"));
        let args = verifier_args(&spec, 0, Path::new("0.json"));
        // No implied device 0 here, unlike the compute worker.
        assert!(!strs(&args).contains(&"--gpu"));

        spec.gpu_id = Some(1);
        let args = verifier_args(&spec, 0, Path::new("0.json"));
        let tail: Vec<&str> = strs(&args)[4..].to_vec();
        assert_eq!(tail, vec!["--ptx", "kernel.ptx", "--gpu", "1"]);
    }
}
