//! Worker subprocess plumbing: command assembly, supervised execution with
//! cancellation and timeout, and the graceful-then-hard kill sequence.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use nonceforge_core::outcome::{classify, Outcome};
use nonceforge_core::summary::output_file;

use crate::api::InvocationConfig;
use crate::watchdog::{CancelCell, Watchdog};

/// Grace period between SIGTERM and SIGKILL. Some workers trap SIGTERM to
/// release GPU memory cleanly, so the hard kill must not come first.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Assemble the worker argv for one nonce. Field order is part of the worker
/// contract.
pub(crate) fn worker_args(cfg: &InvocationConfig, nonce: u64) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        cfg.settings_json.clone().into(),
        cfg.rand_hash.clone().into(),
        nonce.to_string().into(),
        cfg.so_path.clone().into_os_string(),
        "--fuel".into(),
        cfg.max_fuel.to_string().into(),
        "--output".into(),
        cfg.output_dir.clone().into_os_string(),
    ];
    if let Some(data) = &cfg.data {
        args.push("--data".into());
        args.push(data.clone().into());
    }
    if let Some(hp) = &cfg.hyperparameters {
        args.push("--hyperparameters".into());
        args.push(hp.clone().into());
    }
    if let Some(ptx) = &cfg.ptx_path {
        args.push("--ptx".into());
        args.push(ptx.clone().into_os_string());
    }
    match cfg.gpu_id {
        Some(id) => {
            args.push("--gpu".into());
            args.push(id.to_string().into());
        }
        // A PTX module without an explicit device means device 0.
        None if cfg.ptx_path.is_some() => {
            args.push("--gpu".into());
            args.push("0".into());
        }
        None => {}
    }
    args
}

/// How a supervised subprocess ended.
pub(crate) enum ExecResult {
    /// Natural exit, with captured pipes.
    Finished {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// Torn down because the cancel cell fired.
    Cancelled,
    /// Torn down because the per-process timeout expired.
    TimedOut,
    /// The process never started.
    SpawnFailed(std::io::Error),
}

/// Spawn `cmd` and wait for it, honoring the cancel cell and an optional
/// per-process timeout. The pid is attached to the watchdog right after the
/// spawn; if a watchdog kill races ahead of the attach, the cancel branch
/// still tears the subprocess down.
pub(crate) async fn run_supervised(
    mut cmd: Command,
    nonce: u64,
    capture_stdout: bool,
    timeout: Duration,
    cancel: &CancelCell,
    watchdog: &Watchdog,
) -> ExecResult {
    cmd.stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return ExecResult::SpawnFailed(err),
    };
    if let Some(pid) = child.id() {
        watchdog.attach_process(nonce, pid);
    }

    // Drain the pipes concurrently so a chatty worker cannot block on them.
    let stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(read_pipe(stderr_pipe));
    let stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(read_pipe(stdout_pipe));

    let status = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => status,
            Err(err) => {
                let _ = stderr_task.await;
                let _ = stdout_task.await;
                return ExecResult::SpawnFailed(err);
            }
        },
        _ = cancel.cancelled() => {
            terminate_child(&mut child).await;
            let _ = stderr_task.await;
            let _ = stdout_task.await;
            return ExecResult::Cancelled;
        }
        _ = tokio::time::sleep(timeout), if !timeout.is_zero() => {
            terminate_child(&mut child).await;
            let _ = stderr_task.await;
            let _ = stdout_task.await;
            return ExecResult::TimedOut;
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    let stdout = stdout_task.await.unwrap_or_default();
    ExecResult::Finished {
        status,
        stdout,
        stderr,
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Run one compute worker and classify its outcome. Checks for a
/// pre-existing output first (idempotent skip).
pub(crate) async fn run_nonce(
    cfg: Arc<InvocationConfig>,
    nonce: u64,
    worker_timeout: Duration,
    cancel: Arc<CancelCell>,
    watchdog: Arc<Watchdog>,
) -> Outcome {
    let output = output_file(&cfg.output_dir, nonce);
    if output.exists() {
        return Outcome::AlreadyDone;
    }

    let mut cmd = Command::new(&cfg.worker_bin);
    cmd.args(worker_args(&cfg, nonce));

    match run_supervised(cmd, nonce, false, worker_timeout, &cancel, &watchdog).await {
        ExecResult::SpawnFailed(err) => {
            Outcome::Permanent(format!("spawn {}: {err}", cfg.worker_bin.display()))
        }
        ExecResult::Cancelled => Outcome::Cancelled,
        ExecResult::TimedOut => {
            Outcome::Permanent(format!("timeout after {}s", worker_timeout.as_secs()))
        }
        ExecResult::Finished { status, stderr, .. } => {
            let stderr = String::from_utf8_lossy(&stderr);
            classify(status.code(), status.signal(), &stderr, output.exists())
        }
    }
}

/// Terminate a child we own: SIGTERM, bounded grace, then SIGKILL, and reap.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        send_signal(pid, libc::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Terminate a process by pid (watchdog path, no `Child` handle): SIGTERM,
/// bounded grace, then SIGKILL if it is still around. The owning task reaps
/// the exit status. Signal failures are ignored; kill is idempotent.
pub(crate) async fn terminate_pid(pid: u32) {
    if !send_signal(pid, libc::SIGTERM) {
        return;
    }
    tokio::time::sleep(KILL_GRACE).await;
    if send_signal(pid, 0) {
        send_signal(pid, libc::SIGKILL);
    }
}

/// Returns true when the signal was delivered (the process still exists).
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: i32) -> bool {
    // SAFETY: plain syscall on a pid we spawned; no memory is touched.
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_invocation() -> InvocationConfig {
        InvocationConfig {
            worker_bin: PathBuf::from("nonce-runtime"),
            settings_json: r#"{"challenge":"c001"}"#.to_string(),
            rand_hash: "abc123".to_string(),
            so_path: PathBuf::from("/opt/algos/solver.so"),
            max_fuel: 9_000_000,
            output_dir: PathBuf::from("/tmp/out"),
            ptx_path: None,
            gpu_id: None,
            data: None,
            hyperparameters: None,
        }
    }

    fn strs(args: &[OsString]) -> Vec<&str> {
        args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn argv_order_is_stable() {
        let args = worker_args(&base_invocation(), 42);
        assert_eq!(
            strs(&args),
            vec![
                r#"{"challenge":"c001"}"#,
                "abc123",
                "42",
                "/opt/algos/solver.so",
                "--fuel",
                "9000000",
                "--output",
                "/tmp/out",
            ]
        );
    }

    #[test]
    fn optional_flags_come_in_declaration_order() {
        let mut cfg = base_invocation();
        cfg.data = Some("blob".to_string());
        cfg.hyperparameters = Some("hp".to_string());
        cfg.ptx_path = Some(PathBuf::from("kernel.ptx"));
        cfg.gpu_id = Some(2);
        let args = worker_args(&cfg, 0);
        let tail: Vec<&str> = strs(&args)[8..].to_vec();
        assert_eq!(
            tail,
            vec![
                "--data",
                "blob",
                "--hyperparameters",
                "hp",
                "--ptx",
                "kernel.ptx",
                "--gpu",
                "2",
            ]
        );
    }

    #[test]
    fn ptx_without_gpu_implies_device_zero() {
        let mut cfg = base_invocation();
        cfg.ptx_path = Some(PathBuf::from("kernel.ptx"));
        let args = worker_args(&cfg, 0);
        let tail: Vec<&str> = strs(&args)[8..].to_vec();
        assert_eq!(tail, vec!["--ptx", "kernel.ptx", "--gpu", "0"]);
    }

    #[test]
    fn no_gpu_flag_without_gpu_or_ptx() {
        let args = worker_args(&base_invocation(), 0);
        assert!(!strs(&args).contains(&"--gpu"));
    }

    #[test]
    fn explicit_gpu_without_ptx_is_forwarded() {
        let mut cfg = base_invocation();
        cfg.gpu_id = Some(0);
        let args = worker_args(&cfg, 0);
        let tail: Vec<&str> = strs(&args)[8..].to_vec();
        assert_eq!(tail, vec!["--gpu", "0"]);
    }
}
