//! End-to-end scenarios driving the batch engine with fake worker scripts.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nonceforge_engine::{
    start_batch, start_verify, BatchConfig, BatchReport, ConfigError, InvocationConfig, Mode,
    VerifyConfig, WatchdogConfig,
};

/// A worker that parses `--output` and writes `{}` to `<nonce>.json`.
/// The `$extra` hook runs with `$nonce` and `$out` in scope.
fn worker_script(extra: &str) -> String {
    format!(
        r#"#!/bin/sh
nonce="$3"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
{extra}
printf '{{}}' > "$out/$nonce.json"
"#
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn batch_config(mode: Mode, worker_bin: &Path, out_dir: &Path, n: u64, workers: usize) -> BatchConfig {
    BatchConfig {
        mode,
        start_nonce: 0,
        num_nonces: n,
        max_workers: workers,
        worker: InvocationConfig {
            worker_bin: worker_bin.to_path_buf(),
            settings_json: r#"{"challenge":"test"}"#.to_string(),
            rand_hash: "cafef00d".to_string(),
            so_path: PathBuf::from("algo.so"),
            max_fuel: 1_000,
            output_dir: out_dir.to_path_buf(),
            ptx_path: None,
            gpu_id: None,
            data: None,
            hyperparameters: None,
        },
        batch_timeout: Duration::ZERO,
        worker_timeout: Duration::ZERO,
        // Disabled sensing keeps the scenarios deterministic; the retry
        // queue still operates.
        watchdog: WatchdogConfig {
            disabled: true,
            ..WatchdogConfig::default()
        },
    }
}

async fn run(cfg: BatchConfig) -> BatchReport {
    let handle = start_batch(cfg).unwrap();
    tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .expect("batch did not terminate in time")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strict_happy_path() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(tmp.path(), "worker.sh", &worker_script(""));
    let out = tmp.path().join("out");

    let report = run(batch_config(Mode::Strict, &worker, &out, 4, 2)).await;

    assert_eq!(report.success, 4);
    assert!(report.fatal.is_none());
    assert!(report.errors.is_empty());
    for nonce in 0..4 {
        assert!(out.join(format!("{nonce}.json")).exists());
    }
    assert!(!out.join("result.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strict_aborts_on_permanent_error() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(
        tmp.path(),
        "worker.sh",
        &worker_script(
            r#"if [ "$nonce" = "3" ]; then echo "boom" >&2; exit 2; fi"#,
        ),
    );
    let out = tmp.path().join("out");

    let report = run(batch_config(Mode::Strict, &worker, &out, 4, 2)).await;

    let fatal = report.fatal.expect("strict batch must abort");
    assert!(fatal.contains("nonce 3: exit 2: boom"), "got: {fatal}");
    assert!(report.success < 4);

    let raw = std::fs::read_to_string(out.join("result.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(doc["error"].as_str().unwrap().contains("nonce 3: exit 2: boom"));
    assert!(!out.join("3.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lenient_records_errors_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(
        tmp.path(),
        "worker.sh",
        &worker_script(
            r#"if [ "$nonce" = "2" ]; then echo "bad state" >&2; exit 7; fi"#,
        ),
    );
    let out = tmp.path().join("out");

    let report = run(batch_config(Mode::Lenient, &worker, &out, 5, 2)).await;

    assert_eq!(report.success, 4);
    assert!(report.fatal.is_none());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[&2].contains("exit 7: bad state"));

    let raw = std::fs::read_to_string(out.join("result.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(doc["errors"]["2"].as_str().unwrap().contains("exit 7"));
    for nonce in [0u64, 1, 3, 4] {
        assert!(out.join(format!("{nonce}.json")).exists());
    }
    assert!(!out.join("2.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_killed_worker_is_retried_until_it_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    // Nonce 1 dies on SIGTERM for its first two attempts, then succeeds.
    let worker = write_script(
        tmp.path(),
        "worker.sh",
        &worker_script(
            r#"if [ "$nonce" = "1" ]; then
  echo attempt >> "$out/attempts-1"
  if [ "$(wc -l < "$out/attempts-1")" -lt 3 ]; then
    kill -TERM $$
    sleep 5
  fi
fi"#,
        ),
    );
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let report = run(batch_config(Mode::Strict, &worker, &out, 3, 2)).await;

    assert_eq!(report.success, 3);
    assert!(out.join("1.json").exists());
    let attempts = std::fs::read_to_string(out.join("attempts-1")).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pre_existing_outputs_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(
        tmp.path(),
        "worker.sh",
        &worker_script(r#"echo "$nonce" >> "$out/spawned""#),
    );
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("2.json"), "{}").unwrap();

    let report = run(batch_config(Mode::Strict, &worker, &out, 3, 2)).await;

    assert_eq!(report.success, 3);
    let spawned = std::fs::read_to_string(out.join("spawned")).unwrap();
    assert_eq!(spawned.lines().count(), 2);
    assert!(!spawned.lines().any(|line| line == "2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explore_is_bounded_by_the_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(tmp.path(), "worker.sh", &worker_script("sleep 0.1"));
    let out = tmp.path().join("out");

    let mut cfg = batch_config(Mode::Explore, &worker, &out, 0, 2);
    cfg.batch_timeout = Duration::from_secs(2);
    let report = run(cfg).await;

    assert!(report.success >= 2, "success = {}", report.success);
    assert!(report.attempted >= report.success);
    // Cancel-then-drain: the run must come back promptly after the timeout.
    assert!(report.elapsed < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixed_batch_timeout_stops_slow_workers() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(tmp.path(), "worker.sh", &worker_script("sleep 30"));
    let out = tmp.path().join("out");

    let mut cfg = batch_config(Mode::Lenient, &worker, &out, 4, 2);
    cfg.batch_timeout = Duration::from_secs(1);
    let report = run(cfg).await;

    assert_eq!(report.success, 0);
    assert!(report.elapsed < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_timeout_is_a_permanent_error() {
    let tmp = tempfile::tempdir().unwrap();
    let worker = write_script(tmp.path(), "worker.sh", &worker_script("sleep 30"));
    let out = tmp.path().join("out");

    let mut cfg = batch_config(Mode::Lenient, &worker, &out, 1, 1);
    cfg.worker_timeout = Duration::from_secs(1);
    let report = run(cfg).await;

    assert_eq!(report.success, 0);
    assert!(report.errors[&0].contains("timeout after 1s"));
}

#[tokio::test]
async fn watermark_inversion_is_rejected_before_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = batch_config(
        Mode::Strict,
        Path::new("unused"),
        &tmp.path().join("out"),
        1,
        1,
    );
    cfg.watchdog.high_watermark = 0.5;
    cfg.watchdog.low_watermark = 0.8;
    cfg.watchdog.disabled = false;

    let err = match start_batch(cfg) {
        Err(err) => err,
        Ok(_) => panic!("expected a configuration error"),
    };
    assert!(matches!(err, ConfigError::WatermarkInversion));
    assert!(!tmp.path().join("out").exists());
}

#[tokio::test]
async fn explore_without_timeout_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = batch_config(
        Mode::Explore,
        Path::new("unused"),
        &tmp.path().join("out"),
        1,
        1,
    );
    let err = match start_batch(cfg) {
        Err(err) => err,
        Ok(_) => panic!("expected a configuration error"),
    };
    assert!(matches!(err, ConfigError::ExploreWithoutTimeout));
}

fn verify_config(verifier_bin: &Path, out_dir: &Path, start: u64, n: u64) -> VerifyConfig {
    VerifyConfig {
        start_nonce: start,
        num_nonces: n,
        max_workers: 2,
        verifier_bin: verifier_bin.to_path_buf(),
        settings_json: "{}".to_string(),
        rand_hash: "cafef00d".to_string(),
        output_dir: out_dir.to_path_buf(),
        data: None,
        ptx_path: None,
        gpu_id: None,
        watchdog: WatchdogConfig {
            disabled: true,
            ..WatchdogConfig::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verifier_merges_quality_idempotently() {
    let tmp = tempfile::tempdir().unwrap();
    let verifier = write_script(tmp.path(), "verifier.sh", "#!/bin/sh\necho \"quality: 7\"\n");
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("5.json"), r#"{"solution":[1]}"#).unwrap();

    let handle = start_verify(verify_config(&verifier, &out, 5, 1)).unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.success, 1);

    let first = std::fs::read_to_string(out.join("5.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(doc["quality"], 7);
    assert_eq!(doc["solution"][0], 1);

    let handle = start_verify(verify_config(&verifier, &out, 5, 1)).unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.success, 1);
    let second = std::fs::read_to_string(out.join("5.json")).unwrap();
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verifier_reports_missing_files_and_bad_output() {
    let tmp = tempfile::tempdir().unwrap();
    let verifier = write_script(tmp.path(), "verifier.sh", "#!/bin/sh\necho \"done\"\n");
    let out = tmp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("0.json"), "{}").unwrap();

    // Nonce 0 exists but the verifier never prints a quality line; nonce 1
    // has no output file at all.
    let handle = start_verify(verify_config(&verifier, &out, 0, 2)).unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.success, 0);
    assert_eq!(report.errors[&0], "failed to find quality in output");
    assert_eq!(report.errors[&1], "missing file");

    let raw = std::fs::read_to_string(out.join("verifier_errors.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["errors"]["1"], "missing file");
}
