//! The scheduling core: a single-owner loop that keeps up to `max_workers`
//! subprocesses in flight, arbitrates between fresh work, retried work and
//! watchdog kills, and classifies every completion.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use nonceforge_core::outcome::Outcome;
use nonceforge_core::summary::{
    write_error_summary, write_fatal_summary, RESULT_FILE, VERIFIER_ERRORS_FILE,
};

use crate::api::{BatchConfig, BatchEvent, BatchReport, Mode, VerifyConfig};
use crate::probe::MemoryProbe;
use crate::verify::{self, VerifySpec};
use crate::watchdog::{CancelCell, Watchdog};
use crate::worker;

/// Floor on the bounded completion wait, independent of the poll cadence.
const WAIT_FLOOR: Duration = Duration::from_millis(50);

/// Bound on draining cancelled workers at shutdown before aborting their
/// tasks outright.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What one in-flight slot runs.
#[derive(Clone)]
enum JobSpec {
    Compute {
        invocation: Arc<crate::api::InvocationConfig>,
        worker_timeout: Duration,
    },
    Verify(Arc<VerifySpec>),
}

impl JobSpec {
    async fn run(&self, nonce: u64, cancel: Arc<CancelCell>, watchdog: Arc<Watchdog>) -> Outcome {
        let outcome = match self {
            JobSpec::Compute {
                invocation,
                worker_timeout,
            } => {
                worker::run_nonce(
                    invocation.clone(),
                    nonce,
                    *worker_timeout,
                    cancel.clone(),
                    watchdog,
                )
                .await
            }
            JobSpec::Verify(spec) => {
                verify::verify_nonce(spec.clone(), nonce, cancel.clone(), watchdog).await
            }
        };
        cancel.mark_done();
        outcome
    }
}

struct InFlightTask {
    cancel: Arc<CancelCell>,
    started_at: Instant,
}

/// The bounded in-flight set: the join set plus its bookkeeping.
#[derive(Default)]
struct Flight {
    join: JoinSet<(u64, Outcome)>,
    tasks: HashMap<u64, InFlightTask>,
    ids: HashMap<tokio::task::Id, u64>,
}

impl Flight {
    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

struct Supervisor {
    job: JobSpec,
    strict: bool,
    start_nonce: u64,
    num_nonces: u64,
    max_workers: usize,
    batch_timeout: Duration,
    watchdog: Arc<Watchdog>,
    events: mpsc::UnboundedSender<BatchEvent>,
    stop: Arc<CancelCell>,
}

impl Supervisor {
    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }

    fn wait_floor(&self) -> Duration {
        (self.watchdog.check_interval() * 5).max(WAIT_FLOOR)
    }

    fn spawn(&self, flight: &mut Flight, nonce: u64) {
        let cancel = Arc::new(CancelCell::default());
        // Register before the subprocess exists so a watchdog kill can never
        // observe an unknown nonce.
        self.watchdog.register(nonce, cancel.clone(), 0);

        let job = self.job.clone();
        let watchdog = self.watchdog.clone();
        let task_cancel = cancel.clone();
        let handle = flight.join.spawn(async move {
            let outcome = job.run(nonce, task_cancel, watchdog).await;
            (nonce, outcome)
        });
        flight.ids.insert(handle.id(), nonce);
        flight.tasks.insert(
            nonce,
            InFlightTask {
                cancel,
                started_at: Instant::now(),
            },
        );
        self.emit(BatchEvent::NonceStarted { nonce });
    }

    /// Wait for one completion, bounded by `wait`, the stop signal, and the
    /// join set itself.
    async fn wait_next(
        &self,
        flight: &mut Flight,
        wait: Duration,
    ) -> Option<Result<(tokio::task::Id, (u64, Outcome)), JoinError>> {
        tokio::select! {
            res = flight.join.join_next_with_id() => res,
            _ = tokio::time::sleep(wait) => None,
            _ = self.stop.cancelled() => None,
        }
    }

    /// Take a completed slot out of the bookkeeping, returning the time the
    /// nonce spent in flight.
    fn settle(&self, flight: &mut Flight, id: tokio::task::Id, nonce: u64) -> u64 {
        flight.ids.remove(&id);
        let task = flight.tasks.remove(&nonce);
        self.watchdog.unregister(nonce);
        task.map(|t| t.started_at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Cancel everything still in flight and drain it, bounded. Workers get
    /// the terminate-then-kill sequence from their own cancel branch.
    async fn shutdown_in_flight(&self, flight: &mut Flight) {
        if flight.is_empty() {
            return;
        }
        self.emit(BatchEvent::CancellingRemaining {
            count: flight.len(),
        });
        for task in flight.tasks.values() {
            task.cancel.cancel();
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while flight.join.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            flight.join.abort_all();
            while flight.join.join_next().await.is_some() {}
        }
        for nonce in flight.tasks.keys() {
            self.watchdog.unregister(*nonce);
        }
        flight.tasks.clear();
        flight.ids.clear();
    }

    /// Fixed-size batch over `[start_nonce, start_nonce + num_nonces)`.
    ///
    /// Strict aborts on the first permanent error; lenient records it and
    /// keeps going. Nonces killed for memory reasons cycle through the
    /// watchdog's retry queue until they complete or the batch ends.
    async fn run_fixed(self) -> BatchReport {
        let started = Instant::now();
        let deadline = (!self.batch_timeout.is_zero()).then(|| started + self.batch_timeout);
        let interval = self.watchdog.check_interval();

        let mut pending: BTreeSet<u64> =
            (self.start_nonce..self.start_nonce + self.num_nonces).collect();
        let mut flight = Flight::default();
        let mut completed: HashSet<u64> = HashSet::new();
        let mut errors: BTreeMap<u64, String> = BTreeMap::new();
        let mut success: u64 = 0;
        let mut attempted: u64 = 0;
        let mut fatal: Option<String> = None;

        'batch: while !pending.is_empty()
            || !flight.is_empty()
            || self.watchdog.pending_restart_count() > 0
        {
            if self.stop.is_cancelled() {
                self.emit(BatchEvent::Warning {
                    message: "stop requested; cancelling remaining work".to_string(),
                });
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.emit(BatchEvent::TimeoutReached {
                        seconds: self.batch_timeout.as_secs(),
                    });
                    break;
                }
            }

            // Killed nonces come back only below the low watermark, and
            // never once they have been counted.
            for nonce in self.watchdog.poll_restartable() {
                if !completed.contains(&nonce) {
                    pending.insert(nonce);
                }
            }

            // Hold new spawns back while the probe reads above the kill
            // watermark; the watchdog is busy draining the host.
            let saturated = self.watchdog.is_enabled()
                && self.watchdog.memory_usage() > self.watchdog.high_watermark();
            if !saturated {
                while flight.len() < self.max_workers {
                    let Some(nonce) = pending.pop_first() else { break };
                    self.spawn(&mut flight, nonce);
                    attempted += 1;
                }
            }

            if flight.is_empty() {
                if self.watchdog.pending_restart_count() > 0 || saturated {
                    tokio::time::sleep(interval * 2).await;
                }
                continue;
            }

            let mut wait = self.wait_floor();
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(Instant::now()));
            }
            let Some(res) = self.wait_next(&mut flight, wait).await else {
                continue;
            };

            match res {
                Ok((id, (nonce, outcome))) => {
                    let elapsed_ms = self.settle(&mut flight, id, nonce);
                    match outcome {
                        Outcome::Ok | Outcome::AlreadyDone => {
                            let already_done = outcome == Outcome::AlreadyDone;
                            success += 1;
                            completed.insert(nonce);
                            self.emit(BatchEvent::NonceCompleted {
                                nonce,
                                elapsed_ms,
                                already_done,
                            });
                        }
                        Outcome::Retryable(reason) => {
                            self.watchdog.queue_for_retry(nonce);
                            self.emit(BatchEvent::NonceRequeued {
                                nonce,
                                reason: reason.to_string(),
                            });
                        }
                        Outcome::Cancelled => {
                            self.watchdog.queue_for_retry(nonce);
                            self.emit(BatchEvent::NonceRequeued {
                                nonce,
                                reason: "cancelled".to_string(),
                            });
                        }
                        Outcome::Permanent(message) => {
                            self.emit(BatchEvent::NonceFailed {
                                nonce,
                                message: message.clone(),
                            });
                            if self.strict {
                                fatal = Some(format!("nonce {nonce}: {message}"));
                                break 'batch;
                            }
                            errors.insert(nonce, message);
                            completed.insert(nonce);
                        }
                    }
                }
                Err(join_err) => {
                    let nonce = flight.ids.remove(&join_err.id());
                    if let Some(nonce) = nonce {
                        flight.tasks.remove(&nonce);
                        self.watchdog.unregister(nonce);
                    }
                    let message = match nonce {
                        Some(nonce) => format!("worker task for nonce {nonce} failed: {join_err}"),
                        None => format!("worker task failed: {join_err}"),
                    };
                    self.emit(BatchEvent::Error {
                        message: message.clone(),
                    });
                    if self.strict {
                        fatal = Some(message);
                        break 'batch;
                    }
                    if let Some(nonce) = nonce {
                        errors.insert(nonce, message);
                        completed.insert(nonce);
                    }
                }
            }
        }

        self.shutdown_in_flight(&mut flight).await;

        BatchReport {
            success,
            attempted,
            errors,
            fatal,
            elapsed: started.elapsed(),
        }
    }

    /// Time-boxed exploration of the unbounded sequence from `start_nonce`.
    ///
    /// Slots freed by a success or a permanent error respawn immediately,
    /// preferring the retry queue over fresh nonces; slots freed by a
    /// memory kill stay parked until the pressure drops below the low
    /// watermark. Slots owed a fresh nonce (including the initial prime)
    /// are filled only while the probe reads below the kill watermark.
    async fn run_explore(self) -> BatchReport {
        let started = Instant::now();
        let deadline = started + self.batch_timeout;
        let interval = self.watchdog.check_interval();

        let mut flight = Flight::default();
        let mut errors: BTreeMap<u64, String> = BTreeMap::new();
        let mut next_nonce = self.start_nonce;
        let mut success: u64 = 0;
        let mut timed_out = false;

        // Slots waiting for a fresh nonce; starts at full width to prime.
        let mut unfilled = self.max_workers;

        loop {
            if self.stop.is_cancelled() {
                self.emit(BatchEvent::Warning {
                    message: "stop requested; cancelling remaining work".to_string(),
                });
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }

            // Re-admit parked slots once memory has cooled off.
            while flight.len() < self.max_workers {
                let Some(nonce) = self.watchdog.poll_restartable().into_iter().next() else {
                    break;
                };
                self.spawn(&mut flight, nonce);
            }

            // Fill slots owed a fresh nonce, unless the probe reads above
            // the kill watermark; the watchdog is busy draining the host.
            let saturated = self.watchdog.is_enabled()
                && self.watchdog.memory_usage() > self.watchdog.high_watermark();
            while !saturated && unfilled > 0 && flight.len() < self.max_workers {
                self.spawn(&mut flight, next_nonce);
                next_nonce += 1;
                unfilled -= 1;
            }

            if flight.is_empty() {
                if self.watchdog.pending_restart_count() == 0 && unfilled == 0 {
                    break;
                }
                tokio::time::sleep(interval * 2).await;
                continue;
            }

            let wait = self
                .wait_floor()
                .min(deadline.saturating_duration_since(now));
            let Some(res) = self.wait_next(&mut flight, wait).await else {
                continue;
            };

            let respawn = match res {
                Ok((id, (nonce, outcome))) => {
                    let elapsed_ms = self.settle(&mut flight, id, nonce);
                    match outcome {
                        Outcome::Ok | Outcome::AlreadyDone => {
                            let already_done = outcome == Outcome::AlreadyDone;
                            success += 1;
                            self.emit(BatchEvent::NonceCompleted {
                                nonce,
                                elapsed_ms,
                                already_done,
                            });
                            true
                        }
                        Outcome::Retryable(reason) => {
                            self.watchdog.queue_for_retry(nonce);
                            self.emit(BatchEvent::NonceRequeued {
                                nonce,
                                reason: reason.to_string(),
                            });
                            false
                        }
                        Outcome::Cancelled => {
                            self.watchdog.queue_for_retry(nonce);
                            self.emit(BatchEvent::NonceRequeued {
                                nonce,
                                reason: "cancelled".to_string(),
                            });
                            false
                        }
                        Outcome::Permanent(message) => {
                            self.emit(BatchEvent::NonceFailed {
                                nonce,
                                message: message.clone(),
                            });
                            errors.insert(nonce, message);
                            true
                        }
                    }
                }
                Err(join_err) => {
                    let nonce = flight.ids.remove(&join_err.id());
                    if let Some(nonce) = nonce {
                        flight.tasks.remove(&nonce);
                        self.watchdog.unregister(nonce);
                        errors.insert(nonce, format!("worker task failed: {join_err}"));
                    }
                    self.emit(BatchEvent::Error {
                        message: format!("worker task failed: {join_err}"),
                    });
                    true
                }
            };

            if respawn && Instant::now() < deadline && !self.stop.is_cancelled() {
                match self.watchdog.poll_restartable().into_iter().next() {
                    Some(nonce) => self.spawn(&mut flight, nonce),
                    // The slot is owed a fresh nonce; the fill at the top of
                    // the loop spawns it once the host is not saturated.
                    None => unfilled += 1,
                }
            }
        }

        if timed_out {
            self.emit(BatchEvent::TimeoutReached {
                seconds: self.batch_timeout.as_secs(),
            });
        }
        self.shutdown_in_flight(&mut flight).await;

        BatchReport {
            success,
            attempted: next_nonce - self.start_nonce,
            errors,
            fatal: None,
            elapsed: started.elapsed(),
        }
    }
}

/// Create the output directory, tolerating its pre-existence.
fn ensure_output_dir(dir: &Path, events: &mpsc::UnboundedSender<BatchEvent>) -> bool {
    if let Err(err) = std::fs::create_dir_all(dir) {
        if !dir.is_dir() {
            let _ = events.send(BatchEvent::Error {
                message: format!("Cannot create output directory {}: {err}", dir.display()),
            });
            return false;
        }
    }
    true
}

/// Drive one batch run to completion. Configuration was validated by
/// [`crate::api::start_batch`].
pub(crate) async fn run_batch(
    cfg: BatchConfig,
    events: mpsc::UnboundedSender<BatchEvent>,
    stop: Arc<CancelCell>,
) -> BatchReport {
    let started = Instant::now();
    let total = (cfg.mode != Mode::Explore).then_some(cfg.num_nonces);

    if !ensure_output_dir(&cfg.worker.output_dir, &events) {
        let report = BatchReport {
            elapsed: started.elapsed(),
            ..BatchReport::default()
        };
        let _ = events.send(BatchEvent::Completed {
            success: 0,
            total,
            attempted: 0,
            elapsed_secs: report.elapsed.as_secs_f64(),
        });
        return report;
    }

    let probe = MemoryProbe::for_config(cfg.worker.gpu_id, cfg.watchdog.disabled);
    let watchdog = Watchdog::new(cfg.watchdog, probe, events.clone());
    watchdog.start();

    let _ = events.send(BatchEvent::Started {
        mode: cfg.mode,
        start_nonce: cfg.start_nonce,
        num_nonces: total,
        max_workers: cfg.max_workers,
    });

    let supervisor = Supervisor {
        job: JobSpec::Compute {
            invocation: Arc::new(cfg.worker.clone()),
            worker_timeout: cfg.worker_timeout,
        },
        strict: cfg.mode == Mode::Strict,
        start_nonce: cfg.start_nonce,
        num_nonces: cfg.num_nonces,
        max_workers: cfg.max_workers,
        batch_timeout: cfg.batch_timeout,
        watchdog: watchdog.clone(),
        events: events.clone(),
        stop,
    };

    let mut report = match cfg.mode {
        Mode::Explore => supervisor.run_explore().await,
        Mode::Strict | Mode::Lenient => supervisor.run_fixed().await,
    };
    watchdog.stop().await;

    if let Some(fatal) = &report.fatal {
        if let Err(err) = write_fatal_summary(&cfg.worker.output_dir, fatal) {
            let _ = events.send(BatchEvent::Error {
                message: format!("write {RESULT_FILE}: {err:#}"),
            });
        }
    } else if !report.errors.is_empty() {
        if let Err(err) = write_error_summary(&cfg.worker.output_dir, RESULT_FILE, &report.errors)
        {
            let _ = events.send(BatchEvent::Error {
                message: format!("write {RESULT_FILE}: {err:#}"),
            });
        }
    }

    report.elapsed = started.elapsed();
    let _ = events.send(BatchEvent::Completed {
        success: report.success,
        total,
        attempted: report.attempted,
        elapsed_secs: report.elapsed.as_secs_f64(),
    });
    report
}

/// Drive one verifier pass to completion: a best-effort batch whose job is
/// the external verifier instead of the compute worker.
pub(crate) async fn run_verify_batch(
    cfg: VerifyConfig,
    events: mpsc::UnboundedSender<BatchEvent>,
    stop: Arc<CancelCell>,
) -> BatchReport {
    let started = Instant::now();

    if !ensure_output_dir(&cfg.output_dir, &events) {
        let report = BatchReport {
            elapsed: started.elapsed(),
            ..BatchReport::default()
        };
        let _ = events.send(BatchEvent::Completed {
            success: 0,
            total: Some(cfg.num_nonces),
            attempted: 0,
            elapsed_secs: report.elapsed.as_secs_f64(),
        });
        return report;
    }

    let probe = MemoryProbe::for_config(cfg.gpu_id, cfg.watchdog.disabled);
    let watchdog = Watchdog::new(cfg.watchdog, probe, events.clone());
    watchdog.start();

    let _ = events.send(BatchEvent::Started {
        mode: Mode::Lenient,
        start_nonce: cfg.start_nonce,
        num_nonces: Some(cfg.num_nonces),
        max_workers: cfg.max_workers,
    });

    let supervisor = Supervisor {
        job: JobSpec::Verify(Arc::new(VerifySpec {
            verifier_bin: cfg.verifier_bin.clone(),
            settings_json: cfg.settings_json.clone(),
            rand_hash: cfg.rand_hash.clone(),
            output_dir: cfg.output_dir.clone(),
            data: cfg.data.clone(),
            ptx_path: cfg.ptx_path.clone(),
            gpu_id: cfg.gpu_id,
        })),
        strict: false,
        start_nonce: cfg.start_nonce,
        num_nonces: cfg.num_nonces,
        max_workers: cfg.max_workers,
        batch_timeout: Duration::ZERO,
        watchdog: watchdog.clone(),
        events: events.clone(),
        stop,
    };

    let mut report = supervisor.run_fixed().await;
    watchdog.stop().await;

    if !report.errors.is_empty() {
        if let Err(err) = write_error_summary(&cfg.output_dir, VERIFIER_ERRORS_FILE, &report.errors)
        {
            let _ = events.send(BatchEvent::Error {
                message: format!("write {VERIFIER_ERRORS_FILE}: {err:#}"),
            });
        }
    }

    report.elapsed = started.elapsed();
    let _ = events.send(BatchEvent::Completed {
        success: report.success,
        total: Some(cfg.num_nonces),
        attempted: report.attempted,
        elapsed_secs: report.elapsed.as_secs_f64(),
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use crate::api::{InvocationConfig, WatchdogConfig};

    fn write_worker(dir: &Path) -> PathBuf {
        let path = dir.join("worker.sh");
        let body = concat!(
            "#!/bin/sh\n",
            "nonce=\"$3\"\n",
            "out=\"\"\n",
            "prev=\"\"\n",
            "for a in \"$@\"; do\n",
            "  if [ \"$prev\" = \"--output\" ]; then out=\"$a\"; fi\n",
            "  prev=\"$a\"\n",
            "done\n",
            "printf '{}' > \"$out/$nonce.json\"\n",
        );
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explore_defers_fresh_spawns_while_memory_is_hot() {
        let tmp = tempfile::tempdir().unwrap();
        let worker_bin = write_worker(tmp.path());
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let fraction = Arc::new(std::sync::Mutex::new(0.95));
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let watchdog = Watchdog::new(
            WatchdogConfig {
                check_interval: Duration::from_millis(20),
                ..WatchdogConfig::default()
            },
            MemoryProbe::manual(fraction.clone()),
            event_tx.clone(),
        );

        let supervisor = Supervisor {
            job: JobSpec::Compute {
                invocation: Arc::new(InvocationConfig {
                    worker_bin,
                    settings_json: "{}".to_string(),
                    rand_hash: "abc".to_string(),
                    so_path: PathBuf::from("algo.so"),
                    max_fuel: 1,
                    output_dir: out.clone(),
                    ptx_path: None,
                    gpu_id: None,
                    data: None,
                    hyperparameters: None,
                }),
                worker_timeout: Duration::ZERO,
            },
            strict: false,
            start_nonce: 0,
            num_nonces: 0,
            max_workers: 2,
            batch_timeout: Duration::from_secs(2),
            watchdog,
            events: event_tx,
            stop: Arc::new(CancelCell::default()),
        };
        let run = tokio::spawn(supervisor.run_explore());

        // Above the kill watermark nothing is primed or respawned.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, BatchEvent::NonceStarted { .. }),
                "spawned a worker while the probe read above the kill watermark"
            );
        }
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        *fraction.lock().unwrap() = 0.50;
        let report = run.await.unwrap();
        assert!(report.success > 0);
    }
}
