//! Memory-pressure watchdog: a table of in-flight tasks, a polling loop over
//! the memory probe, victim selection under a hysteresis band, and the retry
//! queue for killed nonces.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::api::{BatchEvent, WatchdogConfig};
use crate::probe::MemoryProbe;
use crate::worker;

/// Pause between consecutive kills while draining down to the low watermark,
/// giving the freed memory a chance to show up in the next probe sample.
const KILL_PAUSE: Duration = Duration::from_millis(100);

/// Cooperative cancellation cell shared between one worker task, the
/// supervisor, and the watchdog.
///
/// This is the "completion handle" of the task record: `done` marks natural
/// completion (the task is no longer a kill candidate), `cancelled` asks the
/// worker task to tear its subprocess down and return promptly.
#[derive(Debug, Default)]
pub(crate) struct CancelCell {
    cancelled: AtomicBool,
    done: AtomicBool,
    notify: Notify,
}

impl CancelCell {
    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Resolve once `cancel` has been called (possibly in the past).
    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct NonceTask {
    nonce: u64,
    pid: Option<u32>,
    cancel: Arc<CancelCell>,
    started_at: Instant,
    priority: i64,
}

impl NonceTask {
    fn age_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.started_at).as_secs_f64()
    }

    /// Eviction heuristic: young tasks have wasted little work and score
    /// high; priority is an additive pin for valuable long-running jobs.
    fn oom_score(&self, now: Instant) -> f64 {
        1000.0 / (1.0 + self.age_secs(now)) + self.priority as f64
    }
}

#[derive(Default)]
struct WatchState {
    tasks: HashMap<u64, NonceTask>,
    killed: BTreeSet<u64>,
}

pub(crate) struct Watchdog {
    cfg: WatchdogConfig,
    probe: MemoryProbe,
    state: Mutex<WatchState>,
    stopped: AtomicBool,
    stop_notify: Notify,
    events: mpsc::UnboundedSender<BatchEvent>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub(crate) fn new(
        mut cfg: WatchdogConfig,
        probe: MemoryProbe,
        events: mpsc::UnboundedSender<BatchEvent>,
    ) -> Arc<Self> {
        if cfg.check_interval < WatchdogConfig::MIN_CHECK_INTERVAL {
            cfg.check_interval = WatchdogConfig::MIN_CHECK_INTERVAL;
        }
        Arc::new(Self {
            cfg,
            probe,
            state: Mutex::new(WatchState::default()),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            events,
            poll_task: Mutex::new(None),
        })
    }

    /// Whether the polling loop runs at all.
    pub(crate) fn is_enabled(&self) -> bool {
        self.probe.is_enabled()
    }

    pub(crate) fn check_interval(&self) -> Duration {
        self.cfg.check_interval
    }

    /// Current probe reading; zero when sensing is disabled or degraded.
    pub(crate) fn memory_usage(&self) -> f64 {
        self.probe.usage()
    }

    pub(crate) fn high_watermark(&self) -> f64 {
        self.cfg.high_watermark
    }

    /// Add a task record for an in-flight nonce. Must happen before the
    /// nonce can be killed, i.e. before its subprocess is spawned.
    pub(crate) fn register(&self, nonce: u64, cancel: Arc<CancelCell>, priority: i64) {
        let mut state = self.state.lock().unwrap();
        state.tasks.insert(
            nonce,
            NonceTask {
                nonce,
                pid: None,
                cancel,
                started_at: Instant::now(),
                priority,
            },
        );
    }

    /// Associate an OS pid with a registered nonce. Silent no-op when the
    /// nonce is not (or no longer) registered.
    pub(crate) fn attach_process(&self, nonce: u64, pid: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&nonce) {
            task.pid = Some(pid);
        }
    }

    /// Drop the task record; the retry queue is left untouched.
    pub(crate) fn unregister(&self, nonce: u64) {
        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&nonce);
    }

    /// Idempotently queue a nonce for re-submission.
    pub(crate) fn queue_for_retry(&self, nonce: u64) {
        let mut state = self.state.lock().unwrap();
        state.killed.insert(nonce);
    }

    /// Drain at most one killed nonce, and only below the low watermark.
    pub(crate) fn poll_restartable(&self) -> Vec<u64> {
        if self.probe.usage() >= self.cfg.low_watermark {
            return Vec::new();
        }
        let mut state = self.state.lock().unwrap();
        state.killed.pop_first().into_iter().collect()
    }

    pub(crate) fn pending_restart_count(&self) -> usize {
        self.state.lock().unwrap().killed.len()
    }

    /// Launch the polling loop. No-op when the probe is disabled.
    pub(crate) fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let watchdog = self.clone();
        let handle = tokio::spawn(async move { watchdog.poll_loop().await });
        *self.poll_task.lock().unwrap() = Some(handle);

        let info = self.probe.info();
        let _ = self.events.send(BatchEvent::WatchdogStarted {
            label: self.probe.label(),
            used_mib: info.used_mib,
            total_mib: info.total_mib,
            fraction: info.fraction,
            high: self.cfg.high_watermark,
            low: self.cfg.low_watermark,
            interval_ms: self.cfg.check_interval.as_millis() as u64,
        });
    }

    /// Stop the polling loop and wait (bounded) for it to exit.
    pub(crate) async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.poll_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.cfg.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.stop_notify.notified() => return,
            }
            if self.is_stopped() {
                return;
            }

            if self.probe.usage() > self.cfg.high_watermark {
                while !self.is_stopped() && self.probe.usage() > self.cfg.low_watermark {
                    if !self.kill_victim().await {
                        break;
                    }
                    tokio::time::sleep(KILL_PAUSE).await;
                }
            }
        }
    }

    /// Terminate the task with the highest OOM score, move its nonce to the
    /// retry queue, and report whether a victim existed at all.
    ///
    /// The task table lock is never held across signalling or sleeping.
    async fn kill_victim(&self) -> bool {
        let victim = {
            let state = self.state.lock().unwrap();
            let now = Instant::now();
            let mut best: Option<&NonceTask> = None;
            for task in state.tasks.values() {
                if task.cancel.is_done() || task.cancel.is_cancelled() {
                    continue;
                }
                best = match best {
                    None => Some(task),
                    Some(cur) => {
                        let (score, cur_score) = (task.oom_score(now), cur.oom_score(now));
                        if score > cur_score || (score == cur_score && task.nonce < cur.nonce) {
                            Some(task)
                        } else {
                            Some(cur)
                        }
                    }
                };
            }
            best.map(|task| (task.nonce, task.pid, task.cancel.clone(), task.age_secs(now)))
        };
        let Some((nonce, pid, cancel, age_secs)) = victim else {
            return false;
        };

        let info = self.probe.info();
        let _ = self.events.send(BatchEvent::MemoryKill {
            label: self.probe.label(),
            nonce,
            age_secs,
            used_mib: info.used_mib,
            total_mib: info.total_mib,
            fraction: info.fraction,
        });

        if let Some(pid) = pid {
            worker::terminate_pid(pid).await;
        }
        cancel.cancel();

        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&nonce);
        state.killed.insert(nonce);
        true
    }
}
