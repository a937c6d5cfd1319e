use nonceforge_engine::BatchEvent;

/// Renders engine events: progress to stdout, per-nonce failures to stderr.
///
/// The prefix identifies the binary in mixed logs; it is instance data, not
/// process-global state.
pub struct Printer {
    prefix: &'static str,
    verbose: bool,
}

impl Printer {
    pub fn new(prefix: &'static str, verbose: bool) -> Self {
        Self { prefix, verbose }
    }

    fn out(&self, message: &str) {
        println!("[{}] {}", self.prefix, message);
    }

    fn err(&self, message: &str) {
        eprintln!("[{}] {}", self.prefix, message);
    }

    pub fn event(&self, event: &BatchEvent) {
        match event {
            BatchEvent::Started {
                mode,
                start_nonce,
                num_nonces,
                max_workers,
            } => {
                if self.verbose {
                    match num_nonces {
                        Some(n) => self.out(&format!(
                            "{mode} batch: {n} nonces from {start_nonce}, {max_workers} workers"
                        )),
                        None => self.out(&format!(
                            "{mode} batch from nonce {start_nonce}, {max_workers} workers"
                        )),
                    }
                }
            }
            BatchEvent::WatchdogStarted {
                label,
                used_mib,
                total_mib,
                fraction,
                high,
                low,
                interval_ms,
            } => self.out(&format!(
                "[{label}] Watchdog started ({used_mib}/{total_mib}MB {:.1}%, kill>{:.0}%, restart<{:.0}%, interval={interval_ms}ms)",
                fraction * 100.0,
                high * 100.0,
                low * 100.0,
            )),
            BatchEvent::NonceStarted { nonce } => {
                if self.verbose {
                    self.out(&format!("nonce {nonce}: started"));
                }
            }
            BatchEvent::NonceCompleted {
                nonce,
                elapsed_ms,
                already_done,
            } => {
                if self.verbose {
                    if *already_done {
                        self.out(&format!("nonce {nonce}: already computed"));
                    } else {
                        self.out(&format!(
                            "nonce {nonce}: done in {:.1}s",
                            *elapsed_ms as f64 / 1000.0
                        ));
                    }
                }
            }
            BatchEvent::NonceRequeued { nonce, reason } => {
                self.out(&format!("nonce {nonce}: {reason}; queued for retry"));
            }
            BatchEvent::NonceFailed { nonce, message } => {
                self.err(&format!("nonce {nonce}: {message}"));
            }
            BatchEvent::MemoryKill {
                label,
                nonce,
                age_secs,
                used_mib,
                total_mib,
                fraction,
            } => self.out(&format!(
                "[{label} OOM] Killing nonce {nonce} (age={age_secs:.1}s, {used_mib}/{total_mib}MB {:.1}%)",
                fraction * 100.0,
            )),
            BatchEvent::TimeoutReached { seconds } => {
                self.out(&format!("Batch timeout ({seconds}s) reached"));
            }
            BatchEvent::CancellingRemaining { count } => {
                self.out(&format!("Cancelling {count} remaining tasks"));
            }
            BatchEvent::Warning { message } => self.out(message),
            BatchEvent::Error { message } => self.err(message),
            BatchEvent::Completed {
                success,
                total,
                attempted,
                elapsed_secs,
            } => match total {
                Some(total) => self.out(&format!("Completed {success}/{total} nonces")),
                None => self.out(&format!(
                    "Completed {success} nonces ({attempted} attempted in {elapsed_secs:.1}s)"
                )),
            },
        }
    }
}
