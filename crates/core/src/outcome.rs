//! Per-nonce outcome model and the exit-status classifier.
//!
//! The classifier is the single source of retry policy: everything that
//! decides whether a worker exit goes back into the retry queue lives here,
//! as a pure function over (exit code, signal, stderr, output-file presence).

use std::fmt;

/// Hard cap on the stderr excerpt embedded in permanent error messages.
pub const STDERR_SNIPPET_MAX: usize = 512;

/// Why a worker failure is considered transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The process exited on SIGTERM or SIGKILL (OS OOM killer, or our own
    /// watchdog).
    Signal(i32),
    /// The process stderr carried an out-of-memory marker.
    OomMarker,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Signal(sig) => write!(f, "killed by signal {sig}"),
            RetryReason::OomMarker => write!(f, "out-of-memory marker on stderr"),
        }
    }
}

/// What happened to one nonce attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The output file exists; the nonce counts as a success.
    Ok,
    /// The output file pre-existed; no worker was spawned.
    AlreadyDone,
    /// Transient, memory-induced failure; the nonce is eligible for
    /// re-submission.
    Retryable(RetryReason),
    /// The attempt was cancelled before its natural exit (watchdog kill or
    /// batch shutdown). Treated like a retryable failure by the scheduler.
    Cancelled,
    /// Anything else; the message is what ends up in the error summary.
    Permanent(String),
}

impl Outcome {
    /// True for outcomes that count towards the success total.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Ok | Outcome::AlreadyDone)
    }

    /// True for outcomes that go back into the retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Retryable(_) | Outcome::Cancelled)
    }
}

/// Classify a finished worker.
///
/// `code` and `signal` come from the process exit status (at most one is
/// set on Unix); `output_exists` is whether `<nonce>.json` is on disk after
/// the exit. Rules, in order:
///
/// 1. signal 9 or 15 is retryable no matter what stderr says;
/// 2. an OOM marker on stderr is retryable no matter the exit code;
/// 3. an existing output file is a success no matter the exit code;
/// 4. exit 0 without a file is a permanent `no output`;
/// 5. everything else is a permanent error carrying a stderr excerpt.
pub fn classify(
    code: Option<i32>,
    signal: Option<i32>,
    stderr: &str,
    output_exists: bool,
) -> Outcome {
    if let Some(sig) = signal {
        if sig == 9 || sig == 15 {
            return Outcome::Retryable(RetryReason::Signal(sig));
        }
    }
    if has_oom_marker(stderr) {
        return Outcome::Retryable(RetryReason::OomMarker);
    }
    if output_exists {
        return Outcome::Ok;
    }
    match (code, signal) {
        (Some(0), _) => Outcome::Permanent("no output".to_string()),
        (Some(c), _) => Outcome::Permanent(format!("exit {c}: {}", stderr_snippet(stderr))),
        (None, Some(sig)) => {
            Outcome::Permanent(format!("signal {sig}: {}", stderr_snippet(stderr)))
        }
        (None, None) => Outcome::Permanent("unknown exit status".to_string()),
    }
}

/// Whether stderr indicates the worker died of memory exhaustion.
///
/// `OUT_OF_MEMORY` is matched case-sensitively (CUDA error name); the prose
/// form `out of memory` is matched case-insensitively.
pub fn has_oom_marker(stderr: &str) -> bool {
    stderr.contains("OUT_OF_MEMORY") || stderr.to_lowercase().contains("out of memory")
}

/// Trim stderr and cap it for embedding in error messages.
pub fn stderr_snippet(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_SNIPPET_MAX {
        return trimmed.to_string();
    }
    let mut end = STDERR_SNIPPET_MAX;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_kill_is_retryable_regardless_of_stderr() {
        for sig in [9, 15] {
            assert_eq!(
                classify(None, Some(sig), "", false),
                Outcome::Retryable(RetryReason::Signal(sig))
            );
            assert_eq!(
                classify(None, Some(sig), "some unrelated error", true),
                Outcome::Retryable(RetryReason::Signal(sig))
            );
        }
    }

    #[test]
    fn other_signals_are_not_signal_retryable() {
        let out = classify(None, Some(11), "segfault", false);
        assert_eq!(out, Outcome::Permanent("signal 11: segfault".to_string()));
    }

    #[test]
    fn oom_marker_is_retryable_regardless_of_exit_code() {
        assert_eq!(
            classify(Some(1), None, "CUDA_ERROR_OUT_OF_MEMORY", false),
            Outcome::Retryable(RetryReason::OomMarker)
        );
        assert_eq!(
            classify(Some(1), None, "allocator: Out Of Memory", false),
            Outcome::Retryable(RetryReason::OomMarker)
        );
        // The uppercase form is case-sensitive.
        assert_eq!(
            classify(Some(1), None, "out_of_memory", false),
            Outcome::Permanent("exit 1: out_of_memory".to_string())
        );
    }

    #[test]
    fn existing_output_wins_regardless_of_stderr() {
        assert_eq!(classify(Some(0), None, "warning noise", true), Outcome::Ok);
        assert_eq!(classify(Some(3), None, "late failure", true), Outcome::Ok);
    }

    #[test]
    fn clean_exit_without_output_is_permanent() {
        assert_eq!(
            classify(Some(0), None, "", false),
            Outcome::Permanent("no output".to_string())
        );
    }

    #[test]
    fn nonzero_exit_carries_stderr_excerpt() {
        assert_eq!(
            classify(Some(2), None, "  boom\n", false),
            Outcome::Permanent("exit 2: boom".to_string())
        );
    }

    #[test]
    fn long_stderr_is_capped() {
        let noisy = "x".repeat(4 * STDERR_SNIPPET_MAX);
        let Outcome::Permanent(msg) = classify(Some(1), None, &noisy, false) else {
            panic!("expected permanent outcome");
        };
        assert!(msg.len() < STDERR_SNIPPET_MAX + 32);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn retry_and_success_predicates() {
        assert!(Outcome::AlreadyDone.is_success());
        assert!(Outcome::Cancelled.is_retryable());
        assert!(!Outcome::Permanent("x".into()).is_retryable());
    }
}
