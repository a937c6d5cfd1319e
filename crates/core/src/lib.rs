//! Shared leaf types for `nonceforge`: per-nonce outcome classification and
//! the on-disk JSON artifacts (error summaries, quality annotation).

pub mod outcome;
pub mod summary;
