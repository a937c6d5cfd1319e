#![deny(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Batch engine for `nonceforge`: a bounded-concurrency supervisor driving
//! one compute subprocess per nonce, paired with a memory-pressure watchdog
//! that kills and re-queues workers when RAM or VRAM crosses a hysteresis
//! band.

/// Public API for the engine crate.
pub mod api;

mod probe;
mod supervisor;
mod verify;
mod watchdog;
mod worker;

pub use api::{
    start_batch, start_verify, BatchConfig, BatchEvent, BatchHandle, BatchReport, ConfigError,
    InvocationConfig, Mode, VerifyConfig, WatchdogConfig,
};
