//! Error types for the calibration engine.
//!
//! # Error Recovery Strategies
//!
//! All probe and geometry failures abort the current top-level command and
//! return control with the previously applied kinematics intact. Within a
//! command, nothing is rolled back: the last accepted state stands.
//!
//! ## Fatal For The Current Command
//!
//! - **`ProbeFailed`**: the probe did not trigger, or the averaged
//!   measurement was implausibly small (under 100 steps, which means the
//!   probing start height is misconfigured). Fix the probe or the configured
//!   probe height and rerun the command.
//!
//! - **`GeometryOutOfRange`**: a computed endstop trim fell below -5 mm.
//!   Values that large mean the machine geometry is badly wrong or a probe
//!   measurement was garbage; continuing would drive the effector into the
//!   bed. Inspect the machine before recalibrating.
//!
//! - **`ConfigInvalid`**: the requested operation is incompatible with the
//!   probe configuration (depth correction with nonzero X/Y probe offsets).
//!   Fix the configuration and rerun.
//!
//! - **`Uninitialized`**: a kinematic snapshot was applied before ever being
//!   captured. This is a sequencing bug in the caller.
//!
//! ## Recoverable
//!
//! - **`Io`** / **`DepthMapFormat`**: depth-map file errors. The depth
//!   correction stays disabled; calibration state is untouched. Re-probe or
//!   fix the file.
//!
//! - **`Config`**: the configuration file failed to load or validate at
//!   startup. Fix the file and restart.
//!
//! - **`MutexPoisoned`**: a shared hardware handle was poisoned by a
//!   panicking thread. The engine must be restarted.
//!
//! Annealing stalls are *not* errors: the annealer exits early and reports
//! the best state it reached.

use thiserror::Error;

/// Errors produced by the calibration engine.
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Invalid configuration for this operation: {0}")]
    ConfigInvalid(String),

    #[error("Geometry out of range: {0}")]
    GeometryOutOfRange(String),

    #[error("Kinematic settings applied before being captured")]
    Uninitialized,

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Depth map file rejected: {0}")]
    DepthMapFormat(String),

    #[error("Mutex poisoned")]
    MutexPoisoned,
}

pub type Result<T> = std::result::Result<T, Error>;
