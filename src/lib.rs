//! TrikonaCal - auto-calibration engine for delta-kinematic 3D printers
//!
//! Consumes Z-probe measurements over the print surface and produces the
//! kinematic parameters (endstop trims, delta radius, per-tower radius,
//! angle and arm offsets, arm length, and a virtual-shimming plane) that
//! minimize vertical deviation across the print area, plus a bilinearly
//! interpolated depth map applied in the motion hot path.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    session                          │  ← Command surface
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   calibrate/                        │  ← Calibrators
//! │     (state, energy, iterative, anneal, repeat)      │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │             surface · mapping · probe               │  ← Measurement
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   hardware/                         │  ← Trait seams
//! │          (traits, delta, simulator)                 │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              core · grid · config                   │  ← Foundation
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The motion controller, Z-probe, and arm solution are external
//! collaborators injected behind the [`hardware::traits`] seams; the
//! bundled [`hardware::simulator`] backs all three for tests and
//! hardware-free experiments.

pub mod calibrate;
pub mod config;
pub mod core;
pub mod error;
pub mod grid;
pub mod hardware;
pub mod mapping;
pub mod probe;
pub mod report;
pub mod session;
pub mod surface;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{CalibrationSession, HeuristicOptions, SurfaceOptions};
