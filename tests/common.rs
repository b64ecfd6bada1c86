//! Shared helpers for the integration tests.
//!
//! Builds sessions wired to the simulated printer with output captured in
//! memory, so assertions can inspect both results and the report stream.

#![allow(dead_code)]

use trikona_cal::config::{AnnealingConfig, Config, GridConfig, ProbeConfig, SurfaceConfig};
use trikona_cal::hardware::simulator::SimulatedPrinter;
use trikona_cal::session::CalibrationSession;

/// Test configuration: 100 mm probe radius, 5x5 circular grid.
pub fn config() -> Config {
    Config {
        probe: ProbeConfig {
            radius: 100.0,
            smoothing: 1,
            priming: 0,
            acceleration: 200.0,
            offset_x: 0.0,
            offset_y: 0.0,
            offset_z: 0.0,
            fast_feedrate: 100.0,
            slow_feedrate: 5.0,
            height: 5.0,
        },
        grid: GridConfig::default(),
        annealing: AnnealingConfig::default(),
        surface: SurfaceConfig::default(),
    }
}

/// Same configuration with the depth map stored at `path`.
pub fn config_with_depth_path(path: &str) -> Config {
    let mut config = config();
    config.surface.depth_map_path = path.to_string();
    config
}

/// A session over the given simulated printer, reporting into a buffer.
pub fn session(printer: &SimulatedPrinter, config: Config) -> CalibrationSession<Vec<u8>> {
    CalibrationSession::new(
        config,
        printer.motion_handle(),
        printer.probe_handle(),
        printer.arm_handle(),
        Vec::new(),
    )
    .expect("session construction")
}

/// Everything the session has reported so far.
pub fn output(session: &CalibrationSession<Vec<u8>>) -> String {
    String::from_utf8_lossy(session.report().get_ref()).into_owned()
}
