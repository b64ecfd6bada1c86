//! TrikonaCal - calibration walkthrough against the simulated printer
//!
//! Builds a printer whose true geometry differs from what the controller
//! believes, then runs the recommended calibration sequence: G32-style
//! iterative calibration, G31-style heuristic (annealing) calibration, and
//! a G31 A depth-map pass. Progress prints to stdout exactly as it would
//! stream from a machine.

use std::env;
use std::io;

use trikona_cal::calibrate::RepeatabilityOptions;
use trikona_cal::config::Config;
use trikona_cal::error::Result;
use trikona_cal::hardware::delta::DeltaGeometry;
use trikona_cal::hardware::simulator::{SimOptions, SimulatedPrinter, SurfaceModel};
use trikona_cal::session::{CalibrationSession, HeuristicOptions};

const DEFAULT_CONFIG: &str = r#"
[probe]
radius = 100.0
smoothing = 1
priming = 0

[annealing]
tries = 200
max_temp = 0.35
"#;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("TrikonaCal v0.2.0 starting...");

    let config = match env::args().nth(1) {
        Some(path) => {
            log::info!("Using config: {}", path);
            Config::load(&path)?
        }
        None => basic_toml::from_str(DEFAULT_CONFIG)
            .map_err(|e| trikona_cal::Error::Config(e.to_string()))?,
    };

    // A machine that is out of adjustment in every family of parameters:
    // uneven endstops, a wrong delta radius with per-tower offsets, one
    // leaning tower, and a slightly tilted bed.
    let printer = SimulatedPrinter::new(SimOptions {
        believed: DeltaGeometry::default(),
        truth: DeltaGeometry {
            delta_radius: 130.6,
            radius_offset: [0.2, -0.15, 0.0],
            angle_offset: [0.15, 0.0, -0.1],
            ..DeltaGeometry::default()
        },
        true_trim: [-0.12, -0.31, 0.0],
        surface: SurfaceModel::Plane {
            x_slope: 0.0004,
            y_slope: -0.0003,
        },
        probe_noise_mm: 0.002,
        seed: 17,
        ..SimOptions::default()
    });

    let mut session = CalibrationSession::new(
        config,
        printer.motion_handle(),
        printer.probe_handle(),
        printer.arm_handle(),
        io::stdout(),
    )?;

    // The recommended sequence: check the probe, converge coarsely, then
    // anneal the full parameter set.
    session.probe_repeatability(RepeatabilityOptions {
        samples: Some(5),
        ..RepeatabilityOptions::default()
    })?;

    session.iterative_calibration(false)?;

    session.heuristic_calibration(HeuristicOptions {
        endstop: Some(1.0),
        delta_radius: Some(1.0),
        tower_angle: Some(1.0),
        seed: Some(99),
        ..HeuristicOptions::default()
    })?;

    let depth_map_path = env::temp_dir().join("dm_surface_transform");
    session.depth_map_to_file(Some(&depth_map_path))?;
    log::info!("Depth map written to {}", depth_map_path.display());

    let mut stdout = io::stdout();
    session.write_override(&mut stdout)?;

    let final_settings = session.kinematics()?;
    log::info!(
        "Calibration finished: arm={:.3} radius={:.3} trim=[{:.3}, {:.3}, {:.3}]",
        final_settings.arm_length,
        final_settings.delta_radius,
        final_settings.trim[0],
        final_settings.trim[1],
        final_settings.trim[2]
    );

    Ok(())
}
