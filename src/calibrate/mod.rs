//! Calibration routines: kinematic state, the energy model, and the
//! iterative and annealing calibrators.

pub mod anneal;
pub mod energy;
pub mod iterative;
pub mod repeatability;
pub mod state;

pub use anneal::{AnnealOptions, AnnealOutcome, Annealer, CalType, CalTypeSet};
pub use energy::{simulate_fk_energy, simulate_ik, AxisCapture};
pub use iterative::iterative_calibration;
pub use repeatability::{
    measure_repeatability, BestProbeCalibration, RepeatabilityOptions, RepeatabilityReport,
};
pub use state::{KinematicSettings, KinematicState};

use std::io::Write;

use crate::report::Reporter;
use crate::surface::SurfaceTransform;

/// Print the full kinematic snapshot the way every calibrator reports it.
pub fn print_kinematics<W: Write>(
    report: &mut Reporter<W>,
    settings: &KinematicSettings,
    surface: &SurfaceTransform,
) {
    let mut report = report.scope("PK");
    report.line(&format!("          Arm length: {:.3}", settings.arm_length));
    report.line(&format!("        Delta radius: {:.3}", settings.delta_radius));
    report.line(&format!(
        "     Endstop offsets: {{{:.3}, {:.3}, {:.3}}}",
        settings.trim[0], settings.trim[1], settings.trim[2]
    ));
    report.line(&format!(
        "Radius offsets (ABC): {{{:.3}, {:.3}, {:.3}}}",
        settings.tower_radius_offset[0],
        settings.tower_radius_offset[1],
        settings.tower_radius_offset[2]
    ));
    report.line(&format!(
        " Angle offsets (DEF): {{{:.3}, {:.3}, {:.3}}}",
        settings.tower_angle_offset[0],
        settings.tower_angle_offset[1],
        settings.tower_angle_offset[2]
    ));
    report.line(&format!(
        "   Arm offsets (TUV): {{{:.3}, {:.3}, {:.3}}}",
        settings.tower_arm_offset[0],
        settings.tower_arm_offset[1],
        settings.tower_arm_offset[2]
    ));
    let normal = surface.normal();
    report.line(&format!(
        "    Virtual shimming: {{{:.3}, {:.3}, {:.3}}}, vector={{{:.3}, {:.3}, {:.3}}}, d={:.3}, {}",
        settings.virtual_shimming[0],
        settings.virtual_shimming[1],
        settings.virtual_shimming[2],
        normal.x,
        normal.y,
        normal.z,
        surface.plane_d(),
        enabled_str(surface.plane_enabled() && surface.active())
    ));
    report.line(&format!(
        "Depth (Z) correction: {}",
        enabled_str(surface.depth_enabled() && surface.active())
    ));
}

fn enabled_str(value: bool) -> &'static str {
    if value {
        "enabled"
    } else {
        "disabled"
    }
}
