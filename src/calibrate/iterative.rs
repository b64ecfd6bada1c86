//! Iterative endstop and delta-radius calibration.
//!
//! The classical convergence loop, used as a coarse pre-pass before
//! heuristic calibration: probe four points (center and near each tower),
//! pull the endstop trims toward the shallowest reading, and nudge the
//! delta radius by the center-versus-towers deviation. Both corrections
//! run in the same iteration, so the two subsystems converge together
//! instead of fighting each other in alternate passes.
//!
//! Four probes per iteration keeps this fast; 30 microns is a realistic
//! target for a well-built machine.

use std::io::Write;

use crate::calibrate::state::KinematicState;
use crate::error::{Error, Result};
use crate::grid::{tower_target, Tower};
use crate::probe::ProbeRig;
use crate::report::Reporter;
use crate::surface::SurfaceTransform;

/// Convergence target, mm.
const TARGET: f64 = 0.03;

/// Iteration cap; a healthy machine converges in well under this.
const MAX_ITERATIONS: usize = 20;

/// Trims below this indicate something is horribly wrong with the
/// machine or the measurements.
const TRIM_FLOOR: f64 = -5.0;

/// Starting multiplier for trim corrections.
const INITIAL_TRIMSCALE: f64 = 1.3;

/// Delta radius correction factor.
const DR_FACTOR: f64 = 2.0;

/// Run the iterative calibration.
///
/// With `keep_settings` the current trim and offsets are the starting
/// point; otherwise every offset is zeroed first. Returns `true` when both
/// subsystems reached tolerance within the iteration cap.
pub fn iterative_calibration<W: Write>(
    rig: &mut ProbeRig,
    kin: &mut KinematicState,
    surface: &mut SurfaceTransform,
    report: &mut Reporter<W>,
    keep_settings: bool,
) -> Result<bool> {
    let mut report = report.scope("IC");
    report.blank();
    report.line("Iterative calibration in progress. Press Reset to abort.");
    report.line("/!\\ PROBE CRASH DANGER /!\\ Don't press buttons, send commands, or access the SD card.");
    report.blank();

    // The shimming plane would confound the four-point measurements.
    surface.set_active(false);

    if keep_settings {
        report.line("Keeping kinematics.");
    } else {
        report.line("Resetting kinematics.");
        kin.set_trim([0.0; 3])?;
        kin.set_tower_radius_offsets([0.0; 3], false)?;
        kin.set_tower_angle_offsets([0.0; 3], false)?;
        kin.set_tower_arm_offsets([0.0; 3], false)?;
        surface.set_virtual_shimming(0.0, 0.0, 0.0);
        kin.reseat()?;
    }

    report.line("Current kinematics:");
    let settings = kin.snapshot(surface)?;
    super::print_kinematics(&mut report, &settings, surface);

    let radius = rig.config().radius;
    let towers = [
        tower_target(radius, Tower::X),
        tower_target(radius, Tower::Y),
        tower_target(radius, Tower::Z),
    ];

    let mut endstops_in_tolerance = false;
    let mut radius_in_tolerance = false;
    let mut last_deviation = f64::INFINITY;
    let mut trimscale = INITIAL_TRIMSCALE;

    for iteration in 0..MAX_ITERATIONS {
        report.blank();
        report.line(&format!("Iteration {} (max {})", iteration + 1, MAX_ITERATIONS));

        rig.prepare_to_probe(&mut report)?;
        rig.prime(&mut report)?;

        let steps = rig.probe_at(0.0, 0.0)?;
        let center = rig.steps_to_mm(steps as f64)?;
        let mut tower_depth = [0.0; 3];
        for (i, target) in towers.iter().enumerate() {
            let steps = rig.probe_at(target.x, target.y)?;
            tower_depth[i] = rig.steps_to_mm(steps as f64)?;
        }

        let min = center
            .min(tower_depth[0])
            .min(tower_depth[1])
            .min(tower_depth[2]);
        let max = center
            .max(tower_depth[0])
            .max(tower_depth[1])
            .max(tower_depth[2]);
        let deviation = max - min;

        // === Endstops ===
        {
            let mut report = report.scope("ES");
            report.line(&format!(
                "Endstops: Difference => {:.3} (want {:.3})",
                deviation, TARGET
            ));

            if deviation.abs() <= TARGET {
                report.line("Endstops are within tolerance.");
                endstops_in_tolerance = true;
            } else {
                report.line(&format!("Out of tolerance by {:.3}.", deviation - TARGET));
                endstops_in_tolerance = false;

                let mut trim = kin.trim()?;
                for t in &mut trim {
                    if *t > 0.0 {
                        *t = 0.0;
                    }
                }
                if trim.iter().any(|&t| t < TRIM_FLOOR) {
                    report.line(&format!(
                        "Trim: {{{:.3}, {:.3}, {:.3}}}",
                        trim[0], trim[1], trim[2]
                    ));
                    report.line("Values less than -5 suggest that something is horribly wrong.");
                    return Err(Error::GeometryOutOfRange(format!(
                        "endstop trim below {} mm",
                        TRIM_FLOOR
                    )));
                }

                // Back the correction off whenever the last one failed to
                // improve things, but never below 0.9.
                if deviation >= last_deviation && trimscale * 0.95 >= 0.9 {
                    trimscale *= 0.9;
                    report.line(&format!(
                        "/!\\ Deviation same or worse vs. last time - reducing trim scale to {:.3}",
                        trimscale
                    ));
                }
                last_deviation = deviation;

                for i in 0..3 {
                    trim[i] += (min - tower_depth[i]) * trimscale;
                }
                let peak = trim[0].max(trim[1]).max(trim[2]);
                for t in &mut trim {
                    *t -= peak;
                }
                report.line(&format!(
                    "Setting endstops to {{{:.3}, {:.3}, {:.3}}}.",
                    trim[0], trim[1], trim[2]
                ));
                kin.set_trim(trim)?;
            }
        }

        // === Delta radius ===
        {
            let mut report = report.scope("DR");
            let delta_radius = kin.delta_radius()?;
            let average = (tower_depth[0] + tower_depth[1] + tower_depth[2]) / 3.0;
            let radius_deviation = center - average;
            report.line(&format!(
                "Delta Radius - Depths: Center={:.3}, Tower average={:.3} => Difference: {:.3} (want {:.3})",
                center, average, radius_deviation, TARGET
            ));

            if radius_deviation.abs() <= TARGET {
                report.line("Delta radius is within tolerance.");
                radius_in_tolerance = true;
            } else {
                report.line(&format!(
                    "Delta radius is out of tolerance by {:.3}.",
                    radius_deviation - TARGET
                ));
                radius_in_tolerance = false;
                let corrected = delta_radius + radius_deviation * DR_FACTOR;
                report.line(&format!(
                    "Changing delta radius from {:.3} to {:.3}",
                    delta_radius, corrected
                ));
                kin.set_delta_radius(corrected, true)?;
            }
        }

        if endstops_in_tolerance && radius_in_tolerance {
            report.blank();
            let settings = kin.snapshot(surface)?;
            super::print_kinematics(&mut report, &settings, surface);
            report.blank();
            report.line("All done! Save settings with M500.");
            kin.clear_dirty();
            rig.home()?;
            return Ok(true);
        }
    }

    report.line("Maximum tries exceeded. If this is good enough, type M500 to save.");
    rig.home()?;
    Ok(false)
}
