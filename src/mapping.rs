//! Depth-map probing.
//!
//! Measures the bed at every active grid point, relative to a single center
//! reference measurement taken first. Points classified as active-neighbors
//! lie outside the probe radius and cannot be probed where they are;
//! instead the probe is placed on the radius itself, at the neighbor's Y,
//! and the neighbor's depth is projected along the slope from its adjacent
//! in-radius point through that on-radius measurement. This pushes usable
//! correction data all the way to the edge of a round bed.

use std::io::Write;

use crate::core::statistics;
use crate::error::Result;
use crate::grid::{PointClass, ProbeGrid};
use crate::probe::ProbeRig;
use crate::report::Reporter;

/// One probed (or extrapolated) depth.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthSample {
    /// Distance from the probing height to the surface, mm.
    pub absolute: f64,
    /// Center measurement minus this measurement, mm. Positive means the
    /// surface here is higher than at center.
    pub relative: f64,
}

/// How much to print while probing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayMode {
    None,
    Unformatted,
    Formatted,
}

/// Probe the print surface and return one sample per grid point.
///
/// Inactive points stay at zero. Active-neighbor points are extrapolated
/// when `extrapolate_neighbors` is set and zeroed otherwise.
pub fn probe_surface<W: Write>(
    rig: &mut ProbeRig,
    grid: &ProbeGrid,
    report: &mut Reporter<W>,
    extrapolate_neighbors: bool,
    display: DisplayMode,
) -> Result<Vec<DepthSample>> {
    let mut report = report.scope("DM");

    rig.prepare_to_probe(&mut report)?;
    rig.prime(&mut report)?;

    let origin_steps = rig.probe_at(0.0, 0.0)?;
    let origin_mm = rig.steps_to_mm(origin_steps as f64)?;

    let mut samples = vec![DepthSample::default(); grid.len()];
    samples[grid.center_index()] = DepthSample {
        absolute: origin_mm,
        relative: 0.0,
    };

    if display != DisplayMode::None {
        report.line(&format!(
            "Depth to bed surface at center: {} steps ({:.3} mm)",
            origin_steps, origin_mm
        ));
    }

    // First pass: every directly probe-able point.
    for i in 0..grid.len() {
        if grid.class(i) != PointClass::Active {
            continue;
        }
        let coord = grid.coord(i);
        let steps = rig.probe_at(coord.x, coord.y)?;
        samples[i] = DepthSample {
            absolute: rig.steps_to_mm(steps as f64)?,
            relative: rig.steps_to_mm((origin_steps - steps) as f64)?,
        };
        if display == DisplayMode::Unformatted {
            report.line(&format!(
                "Depth: {:.3}mm ({:.3}mm absolute)",
                samples[i].relative, samples[i].absolute
            ));
        }
        rig.yield_idle()?;
    }

    // Second pass: neighbors, probed on the radius and projected outward.
    // Left-side neighbors need their in-radius partner's depth, so this
    // cannot fold into the first pass.
    if extrapolate_neighbors {
        let radius = grid.probe_radius();
        for i in 0..grid.len() {
            if grid.class(i) != PointClass::ActiveNeighbor {
                continue;
            }
            let coord = grid.coord(i);

            // The radius crossing at this row's Y. The square root gives
            // the +X crossing; mirror it for neighbors left of center,
            // whose in-radius partner sits to their right.
            let mut on_radius_x = (radius * radius - coord.y * coord.y).sqrt();
            let active_idx = if coord.x > 0.0 {
                i - 1
            } else {
                on_radius_x = -on_radius_x;
                i + 1
            };

            let steps = rig.probe_at(on_radius_x, coord.y)?;
            let probed = DepthSample {
                absolute: rig.steps_to_mm(steps as f64)?,
                relative: rig.steps_to_mm((origin_steps - steps) as f64)?,
            };

            let active = samples[active_idx];
            let active_x = grid.coord(active_idx).x;
            let rise = probed.absolute - active.absolute;
            let dist_mul = (coord.x - active_x).abs() / (on_radius_x - active_x).abs();

            let absolute = active.absolute + rise * dist_mul;
            samples[i] = DepthSample {
                absolute,
                relative: origin_mm - absolute,
            };
            rig.yield_idle()?;
        }
    }

    if display == DisplayMode::Formatted {
        print_depths(&mut report, grid, &samples);
    }

    Ok(samples)
}

/// Mean absolute relative depth over the active points.
pub fn depth_energy(grid: &ProbeGrid, samples: &[DepthSample]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0;
    for i in 0..grid.len() {
        if grid.class(i) == PointClass::Active {
            sum += samples[i].relative.abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Pretty-print a depth map in grid order with summary statistics.
///
/// Active and center depths print bare, extrapolated neighbors in
/// brackets, and inactive points as blanks.
pub fn print_depths<W: Write>(report: &mut Reporter<W>, grid: &ProbeGrid, samples: &[DepthSample]) {
    let n = grid.n();
    report.raw("[PD] ");
    for i in 0..grid.len() {
        match grid.class(i) {
            PointClass::Center | PointClass::Active => {
                report.raw(&format!(" {:6.3} ", samples[i].relative));
            }
            PointClass::ActiveNeighbor => {
                report.raw(&format!("[{:6.3}]", samples[i].relative));
            }
            PointClass::Inactive => {
                report.raw("        ");
            }
        }
        if (i + 1) % n == 0 {
            if i + 1 < grid.len() {
                report.raw("\n[PD]\n[PD] ");
            }
        } else {
            report.raw("   ");
        }
    }
    report.raw("\n");

    let rel: Vec<f64> = samples.iter().map(|s| s.relative).collect();
    let stats = statistics(&rel);
    let mut best = f64::INFINITY;
    let mut worst = 0.0f64;
    for s in samples {
        best = best.min(s.relative.abs());
        worst = worst.max(s.relative.abs());
    }
    report.raw(&format!(
        "[PD] Best={:.3}, worst={:.3}, min={:.3}, max={:.3}, mu={:.3}, sigma={:.3}, energy={:.3}\n",
        best,
        worst,
        stats.min,
        stats.max,
        stats.mean,
        stats.sigma,
        depth_energy(grid, samples)
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SurfaceShape};
    use crate::hardware::simulator::{SimOptions, SimulatedPrinter, SurfaceModel};
    use crate::probe::ProbeRig;

    fn setup(surface: SurfaceModel) -> (ProbeRig, ProbeGrid, Reporter<Vec<u8>>) {
        let printer = SimulatedPrinter::new(SimOptions {
            surface,
            ..SimOptions::default()
        });
        let config: Config = basic_toml::from_str("[probe]\nradius = 100.0\n").unwrap();
        let rig = ProbeRig::new(printer.probe_handle(), printer.motion_handle(), config.probe);
        let grid = ProbeGrid::build(100.0, 5, SurfaceShape::Circle).unwrap();
        (rig, grid, Reporter::new(Vec::new()))
    }

    #[test]
    fn test_flat_surface_probes_flat() {
        let (mut rig, grid, mut report) = setup(SurfaceModel::Flat);
        let samples =
            probe_surface(&mut rig, &grid, &mut report, false, DisplayMode::None).unwrap();

        assert_eq!(samples[grid.center_index()].relative, 0.0);
        for i in 0..grid.len() {
            if grid.class(i) == PointClass::Active {
                // Flat bed, perfect machine: only step quantization left.
                assert!(
                    samples[i].relative.abs() <= 0.0026,
                    "point {} depth {}",
                    i,
                    samples[i].relative
                );
            }
        }
        assert!(depth_energy(&grid, &samples) < 0.003);
    }

    #[test]
    fn test_neighbors_zeroed_without_extrapolation() {
        let (mut rig, grid, mut report) = setup(SurfaceModel::Flat);
        let samples =
            probe_surface(&mut rig, &grid, &mut report, false, DisplayMode::None).unwrap();
        for i in 0..grid.len() {
            if grid.class(i) == PointClass::ActiveNeighbor {
                assert_eq!(samples[i].relative, 0.0);
                assert_eq!(samples[i].absolute, 0.0);
            }
        }
    }

    #[test]
    fn test_extrapolation_follows_tilt() {
        // Bed tilted along X: z = 0.002 * x. A neighbor at x = -100 should
        // extrapolate to roughly -0.2 mm relative depth... with the sign
        // convention that a low bed reads negative.
        let (mut rig, grid, mut report) = setup(SurfaceModel::Plane {
            x_slope: 0.002,
            y_slope: 0.0,
        });
        let samples =
            probe_surface(&mut rig, &grid, &mut report, true, DisplayMode::None).unwrap();

        for i in 0..grid.len() {
            if grid.class(i) != PointClass::ActiveNeighbor {
                continue;
            }
            let coord = grid.coord(i);
            let expected = 0.002 * coord.x;
            assert!(
                (samples[i].relative - expected).abs() < 0.02,
                "neighbor {} at ({}, {}): got {}, expected {}",
                i,
                coord.x,
                coord.y,
                samples[i].relative,
                expected
            );
        }
    }

    #[test]
    fn test_formatted_output_has_grid_rows() {
        let (mut rig, grid, mut report) = setup(SurfaceModel::Flat);
        probe_surface(&mut rig, &grid, &mut report, false, DisplayMode::Formatted).unwrap();
        let text = String::from_utf8(report.get_ref().clone()).unwrap();
        let depth_rows = text.lines().filter(|l| l.starts_with("[PD]  ")).count();
        // One printed row per grid row.
        assert!(depth_rows >= 5, "output:\n{}", text);
        assert!(text.contains("energy="));
    }
}
