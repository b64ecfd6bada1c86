//! Energy model and forward-kinematics simulator.
//!
//! The annealer never probes. One real probing pass (or one simulated flat
//! surface) is converted once into per-point carriage positions by running
//! inverse kinematics under the settings that were current at measurement
//! time; that capture is then frozen. Every candidate parameter set is
//! scored by running forward kinematics over the frozen capture and
//! measuring how far from flat the reprojected surface is.
//!
//! Energy is the mean absolute Z deviation over the active grid points: a
//! perfectly explained surface scores zero.

use std::sync::{Arc, Mutex};

use crate::core::Point3D;
use crate::error::{Error, Result};
use crate::grid::{PointClass, ProbeGrid};
use crate::hardware::traits::ArmSolution;
use crate::mapping::DepthSample;
use crate::surface::SurfaceTransform;

/// Frozen per-point carriage positions from one probing pass.
#[derive(Clone, Debug)]
pub struct AxisCapture {
    axis: Vec<[f64; 3]>,
}

impl AxisCapture {
    pub fn len(&self) -> usize {
        self.axis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axis.is_empty()
    }
}

/// Capture carriage positions for the measured surface.
///
/// For each active point the measured relative depth (plus the shimming
/// plane term, when the plane is enabled) becomes a cartesian target, runs
/// through inverse kinematics, and gets the trim added per tower. Inactive
/// points store zeros and never contribute to energy.
pub fn simulate_ik(
    arm: &Arc<Mutex<dyn ArmSolution>>,
    grid: &ProbeGrid,
    surface: &SurfaceTransform,
    samples: &[DepthSample],
    trim: [f64; 3],
) -> Result<AxisCapture> {
    let arm = arm.lock().map_err(|_| Error::MutexPoisoned)?;
    let mut axis = vec![[0.0; 3]; grid.len()];

    for i in 0..grid.len() {
        if grid.class(i) != PointClass::Active {
            continue;
        }
        let coord = grid.coord(i);
        let mut z = samples[i].relative;
        if surface.plane_enabled() {
            z += surface.plane_z(coord.x, coord.y);
        }
        let mut carriage = arm.cartesian_to_actuator(Point3D::new(coord.x, coord.y, z));
        for k in 0..3 {
            carriage[k] += trim[k];
        }
        axis[i] = carriage;
    }

    Ok(AxisCapture { axis })
}

/// Reproject a capture under the currently applied arm-solution settings
/// and candidate trim, and return the energy.
///
/// `cartesian` is reused between calls; it ends up holding the reprojected
/// surface (grid coordinates with the simulated deposit height in z).
pub fn simulate_fk_energy(
    arm: &Arc<Mutex<dyn ArmSolution>>,
    grid: &ProbeGrid,
    surface: &SurfaceTransform,
    capture: &AxisCapture,
    trim: [f64; 3],
    cartesian: &mut Vec<Point3D>,
) -> Result<f64> {
    let arm = arm.lock().map_err(|_| Error::MutexPoisoned)?;
    cartesian.clear();
    cartesian.reserve(grid.len());

    for i in 0..grid.len() {
        let coord = grid.coord(i);
        if grid.class(i) != PointClass::Active {
            cartesian.push(Point3D::new(coord.x, coord.y, 0.0));
            continue;
        }
        let mut carriage = capture.axis[i];
        for k in 0..3 {
            carriage[k] -= trim[k];
        }
        let mut point = arm.actuator_to_cartesian(carriage);
        if surface.plane_enabled() {
            point.z -= surface.plane_z(point.x, point.y);
        }
        cartesian.push(point);
    }

    Ok(energy_of(grid, cartesian))
}

/// Mean absolute Z over the active points.
pub fn energy_of(grid: &ProbeGrid, cartesian: &[Point3D]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0;
    for i in 0..grid.len() {
        if grid.class(i) == PointClass::Active {
            sum += cartesian[i].z.abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurfaceShape;
    use crate::hardware::delta::{DeltaGeometry, LinearDeltaSolution};

    fn arm() -> Arc<Mutex<dyn ArmSolution>> {
        Arc::new(Mutex::new(LinearDeltaSolution::new(DeltaGeometry::default())))
    }

    fn grid() -> ProbeGrid {
        ProbeGrid::build(100.0, 5, SurfaceShape::Circle).unwrap()
    }

    #[test]
    fn test_ik_fk_identity_zero_trim() {
        let arm = arm();
        let grid = grid();
        let surface = SurfaceTransform::new(&grid);

        // A gently bowed measured surface.
        let samples: Vec<DepthSample> = grid
            .points()
            .map(|p| DepthSample {
                absolute: 0.0,
                relative: 0.0001 * (p.coord.x + p.coord.y),
            })
            .collect();

        let capture = simulate_ik(&arm, &grid, &surface, &samples, [0.0; 3]).unwrap();
        let mut cartesian = Vec::new();
        simulate_fk_energy(&arm, &grid, &surface, &capture, [0.0; 3], &mut cartesian).unwrap();

        for i in 0..grid.len() {
            if grid.class(i) == PointClass::Active {
                assert!(
                    (cartesian[i].z - samples[i].relative).abs() < 1e-9,
                    "point {}: {} vs {}",
                    i,
                    cartesian[i].z,
                    samples[i].relative
                );
            }
        }
    }

    #[test]
    fn test_identity_with_matching_trim() {
        let arm = arm();
        let grid = grid();
        let surface = SurfaceTransform::new(&grid);
        let samples = vec![DepthSample::default(); grid.len()];
        let trim = [-0.8, -0.2, 0.0];

        let capture = simulate_ik(&arm, &grid, &surface, &samples, trim).unwrap();
        let mut cartesian = Vec::new();
        let energy =
            simulate_fk_energy(&arm, &grid, &surface, &capture, trim, &mut cartesian).unwrap();
        assert!(energy < 1e-12, "energy = {}", energy);
    }

    #[test]
    fn test_trim_mismatch_raises_energy() {
        let arm = arm();
        let grid = grid();
        let surface = SurfaceTransform::new(&grid);
        let samples = vec![DepthSample::default(); grid.len()];

        let capture = simulate_ik(&arm, &grid, &surface, &samples, [-1.0, 0.0, 0.0]).unwrap();
        let mut cartesian = Vec::new();
        let energy =
            simulate_fk_energy(&arm, &grid, &surface, &capture, [0.0; 3], &mut cartesian).unwrap();
        // A 1 mm trim error on one tower shows up strongly.
        assert!(energy > 0.1, "energy = {}", energy);
    }

    #[test]
    fn test_plane_term_round_trips() {
        let arm = arm();
        let grid = grid();
        let mut surface = SurfaceTransform::new(&grid);
        surface.set_virtual_shimming(0.2, -0.1, 0.3);

        let samples = vec![DepthSample::default(); grid.len()];
        let capture = simulate_ik(&arm, &grid, &surface, &samples, [0.0; 3]).unwrap();
        let mut cartesian = Vec::new();
        let energy =
            simulate_fk_energy(&arm, &grid, &surface, &capture, [0.0; 3], &mut cartesian).unwrap();
        // The same plane is added in IK and removed in FK.
        assert!(energy < 1e-9, "energy = {}", energy);
    }
}
