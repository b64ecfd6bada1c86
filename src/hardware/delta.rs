//! Linear delta arm solution.
//!
//! Three vertical towers carry one carriage each; fixed-length arms connect
//! the carriages to the effector. Inverse kinematics is one sphere equation
//! per tower; forward kinematics is trilateration of the three spheres
//! centered on the carriages.
//!
//! Towers sit at 210, 330, and 90 degrees around the center, each displaced
//! by its angle offset, at `delta_radius + radius_offset` from center, with
//! an arm of `arm_length + arm_offset`.

use crate::core::{Point2D, Point3D};
use crate::hardware::traits::{ArmSolution, GeometryOption};

/// Base tower angles in degrees: X front-left, Y front-right, Z back.
const TOWER_ANGLES: [f64; 3] = [210.0, 330.0, 90.0];

/// The geometric parameters of a linear delta.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeltaGeometry {
    pub arm_length: f64,
    pub delta_radius: f64,
    pub radius_offset: [f64; 3],
    pub angle_offset: [f64; 3],
    pub arm_offset: [f64; 3],
}

impl Default for DeltaGeometry {
    fn default() -> Self {
        Self {
            arm_length: 270.0,
            delta_radius: 130.0,
            radius_offset: [0.0; 3],
            angle_offset: [0.0; 3],
            arm_offset: [0.0; 3],
        }
    }
}

/// Linear delta kinematics with per-tower corrections.
#[derive(Clone, Debug)]
pub struct LinearDeltaSolution {
    geometry: DeltaGeometry,
    /// Tower joint positions, derived from radius and angle parameters.
    towers: [Point2D; 3],
    /// Effective arm length per tower.
    arms: [f64; 3],
}

impl LinearDeltaSolution {
    pub fn new(geometry: DeltaGeometry) -> Self {
        let mut solution = Self {
            geometry,
            towers: [Point2D::ORIGIN; 3],
            arms: [0.0; 3],
        };
        solution.rebuild();
        solution
    }

    pub fn geometry(&self) -> &DeltaGeometry {
        &self.geometry
    }

    fn rebuild(&mut self) {
        for i in 0..3 {
            let radius = self.geometry.delta_radius + self.geometry.radius_offset[i];
            let angle = (TOWER_ANGLES[i] + self.geometry.angle_offset[i]).to_radians();
            self.towers[i] = Point2D::new(radius * angle.cos(), radius * angle.sin());
            self.arms[i] = self.geometry.arm_length + self.geometry.arm_offset[i];
        }
    }
}

impl ArmSolution for LinearDeltaSolution {
    fn cartesian_to_actuator(&self, cartesian: Point3D) -> [f64; 3] {
        let mut actuator = [0.0; 3];
        for i in 0..3 {
            let dx = self.towers[i].x - cartesian.x;
            let dy = self.towers[i].y - cartesian.y;
            let reach_sq = self.arms[i].powi(2) - dx * dx - dy * dy;
            // Out-of-envelope candidates can push the radicand negative
            // during optimization sweeps; treat the arm as horizontal.
            actuator[i] = cartesian.z + reach_sq.max(0.0).sqrt();
        }
        actuator
    }

    fn actuator_to_cartesian(&self, actuator: [f64; 3]) -> Point3D {
        // Trilateration of three spheres centered on the carriages.
        let p1 = [self.towers[0].x, self.towers[0].y, actuator[0]];
        let p2 = [self.towers[1].x, self.towers[1].y, actuator[1]];
        let p3 = [self.towers[2].x, self.towers[2].y, actuator[2]];

        let sub = |a: [f64; 3], b: [f64; 3]| [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
        let dot = |a: [f64; 3], b: [f64; 3]| a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
        let scale = |a: [f64; 3], s: f64| [a[0] * s, a[1] * s, a[2] * s];

        let p12 = sub(p2, p1);
        let d = dot(p12, p12).sqrt();
        let ex = scale(p12, 1.0 / d);

        let p13 = sub(p3, p1);
        let i = dot(ex, p13);
        let ey_raw = sub(p13, scale(ex, i));
        let ey_len = dot(ey_raw, ey_raw).sqrt();
        let ey = scale(ey_raw, 1.0 / ey_len);
        let ez = [
            ex[1] * ey[2] - ex[2] * ey[1],
            ex[2] * ey[0] - ex[0] * ey[2],
            ex[0] * ey[1] - ex[1] * ey[0],
        ];
        let j = dot(ey, p13);

        let r1_sq = self.arms[0].powi(2);
        let x = (r1_sq - self.arms[1].powi(2) + d * d) / (2.0 * d);
        let y = (r1_sq - self.arms[2].powi(2) + i * i + j * j) / (2.0 * j) - (i / j) * x;
        // The effector hangs below the carriages.
        let z = -(r1_sq - x * x - y * y).max(0.0).sqrt();

        Point3D::new(
            p1[0] + x * ex[0] + y * ey[0] + z * ez[0],
            p1[1] + x * ex[1] + y * ey[1] + z * ez[1],
            p1[2] + x * ex[2] + y * ey[2] + z * ez[2],
        )
    }

    fn option(&self, opt: GeometryOption) -> f64 {
        match opt {
            GeometryOption::ArmLength => self.geometry.arm_length,
            GeometryOption::DeltaRadius => self.geometry.delta_radius,
            GeometryOption::RadiusOffset(t) => self.geometry.radius_offset[t.index()],
            GeometryOption::AngleOffset(t) => self.geometry.angle_offset[t.index()],
            GeometryOption::ArmOffset(t) => self.geometry.arm_offset[t.index()],
        }
    }

    fn set_option(&mut self, opt: GeometryOption, value: f64) {
        match opt {
            GeometryOption::ArmLength => self.geometry.arm_length = value,
            GeometryOption::DeltaRadius => self.geometry.delta_radius = value,
            GeometryOption::RadiusOffset(t) => self.geometry.radius_offset[t.index()] = value,
            GeometryOption::AngleOffset(t) => self.geometry.angle_offset[t.index()] = value,
            GeometryOption::ArmOffset(t) => self.geometry.arm_offset[t.index()] = value,
        }
        self.rebuild();
    }
}
