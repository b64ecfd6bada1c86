//! Surface transform: virtual shimming plane plus depth-map correction.
//!
//! Two stacked corrections turn a measured bed into a flat one at motion
//! time. The *plane* term tilts the coordinate system through three anchor
//! points near the towers (virtual shimming). The *depth* term bilinearly
//! interpolates a probed N x N depth map. [`SurfaceTransform::adjust_z`] is
//! the hot-path entry: the motion pipeline calls it for every planned move,
//! so it allocates nothing and branches only on the enable flags.
//!
//! The depth map persists as a human-readable file, one value per line with
//! `;` comments, so it can also be filled in by hand from a dial gauge.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::core::{clamp, Point3D, Vector3};
use crate::error::{Error, Result};
use crate::grid::{ProbeGrid, PointClass, Tower};
use crate::mapping::DepthSample;

/// Depth-map entries outside this bound are rejected on load; nothing on a
/// working printer is 5 mm out of plane.
const MAX_DEPTH_MM: f64 = 5.0;

/// The runtime Z-correction state.
#[derive(Clone, Debug)]
pub struct SurfaceTransform {
    n: usize,
    probe_radius: f64,
    scale: f64,
    /// Tower-facing anchor points; xy fixed at grid tower points, z is the
    /// shim value.
    tri_points: [Point3D; 3],
    normal: Vector3,
    d: f64,
    /// Row-major depth map, n^2 entries once allocated.
    depth: Vec<f64>,
    have_depth_map: bool,
    plane_enabled: bool,
    depth_enabled: bool,
    active: bool,
}

impl SurfaceTransform {
    pub fn new(grid: &ProbeGrid) -> Self {
        let mut tri_points = [Point3D::default(); 3];
        for tower in Tower::ALL {
            let coord = grid.coord(grid.tower_index(tower));
            tri_points[tower.index()] = Point3D::new(coord.x, coord.y, 0.0);
        }
        Self {
            n: grid.n(),
            probe_radius: grid.probe_radius(),
            scale: grid.cartesian_to_array_scale(),
            tri_points,
            normal: Vector3::Z_UP,
            d: 0.0,
            depth: Vec::new(),
            have_depth_map: false,
            plane_enabled: false,
            depth_enabled: false,
            active: false,
        }
    }

    // === Hot path ===

    /// Z correction for a target position.
    ///
    /// Positions beyond the probe radius are clamped to it, so the
    /// correction extends flat past the probed area instead of
    /// extrapolating.
    #[inline]
    pub fn adjust_z(&self, x: f64, y: f64) -> f64 {
        let mut offset = 0.0;
        if self.plane_enabled && self.active {
            offset = self.plane_z(x, y);
        }
        if self.depth_enabled && self.active && !self.depth.is_empty() {
            offset += self.bilinear(x, y);
        }
        offset
    }

    /// Plane-tilt term alone.
    #[inline]
    pub fn plane_z(&self, x: f64, y: f64) -> f64 {
        (-self.normal.x * x - self.normal.y * y - self.d) / self.normal.z
    }

    fn bilinear(&self, x: f64, y: f64) -> f64 {
        let r = self.probe_radius;
        let x = clamp(x, -r, r);
        let y = clamp(y, -r, r);

        // Fractional array coordinates; the array's Y grows downward.
        let ax = (x + r) * self.scale;
        let ay = (-y + r) * self.scale;

        // Cell corners, clamped so the +1 neighbors stay in bounds when the
        // position lands exactly on the far edge.
        let x1 = (ax.floor() as usize).min(self.n - 2);
        let y1 = (ay.floor() as usize).min(self.n - 2);
        let x2 = x1 + 1;
        let y2 = y1 + 1;

        let q11 = self.depth[y1 * self.n + x1];
        let q21 = self.depth[y1 * self.n + x2];
        let q12 = self.depth[y2 * self.n + x1];
        let q22 = self.depth[y2 * self.n + x2];

        let x1f = x1 as f64;
        let x2f = x2 as f64;
        let y1f = y1 as f64;
        let y2f = y2 as f64;

        q11 * (x2f - ax) * (y2f - ay)
            + q21 * (ax - x1f) * (y2f - ay)
            + q12 * (x2f - ax) * (ay - y1f)
            + q22 * (ax - x1f) * (ay - y1f)
    }

    // === Virtual shimming ===

    /// Assign the shim heights and refit the plane.
    ///
    /// The all-zero triplet resets the normal directly; the plane fit
    /// cannot express it (a null cross product has no direction).
    pub fn set_virtual_shimming(&mut self, sx: f64, sy: f64, sz: f64) {
        self.tri_points[0].z = sx;
        self.tri_points[1].z = sy;
        self.tri_points[2].z = sz;

        if sx == 0.0 && sy == 0.0 && sz == 0.0 {
            self.normal = Vector3::Z_UP;
            self.d = 0.0;
            return;
        }

        let v1 = Vector3::from(self.tri_points[0]);
        let v2 = Vector3::from(self.tri_points[1]);
        let v3 = Vector3::from(self.tri_points[2]);
        let cross = (v1 - v2).cross(v1 - v3);
        self.normal = match cross.unit() {
            Some(unit) => unit,
            None => {
                log::warn!("degenerate shimming triangle, keeping level plane");
                Vector3::Z_UP
            }
        };
        self.d = -(self.normal.x * v1.x + self.normal.y * v1.y + self.normal.z * v1.z);
        self.plane_enabled = true;
        self.active = true;
    }

    /// Current shim heights; zeros when the plane is disabled.
    pub fn shimming(&self) -> [f64; 3] {
        if self.plane_enabled {
            [
                self.tri_points[0].z,
                self.tri_points[1].z,
                self.tri_points[2].z,
            ]
        } else {
            [0.0; 3]
        }
    }

    /// Set one anchor's shim height without refitting.
    pub fn set_tri_z(&mut self, tower: Tower, z: f64) {
        self.tri_points[tower.index()].z = z;
    }

    pub fn tri_points(&self) -> &[Point3D; 3] {
        &self.tri_points
    }

    pub fn normal(&self) -> Vector3 {
        self.normal
    }

    pub fn plane_d(&self) -> f64 {
        self.d
    }

    // === Flags ===

    pub fn set_active(&mut self, on: bool) {
        self.active = on;
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_plane_enabled(&mut self, on: bool) {
        self.plane_enabled = on;
    }

    pub fn plane_enabled(&self) -> bool {
        self.plane_enabled
    }

    pub fn set_depth_enabled(&mut self, on: bool) {
        self.depth_enabled = on;
    }

    pub fn depth_enabled(&self) -> bool {
        self.depth_enabled
    }

    pub fn have_depth_map(&self) -> bool {
        self.have_depth_map
    }

    // === Depth map ===

    /// Allocate (or zero) the depth buffer.
    pub fn ensure_depth_buffer(&mut self) {
        if self.depth.len() == self.n * self.n {
            self.depth.fill(0.0);
        } else {
            self.depth = vec![0.0; self.n * self.n];
        }
    }

    pub fn depths(&self) -> &[f64] {
        &self.depth
    }

    /// Copy probed relative depths into the buffer.
    pub fn fill_depths(&mut self, samples: &[DepthSample]) {
        self.ensure_depth_buffer();
        for (slot, sample) in self.depth.iter_mut().zip(samples) {
            *slot = sample.relative;
        }
        self.have_depth_map = true;
    }

    /// Propagate depths outward along each row into inactive cells.
    ///
    /// On a circular surface the corner regions are never probed; copying
    /// from the nearest inward cell leaves the saved map defined across the
    /// whole grid.
    pub fn propagate_edges(&mut self, grid: &ProbeGrid) {
        let n = self.n;
        let mid = (n - 1) / 2;
        for row in 0..n {
            for step in 0..=mid {
                let right = grid.index_at(row, mid + step);
                let left = grid.index_at(row, mid - step);
                if grid.class(right) == PointClass::Inactive {
                    self.depth[right] = self.depth[right - 1];
                }
                if grid.class(left) == PointClass::Inactive {
                    self.depth[left] = self.depth[left + 1];
                }
            }
        }
    }

    // === Persistence ===

    /// Write the depth map, row-major, five decimal places.
    pub fn save_depth_map<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.depth.is_empty() {
            return Err(Error::DepthMapFormat("no depth map to save".to_string()));
        }
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "; Depth Map Surface Transform")?;
        for row in 0..self.n {
            writeln!(out, "; Line {} of {}", row + 1, self.n)?;
            for col in 0..self.n {
                writeln!(out, "{:.5}", self.depth[row * self.n + col])?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Load a depth map saved by [`save_depth_map`](Self::save_depth_map).
    ///
    /// Comment lines are ignored. The file must contain exactly n^2 values,
    /// each within +/-5 mm.
    pub fn load_depth_map<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut values = Vec::with_capacity(self.n * self.n);
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            }
            let value: f64 = trimmed.parse().map_err(|_| {
                Error::DepthMapFormat(format!("element {} is not a number: {:?}", values.len(), trimmed))
            })?;
            if value.abs() > MAX_DEPTH_MM {
                return Err(Error::DepthMapFormat(format!(
                    "element {} is out of range ({:.3})",
                    values.len(),
                    value
                )));
            }
            values.push(value);
        }

        if values.len() != self.n * self.n {
            return Err(Error::DepthMapFormat(format!(
                "expected {} elements, got {}",
                self.n * self.n,
                values.len()
            )));
        }

        self.ensure_depth_buffer();
        self.depth.copy_from_slice(&values);
        self.have_depth_map = true;
        Ok(())
    }
}
