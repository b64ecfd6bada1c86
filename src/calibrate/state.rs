//! Kinematic state: the snapshot of every tunable parameter.
//!
//! [`KinematicState`] is the single writer of machine geometry. It forwards
//! each change to the arm solution (or the motion controller, for trim) and
//! re-seats the planner's axis position afterward when asked, because a
//! move planned from a stale milestone under new kinematics jerks the
//! effector.
//!
//! The `geometry_dirty` flag tracks externally announced geometry changes;
//! it is cleared only by a successful iterative calibration.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::grid::Tower;
use crate::hardware::traits::{ArmSolution, GeometryOption, MotionController};
use crate::surface::SurfaceTransform;

/// A complete snapshot of the tunable kinematic parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct KinematicSettings {
    pub arm_length: f64,
    pub delta_radius: f64,
    /// Per-tower endstop trim, mm. Invariant after normalization: every
    /// entry is <= 0 and the largest is exactly 0.
    pub trim: [f64; 3],
    pub tower_radius_offset: [f64; 3],
    pub tower_angle_offset: [f64; 3],
    pub tower_arm_offset: [f64; 3],
    pub virtual_shimming: [f64; 3],
    /// Whether this snapshot was ever captured from the machine.
    pub initialized: bool,
}

impl KinematicSettings {
    /// Subtract the largest trim from all three, so trims only ever pull
    /// towers down and the homed height does not creep.
    pub fn normalize_trim(&mut self) {
        let max = self.trim[0].max(self.trim[1]).max(self.trim[2]);
        for t in &mut self.trim {
            *t -= max;
        }
    }
}

/// Owner of all kinematic writes.
pub struct KinematicState {
    arm: Arc<Mutex<dyn ArmSolution>>,
    motion: Arc<Mutex<dyn MotionController>>,
    geometry_dirty: bool,
}

impl KinematicState {
    pub fn new(arm: Arc<Mutex<dyn ArmSolution>>, motion: Arc<Mutex<dyn MotionController>>) -> Self {
        Self {
            arm,
            motion,
            // Until a calibration has run, assume nothing about the geometry.
            geometry_dirty: true,
        }
    }

    fn lock_arm(&self) -> Result<MutexGuard<'_, dyn ArmSolution + 'static>> {
        self.arm.lock().map_err(|_| Error::MutexPoisoned)
    }

    fn lock_motion(&self) -> Result<MutexGuard<'_, dyn MotionController + 'static>> {
        self.motion.lock().map_err(|_| Error::MutexPoisoned)
    }

    /// Shared arm solution handle, for the forward-kinematics simulator.
    pub fn arm(&self) -> &Arc<Mutex<dyn ArmSolution>> {
        &self.arm
    }

    // === Dirty flag ===

    pub fn mark_dirty(&mut self) {
        self.geometry_dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.geometry_dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.geometry_dirty
    }

    // === Snapshot / apply ===

    /// Read every parameter from the machine.
    pub fn snapshot(&self, surface: &SurfaceTransform) -> Result<KinematicSettings> {
        let arm = self.lock_arm()?;
        let mut settings = KinematicSettings {
            arm_length: arm.option(GeometryOption::ArmLength),
            delta_radius: arm.option(GeometryOption::DeltaRadius),
            trim: self.lock_motion()?.trim(),
            virtual_shimming: surface.shimming(),
            initialized: true,
            ..KinematicSettings::default()
        };
        for tower in Tower::ALL {
            let i = tower.index();
            settings.tower_radius_offset[i] = arm.option(GeometryOption::RadiusOffset(tower));
            settings.tower_angle_offset[i] = arm.option(GeometryOption::AngleOffset(tower));
            settings.tower_arm_offset[i] = arm.option(GeometryOption::ArmOffset(tower));
        }
        Ok(settings)
    }

    /// Push a full snapshot to the machine.
    ///
    /// Fails with [`Error::Uninitialized`] if the snapshot was never
    /// captured; applying a zeroed snapshot would wreck the geometry.
    pub fn apply(
        &mut self,
        settings: &KinematicSettings,
        surface: &mut SurfaceTransform,
        update: bool,
    ) -> Result<()> {
        if !settings.initialized {
            return Err(Error::Uninitialized);
        }
        self.set_delta_radius(settings.delta_radius, false)?;
        self.set_arm_length(settings.arm_length, false)?;
        self.set_trim(settings.trim)?;
        self.set_tower_radius_offsets(settings.tower_radius_offset, false)?;
        self.set_tower_angle_offsets(settings.tower_angle_offset, false)?;
        self.set_tower_arm_offsets(settings.tower_arm_offset, false)?;
        surface.set_virtual_shimming(
            settings.virtual_shimming[0],
            settings.virtual_shimming[1],
            settings.virtual_shimming[2],
        );
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    // === Individual parameters ===

    pub fn trim(&self) -> Result<[f64; 3]> {
        Ok(self.lock_motion()?.trim())
    }

    pub fn set_trim(&mut self, trim: [f64; 3]) -> Result<()> {
        self.lock_motion()?.set_trim(trim);
        Ok(())
    }

    pub fn arm_length(&self) -> Result<f64> {
        Ok(self.lock_arm()?.option(GeometryOption::ArmLength))
    }

    pub fn set_arm_length(&mut self, value: f64, update: bool) -> Result<()> {
        self.lock_arm()?.set_option(GeometryOption::ArmLength, value);
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    pub fn delta_radius(&self) -> Result<f64> {
        Ok(self.lock_arm()?.option(GeometryOption::DeltaRadius))
    }

    pub fn set_delta_radius(&mut self, value: f64, update: bool) -> Result<()> {
        self.lock_arm()?.set_option(GeometryOption::DeltaRadius, value);
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    pub fn set_tower_radius_offsets(&mut self, offsets: [f64; 3], update: bool) -> Result<()> {
        {
            let mut arm = self.lock_arm()?;
            for tower in Tower::ALL {
                arm.set_option(GeometryOption::RadiusOffset(tower), offsets[tower.index()]);
            }
        }
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    pub fn set_tower_angle_offsets(&mut self, offsets: [f64; 3], update: bool) -> Result<()> {
        {
            let mut arm = self.lock_arm()?;
            for tower in Tower::ALL {
                arm.set_option(GeometryOption::AngleOffset(tower), offsets[tower.index()]);
            }
        }
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    pub fn set_tower_arm_offsets(&mut self, offsets: [f64; 3], update: bool) -> Result<()> {
        {
            let mut arm = self.lock_arm()?;
            for tower in Tower::ALL {
                arm.set_option(GeometryOption::ArmOffset(tower), offsets[tower.index()]);
            }
        }
        if update {
            self.reseat()?;
        }
        Ok(())
    }

    /// Re-seat the planner at its current position so the next move is
    /// computed under the freshly applied kinematics.
    pub fn reseat(&mut self) -> Result<()> {
        let mut motion = self.lock_motion()?;
        let pos = motion.axis_position();
        motion.reset_axis_position(pos);
        Ok(())
    }

    /// Cooperative yield inside long optimization loops.
    pub fn yield_idle(&self) -> Result<()> {
        self.lock_motion()?.yield_idle();
        Ok(())
    }
}
