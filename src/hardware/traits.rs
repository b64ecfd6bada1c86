//! Hardware abstraction traits.
//!
//! The calibration engine never talks to hardware directly: the motion
//! controller, Z-probe, and arm solution are injected behind these traits at
//! construction. On a real machine each trait fronts a firmware subsystem;
//! in tests and simulation they are all backed by
//! [`crate::hardware::simulator::SimulatedPrinter`].
//!
//! # Threading
//!
//! Handles are shared as `Arc<Mutex<dyn Trait>>`. Scheduling is cooperative
//! and single-threaded from the engine's point of view; the `Send` bounds
//! exist so the same handles can be owned by a host runtime that services
//! other work between [`MotionController::yield_idle`] calls.

use crate::core::Point3D;
use crate::error::Result;
use crate::grid::Tower;

/// Coordinated motion and machine state.
///
/// Every probing move goes through this trait, and every geometry change is
/// followed by [`reset_axis_position`](Self::reset_axis_position) so the
/// next move is planned from a position consistent with the new kinematics.
pub trait MotionController: Send {
    /// Home all towers.
    fn home(&mut self) -> Result<()>;

    /// Coordinated absolute move. `None` keeps an axis where it is.
    fn move_to(&mut self, x: Option<f64>, y: Option<f64>, z: Option<f64>, feedrate: f64)
        -> Result<()>;

    /// Coordinated relative move.
    fn move_relative(&mut self, dx: f64, dy: f64, dz: f64, feedrate: f64) -> Result<()>;

    /// Last planned cartesian position.
    fn axis_position(&self) -> Point3D;

    /// Re-seat the planner's idea of where the effector is without moving.
    ///
    /// Required after any kinematic change: the last milestone was computed
    /// under the old geometry and the next move would otherwise jerk.
    fn reset_axis_position(&mut self, pos: Point3D);

    /// Current global acceleration, mm/s^2.
    fn acceleration(&self) -> f64;

    /// Set the global acceleration, mm/s^2.
    fn set_acceleration(&mut self, accel: f64);

    /// Publish a newly measured bed height as the Z max travel.
    fn set_max_z(&mut self, z_max: f64);

    /// Per-tower endstop trim, mm (each entry <= 0).
    fn trim(&self) -> [f64; 3];

    /// Apply per-tower endstop trim, mm.
    fn set_trim(&mut self, trim: [f64; 3]);

    /// Block until the motion queue has drained.
    fn wait_for_idle(&mut self);

    /// Cooperative yield: let the host runtime service serial and idle
    /// work. Called periodically inside long probing and annealing loops.
    fn yield_idle(&mut self);
}

/// The Z-probe itself.
///
/// Measurements are reported in motor steps; [`steps_to_mm`](Self::steps_to_mm)
/// converts using the Z steps-per-mm of the machine.
pub trait ZProbe: Send {
    /// Descend from the current position until the probe triggers.
    /// Returns the distance traveled in steps.
    fn run_probe(&mut self, fast: bool) -> Result<i32>;

    /// Raise the effector back up by `steps`.
    fn return_probe(&mut self, steps: i32) -> Result<()>;

    /// Steps traveled at the end of deceleration after the last trigger.
    fn steps_at_decel_end(&self) -> i32;

    /// Convert a step count to millimeters.
    fn steps_to_mm(&self, steps: f64) -> f64;

    /// Configured clearance height above the trigger point, mm.
    fn probe_height(&self) -> f64;

    fn fast_feedrate(&self) -> f64;
    fn set_fast_feedrate(&mut self, feedrate: f64);

    fn slow_feedrate(&self) -> f64;
    fn set_slow_feedrate(&mut self, feedrate: f64);

    fn debounce_count(&self) -> u32;
    fn set_debounce_count(&mut self, count: u32);

    fn decelerate_on_trigger(&self) -> bool;
    fn set_decelerate_on_trigger(&mut self, on: bool);
}

/// A tunable geometric parameter of the arm solution.
///
/// Each scalar the calibration can adjust is addressed by one variant, so
/// optimization targets stay typed instead of going through a letter-keyed
/// option map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryOption {
    /// Diagonal arm length, mm.
    ArmLength,
    /// Horizontal tower-to-effector-joint distance, mm.
    DeltaRadius,
    /// Per-tower delta radius offset, mm.
    RadiusOffset(Tower),
    /// Per-tower angular position offset, degrees.
    AngleOffset(Tower),
    /// Per-tower arm length offset, mm.
    ArmOffset(Tower),
}

/// Forward and inverse kinematics for a linear delta.
pub trait ArmSolution: Send {
    /// Cartesian effector position to the three carriage heights.
    fn cartesian_to_actuator(&self, cartesian: Point3D) -> [f64; 3];

    /// Three carriage heights to the cartesian effector position.
    fn actuator_to_cartesian(&self, actuator: [f64; 3]) -> Point3D;

    /// Read one geometric parameter.
    fn option(&self, opt: GeometryOption) -> f64;

    /// Write one geometric parameter and rebuild derived geometry.
    fn set_option(&mut self, opt: GeometryOption, value: f64);
}
