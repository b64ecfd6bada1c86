//! Simulated delta printer.
//!
//! Backs all three hardware traits with a shared physical model, so the
//! whole calibration stack can run hardware-free: the integration tests and
//! the demo binary drive exactly the code paths a real machine would.
//!
//! The model keeps two geometries. The *believed* geometry is what the
//! controller plans moves with, and is the one the calibration engine reads
//! and writes through [`ArmSolution`]. The *true* geometry is the physical
//! machine. A commanded move lands the carriages where the believed inverse
//! kinematics says, shifted per tower by the difference between applied and
//! true endstop trim; the effector then sits wherever the true forward
//! kinematics puts it. Probing descends until the true effector height
//! meets the bed model. The better the believed parameters match the true
//! ones, the flatter the probed surface gets, which is precisely the signal
//! the calibrators work against.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::Point3D;
use crate::error::{Error, Result};
use crate::hardware::delta::{DeltaGeometry, LinearDeltaSolution};
use crate::hardware::traits::{ArmSolution, GeometryOption, MotionController, ZProbe};

/// True shape of the simulated bed surface.
#[derive(Clone, Copy, Debug, Default)]
pub enum SurfaceModel {
    /// Perfectly flat at z = 0.
    #[default]
    Flat,
    /// Tilted plane: z = x_slope * x + y_slope * y.
    Plane { x_slope: f64, y_slope: f64 },
}

impl SurfaceModel {
    fn height(&self, x: f64, y: f64) -> f64 {
        match *self {
            SurfaceModel::Flat => 0.0,
            SurfaceModel::Plane { x_slope, y_slope } => x_slope * x + y_slope * y,
        }
    }
}

/// Construction options for the simulated printer.
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Geometry the controller plans with.
    pub believed: DeltaGeometry,
    /// Geometry of the physical machine.
    pub truth: DeltaGeometry,
    /// Endstop trim that would exactly level the towers.
    pub true_trim: [f64; 3],
    /// Bed surface model.
    pub surface: SurfaceModel,
    /// Believed Z travel before any bed-height measurement, mm.
    pub z_max: f64,
    /// Z axis resolution, mm per motor step.
    pub mm_per_step: f64,
    /// Clearance the probe driver reports above its trigger point, mm.
    pub probe_height: f64,
    /// Uniform probe noise amplitude, mm. Zero for deterministic tests.
    pub probe_noise_mm: f64,
    /// Noise generator seed.
    pub seed: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            believed: DeltaGeometry::default(),
            truth: DeltaGeometry::default(),
            true_trim: [0.0; 3],
            surface: SurfaceModel::Flat,
            z_max: 300.0,
            mm_per_step: 0.0025,
            probe_height: 5.0,
            probe_noise_mm: 0.0,
            seed: 0,
        }
    }
}

struct SimCore {
    believed: LinearDeltaSolution,
    truth: LinearDeltaSolution,
    trim: [f64; 3],
    true_trim: [f64; 3],
    surface: SurfaceModel,
    position: Point3D,
    homed: bool,
    acceleration: f64,
    z_max: f64,
    mm_per_step: f64,
    probe_height: f64,
    probe_noise_mm: f64,
    fast_feedrate: f64,
    slow_feedrate: f64,
    debounce_count: u32,
    decelerate_on_trigger: bool,
    last_steps: i32,
    rng: StdRng,
}

impl SimCore {
    /// True effector position for a commanded cartesian position.
    fn effector_true(&self, commanded: Point3D) -> Point3D {
        let mut carriage = self.believed.cartesian_to_actuator(commanded);
        for i in 0..3 {
            carriage[i] += self.trim[i] - self.true_trim[i];
        }
        self.truth.actuator_to_cartesian(carriage)
    }

    /// Commanded z at which the probe triggers under the current x/y.
    ///
    /// Solves `effector_true(x, y, z).z == bed(x', y')` by fixed-point
    /// iteration; the map is within a hair of identity in z, so a handful
    /// of rounds reaches machine precision.
    fn trigger_z(&self) -> f64 {
        let mut z = self.position.z;
        for _ in 0..12 {
            let p = self.effector_true(Point3D::new(self.position.x, self.position.y, z));
            let err = p.z - self.surface.height(p.x, p.y);
            z -= err;
            if err.abs() < 1e-10 {
                break;
            }
        }
        z
    }
}

/// A simulated printer whose hardware handles share one physical model.
#[derive(Clone)]
pub struct SimulatedPrinter {
    core: Arc<Mutex<SimCore>>,
}

impl SimulatedPrinter {
    pub fn new(opts: SimOptions) -> Self {
        let core = SimCore {
            believed: LinearDeltaSolution::new(opts.believed),
            truth: LinearDeltaSolution::new(opts.truth),
            trim: [0.0; 3],
            true_trim: opts.true_trim,
            surface: opts.surface,
            position: Point3D::new(0.0, 0.0, opts.z_max),
            homed: false,
            acceleration: 3000.0,
            z_max: opts.z_max,
            mm_per_step: opts.mm_per_step,
            probe_height: opts.probe_height,
            probe_noise_mm: opts.probe_noise_mm,
            fast_feedrate: 100.0,
            slow_feedrate: 5.0,
            debounce_count: 0,
            decelerate_on_trigger: false,
            last_steps: 0,
            rng: StdRng::seed_from_u64(opts.seed),
        };
        Self {
            core: Arc::new(Mutex::new(core)),
        }
    }

    pub fn motion_handle(&self) -> Arc<Mutex<dyn MotionController>> {
        Arc::new(Mutex::new(SimMotion {
            core: self.core.clone(),
        }))
    }

    pub fn probe_handle(&self) -> Arc<Mutex<dyn ZProbe>> {
        Arc::new(Mutex::new(SimProbe {
            core: self.core.clone(),
        }))
    }

    pub fn arm_handle(&self) -> Arc<Mutex<dyn ArmSolution>> {
        Arc::new(Mutex::new(SimArm {
            core: self.core.clone(),
        }))
    }

    /// Believed geometry currently applied by the controller.
    pub fn believed_geometry(&self) -> DeltaGeometry {
        *self.core.lock().unwrap().believed.geometry()
    }

    /// Believed trim currently applied by the controller.
    pub fn applied_trim(&self) -> [f64; 3] {
        self.core.lock().unwrap().trim
    }

    /// Replace the bed surface model.
    pub fn set_surface(&self, surface: SurfaceModel) {
        self.core.lock().unwrap().surface = surface;
    }
}

struct SimMotion {
    core: Arc<Mutex<SimCore>>,
}

impl MotionController for SimMotion {
    fn home(&mut self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.position = Point3D::new(0.0, 0.0, core.z_max);
        core.homed = true;
        Ok(())
    }

    fn move_to(
        &mut self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        _feedrate: f64,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if let Some(x) = x {
            core.position.x = x;
        }
        if let Some(y) = y {
            core.position.y = y;
        }
        if let Some(z) = z {
            core.position.z = z;
        }
        Ok(())
    }

    fn move_relative(&mut self, dx: f64, dy: f64, dz: f64, _feedrate: f64) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.position.x += dx;
        core.position.y += dy;
        core.position.z += dz;
        Ok(())
    }

    fn axis_position(&self) -> Point3D {
        self.core.lock().unwrap().position
    }

    fn reset_axis_position(&mut self, pos: Point3D) {
        self.core.lock().unwrap().position = pos;
    }

    fn acceleration(&self) -> f64 {
        self.core.lock().unwrap().acceleration
    }

    fn set_acceleration(&mut self, accel: f64) {
        self.core.lock().unwrap().acceleration = accel;
    }

    fn set_max_z(&mut self, z_max: f64) {
        self.core.lock().unwrap().z_max = z_max;
    }

    fn trim(&self) -> [f64; 3] {
        self.core.lock().unwrap().trim
    }

    fn set_trim(&mut self, trim: [f64; 3]) {
        self.core.lock().unwrap().trim = trim;
    }

    fn wait_for_idle(&mut self) {}

    fn yield_idle(&mut self) {}
}

struct SimProbe {
    core: Arc<Mutex<SimCore>>,
}

impl ZProbe for SimProbe {
    fn run_probe(&mut self, _fast: bool) -> Result<i32> {
        let mut core = self.core.lock().unwrap();
        if !core.homed {
            return Err(Error::ProbeFailed("machine not homed".to_string()));
        }
        let mut trigger = core.trigger_z();
        if core.probe_noise_mm > 0.0 {
            let noise = core.probe_noise_mm;
            trigger += (core.rng.random::<f64>() - 0.5) * 2.0 * noise;
        }
        let travel = core.position.z - trigger;
        if travel <= 0.0 {
            return Err(Error::ProbeFailed(
                "probe already triggered at start of descent".to_string(),
            ));
        }
        let steps = (travel / core.mm_per_step).round() as i32;
        core.position.z = trigger;
        core.last_steps = steps;
        Ok(steps)
    }

    fn return_probe(&mut self, steps: i32) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.position.z += steps as f64 * core.mm_per_step;
        Ok(())
    }

    fn steps_at_decel_end(&self) -> i32 {
        self.core.lock().unwrap().last_steps
    }

    fn steps_to_mm(&self, steps: f64) -> f64 {
        steps * self.core.lock().unwrap().mm_per_step
    }

    fn probe_height(&self) -> f64 {
        self.core.lock().unwrap().probe_height
    }

    fn fast_feedrate(&self) -> f64 {
        self.core.lock().unwrap().fast_feedrate
    }

    fn set_fast_feedrate(&mut self, feedrate: f64) {
        self.core.lock().unwrap().fast_feedrate = feedrate;
    }

    fn slow_feedrate(&self) -> f64 {
        self.core.lock().unwrap().slow_feedrate
    }

    fn set_slow_feedrate(&mut self, feedrate: f64) {
        self.core.lock().unwrap().slow_feedrate = feedrate;
    }

    fn debounce_count(&self) -> u32 {
        self.core.lock().unwrap().debounce_count
    }

    fn set_debounce_count(&mut self, count: u32) {
        self.core.lock().unwrap().debounce_count = count;
    }

    fn decelerate_on_trigger(&self) -> bool {
        self.core.lock().unwrap().decelerate_on_trigger
    }

    fn set_decelerate_on_trigger(&mut self, on: bool) {
        self.core.lock().unwrap().decelerate_on_trigger = on;
    }
}

struct SimArm {
    core: Arc<Mutex<SimCore>>,
}

impl ArmSolution for SimArm {
    fn cartesian_to_actuator(&self, cartesian: Point3D) -> [f64; 3] {
        self.core.lock().unwrap().believed.cartesian_to_actuator(cartesian)
    }

    fn actuator_to_cartesian(&self, actuator: [f64; 3]) -> Point3D {
        self.core.lock().unwrap().believed.actuator_to_cartesian(actuator)
    }

    fn option(&self, opt: GeometryOption) -> f64 {
        self.core.lock().unwrap().believed.option(opt)
    }

    fn set_option(&mut self, opt: GeometryOption, value: f64) {
        self.core.lock().unwrap().believed.set_option(opt, value);
    }
}
