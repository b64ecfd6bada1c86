//! Parallel simulated annealing over the kinematic parameters.
//!
//! Up to fourteen interacting variables (three trims, delta radius with
//! three per-tower offsets, arm length with three per-tower offsets, three
//! tower angles, and the three-point shimming plane) are optimized against
//! a single frozen probing pass. Per iteration, every variable of every
//! active calibration type gets a binary search for its conditional optimum
//! (all other variables held at their current values), then moves a random,
//! temperature-bounded step toward it. The temperature cools linearly, so
//! early iterations can escape local optima while late ones settle.
//!
//! The expensive part, probing, happens exactly once; each candidate is
//! scored purely by forward kinematics over the captured carriage
//! positions (see [`crate::calibrate::energy`]).

use std::io::Write;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::calibrate::energy::{simulate_fk_energy, AxisCapture};
use crate::calibrate::state::{KinematicSettings, KinematicState};
use crate::config::AnnealingConfig;
use crate::core::{clamp, statistics, Point3D};
use crate::error::Result;
use crate::grid::ProbeGrid;
use crate::hardware::traits::ArmSolution;
use crate::mapping::DepthSample;
use crate::report::Reporter;
use crate::surface::SurfaceTransform;

/// Stop when the whole surface deviates less than this, mm.
const GLOBAL_TARGET: f64 = 0.010;

/// Binary search resolution per variable, mm (or degrees).
const VARIABLE_TARGET: f64 = 0.005;

/// Binary search iteration cap.
const BINSEARCH_ROUNDS: usize = 250;

/// Energy sample window for the stall detector.
const ENERGY_WINDOW: usize = 6;

/// Sigma below which the sampled energies count as stalled.
const STALL_SIGMA: f64 = 0.01;

/// One calibration type switch.
#[derive(Clone, Copy, Debug)]
pub struct CalType {
    pub active: bool,
    /// Per-type temperature multiplier; lets one family of variables roam
    /// hotter than the rest.
    pub annealing_temp_mul: f64,
}

impl Default for CalType {
    fn default() -> Self {
        Self {
            active: false,
            annealing_temp_mul: 1.0,
        }
    }
}

/// The five independently switchable calibration types.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalTypeSet {
    pub endstop: CalType,
    pub delta_radius: CalType,
    pub arm_length: CalType,
    pub tower_angle: CalType,
    pub virtual_shimming: CalType,
}

impl CalTypeSet {
    pub fn any_active(&self) -> bool {
        self.endstop.active
            || self.delta_radius.active
            || self.arm_length.active
            || self.tower_angle.active
            || self.virtual_shimming.active
    }

    /// Default zero multipliers to 1 and clamp the rest to a sane range.
    pub fn sanitize(&mut self) {
        for caltype in [
            &mut self.endstop,
            &mut self.delta_radius,
            &mut self.arm_length,
            &mut self.tower_angle,
            &mut self.virtual_shimming,
        ] {
            if caltype.annealing_temp_mul == 0.0 {
                caltype.annealing_temp_mul = 1.0;
            }
            caltype.annealing_temp_mul = clamp(caltype.annealing_temp_mul, 0.0, 50.0);
        }
    }
}

/// Annealing run parameters.
#[derive(Clone, Copy, Debug)]
pub struct AnnealOptions {
    pub tries: u32,
    pub max_temp: f64,
    pub binsearch_width: f64,
    pub overrun_divisor: f64,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl AnnealOptions {
    pub fn from_config(config: &AnnealingConfig) -> Self {
        Self {
            tries: config.tries,
            max_temp: config.max_temp,
            binsearch_width: config.binsearch_width,
            overrun_divisor: config.overrun_divisor,
            seed: None,
        }
    }

    /// Clamp everything into its supported range.
    pub fn clamped(mut self) -> Self {
        self.tries = self.tries.clamp(10, 1000);
        self.max_temp = clamp(self.max_temp, 0.0, 2.0);
        self.binsearch_width = clamp(self.binsearch_width, 0.0, 0.5);
        self.overrun_divisor = clamp(self.overrun_divisor, 0.5, 15.0);
        self
    }
}

/// What a run achieved.
#[derive(Clone, Copy, Debug)]
pub struct AnnealOutcome {
    /// Energy of the final state.
    pub energy: f64,
    /// The stall detector fired before the target was reached.
    pub stalled: bool,
    /// Iterations actually executed.
    pub tries_used: u32,
}

/// One scalar the annealer can optimize.
///
/// Each variant knows how to apply a candidate value: trim lives only in
/// the settings (forward kinematics subtracts it explicitly), geometry
/// offsets go to the arm solution, and shim values refit the plane.
#[derive(Clone, Copy, Debug)]
enum CalTarget {
    Trim(usize),
    RadiusOffset(usize),
    ArmOffset(usize),
    AngleOffset(usize),
    Shim(usize),
}

/// A binary search range that re-centers on the variable as it moves.
#[derive(Clone, Copy, Debug)]
struct TestRange {
    min: f64,
    max: f64,
    half_width: f64,
}

impl TestRange {
    fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            half_width: (max - min) / 2.0,
        }
    }

    fn recenter(&mut self, center: f64) {
        self.min = center - self.half_width;
        self.max = center + self.half_width;
    }
}

/// The annealing engine. Holds the frozen capture and the candidate
/// settings, and drives the arm solution through [`KinematicState`].
pub struct Annealer<'a> {
    arm: Arc<Mutex<dyn ArmSolution>>,
    kin: &'a mut KinematicState,
    surface: &'a mut SurfaceTransform,
    grid: &'a ProbeGrid,
    caltypes: CalTypeSet,
    opts: AnnealOptions,
    cur: KinematicSettings,
    capture: AxisCapture,
    cartesian: Vec<Point3D>,
    rng: StdRng,
}

impl<'a> Annealer<'a> {
    pub fn new(
        kin: &'a mut KinematicState,
        surface: &'a mut SurfaceTransform,
        grid: &'a ProbeGrid,
        caltypes: CalTypeSet,
        opts: AnnealOptions,
        settings: KinematicSettings,
        capture: AxisCapture,
    ) -> Self {
        let arm = kin.arm().clone();
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            arm,
            kin,
            surface,
            grid,
            caltypes,
            opts,
            cur: settings,
            capture,
            cartesian: Vec::new(),
            rng,
        }
    }

    /// Final candidate settings after a run.
    pub fn settings(&self) -> KinematicSettings {
        self.cur
    }

    /// The reprojected surface of the last energy evaluation, as samples.
    pub fn final_depths(&self) -> Vec<DepthSample> {
        self.cartesian
            .iter()
            .map(|p| DepthSample {
                absolute: 0.0,
                relative: p.z,
            })
            .collect()
    }

    /// Run the annealing loop. `report` should already carry the caller's
    /// prefix scope.
    pub fn run<W: Write>(&mut self, report: &mut Reporter<W>) -> Result<AnnealOutcome> {
        let tries = self.opts.tries;

        let mut trim_range = [TestRange::new(-5.0, 0.0); 3];
        let mut radius_offset_range = [TestRange::new(-3.0, 3.0); 3];
        let mut arm_offset_range = [TestRange::new(-3.0, 3.0); 3];
        let mut angle_range = [TestRange::new(-3.0, 3.0); 3];
        let mut shim_range = [TestRange::new(-3.0, 3.0); 3];

        let mut last_energy = [0.0; ENERGY_WINDOW];
        let mut energy_count = 0usize;

        let mut stalled = false;
        let mut tries_used = tries;

        for attempt in 0..tries {
            // Linear cooling, floored so late iterations can still move.
            let fraction = attempt as f64 / tries as f64;
            let temp = (self.opts.max_temp - fraction * self.opts.max_temp).max(0.01);

            if self.caltypes.delta_radius.active {
                let mul = self.caltypes.delta_radius.annealing_temp_mul;
                for k in 0..3 {
                    let best =
                        self.find_optimal(CalTarget::RadiusOffset(k), &radius_offset_range[k])?;
                    let moved = self.move_randomly_towards(
                        self.cur.tower_radius_offset[k],
                        best,
                        temp * mul,
                    );
                    self.apply_target(CalTarget::RadiusOffset(k), moved)?;
                }

                // Steal the common mode: the offset closest to zero moves
                // into the global delta radius, keeping the offsets small.
                let lowest = closest_to_zero(&self.cur.tower_radius_offset);
                for offset in &mut self.cur.tower_radius_offset {
                    *offset -= lowest;
                }
                self.cur.delta_radius += lowest;
                self.kin.set_delta_radius(self.cur.delta_radius, false)?;
                self.kin
                    .set_tower_radius_offsets(self.cur.tower_radius_offset, false)?;
            }

            if self.caltypes.arm_length.active {
                let mul = self.caltypes.arm_length.annealing_temp_mul;
                for k in 0..3 {
                    let best = self.find_optimal(CalTarget::ArmOffset(k), &arm_offset_range[k])?;
                    let moved = self.move_randomly_towards(
                        self.cur.tower_arm_offset[k],
                        best,
                        temp * mul,
                    );
                    self.apply_target(CalTarget::ArmOffset(k), moved)?;
                }

                // Same normalization as delta radius, into the global arm
                // length.
                let lowest = closest_to_zero(&self.cur.tower_arm_offset);
                for offset in &mut self.cur.tower_arm_offset {
                    *offset -= lowest;
                }
                self.cur.arm_length += lowest;
                self.kin.set_arm_length(self.cur.arm_length, false)?;
                self.kin
                    .set_tower_arm_offsets(self.cur.tower_arm_offset, false)?;
            }

            if self.caltypes.endstop.active {
                let mul = self.caltypes.endstop.annealing_temp_mul;
                for k in 0..3 {
                    let best = self.find_optimal(CalTarget::Trim(k), &trim_range[k])?;
                    let moved = self.move_randomly_towards(self.cur.trim[k], best, temp * mul);
                    self.apply_target(CalTarget::Trim(k), moved)?;
                }
                self.kin.set_trim(self.cur.trim)?;
            }

            if self.caltypes.tower_angle.active {
                let mul = self.caltypes.tower_angle.annealing_temp_mul;
                for k in 0..3 {
                    let best = self.find_optimal(CalTarget::AngleOffset(k), &angle_range[k])?;
                    let moved = self.move_randomly_towards(
                        self.cur.tower_angle_offset[k],
                        best,
                        temp * mul,
                    );
                    self.apply_target(CalTarget::AngleOffset(k), moved)?;
                }
                self.kin
                    .set_tower_angle_offsets(self.cur.tower_angle_offset, false)?;
            }

            if self.caltypes.virtual_shimming.active {
                let mul = self.caltypes.virtual_shimming.annealing_temp_mul;
                for k in 0..3 {
                    let best = self.find_optimal(CalTarget::Shim(k), &shim_range[k])?;
                    let moved = self.move_randomly_towards(
                        self.cur.virtual_shimming[k],
                        best,
                        temp * mul,
                    );
                    self.apply_target(CalTarget::Shim(k), moved)?;
                }
            }

            self.kin.reseat()?;

            // Follow the variables as they wander so the searches keep
            // resolution around the current state.
            for k in 0..3 {
                trim_range[k].recenter(self.cur.trim[k]);
                radius_offset_range[k].recenter(self.cur.tower_radius_offset[k]);
                arm_offset_range[k].recenter(self.cur.tower_arm_offset[k]);
                angle_range[k].recenter(self.cur.tower_angle_offset[k]);
                shim_range[k].recenter(self.cur.virtual_shimming[k]);
            }

            if attempt % 5 == 0 {
                let energy = self.eval_energy()?;
                report.line(&format!(
                    "Try {} of {}, energy={:.3} (want <= {:.3})",
                    attempt, tries, energy, GLOBAL_TARGET
                ));

                // Shift the window and watch for a flatline.
                for j in (1..ENERGY_WINDOW).rev() {
                    last_energy[j] = last_energy[j - 1];
                }
                last_energy[0] = energy;
                energy_count += 1;
                if energy_count >= ENERGY_WINDOW {
                    let stats = statistics(&last_energy);
                    if stats.sigma < STALL_SIGMA {
                        report.line("Annealing has stalled - aborting.");
                        stalled = true;
                        tries_used = attempt;
                        break;
                    }
                }

                if energy <= GLOBAL_TARGET {
                    report.line("Annealing: Within target");
                    tries_used = attempt;
                    break;
                }
            }

            self.kin.yield_idle()?;
        }

        let energy = self.eval_energy()?;

        // Normalized trim prevents the homed height from creeping downward
        // run over run.
        self.cur.normalize_trim();
        self.kin.set_trim(self.cur.trim)?;

        Ok(AnnealOutcome {
            energy,
            stalled,
            tries_used,
        })
    }

    /// Energy of the current candidate state.
    fn eval_energy(&mut self) -> Result<f64> {
        simulate_fk_energy(
            &self.arm,
            self.grid,
            self.surface,
            &self.capture,
            self.cur.trim,
            &mut self.cartesian,
        )
    }

    /// Binary-search the conditional optimum of one variable.
    ///
    /// Evaluates the energy at both ends of the range and shrinks the
    /// losing side by the configured width fraction until the range is
    /// tighter than the per-variable target. The variable is restored
    /// afterward; only the returned optimum matters.
    fn find_optimal(&mut self, target: CalTarget, range: &TestRange) -> Result<f64> {
        let saved = self.target_value(target);
        let mut min = range.min;
        let mut max = range.max;

        for _ in 0..BINSEARCH_ROUNDS {
            self.apply_target(target, min)?;
            let energy_min = self.eval_energy()?;

            self.apply_target(target, max)?;
            let energy_max = self.eval_energy()?;

            if max - min <= VARIABLE_TARGET {
                break;
            }
            if energy_min < energy_max {
                max -= (max - min) * self.opts.binsearch_width;
            } else if energy_min > energy_max {
                min += (max - min) * self.opts.binsearch_width;
            } else {
                // A perfectly flat response means this variable cannot be
                // resolved further.
                break;
            }
        }

        self.apply_target(target, saved)?;
        Ok((min + max) / 2.0)
    }

    /// Take a random, temperature-bounded step from `value` toward `best`.
    ///
    /// A step that would overshoot is divided down instead of clipped, so
    /// the variable can still jump past the optimum occasionally; that
    /// wobble is what keeps the search from freezing into a local optimum.
    fn move_randomly_towards(&mut self, value: f64, best: f64, temp: f64) -> f64 {
        let mut step = self.rng.random::<f64>() * temp + 0.001;
        let mut value = value;

        if best > value + VARIABLE_TARGET {
            if value + step > best {
                step /= self.opts.overrun_divisor;
            }
            value += step;
        } else if best < value - VARIABLE_TARGET {
            if value - step < best {
                step /= self.opts.overrun_divisor;
            }
            value -= step;
        }
        value
    }

    fn target_value(&self, target: CalTarget) -> f64 {
        match target {
            CalTarget::Trim(k) => self.cur.trim[k],
            CalTarget::RadiusOffset(k) => self.cur.tower_radius_offset[k],
            CalTarget::ArmOffset(k) => self.cur.tower_arm_offset[k],
            CalTarget::AngleOffset(k) => self.cur.tower_angle_offset[k],
            CalTarget::Shim(k) => self.cur.virtual_shimming[k],
        }
    }

    fn apply_target(&mut self, target: CalTarget, value: f64) -> Result<()> {
        match target {
            CalTarget::Trim(k) => {
                // Trim is applied inside the FK evaluation; nothing to push.
                self.cur.trim[k] = value;
            }
            CalTarget::RadiusOffset(k) => {
                self.cur.tower_radius_offset[k] = value;
                self.kin
                    .set_tower_radius_offsets(self.cur.tower_radius_offset, false)?;
            }
            CalTarget::ArmOffset(k) => {
                self.cur.tower_arm_offset[k] = value;
                self.kin
                    .set_tower_arm_offsets(self.cur.tower_arm_offset, false)?;
            }
            CalTarget::AngleOffset(k) => {
                self.cur.tower_angle_offset[k] = value;
                self.kin
                    .set_tower_angle_offsets(self.cur.tower_angle_offset, false)?;
            }
            CalTarget::Shim(k) => {
                self.cur.virtual_shimming[k] = value;
                self.surface.set_virtual_shimming(
                    self.cur.virtual_shimming[0],
                    self.cur.virtual_shimming[1],
                    self.cur.virtual_shimming[2],
                );
            }
        }
        Ok(())
    }
}

/// The element with the smallest magnitude, keeping its sign.
fn closest_to_zero(values: &[f64; 3]) -> f64 {
    let mut lowest = values[0];
    for &v in &values[1..] {
        if v.abs() < lowest.abs() {
            lowest = v;
        }
    }
    lowest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::energy::simulate_ik;
    use crate::config::SurfaceShape;
    use crate::hardware::simulator::{SimOptions, SimulatedPrinter};

    fn setup() -> (KinematicState, SurfaceTransform, ProbeGrid) {
        let printer = SimulatedPrinter::new(SimOptions::default());
        let grid = ProbeGrid::build(100.0, 5, SurfaceShape::Circle).unwrap();
        let surface = SurfaceTransform::new(&grid);
        let kin = KinematicState::new(printer.arm_handle(), printer.motion_handle());
        (kin, surface, grid)
    }

    fn flat_samples(grid: &ProbeGrid) -> Vec<DepthSample> {
        vec![DepthSample::default(); grid.len()]
    }

    #[test]
    fn test_closest_to_zero_keeps_sign() {
        assert_eq!(closest_to_zero(&[-1.0, 0.5, 2.0]), 0.5);
        assert_eq!(closest_to_zero(&[-0.25, 0.5, 2.0]), -0.25);
        assert_eq!(closest_to_zero(&[3.0, 3.0, 3.0]), 3.0);
    }

    #[test]
    fn test_binary_search_finds_trim_optimum() {
        let (mut kin, mut surface, grid) = setup();

        // Capture a flat surface as measured by a printer whose X trim is
        // really -1.0; the conditional optimum of trim X is then -1.0.
        let samples = flat_samples(&grid);
        let capture =
            simulate_ik(kin.arm(), &grid, &surface, &samples, [-1.0, 0.0, 0.0]).unwrap();

        let settings = KinematicSettings {
            initialized: true,
            arm_length: 270.0,
            delta_radius: 130.0,
            ..KinematicSettings::default()
        };
        let opts = AnnealOptions {
            tries: 50,
            max_temp: 0.35,
            binsearch_width: 0.1,
            overrun_divisor: 2.0,
            seed: Some(7),
        }
        .clamped();
        let mut annealer = Annealer::new(
            &mut kin,
            &mut surface,
            &grid,
            CalTypeSet::default(),
            opts,
            settings,
            capture,
        );

        let best = annealer
            .find_optimal(CalTarget::Trim(0), &TestRange::new(-5.0, 0.0))
            .unwrap();
        assert!((best - (-1.0)).abs() < 0.01, "best = {}", best);
        // The searched variable is restored afterward.
        assert_eq!(annealer.settings().trim[0], 0.0);
    }

    #[test]
    fn test_move_randomly_respects_temperature() {
        let (mut kin, mut surface, grid) = setup();
        let samples = flat_samples(&grid);
        let capture = simulate_ik(kin.arm(), &grid, &surface, &samples, [0.0; 3]).unwrap();
        let settings = KinematicSettings {
            initialized: true,
            ..KinematicSettings::default()
        };
        let opts = AnnealOptions {
            tries: 50,
            max_temp: 0.35,
            binsearch_width: 0.1,
            overrun_divisor: 2.0,
            seed: Some(3),
        };
        let mut annealer = Annealer::new(
            &mut kin,
            &mut surface,
            &grid,
            CalTypeSet::default(),
            opts,
            settings,
            capture,
        );

        for _ in 0..100 {
            let moved = annealer.move_randomly_towards(0.0, 10.0, 0.2);
            assert!(moved > 0.0, "always moves toward a distant optimum");
            assert!(moved <= 0.201 + 0.001, "step bounded by temperature");
        }

        // Within the per-variable target, no move at all.
        let stay = annealer.move_randomly_towards(1.0, 1.002, 0.2);
        assert_eq!(stay, 1.0);
    }

    #[test]
    fn test_options_clamped() {
        let opts = AnnealOptions {
            tries: 5000,
            max_temp: 9.0,
            binsearch_width: 3.0,
            overrun_divisor: 0.0,
            seed: None,
        }
        .clamped();
        assert_eq!(opts.tries, 1000);
        assert_eq!(opts.max_temp, 2.0);
        assert_eq!(opts.binsearch_width, 0.5);
        assert_eq!(opts.overrun_divisor, 0.5);
    }

    #[test]
    fn test_caltype_sanitize() {
        let mut caltypes = CalTypeSet::default();
        caltypes.endstop.active = true;
        caltypes.endstop.annealing_temp_mul = 0.0;
        caltypes.delta_radius.annealing_temp_mul = 500.0;
        caltypes.sanitize();
        assert_eq!(caltypes.endstop.annealing_temp_mul, 1.0);
        assert_eq!(caltypes.delta_radius.annealing_temp_mul, 50.0);
    }

    #[test]
    fn test_anneal_recovers_single_trim_error() {
        let (mut kin, mut surface, grid) = setup();
        let samples = flat_samples(&grid);
        let true_trim = [-0.9, -0.4, 0.0];
        let capture = simulate_ik(kin.arm(), &grid, &surface, &samples, true_trim).unwrap();

        let settings = KinematicSettings {
            initialized: true,
            arm_length: 270.0,
            delta_radius: 130.0,
            ..KinematicSettings::default()
        };
        let mut caltypes = CalTypeSet::default();
        caltypes.endstop.active = true;
        caltypes.sanitize();
        let opts = AnnealOptions {
            tries: 100,
            max_temp: 0.35,
            binsearch_width: 0.1,
            overrun_divisor: 2.0,
            seed: Some(42),
        }
        .clamped();

        let mut annealer = Annealer::new(
            &mut kin,
            &mut surface,
            &grid,
            caltypes,
            opts,
            settings,
            capture,
        );
        let mut report = Reporter::new(Vec::new());
        let outcome = annealer.run(&mut report).unwrap();

        assert!(
            outcome.energy <= GLOBAL_TARGET + 0.005,
            "energy = {} after {} tries (stalled: {})",
            outcome.energy,
            outcome.tries_used,
            outcome.stalled
        );

        // Recovered trim matches the true trim up to a common offset.
        let recovered = annealer.settings().trim;
        let diff0 = recovered[0] - true_trim[0];
        for k in 1..3 {
            assert!(
                ((recovered[k] - true_trim[k]) - diff0).abs() < 0.03,
                "recovered {:?} vs true {:?}",
                recovered,
                true_trim
            );
        }
    }
}
