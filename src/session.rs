//! Calibration session: command surface and orchestration.
//!
//! [`CalibrationSession`] owns the injected hardware handles and every
//! piece of calibration state, and exposes one typed method per host
//! command:
//!
//! | Host command | Method |
//! |--------------|--------|
//! | `G29`        | [`probe_repeatability`](CalibrationSession::probe_repeatability) |
//! | `G31 A`      | [`depth_map_to_file`](CalibrationSession::depth_map_to_file) |
//! | `G31 Z`      | [`display_surface`](CalibrationSession::display_surface) |
//! | `G31 ...`    | [`heuristic_calibration`](CalibrationSession::heuristic_calibration) |
//! | `G32`        | [`iterative_calibration`](CalibrationSession::iterative_calibration) |
//! | `M665/M666`  | [`note_geometry_changed`](CalibrationSession::note_geometry_changed) / [`note_trim_changed`](CalibrationSession::note_trim_changed) |
//! | `M667`       | [`set_surface_transform`](CalibrationSession::set_surface_transform) |
//! | `M500/M503`  | [`write_override`](CalibrationSession::write_override) |
//!
//! The G-code text itself is parsed by the host dispatcher; this crate only
//! sees the decoded options.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::calibrate::{
    self, measure_repeatability, print_kinematics, simulate_fk_energy, simulate_ik, AnnealOptions,
    AnnealOutcome, Annealer, AxisCapture, BestProbeCalibration, CalType, CalTypeSet,
    KinematicSettings, KinematicState, RepeatabilityOptions, RepeatabilityReport,
};
use crate::config::{Config, SurfaceShape};
use crate::error::{Error, Result};
use crate::grid::{ProbeGrid, Tower};
use crate::hardware::traits::{ArmSolution, MotionController, ZProbe};
use crate::mapping::{print_depths, probe_surface, DepthSample, DisplayMode};
use crate::probe::ProbeRig;
use crate::report::Reporter;
use crate::surface::SurfaceTransform;

/// Options for heuristic (annealing) calibration.
///
/// Each caltype field carries its annealing temperature multiplier when the
/// type is active. Unset tuning parameters fall back to the configured
/// defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicOptions {
    pub endstop: Option<f64>,
    pub delta_radius: Option<f64>,
    pub arm_length: Option<f64>,
    pub tower_angle: Option<f64>,
    pub virtual_shimming: Option<f64>,
    /// Keep the current kinematics and the last depth map.
    pub keep_settings: bool,
    /// Work against a synthetic flat surface instead of probing.
    pub simulate_only: bool,
    /// Zero every per-tower offset and the shimming plane first.
    pub zero_all_offsets: bool,
    pub tries: Option<u32>,
    pub max_temp: Option<f64>,
    pub binsearch_width: Option<f64>,
    pub overrun_divisor: Option<f64>,
    /// Fixed annealing seed for reproducible runs.
    pub seed: Option<u64>,
}

/// Decoded M667 arguments.
#[derive(Clone, Copy, Debug, Default)]
pub struct SurfaceOptions {
    pub shim_x: Option<f64>,
    pub shim_y: Option<f64>,
    pub shim_z: Option<f64>,
    pub plane_enable: Option<bool>,
    pub depth_enable: Option<bool>,
    pub master_enable: Option<bool>,
}

/// The calibration engine with its injected collaborators.
pub struct CalibrationSession<W: Write> {
    config: Config,
    grid: ProbeGrid,
    surface: SurfaceTransform,
    kin: KinematicState,
    rig: ProbeRig,
    report: Reporter<W>,
    motion: Arc<Mutex<dyn MotionController>>,
    arm: Arc<Mutex<dyn ArmSolution>>,
    base_set: KinematicSettings,
    cur_set: KinematicSettings,
    last_samples: Option<Vec<DepthSample>>,
    capture: Option<AxisCapture>,
    need_to_simulate_ik: bool,
    best_probe: Option<BestProbeCalibration>,
}

impl<W: Write> CalibrationSession<W> {
    pub fn new(
        config: Config,
        motion: Arc<Mutex<dyn MotionController>>,
        probe: Arc<Mutex<dyn ZProbe>>,
        arm: Arc<Mutex<dyn ArmSolution>>,
        out: W,
    ) -> Result<Self> {
        config.validate()?;
        let grid = ProbeGrid::build(config.probe.radius, config.grid.dimension, config.grid.shape)?;

        let mut surface = SurfaceTransform::new(&grid);
        surface.set_virtual_shimming(0.0, 0.0, 0.0);
        surface.set_active(true);

        {
            let mut probe = probe.lock().map_err(|_| Error::MutexPoisoned)?;
            probe.set_fast_feedrate(config.probe.fast_feedrate);
            probe.set_slow_feedrate(config.probe.slow_feedrate);
        }

        let kin = KinematicState::new(arm.clone(), motion.clone());
        let rig = ProbeRig::new(probe, motion.clone(), config.probe.clone());

        Ok(Self {
            config,
            grid,
            surface,
            kin,
            rig,
            report: Reporter::new(out),
            motion,
            arm,
            base_set: KinematicSettings::default(),
            cur_set: KinematicSettings::default(),
            last_samples: None,
            capture: None,
            need_to_simulate_ik: true,
            best_probe: None,
        })
    }

    // === Introspection ===

    pub fn grid(&self) -> &ProbeGrid {
        &self.grid
    }

    pub fn surface(&self) -> &SurfaceTransform {
        &self.surface
    }

    pub fn report(&self) -> &Reporter<W> {
        &self.report
    }

    pub fn geometry_dirty(&self) -> bool {
        self.kin.is_dirty()
    }

    /// Snapshot of the currently applied kinematics.
    pub fn kinematics(&self) -> Result<KinematicSettings> {
        self.kin.snapshot(&self.surface)
    }

    /// Print the current kinematics to the report stream.
    pub fn print_kinematics(&mut self) -> Result<()> {
        let CalibrationSession {
            report,
            kin,
            surface,
            ..
        } = self;
        let snapshot = kin.snapshot(surface)?;
        print_kinematics(report, &snapshot, surface);
        Ok(())
    }

    fn wait_for_idle(&self) -> Result<()> {
        self.motion
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .wait_for_idle();
        Ok(())
    }

    // === G29: probe repeatability ===

    pub fn probe_repeatability(
        &mut self,
        opts: RepeatabilityOptions,
    ) -> Result<RepeatabilityReport> {
        self.wait_for_idle()?;
        let CalibrationSession {
            report,
            rig,
            best_probe,
            ..
        } = self;
        measure_repeatability(rig, report, opts, best_probe)
    }

    // === G31 Z: probe and display only ===

    pub fn display_surface(&mut self) -> Result<Vec<DepthSample>> {
        self.wait_for_idle()?;
        let CalibrationSession {
            report,
            rig,
            kin,
            surface,
            grid,
            ..
        } = self;

        report.blank();
        let mut report = report.scope("DM");
        report.line("Current kinematics:");
        let snapshot = kin.snapshot(surface)?;
        print_kinematics(&mut report, &snapshot, surface);
        report.blank();

        let samples = match probe_surface(rig, grid, &mut report, false, DisplayMode::Formatted) {
            Ok(samples) => samples,
            Err(e) => {
                report.line("Couldn't depth-map the surface.");
                rig.home()?;
                return Err(e);
            }
        };
        rig.home()?;
        Ok(samples)
    }

    // === G31 A: build, save, and enable the depth map ===

    pub fn depth_map_to_file(&mut self, path: Option<&Path>) -> Result<()> {
        self.wait_for_idle()?;
        if self.config.probe.offset_x != 0.0 || self.config.probe.offset_y != 0.0 {
            self.report
                .line("Depth correction doesn't work with X or Y probe offsets.");
            return Err(Error::ConfigInvalid(
                "depth correction requires zero probe X/Y offsets".to_string(),
            ));
        }

        let CalibrationSession {
            report,
            rig,
            surface,
            grid,
            config,
            last_samples,
            ..
        } = self;
        let mut report = report.scope("DC");
        report.blank();
        report.line("Probing bed for depth correction...");

        // Correction must not feed back into its own measurements.
        surface.set_depth_enabled(false);
        surface.ensure_depth_buffer();

        let samples = match probe_surface(rig, grid, &mut report, true, DisplayMode::Formatted) {
            Ok(samples) => samples,
            Err(e) => {
                report.line("Couldn't build depth map - aborting!");
                rig.home()?;
                return Err(e);
            }
        };

        surface.fill_depths(&samples);
        if grid.shape() == SurfaceShape::Circle {
            surface.propagate_edges(grid);
        }
        surface.set_depth_enabled(true);
        surface.set_active(true);

        let default_path = Path::new(&config.surface.depth_map_path);
        match surface.save_depth_map(path.unwrap_or(default_path)) {
            Ok(()) => {
                report.line("Surface transform saved to SD card. Type M500 to auto-enable.");
            }
            Err(e) => {
                report.line("Couldn't save surface transform to SD card!");
                return Err(e);
            }
        }

        *last_samples = Some(samples);
        rig.home()?;
        Ok(())
    }

    // === G32: iterative calibration ===

    pub fn iterative_calibration(&mut self, keep_settings: bool) -> Result<bool> {
        self.wait_for_idle()?;
        let CalibrationSession {
            report,
            rig,
            kin,
            surface,
            ..
        } = self;
        calibrate::iterative_calibration(rig, kin, surface, report, keep_settings)
    }

    /// Recalibrate automatically if the geometry was changed externally.
    pub fn require_clean_geometry(&mut self) -> Result<()> {
        if !self.kin.is_dirty() {
            return Ok(());
        }
        {
            let mut report = self.report.scope("EC");
            report.line("Geometry has been changed - recalibrating.");
        }
        self.iterative_calibration(false)?;
        // Trim changes move the homed position, so the remembered bed
        // height is stale.
        let CalibrationSession { report, rig, .. } = self;
        rig.find_bed_center_height(report, true)?;
        Ok(())
    }

    // === M665 / M666 ===

    pub fn note_geometry_changed(&mut self) {
        self.kin.mark_dirty();
    }

    pub fn note_trim_changed(&mut self) {
        self.kin.mark_dirty();
    }

    // === M667 ===

    pub fn set_surface_transform(&mut self, opts: SurfaceOptions) -> Result<()> {
        let CalibrationSession {
            report,
            surface,
            config,
            ..
        } = self;
        let mut report = report.scope("DM");

        if let Some(z) = opts.shim_x {
            surface.set_tri_z(Tower::X, z);
        }
        if let Some(z) = opts.shim_y {
            surface.set_tri_z(Tower::Y, z);
        }
        if let Some(z) = opts.shim_z {
            surface.set_tri_z(Tower::Z, z);
        }

        if let Some(enable) = opts.plane_enable {
            surface.set_plane_enabled(enable);
        }
        if surface.plane_enabled() {
            let tri = *surface.tri_points();
            surface.set_virtual_shimming(tri[0].z, tri[1].z, tri[2].z);
            surface.set_active(true);
        }

        if let Some(enable) = opts.depth_enable {
            if config.probe.offset_x == 0.0 && config.probe.offset_y == 0.0 {
                if surface.have_depth_map() {
                    surface.set_depth_enabled(enable);
                } else {
                    surface.ensure_depth_buffer();
                    match surface.load_depth_map(&config.surface.depth_map_path) {
                        Ok(()) => {
                            surface.set_depth_enabled(enable);
                            if enable {
                                surface.set_active(true);
                            }
                        }
                        Err(Error::Io(_)) => {
                            report.line("Depth correction not initialized.");
                        }
                        Err(e) => {
                            report.line("Depth map file rejected - correction stays off.");
                            surface.set_depth_enabled(false);
                            return Err(e);
                        }
                    }
                }
            } else {
                // Enabling correction with XY probe offsets would shift
                // the whole map; refuse quietly like the save path warns.
                log::debug!("ignoring depth-correction enable: probe X/Y offsets are nonzero");
            }
        }

        if let Some(master) = opts.master_enable {
            if master {
                if surface.depth_enabled() || surface.plane_enabled() {
                    surface.set_active(true);
                } else {
                    report.line("Can't enable surface transform - no data.");
                }
            } else {
                surface.set_active(false);
            }
        }

        Ok(())
    }

    // === M500 / M503 ===

    /// Emit the M667 line that restores the surface transform state.
    pub fn write_override(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let tri = self.surface.tri_points();
        writeln!(out, ";ABC=Shimming data; D=Shimming; E=Depth map; Z=Master enable")?;
        writeln!(
            out,
            "M667 A{:.4} B{:.4} C{:.4} D{} E{} Z{}",
            tri[0].z,
            tri[1].z,
            tri[2].z,
            self.surface.plane_enabled() as i32,
            self.surface.depth_enabled() as i32,
            self.surface.active() as i32
        )
    }

    // === G31: heuristic calibration ===

    pub fn heuristic_calibration(&mut self, opts: HeuristicOptions) -> Result<AnnealOutcome> {
        self.wait_for_idle()?;

        let mut caltypes = CalTypeSet::default();
        for (flag, caltype) in [
            (opts.endstop, &mut caltypes.endstop),
            (opts.delta_radius, &mut caltypes.delta_radius),
            (opts.arm_length, &mut caltypes.arm_length),
            (opts.tower_angle, &mut caltypes.tower_angle),
            (opts.virtual_shimming, &mut caltypes.virtual_shimming),
        ] {
            if let Some(mul) = flag {
                *caltype = CalType {
                    active: true,
                    annealing_temp_mul: mul,
                };
            }
        }

        let anneal_opts = AnnealOptions {
            tries: opts.tries.unwrap_or(self.config.annealing.tries),
            max_temp: opts.max_temp.unwrap_or(self.config.annealing.max_temp),
            binsearch_width: opts
                .binsearch_width
                .unwrap_or(self.config.annealing.binsearch_width),
            overrun_divisor: opts
                .overrun_divisor
                .unwrap_or(self.config.annealing.overrun_divisor),
            seed: opts.seed,
        }
        .clamped();

        let CalibrationSession {
            report,
            rig,
            kin,
            surface,
            grid,
            arm,
            base_set,
            cur_set,
            last_samples,
            capture,
            need_to_simulate_ik,
            ..
        } = self;
        let mut report = report.scope("HC");

        report.blank();
        report.line("Heuristic calibration in progress. Press Reset to abort.");
        report.line(
            "/!\\ PROBE CRASH DANGER /!\\ Don't press buttons, send commands, or access the SD card.",
        );
        report.blank();

        if !caltypes.any_active() {
            report.line("No calibration types selected - activating endstops & delta radius.");
            caltypes.endstop.active = true;
            caltypes.delta_radius.active = true;
        }
        caltypes.sanitize();

        if opts.zero_all_offsets {
            surface.set_virtual_shimming(0.0, 0.0, 0.0);
            kin.set_trim([0.0; 3])?;
            kin.set_tower_radius_offsets([0.0; 3], false)?;
            kin.set_tower_angle_offsets([0.0; 3], false)?;
            kin.set_tower_arm_offsets([0.0; 3], false)?;
            kin.reseat()?;
            *base_set = kin.snapshot(surface)?;
            *cur_set = *base_set;
        }

        report.line(&format!(
            "            Data source: {}",
            if opts.simulate_only {
                "Simulation (L)"
            } else {
                "Probe"
            }
        ));
        report.line(&format!(
            "           Active tests: {}",
            caltype_summary(&caltypes, true)
        ));
        report.line(&format!(
            "         Inactive tests: {}",
            caltype_summary(&caltypes, false)
        ));
        report.line(&format!(
            " Keep last settings (K): {}",
            opts.keep_settings
        ));
        report.line(&format!("    Annealing tries (T): {}", anneal_opts.tries));
        report.line(&format!("           Max temp (U): {:.3}", anneal_opts.max_temp));
        report.line(&format!(
            "Binary search width (V): {:.3}",
            anneal_opts.binsearch_width
        ));
        report.line(&format!(
            "    Overrun divisor (W): {:.3}",
            anneal_opts.overrun_divisor
        ));
        report.line(&format!(
            "   Zero all offsets (Y): {}",
            opts.zero_all_offsets
        ));
        report.blank();

        // Depth correction would corrupt both the measurements and the
        // energy model; the shimming plane participates only when it is
        // being calibrated.
        surface.set_depth_enabled(false);
        surface.set_plane_enabled(caltypes.virtual_shimming.active);

        if !opts.simulate_only || !base_set.initialized {
            report.line("Baseline kinematics updated.");
            *base_set = kin.snapshot(surface)?;
        }
        if !cur_set.initialized {
            *cur_set = kin.snapshot(surface)?;
        }
        if opts.keep_settings || !opts.simulate_only {
            report.line("Keeping existing kinematics.");
            *cur_set = kin.snapshot(surface)?;
        } else {
            report.line("Restoring baseline kinematics.");
            *cur_set = *base_set;
            kin.apply(cur_set, surface, true)?;
        }

        // Acquire the measured surface: real probes, or a flat simulated
        // bed seen by deliberately perturbed parameters.
        let mut restore_to: Option<KinematicSettings> = None;
        let samples: Vec<DepthSample>;
        if opts.simulate_only {
            if !opts.keep_settings {
                report.line("Perturbing simulated printer parameters.");
                restore_to = Some(kin.snapshot(surface)?);

                if caltypes.endstop.active {
                    kin.set_trim([-1.834, -1.779, 0.0])?;
                }
                if caltypes.delta_radius.active {
                    kin.set_delta_radius(131.25, false)?;
                    kin.set_tower_radius_offsets([-1.0, 0.0, 2.0], false)?;
                } else {
                    kin.set_tower_radius_offsets([0.0; 3], false)?;
                }
                if caltypes.arm_length.active {
                    kin.set_arm_length(269.75, false)?;
                }
                if caltypes.tower_angle.active {
                    kin.set_tower_angle_offsets([1.0, 0.0, -1.5], false)?;
                } else {
                    kin.set_tower_angle_offsets([0.0; 3], false)?;
                }
                if caltypes.virtual_shimming.active {
                    surface.set_virtual_shimming(0.0, 0.0, -1.0);
                } else {
                    surface.set_virtual_shimming(0.0, 0.0, 0.0);
                }
                kin.reseat()?;

                *cur_set = kin.snapshot(surface)?;
                *need_to_simulate_ik = true;

                report.line("After hosing the variables, the settings are now:");
                print_kinematics(&mut report, cur_set, surface);
            }
            samples = vec![DepthSample::default(); grid.len()];
        } else if !opts.keep_settings || last_samples.is_none() {
            report.line("Depth-mapping the print surface...");
            let snapshot = kin.snapshot(surface)?;
            print_kinematics(&mut report, &snapshot, surface);
            let probed =
                match probe_surface(rig, grid, &mut report, false, DisplayMode::Formatted) {
                    Ok(samples) => samples,
                    Err(e) => {
                        report.line("Couldn't depth-map the surface.");
                        rig.home()?;
                        return Err(e);
                    }
                };
            *last_samples = Some(probed.clone());
            samples = probed;
        } else {
            report.line("Keeping old depth map.");
            samples = last_samples.clone().unwrap_or_default();
        }

        // Freeze the carriage positions of a printer that perfectly
        // matches the measuring configuration. In simulation this happens
        // once per perturbation; with real probes, once per probing pass.
        if *need_to_simulate_ik || !opts.simulate_only {
            report.line("Generating carriage positions for a printer with this configuration.");
            *capture = Some(simulate_ik(arm, grid, surface, &samples, cur_set.trim)?);
            if let Some(previous) = restore_to {
                *cur_set = previous;
                kin.apply(cur_set, surface, true)?;
            }
            *need_to_simulate_ik = false;
        }
        let frozen = capture.clone().ok_or(Error::Uninitialized)?;

        report.blank();
        report.line(&format!(
            "Starting test configuration: Arm Length={:.3}, Delta Radius={:.3}",
            cur_set.arm_length, cur_set.delta_radius
        ));

        let mut scratch = Vec::new();
        let initial_energy =
            simulate_fk_energy(arm, grid, surface, &frozen, cur_set.trim, &mut scratch)?;
        report.blank();
        report.line("***** Simulated annealing in progress *****");
        report.line(&format!(
            "Existing calibration has energy {:.3}",
            initial_energy
        ));
        report.line("Reticulating splines...");

        let mut annealer = Annealer::new(kin, surface, grid, caltypes, anneal_opts, *cur_set, frozen);
        let outcome = annealer.run(&mut report)?;
        *cur_set = annealer.settings();
        let final_depths = annealer.final_depths();
        drop(annealer);

        report.line(&format!(
            "Heuristic calibration complete (energy={:.3}). Final settings:",
            outcome.energy
        ));
        print_kinematics(&mut report, cur_set, surface);

        report.blank();
        report.line("Final SIMULATED depths:");
        print_depths(&mut report, grid, &final_depths);

        report.blank();
        report.line("You can run this command again to see if it gets better, or type M500 to save.");
        rig.home()?;

        Ok(outcome)
    }
}

fn caltype_summary(caltypes: &CalTypeSet, show_active: bool) -> String {
    let entries = [
        ("Endstops (O)", caltypes.endstop),
        ("Delta Radius (P)", caltypes.delta_radius),
        ("Arm Length (Q)", caltypes.arm_length),
        ("Tower Angle Offset (R)", caltypes.tower_angle),
        ("Virtual Shimming (S)", caltypes.virtual_shimming),
    ];
    let mut text = String::new();
    for (name, caltype) in entries {
        if caltype.active == show_active {
            text.push_str(&format!("[{}, mul={:.2}] ", name, caltype.annealing_temp_mul));
        }
    }
    if text.is_empty() {
        text.push_str("(none)");
    }
    text
}
