//! Probe driver adapter.
//!
//! [`ProbeRig`] wraps the raw Z-probe and the motion controller with the
//! behavior every measurement needs: moving to the target with the probe
//! offset applied, dropping to the probing acceleration and restoring the
//! global one afterward, averaging multiple taps, priming probes that need
//! to settle, and establishing the absolute bed height.
//!
//! Measurements are step counts so averaging does not lose resolution;
//! conversion to millimeters happens at the consumer.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ProbeConfig;
use crate::core::Point2D;
use crate::error::{Error, Result};
use crate::hardware::traits::{MotionController, ZProbe};
use crate::report::Reporter;

/// Averaged measurements below this are a misconfigured probing height,
/// not a real surface.
const MIN_PLAUSIBLE_STEPS: i32 = 100;

/// The probe with its measurement discipline attached.
pub struct ProbeRig {
    probe: Arc<Mutex<dyn ZProbe>>,
    motion: Arc<Mutex<dyn MotionController>>,
    config: ProbeConfig,
    /// Height to descend to before probing; `None` until the bed has been
    /// measured once.
    probe_from_height: Option<f64>,
    height_to_trigger: f64,
    bed_height: f64,
}

impl ProbeRig {
    pub fn new(
        probe: Arc<Mutex<dyn ZProbe>>,
        motion: Arc<Mutex<dyn MotionController>>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            probe,
            motion,
            config,
            probe_from_height: None,
            height_to_trigger: 0.0,
            bed_height: 0.0,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProbeConfig {
        &mut self.config
    }

    /// Raw probe handle, for adjusting driver parameters.
    pub fn probe(&self) -> &Arc<Mutex<dyn ZProbe>> {
        &self.probe
    }

    pub fn bed_height(&self) -> f64 {
        self.bed_height
    }

    pub fn height_to_trigger(&self) -> f64 {
        self.height_to_trigger
    }

    pub fn probe_from_height(&self) -> Option<f64> {
        self.probe_from_height
    }

    /// Forget the measured bed height, forcing re-measurement before the
    /// next probing pass. Called when trim changes move the homed position.
    pub fn invalidate_bed_height(&mut self) {
        self.probe_from_height = None;
    }

    fn lock_probe(&self) -> Result<MutexGuard<'_, dyn ZProbe + 'static>> {
        self.probe.lock().map_err(|_| Error::MutexPoisoned)
    }

    fn lock_motion(&self) -> Result<MutexGuard<'_, dyn MotionController + 'static>> {
        self.motion.lock().map_err(|_| Error::MutexPoisoned)
    }

    pub fn steps_to_mm(&self, steps: f64) -> Result<f64> {
        Ok(self.lock_probe()?.steps_to_mm(steps))
    }

    pub fn home(&mut self) -> Result<()> {
        self.lock_motion()?.home()
    }

    /// Cooperative yield between measurements in long probing loops.
    pub fn yield_idle(&mut self) -> Result<()> {
        self.lock_motion()?.yield_idle();
        Ok(())
    }

    /// Measure the depth at `(x, y)` in steps, averaged over the configured
    /// smoothing count.
    pub fn probe_at(&mut self, x: f64, y: f64) -> Result<i32> {
        let fast_feedrate = self.lock_probe()?.fast_feedrate();
        self.lock_motion()?.move_to(
            Some(x + self.config.offset_x),
            Some(y + self.config.offset_y),
            None,
            fast_feedrate,
        )?;

        let saved_acceleration = self.lock_motion()?.acceleration();
        self.lock_motion()?.set_acceleration(self.config.acceleration);
        let outcome = self.probe_smoothed();
        self.lock_motion()?.set_acceleration(saved_acceleration);

        let steps = outcome?;
        if steps < MIN_PLAUSIBLE_STEPS {
            return Err(Error::ProbeFailed(format!(
                "averaged {} steps, far too small - is the probing height high enough?",
                steps
            )));
        }
        Ok(steps)
    }

    fn probe_smoothed(&mut self) -> Result<i32> {
        let smoothing = self.config.smoothing.max(1) as i32;
        let mut accumulated: i64 = 0;
        for _ in 0..smoothing {
            let mut probe = self.lock_probe()?;
            let result = probe.run_probe(false)?;
            if probe.decelerate_on_trigger() {
                let decel_steps = probe.steps_at_decel_end();
                probe.return_probe(decel_steps)?;
            } else {
                probe.return_probe(result)?;
            }
            accumulated += result as i64;
        }
        Ok((accumulated / smoothing as i64) as i32)
    }

    /// Run the configured number of settling probes at center and discard
    /// the results.
    pub fn prime<W: Write>(&mut self, report: &mut Reporter<W>) -> Result<()> {
        if self.config.priming == 0 {
            return Ok(());
        }
        let mut scope = report.scope("PR");
        scope.line(&format!("Priming probe {} times.", self.config.priming));
        for _ in 0..self.config.priming {
            self.probe_at(0.0, 0.0)?;
        }
        Ok(())
    }

    /// Measure the absolute bed height at center and publish it as the new
    /// Z max.
    ///
    /// The first (or a reset) call also determines `probe_from_height`, the
    /// descent that leaves the probe its configured clearance above the
    /// trigger point.
    pub fn find_bed_center_height<W: Write>(
        &mut self,
        report: &mut Reporter<W>,
        reset: bool,
    ) -> Result<()> {
        let mut report = report.scope("BH");

        self.lock_motion()?.home()?;

        if reset {
            self.probe_from_height = None;
        }

        if self.probe_from_height.is_none() {
            report.line("Determining the probe-from height.");
            let steps = self.lock_probe()?.run_probe(true)?;
            let (total, clearance) = {
                let probe = self.lock_probe()?;
                (probe.steps_to_mm(steps as f64), probe.probe_height())
            };
            self.probe_from_height = Some(total - clearance);
            self.lock_motion()?.home()?;
        } else {
            report.line(&format!(
                "Probe-from height = {:.3}",
                self.probe_from_height.unwrap_or_default()
            ));
        }

        let descend = self.probe_from_height.unwrap_or_default();
        let fast_feedrate = self.lock_probe()?.fast_feedrate();
        self.lock_motion()?
            .move_relative(0.0, 0.0, -descend, fast_feedrate)?;

        // This measurement anchors everything else, so settle the probe.
        self.prime(&mut report)?;

        // Two separate moves: a delta's build envelope domes at the top, so
        // combining the XY offset move with the descent risks asking for an
        // unreachable position.
        self.lock_motion()?.move_to(
            Some(self.config.offset_x),
            Some(self.config.offset_y),
            None,
            fast_feedrate,
        )?;

        let saved_acceleration = self.lock_motion()?.acceleration();
        self.lock_motion()?.set_acceleration(self.config.acceleration);
        let outcome = self.lock_probe()?.run_probe(false);
        self.lock_motion()?.set_acceleration(saved_acceleration);
        let steps = outcome?;

        let height_to_trigger = self.lock_probe()?.steps_to_mm(steps as f64);
        self.height_to_trigger = height_to_trigger;
        self.bed_height = descend + self.height_to_trigger + self.config.offset_z;

        {
            let mut motion = self.lock_motion()?;
            motion.set_max_z(self.bed_height);
            motion.wait_for_idle();
        }

        report.line(&format!("Bed height set to {:.3}", self.bed_height));
        Ok(())
    }

    /// Home and descend to the probing height, measuring the bed first if
    /// it has never been measured.
    pub fn prepare_to_probe<W: Write>(&mut self, report: &mut Reporter<W>) -> Result<()> {
        if self.probe_from_height.is_none() {
            self.find_bed_center_height(report, false)?;
        }
        self.lock_motion()?.home()?;
        let descend = self.probe_from_height.unwrap_or_default();
        let fast_feedrate = self.lock_probe()?.fast_feedrate();
        self.lock_motion()?
            .move_relative(0.0, 0.0, -descend, fast_feedrate)
    }

    /// Move to a surface position without probing, at the fast feedrate.
    pub fn travel_to(&mut self, target: Point2D) -> Result<()> {
        let fast_feedrate = self.lock_probe()?.fast_feedrate();
        self.lock_motion()?
            .move_to(Some(target.x), Some(target.y), None, fast_feedrate)
    }
}
