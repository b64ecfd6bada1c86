//! Probe repeatability characterization.
//!
//! Probes the same spot repeatedly and reports mean, standard deviation,
//! and range. The range converted to millimeters is the "repeatability"
//! figure: the slop a single measurement can carry. The eccentricity
//! option swings the effector toward each tower between samples to shake
//! out mechanical looseness that a stationary test would never see.
//!
//! The best configuration seen so far (lowest sigma) is tracked across
//! invocations so parameter sweeps can be compared at the end.

use std::io::Write;

use crate::core::statistics;
use crate::error::{Error, Result};
use crate::grid::{tower_target, Tower};
use crate::probe::ProbeRig;
use crate::report::Reporter;

/// Default sample count.
const DEFAULT_SAMPLES: u32 = 10;

/// Sample cap; beyond this the test takes longer than it is worth.
const MAX_SAMPLES: u32 = 30;

/// Samples this large mean the probe missed the bed entirely.
const DISCARD_THRESHOLD_STEPS: i32 = 50_000;

/// Radius of the eccentricity excursions, mm.
const ECCENTRICITY_RADIUS: f64 = 10.0;

/// Overrides for one repeatability run. `None` keeps the current setting.
#[derive(Clone, Copy, Debug, Default)]
pub struct RepeatabilityOptions {
    pub acceleration: Option<f64>,
    pub debounce: Option<u32>,
    pub decelerate: Option<bool>,
    pub eccentricity: bool,
    pub smoothing: Option<u32>,
    pub priming: Option<u32>,
    pub fast_feedrate: Option<f64>,
    pub slow_feedrate: Option<f64>,
    pub samples: Option<u32>,
}

/// Result of one repeatability run.
#[derive(Clone, Copy, Debug)]
pub struct RepeatabilityReport {
    pub samples: u32,
    pub mean_steps: f64,
    pub sigma_steps: f64,
    pub range_steps: f64,
    /// Range in millimeters; the headline number.
    pub repeatability_mm: f64,
    /// Whether this run beat every earlier one.
    pub best_so_far: bool,
}

/// The lowest-sigma configuration observed so far.
#[derive(Clone, Copy, Debug)]
pub struct BestProbeCalibration {
    pub sigma: f64,
    pub range: f64,
    pub acceleration: f64,
    pub debounce: u32,
    pub decelerate: bool,
    pub eccentricity: bool,
    pub smoothing: u32,
    pub priming: u32,
    pub fast_feedrate: f64,
    pub slow_feedrate: f64,
}

/// Run the repeatability test.
pub fn measure_repeatability<W: Write>(
    rig: &mut ProbeRig,
    report: &mut Reporter<W>,
    opts: RepeatabilityOptions,
    best: &mut Option<BestProbeCalibration>,
) -> Result<RepeatabilityReport> {
    let mut report = report.scope("PR");

    let samples = opts.samples.unwrap_or(DEFAULT_SAMPLES);
    if samples == 0 || samples > MAX_SAMPLES {
        report.line("Too many samples!");
        return Err(Error::ConfigInvalid(format!(
            "sample count must be 1-{} (got {})",
            MAX_SAMPLES, samples
        )));
    }

    // Apply overrides.
    if let Some(acceleration) = opts.acceleration {
        if (1.0..=1000.0).contains(&acceleration) {
            rig.config_mut().acceleration = acceleration;
        }
    }
    {
        let mut probe = rig.probe().lock().map_err(|_| Error::MutexPoisoned)?;
        if let Some(debounce) = opts.debounce {
            probe.set_debounce_count(debounce.min(2000));
        }
        if let Some(decelerate) = opts.decelerate {
            probe.set_decelerate_on_trigger(decelerate);
        }
        if let Some(fast) = opts.fast_feedrate {
            probe.set_fast_feedrate(fast);
        }
        if let Some(slow) = opts.slow_feedrate {
            probe.set_slow_feedrate(slow);
        }
    }
    if let Some(smoothing) = opts.smoothing {
        rig.config_mut().smoothing = smoothing.clamp(1, 10);
    }
    if let Some(priming) = opts.priming {
        rig.config_mut().priming = priming.min(20);
    }

    // Echo the configuration under test.
    let (debounce, decelerate, fast, slow, one_step) = {
        let probe = rig.probe().lock().map_err(|_| Error::MutexPoisoned)?;
        (
            probe.debounce_count(),
            probe.decelerate_on_trigger(),
            probe.fast_feedrate(),
            probe.slow_feedrate(),
            probe.steps_to_mm(1.0),
        )
    };
    report.line(&format!("   Repeatability test: {} samples (S)", samples));
    report.line(&format!("     Acceleration (A): {:.1}", rig.config().acceleration));
    report.line(&format!("   Debounce count (B): {}", debounce));
    report.line(&format!(" Smooth decel (D0|D1): {}", decelerate));
    report.line(&format!("Eccentricity test (E): {}", on_off(opts.eccentricity)));
    report.line(&format!("  Probe smoothing (P): {}", rig.config().smoothing));
    report.line(&format!("    Probe priming (Q): {}", rig.config().priming));
    report.line(&format!(
        "            Feedrates: Fast (U) = {:.3}, Slow (V) = {:.3}",
        fast, slow
    ));
    report.line(&format!("1 step = {:.5} mm.", one_step));

    rig.prepare_to_probe(&mut report)?;
    rig.prime(&mut report)?;

    let mut recorded: Vec<f64> = Vec::with_capacity(samples as usize);
    let mut discarded = 0u32;

    while recorded.len() < samples as usize {
        if opts.eccentricity {
            // Swing toward each tower and back to shake out slop.
            for tower in Tower::ALL {
                rig.travel_to(tower_target(ECCENTRICITY_RADIUS, tower))?;
                rig.travel_to(crate::core::Point2D::ORIGIN)?;
            }
        }

        let steps = rig.probe_at(0.0, 0.0)?;
        let mm = rig.steps_to_mm(steps as f64)?;
        report.line(&format!(
            "Test {:2} of {:2}: Measured {} steps ({:.3} mm)",
            recorded.len() + 1,
            samples,
            steps,
            mm
        ));

        if steps > DISCARD_THRESHOLD_STEPS {
            report.line("Discarding result and trying again. Check probe height.");
            discarded += 1;
            if discarded > MAX_SAMPLES {
                return Err(Error::ProbeFailed(
                    "too many discarded samples".to_string(),
                ));
            }
            continue;
        }
        recorded.push(steps as f64);
    }

    let stats = statistics(&recorded);
    let repeatability_mm = rig.steps_to_mm(stats.range())?;

    report.line("Stats:");
    report.line(&format!(
        "  range: {} steps ({:.4} mm)",
        stats.range() as i64,
        repeatability_mm
    ));
    report.line(&format!(
        "     mu: {:.3} steps ({:.3} mm)",
        stats.mean,
        rig.steps_to_mm(stats.mean)?
    ));
    report.line(&format!(
        "  sigma: {:.3} steps ({:.3} mm)",
        stats.sigma,
        rig.steps_to_mm(stats.sigma)?
    ));
    report.line(&format!(
        "Repeatability: {:.4} (add a little to be sure)",
        repeatability_mm
    ));

    let best_so_far = match best {
        Some(b) => stats.sigma < b.sigma,
        None => true,
    };
    if best_so_far {
        report.line("This is your best score so far!");
        *best = Some(BestProbeCalibration {
            sigma: stats.sigma,
            range: stats.range(),
            acceleration: rig.config().acceleration,
            debounce,
            decelerate,
            eccentricity: opts.eccentricity,
            smoothing: rig.config().smoothing,
            priming: rig.config().priming,
            fast_feedrate: fast,
            slow_feedrate: slow,
        });
    } else if let Some(b) = best {
        report.line(&format!(
            "Best score so far: [sigma={:.3}, range={}] => accel={}, debounce={}, decelerate={}, eccentricity={}, smoothing={}, priming={}, fastFR={:.3}, slowFR={:.3}",
            b.sigma,
            b.range as i64,
            b.acceleration,
            b.debounce,
            b.decelerate,
            on_off(b.eccentricity),
            b.smoothing,
            b.priming,
            b.fast_feedrate,
            b.slow_feedrate
        ));
    }

    let verdict = if repeatability_mm < 0.015 {
        "very good!"
    } else if repeatability_mm <= 0.03 {
        "average."
    } else if repeatability_mm <= 0.04 {
        "borderline."
    } else {
        "HORRIBLE."
    };
    report.line(&format!("This score is {}", verdict));
    report.blank();

    Ok(RepeatabilityReport {
        samples,
        mean_steps: stats.mean,
        sigma_steps: stats.sigma,
        range_steps: stats.range(),
        repeatability_mm,
        best_so_far,
    })
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hardware::simulator::{SimOptions, SimulatedPrinter};

    fn rig_with_noise(noise: f64, seed: u64) -> ProbeRig {
        let printer = SimulatedPrinter::new(SimOptions {
            probe_noise_mm: noise,
            seed,
            ..SimOptions::default()
        });
        let config: Config = basic_toml::from_str("[probe]\nradius = 100.0\n").unwrap();
        ProbeRig::new(printer.probe_handle(), printer.motion_handle(), config.probe)
    }

    #[test]
    fn test_noiseless_probe_scores_perfectly() {
        let mut rig = rig_with_noise(0.0, 0);
        let mut report = Reporter::new(Vec::new());
        let mut best = None;

        let result = measure_repeatability(
            &mut rig,
            &mut report,
            RepeatabilityOptions::default(),
            &mut best,
        )
        .unwrap();

        assert_eq!(result.samples, 10);
        assert!(result.sigma_steps < 1.0);
        assert!(result.repeatability_mm < 0.01);
        assert!(result.best_so_far);
        assert!(best.is_some());
    }

    #[test]
    fn test_noisy_probe_scores_worse() {
        let mut quiet_rig = rig_with_noise(0.0, 1);
        let mut noisy_rig = rig_with_noise(0.08, 2);
        let mut report = Reporter::new(Vec::new());
        let mut best = None;

        let quiet = measure_repeatability(
            &mut quiet_rig,
            &mut report,
            RepeatabilityOptions::default(),
            &mut best,
        )
        .unwrap();
        let noisy = measure_repeatability(
            &mut noisy_rig,
            &mut report,
            RepeatabilityOptions::default(),
            &mut best,
        )
        .unwrap();

        assert!(noisy.sigma_steps > quiet.sigma_steps);
        // The quieter earlier run keeps the best slot.
        assert!(!noisy.best_so_far);
        assert!(best.unwrap().sigma == quiet.sigma_steps);
    }

    #[test]
    fn test_sample_cap_enforced() {
        let mut rig = rig_with_noise(0.0, 0);
        let mut report = Reporter::new(Vec::new());
        let mut best = None;
        let opts = RepeatabilityOptions {
            samples: Some(31),
            ..RepeatabilityOptions::default()
        };
        assert!(matches!(
            measure_repeatability(&mut rig, &mut report, opts, &mut best),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_eccentricity_moves_do_not_break_measurement() {
        let mut rig = rig_with_noise(0.0, 0);
        let mut report = Reporter::new(Vec::new());
        let mut best = None;
        let opts = RepeatabilityOptions {
            eccentricity: true,
            samples: Some(5),
            ..RepeatabilityOptions::default()
        };
        let result = measure_repeatability(&mut rig, &mut report, opts, &mut best).unwrap();
        assert_eq!(result.samples, 5);
        assert!(result.repeatability_mm < 0.01);
    }

    #[test]
    fn test_overrides_applied() {
        let mut rig = rig_with_noise(0.0, 0);
        let mut report = Reporter::new(Vec::new());
        let mut best = None;
        let opts = RepeatabilityOptions {
            smoothing: Some(4),
            priming: Some(2),
            debounce: Some(5000),
            samples: Some(3),
            ..RepeatabilityOptions::default()
        };
        measure_repeatability(&mut rig, &mut report, opts, &mut best).unwrap();
        assert_eq!(rig.config().smoothing, 4);
        assert_eq!(rig.config().priming, 2);
        // Debounce capped at its hardware maximum.
        assert_eq!(rig.probe().lock().unwrap().debounce_count(), 2000);
    }
}
