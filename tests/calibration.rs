//! End-to-end calibration tests against the simulated printer.
//!
//! These drive the same command surface a host dispatcher would, with the
//! simulator standing in for the machine: believed and true geometry
//! disagree, and the calibrators have to close the gap using nothing but
//! probe measurements.

mod common;

use trikona_cal::calibrate::RepeatabilityOptions;
use trikona_cal::hardware::delta::DeltaGeometry;
use trikona_cal::hardware::simulator::{SimOptions, SimulatedPrinter};
use trikona_cal::mapping::depth_energy;
use trikona_cal::session::HeuristicOptions;

#[test]
fn test_iterative_calibration_converges_on_physical_printer() {
    // Endstops off by up to a quarter millimeter, believed radius 0.8 mm
    // small.
    let printer = SimulatedPrinter::new(SimOptions {
        true_trim: [-0.25, 0.05, -0.1],
        believed: DeltaGeometry {
            delta_radius: 129.2,
            ..DeltaGeometry::default()
        },
        truth: DeltaGeometry::default(),
        ..SimOptions::default()
    });
    let mut session = common::session(&printer, common::config());

    let converged = session.iterative_calibration(false).unwrap();
    assert!(converged, "output:\n{}", common::output(&session));
    assert!(!session.geometry_dirty());

    // The re-probed surface is now flat to within the iterative target
    // plus probe quantization.
    let samples = session.display_surface().unwrap();
    let energy = depth_energy(session.grid(), &samples);
    assert!(energy < 0.03, "post-calibration energy {}", energy);

    // Trim normalization invariant holds on the machine itself.
    let settings = session.kinematics().unwrap();
    let max = settings.trim.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert!(max.abs() < 1e-9, "trim {:?}", settings.trim);
}

#[test]
fn test_simulated_annealing_recovers_perturbed_kinematics() {
    // Flat simulated surface, canonical perturbation (trim and tower
    // radius offsets), endstop + delta radius annealing. The annealer has
    // to reproduce the perturbed configuration well enough to flatten the
    // simulated surface.
    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, common::config());

    let outcome = session
        .heuristic_calibration(HeuristicOptions {
            endstop: Some(1.0),
            delta_radius: Some(1.0),
            simulate_only: true,
            tries: Some(200),
            seed: Some(1234),
            ..HeuristicOptions::default()
        })
        .unwrap();

    assert!(
        outcome.energy <= 0.010,
        "energy {} after {} tries (stalled: {})\noutput:\n{}",
        outcome.energy,
        outcome.tries_used,
        outcome.stalled,
        common::output(&session)
    );
    assert!(outcome.tries_used <= 200);

    let settings = session.kinematics().unwrap();
    let max = settings.trim.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert!(max.abs() < 1e-9, "trim {:?}", settings.trim);
}

#[test]
fn test_heuristic_calibration_flattens_physical_printer() {
    // Radius and endstop errors, including per-tower radius offsets the
    // iterative pass cannot express.
    let printer = SimulatedPrinter::new(SimOptions {
        true_trim: [-0.15, -0.05, 0.0],
        believed: DeltaGeometry::default(),
        truth: DeltaGeometry {
            delta_radius: 130.5,
            radius_offset: [0.1, -0.1, 0.0],
            ..DeltaGeometry::default()
        },
        ..SimOptions::default()
    });
    let mut session = common::session(&printer, common::config());

    session.iterative_calibration(false).unwrap();
    let samples = session.display_surface().unwrap();
    let before = depth_energy(session.grid(), &samples);

    session
        .heuristic_calibration(HeuristicOptions {
            endstop: Some(1.0),
            delta_radius: Some(1.0),
            tries: Some(150),
            seed: Some(7),
            ..HeuristicOptions::default()
        })
        .unwrap();

    let samples = session.display_surface().unwrap();
    let after = depth_energy(session.grid(), &samples);
    // Annealing works from one frozen probing pass, so a couple of
    // microns of quantization slack is expected.
    assert!(
        after <= before + 0.005,
        "energy went from {} to {}",
        before,
        after
    );
    assert!(after < 0.03, "residual energy {}", after);
}

#[test]
fn test_heuristic_defaults_to_endstops_and_radius() {
    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, common::config());

    session
        .heuristic_calibration(HeuristicOptions {
            simulate_only: true,
            tries: Some(20),
            seed: Some(5),
            ..HeuristicOptions::default()
        })
        .unwrap();

    let text = common::output(&session);
    assert!(
        text.contains("No calibration types selected - activating endstops & delta radius."),
        "output:\n{}",
        text
    );
    assert!(text.contains("Endstops (O)"));
    assert!(text.contains("Delta Radius (P)"));
}

#[test]
fn test_repeatability_through_session() {
    let printer = SimulatedPrinter::new(SimOptions {
        probe_noise_mm: 0.003,
        seed: 11,
        ..SimOptions::default()
    });
    let mut session = common::session(&printer, common::config());

    let result = session
        .probe_repeatability(RepeatabilityOptions {
            samples: Some(10),
            ..RepeatabilityOptions::default()
        })
        .unwrap();

    assert_eq!(result.samples, 10);
    assert!(result.repeatability_mm < 0.01, "{:?}", result);
    assert!(result.best_so_far);

    let text = common::output(&session);
    assert!(text.contains("Repeatability:"), "output:\n{}", text);
    assert!(text.contains("This is your best score so far!"));
}

#[test]
fn test_require_clean_geometry_recalibrates() {
    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, common::config());

    assert!(session.geometry_dirty());
    session.require_clean_geometry().unwrap();
    assert!(!session.geometry_dirty());

    // A clean session does nothing.
    let before = common::output(&session).len();
    session.require_clean_geometry().unwrap();
    assert_eq!(common::output(&session).len(), before);

    // An external M665 makes the next check recalibrate again.
    session.note_geometry_changed();
    assert!(session.geometry_dirty());
    session.require_clean_geometry().unwrap();
    assert!(!session.geometry_dirty());
}
