//! Surface transform integration: depth-map persistence and the M667
//! command surface.

mod common;

use trikona_cal::grid::Tower;
use trikona_cal::hardware::simulator::{SimOptions, SimulatedPrinter, SurfaceModel};
use trikona_cal::session::SurfaceOptions;

#[test]
fn test_depth_map_survives_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dm_surface_transform");
    let config = common::config_with_depth_path(path.to_str().unwrap());

    // A perfect machine over a tilted bed: the depth map captures the
    // tilt.
    let printer = SimulatedPrinter::new(SimOptions {
        surface: SurfaceModel::Plane {
            x_slope: 0.0005,
            y_slope: -0.0003,
        },
        ..SimOptions::default()
    });
    let mut session = common::session(&printer, config.clone());

    session.depth_map_to_file(None).unwrap();
    assert!(path.exists());
    assert!(session.surface().depth_enabled());
    assert!(session.surface().active());

    // The correction reproduces the bed tilt at a probed point.
    let adjusted = session.surface().adjust_z(50.0, 0.0);
    assert!(
        (adjusted - 0.025).abs() < 0.01,
        "adjust_z(50, 0) = {}",
        adjusted
    );

    // A fresh session (same machine, same config) loads the saved map via
    // the M667 path and produces the same corrections.
    let mut restored = common::session(&printer, config);
    restored
        .set_surface_transform(SurfaceOptions {
            depth_enable: Some(true),
            master_enable: Some(true),
            ..SurfaceOptions::default()
        })
        .unwrap();
    assert!(restored.surface().depth_enabled());

    let grid = session.grid().clone();
    for tower in Tower::ALL {
        let coord = grid.coord(grid.tower_index(tower));
        let a = session.surface().adjust_z(coord.x, coord.y);
        let b = restored.surface().adjust_z(coord.x, coord.y);
        assert!(
            (a - b).abs() < 1e-4,
            "tower {:?}: {} vs {} after reload",
            tower,
            a,
            b
        );
    }
}

#[test]
fn test_depth_map_rejected_with_probe_offsets() {
    let mut config = common::config();
    config.probe.offset_x = 2.0;

    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, config);

    let result = session.depth_map_to_file(None);
    assert!(result.is_err());
    let text = common::output(&session);
    assert!(
        text.contains("Depth correction doesn't work with X or Y probe offsets."),
        "output:\n{}",
        text
    );
}

#[test]
fn test_shimming_via_m667_and_override_line() {
    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, common::config());

    session
        .set_surface_transform(SurfaceOptions {
            shim_x: Some(0.1),
            shim_y: Some(-0.2),
            shim_z: Some(0.05),
            plane_enable: Some(true),
            ..SurfaceOptions::default()
        })
        .unwrap();

    assert!(session.surface().plane_enabled());
    assert!(session.surface().active());

    // The plane passes through the three anchors.
    let grid = session.grid().clone();
    let shims = [0.1, -0.2, 0.05];
    for (tower, shim) in Tower::ALL.into_iter().zip(shims) {
        let coord = grid.coord(grid.tower_index(tower));
        let z = session.surface().adjust_z(coord.x, coord.y);
        assert!((z - shim).abs() < 1e-9, "tower {:?}: {}", tower, z);
    }

    let mut saved = Vec::new();
    session.write_override(&mut saved).unwrap();
    let line = String::from_utf8(saved).unwrap();
    assert!(
        line.contains("M667 A0.1000 B-0.2000 C0.0500 D1 E0 Z1"),
        "override line:\n{}",
        line
    );
}

#[test]
fn test_master_disable_zeroes_correction() {
    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, common::config());

    session
        .set_surface_transform(SurfaceOptions {
            shim_x: Some(0.5),
            shim_y: Some(0.5),
            shim_z: Some(0.5),
            plane_enable: Some(true),
            ..SurfaceOptions::default()
        })
        .unwrap();
    assert!(session.surface().adjust_z(0.0, 0.0).abs() > 0.1);

    session
        .set_surface_transform(SurfaceOptions {
            master_enable: Some(false),
            ..SurfaceOptions::default()
        })
        .unwrap();
    assert_eq!(session.surface().adjust_z(0.0, 0.0), 0.0);
}

#[test]
fn test_depth_enable_without_file_reports_uninitialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing_map");
    let config = common::config_with_depth_path(path.to_str().unwrap());

    let printer = SimulatedPrinter::new(SimOptions::default());
    let mut session = common::session(&printer, config);

    // Missing file is not an error at the command level; the correction
    // just stays off.
    session
        .set_surface_transform(SurfaceOptions {
            depth_enable: Some(true),
            ..SurfaceOptions::default()
        })
        .unwrap();
    assert!(!session.surface().depth_enabled());
    let text = common::output(&session);
    assert!(
        text.contains("Depth correction not initialized."),
        "output:\n{}",
        text
    );
}
