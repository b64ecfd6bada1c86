//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [probe]
//! radius = 100.0          # probing radius in mm (required)
//! smoothing = 1           # taps averaged per measurement, 1-10
//! priming = 0             # discarded settling taps before probing, 0-20
//! acceleration = 200.0    # acceleration while probing, mm/s^2
//! offset_x = 0.0          # effector -> probe trigger offset
//! offset_y = 0.0
//! offset_z = 0.0
//! fast_feedrate = 100.0   # mm/s
//! slow_feedrate = 5.0     # mm/s
//! height = 5.0            # clearance above the trigger point when probing
//!
//! [grid]
//! dimension = 5           # odd, 3-9; 5 is the well-tested default
//! shape = "circle"        # "circle" or "square"
//!
//! [annealing]
//! tries = 50
//! max_temp = 0.35
//! binsearch_width = 0.1
//! overrun_divisor = 2.0
//!
//! [surface]
//! depth_map_path = "/sd/dm_surface_transform"
//! ```
//!
//! All sections except `[probe]` are optional and default as shown.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Shape of the probed print surface.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceShape {
    /// Round bed: points beyond the probe radius are unreachable and get
    /// extrapolated or propagated instead of probed.
    #[default]
    Circle,
    /// Rectangular bed: every grid point is probed directly.
    Square,
}

/// Z-probe behavior and mounting.
#[derive(Clone, Debug, Deserialize)]
pub struct ProbeConfig {
    /// Probing radius in mm.
    ///
    /// This is how far out from center the probe can safely be triggered,
    /// which is usually smaller than the printable radius.
    /// **Required**: Yes
    pub radius: f64,

    /// Number of probe taps averaged into one measurement.
    ///
    /// **Valid range**: 1-10
    /// **Default**: 1
    #[serde(default = "default_smoothing")]
    pub smoothing: u32,

    /// Number of settling taps run and discarded before real probing.
    ///
    /// Some probes read consistently only after a few triggers.
    /// **Valid range**: 0-20
    /// **Default**: 0
    #[serde(default)]
    pub priming: u32,

    /// Acceleration used while the probe is live, mm/s^2.
    ///
    /// Lower than the print acceleration so the trigger point is not
    /// smeared by frame ringing.
    /// **Default**: 200.0
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,

    /// Effector-to-trigger offset, mm.
    ///
    /// Measured by jogging the nozzle to a mark on the bed and then moving
    /// the probe trigger onto the same mark. Nonzero X/Y offsets preclude
    /// depth correction.
    #[serde(default)]
    pub offset_x: f64,
    #[serde(default)]
    pub offset_y: f64,
    #[serde(default)]
    pub offset_z: f64,

    /// Travel feedrate between probe points, mm/s.
    #[serde(default = "default_fast_feedrate")]
    pub fast_feedrate: f64,

    /// Feedrate of the final measuring descent, mm/s.
    #[serde(default = "default_slow_feedrate")]
    pub slow_feedrate: f64,

    /// Clearance kept above the trigger point while hopping between
    /// probe points, mm.
    #[serde(default = "default_probe_height")]
    pub height: f64,
}

fn default_smoothing() -> u32 {
    1
}
fn default_acceleration() -> f64 {
    200.0
}
fn default_fast_feedrate() -> f64 {
    100.0
}
fn default_slow_feedrate() -> f64 {
    5.0
}
fn default_probe_height() -> f64 {
    5.0
}

/// Probe grid geometry.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct GridConfig {
    /// Points per grid side. Must be odd so the center lands on a point.
    ///
    /// **Valid range**: 3-9, odd
    /// **Default**: 5
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Print surface shape.
    #[serde(default)]
    pub shape: SurfaceShape,
}

fn default_dimension() -> usize {
    5
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            shape: SurfaceShape::default(),
        }
    }
}

/// Default parameters for heuristic (annealing) calibration.
///
/// All of these can be overridden per run; these are the values used when
/// the caller does not specify them.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct AnnealingConfig {
    /// Annealing iterations. More iterations want a lower max temperature.
    #[serde(default = "default_tries")]
    pub tries: u32,

    /// Starting temperature of the cooling schedule.
    #[serde(default = "default_max_temp")]
    pub max_temp: f64,

    /// Fraction of the losing half-range discarded per binary search round.
    #[serde(default = "default_binsearch_width")]
    pub binsearch_width: f64,

    /// Divisor applied to a random step that would overshoot the optimum.
    #[serde(default = "default_overrun_divisor")]
    pub overrun_divisor: f64,
}

fn default_tries() -> u32 {
    50
}
fn default_max_temp() -> f64 {
    0.35
}
fn default_binsearch_width() -> f64 {
    0.1
}
fn default_overrun_divisor() -> f64 {
    2.0
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            tries: default_tries(),
            max_temp: default_max_temp(),
            binsearch_width: default_binsearch_width(),
            overrun_divisor: default_overrun_divisor(),
        }
    }
}

/// Surface transform persistence.
#[derive(Clone, Debug, Deserialize)]
pub struct SurfaceConfig {
    /// Where the depth map is saved and loaded.
    #[serde(default = "default_depth_map_path")]
    pub depth_map_path: String,
}

fn default_depth_map_path() -> String {
    "/sd/dm_surface_transform".to_string()
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            depth_map_path: default_depth_map_path(),
        }
    }
}

/// Root configuration
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub probe: ProbeConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub annealing: AnnealingConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
}

const MAX_SMOOTHING: u32 = 10;
const MAX_PRIMING: u32 = 20;

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Validation
    ///
    /// - `probe.radius` must be positive
    /// - `probe.smoothing` must be 1-10, `probe.priming` 0-20
    /// - feedrates must be positive
    /// - `grid.dimension` must be odd and between 3 and 9
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges. Called by [`Config::load`]; exposed for configs
    /// built in code.
    pub fn validate(&self) -> Result<()> {
        if self.probe.radius <= 0.0 {
            return Err(Error::Config("probe.radius must be positive".to_string()));
        }
        if !(1..=MAX_SMOOTHING).contains(&self.probe.smoothing) {
            return Err(Error::Config(format!(
                "probe.smoothing must be between 1 and {} (got {})",
                MAX_SMOOTHING, self.probe.smoothing
            )));
        }
        if self.probe.priming > MAX_PRIMING {
            return Err(Error::Config(format!(
                "probe.priming must be at most {} (got {})",
                MAX_PRIMING, self.probe.priming
            )));
        }
        if self.probe.fast_feedrate <= 0.0 || self.probe.slow_feedrate <= 0.0 {
            return Err(Error::Config("probe feedrates must be positive".to_string()));
        }
        if self.probe.acceleration <= 0.0 {
            return Err(Error::Config(
                "probe.acceleration must be positive".to_string(),
            ));
        }
        if self.probe.height <= 0.0 {
            return Err(Error::Config("probe.height must be positive".to_string()));
        }
        if self.grid.dimension % 2 == 0 || !(3..=9).contains(&self.grid.dimension) {
            return Err(Error::Config(format!(
                "grid.dimension must be odd and between 3 and 9 (got {})",
                self.grid.dimension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            probe: ProbeConfig {
                radius: 100.0,
                smoothing: default_smoothing(),
                priming: 0,
                acceleration: default_acceleration(),
                offset_x: 0.0,
                offset_y: 0.0,
                offset_z: 0.0,
                fast_feedrate: default_fast_feedrate(),
                slow_feedrate: default_slow_feedrate(),
                height: default_probe_height(),
            },
            grid: GridConfig::default(),
            annealing: AnnealingConfig::default(),
            surface: SurfaceConfig::default(),
        }
    }

    #[test]
    fn test_parse_minimal() {
        let config: Config = basic_toml::from_str("[probe]\nradius = 85.0\n").unwrap();
        assert_eq!(config.probe.radius, 85.0);
        assert_eq!(config.probe.smoothing, 1);
        assert_eq!(config.grid.dimension, 5);
        assert_eq!(config.grid.shape, SurfaceShape::Circle);
        assert_eq!(config.annealing.tries, 50);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
            [probe]
            radius = 120.0
            smoothing = 3
            priming = 2
            acceleration = 150.0
            offset_x = 1.5
            offset_y = -2.0
            offset_z = 0.25

            [grid]
            dimension = 7
            shape = "square"

            [annealing]
            tries = 200
            max_temp = 0.5
        "#;
        let config: Config = basic_toml::from_str(toml).unwrap();
        assert_eq!(config.probe.smoothing, 3);
        assert_eq!(config.grid.dimension, 7);
        assert_eq!(config.grid.shape, SurfaceShape::Square);
        assert_eq!(config.annealing.tries, 200);
        assert_eq!(config.annealing.overrun_divisor, 2.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_even_grid_dimension_rejected() {
        let mut config = base_config();
        config.grid.dimension = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_smoothing_rejected() {
        let mut config = base_config();
        config.probe.smoothing = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_radius_rejected() {
        let mut config = base_config();
        config.probe.radius = -1.0;
        assert!(config.validate().is_err());
    }
}
