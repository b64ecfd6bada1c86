//! Foundation types: points, vectors, and statistics.

pub mod point;
pub mod stats;

pub use point::{Point2D, Point3D, Vector3};
pub use stats::{clamp, statistics, Statistics};
