//! Analytic projection-surface descriptions.
//!
//! When no measured calibration is available, the surface can be described
//! as a cylinder, a dome section, or a flat screen. The model is sampled on a
//! regular UV grid to produce the same direction/UV correspondences a
//! measured calibration provides.

use std::f32::consts::PI;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::calibration::Correspondence;

/// Upper bound on the UV grid along either axis.
pub const MAX_SAMPLES_PER_AXIS: u32 = 4096;

fn default_height() -> f32 {
    1.0
}

fn default_azimuth_start() -> f32 {
    -180.0
}

fn default_azimuth_end() -> f32 {
    180.0
}

fn default_elevation_top() -> f32 {
    60.0
}

fn default_elevation_bottom() -> f32 {
    -30.0
}

fn default_samples() -> [u32; 2] {
    [73, 19]
}

/// Shape of the physical display surface, in world units.
///
/// UV `(0, 0)` is the top-left of the display image; `u` runs along the
/// azimuth (or the screen's horizontal axis) and `v` runs downward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DisplaySurfaceModel {
    /// Vertical cylinder around the world Z axis.
    Cylinder {
        radius: f32,
        #[serde(default = "default_height")]
        height: f32,
        #[serde(default)]
        center_z: f32,
        /// Degrees at u = 0.
        #[serde(default = "default_azimuth_start")]
        azimuth_start: f32,
        /// Degrees at u = 1.
        #[serde(default = "default_azimuth_end")]
        azimuth_end: f32,
        #[serde(default)]
        observer: [f32; 3],
        #[serde(default = "default_samples")]
        samples: [u32; 2],
    },
    /// Section of a sphere centred on the world origin.
    Sphere {
        radius: f32,
        #[serde(default = "default_azimuth_start")]
        azimuth_start: f32,
        #[serde(default = "default_azimuth_end")]
        azimuth_end: f32,
        /// Degrees at v = 0.
        #[serde(default = "default_elevation_top")]
        elevation_top: f32,
        /// Degrees at v = 1.
        #[serde(default = "default_elevation_bottom")]
        elevation_bottom: f32,
        #[serde(default)]
        observer: [f32; 3],
        #[serde(default = "default_samples")]
        samples: [u32; 2],
    },
    /// Flat screen: `center + (u - 0.5) * u_axis + (v - 0.5) * v_axis`.
    Planar {
        center: [f32; 3],
        u_axis: [f32; 3],
        v_axis: [f32; 3],
        #[serde(default)]
        observer: [f32; 3],
        #[serde(default = "default_samples")]
        samples: [u32; 2],
    },
}

impl DisplaySurfaceModel {
    pub fn validate(&self) -> Result<(), String> {
        let samples = match self {
            DisplaySurfaceModel::Cylinder {
                radius, height, samples, ..
            } => {
                if !(*radius > 0.0 && *height > 0.0) {
                    return Err("cylinder radius and height must be positive".to_string());
                }
                samples
            }
            DisplaySurfaceModel::Sphere { radius, samples, .. } => {
                if !(*radius > 0.0) {
                    return Err("sphere radius must be positive".to_string());
                }
                samples
            }
            DisplaySurfaceModel::Planar {
                u_axis, v_axis, samples, ..
            } => {
                let normal = Vec3::from(*u_axis).cross(Vec3::from(*v_axis));
                if normal.length_squared() <= f32::EPSILON {
                    return Err("planar axes must span a plane".to_string());
                }
                samples
            }
        };
        if samples[0] < 2 || samples[1] < 2 {
            return Err(format!("need at least 2x2 samples, got {:?}", samples));
        }
        if samples[0] > MAX_SAMPLES_PER_AXIS || samples[1] > MAX_SAMPLES_PER_AXIS {
            return Err(format!(
                "at most {} samples per axis, got {:?}",
                MAX_SAMPLES_PER_AXIS, samples
            ));
        }
        Ok(())
    }

    fn observer(&self) -> Vec3 {
        match self {
            DisplaySurfaceModel::Cylinder { observer, .. }
            | DisplaySurfaceModel::Sphere { observer, .. }
            | DisplaySurfaceModel::Planar { observer, .. } => Vec3::from(*observer),
        }
    }

    fn samples(&self) -> [u32; 2] {
        match self {
            DisplaySurfaceModel::Cylinder { samples, .. }
            | DisplaySurfaceModel::Sphere { samples, .. }
            | DisplaySurfaceModel::Planar { samples, .. } => *samples,
        }
    }

    /// World-space point of the surface shown at display `uv`.
    pub fn surface_point(&self, uv: [f32; 2]) -> Vec3 {
        let [u, v] = uv;
        match self {
            DisplaySurfaceModel::Cylinder {
                radius,
                height,
                center_z,
                azimuth_start,
                azimuth_end,
                ..
            } => {
                let azimuth = lerp(*azimuth_start, *azimuth_end, u) * PI / 180.0;
                let z = center_z + height * (0.5 - v);
                Vec3::new(radius * azimuth.cos(), radius * azimuth.sin(), z)
            }
            DisplaySurfaceModel::Sphere {
                radius,
                azimuth_start,
                azimuth_end,
                elevation_top,
                elevation_bottom,
                ..
            } => {
                let azimuth = lerp(*azimuth_start, *azimuth_end, u) * PI / 180.0;
                let elevation = lerp(*elevation_top, *elevation_bottom, v) * PI / 180.0;
                *radius
                    * Vec3::new(
                        elevation.cos() * azimuth.cos(),
                        elevation.cos() * azimuth.sin(),
                        elevation.sin(),
                    )
            }
            DisplaySurfaceModel::Planar {
                center,
                u_axis,
                v_axis,
                ..
            } => {
                Vec3::from(*center)
                    + (u - 0.5) * Vec3::from(*u_axis)
                    + (v - 0.5) * Vec3::from(*v_axis)
            }
        }
    }

    /// Sample the surface on its UV grid. Points that coincide with the
    /// observer are skipped.
    pub fn correspondences(&self) -> Vec<Correspondence> {
        let [nu, nv] = self.samples();
        let observer = self.observer();
        let mut out = Vec::with_capacity(nu as usize * nv as usize);
        for j in 0..nv {
            for i in 0..nu {
                let uv = [i as f32 / (nu - 1) as f32, j as f32 / (nv - 1) as f32];
                let ray = self.surface_point(uv) - observer;
                if ray.length_squared() > f32::EPSILON {
                    out.push(Correspondence {
                        direction: ray.normalize(),
                        uv,
                    });
                }
            }
        }
        out
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cylinder_from_axis_observer_is_horizontal_at_mid_height() {
        let model: DisplaySurfaceModel = serde_json::from_str(
            r#"{"model": "cylinder", "radius": 1.0, "height": 2.0, "samples": [5, 3]}"#,
        )
        .unwrap();
        model.validate().unwrap();
        let corr = model.correspondences();
        assert_eq!(corr.len(), 15);

        // Middle row, u = 0.5 -> azimuth 0 -> +X.
        let mid = corr.iter().find(|c| c.uv == [0.5, 0.5]).unwrap();
        assert!((mid.direction - Vec3::X).length() < 1e-5);

        // Top row points upward.
        assert!(corr.iter().filter(|c| c.uv[1] == 0.0).all(|c| c.direction.z > 0.0));
    }

    #[test]
    fn test_planar_center_and_validation() {
        let model = DisplaySurfaceModel::Planar {
            center: [2.0, 0.0, 0.0],
            u_axis: [0.0, -1.0, 0.0],
            v_axis: [0.0, 0.0, -1.0],
            observer: [0.0, 0.0, 0.0],
            samples: [3, 3],
        };
        assert_eq!(model.surface_point([0.5, 0.5]), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(model.surface_point([0.0, 0.0]), Vec3::new(2.0, 0.5, 0.5));

        let degenerate = DisplaySurfaceModel::Planar {
            center: [1.0, 0.0, 0.0],
            u_axis: [0.0, 1.0, 0.0],
            v_axis: [0.0, 2.0, 0.0],
            observer: [0.0; 3],
            samples: [3, 3],
        };
        assert!(degenerate.validate().is_err());
    }

    #[test]
    fn test_oversized_sample_grid_is_rejected() {
        let planar = |samples| DisplaySurfaceModel::Planar {
            center: [2.0, 0.0, 0.0],
            u_axis: [0.0, -1.0, 0.0],
            v_axis: [0.0, 0.0, -1.0],
            observer: [0.0; 3],
            samples,
        };
        assert!(planar([70_000, 70_000]).validate().is_err());
        assert!(planar([MAX_SAMPLES_PER_AXIS + 1, 2]).validate().is_err());
        assert!(planar([2, MAX_SAMPLES_PER_AXIS + 1]).validate().is_err());
        assert!(planar([MAX_SAMPLES_PER_AXIS, 2]).validate().is_ok());
    }

    #[test]
    fn test_sphere_elevation_runs_top_to_bottom() {
        let model = DisplaySurfaceModel::Sphere {
            radius: 2.0,
            azimuth_start: -90.0,
            azimuth_end: 90.0,
            elevation_top: 45.0,
            elevation_bottom: -45.0,
            observer: [0.0; 3],
            samples: [3, 3],
        };
        let top = model.surface_point([0.5, 0.0]);
        let bottom = model.surface_point([0.5, 1.0]);
        assert!(top.z > 0.0 && bottom.z < 0.0);
        assert!((top.length() - 2.0).abs() < 1e-5);
    }
}
