//! Trackball camera for the virtual-world preview.
//!
//! Only the extrinsic state (rotation, look-at centre, distance) matters to
//! the rest of the server; it is exported and imported verbatim for session
//! persistence.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{DisplayError, Result};

/// Exportable manipulator state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManipulatorState {
    /// Quaternion `[x, y, z, w]`.
    pub rotation: [f32; 4],
    pub center: [f32; 3],
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackballManipulator {
    rotation: Quat,
    center: Vec3,
    distance: f32,
}

impl Default for TrackballManipulator {
    /// Looking at the origin from the -Y side, slightly above, with +Z up.
    fn default() -> Self {
        let rotation = Quat::from_rotation_x(std::f32::consts::FRAC_PI_2 - 0.3);
        Self {
            rotation,
            center: Vec3::ZERO,
            distance: 5.0,
        }
    }
}

impl TrackballManipulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export_state(&self) -> ManipulatorState {
        ManipulatorState {
            rotation: self.rotation.to_array(),
            center: self.center.to_array(),
            distance: self.distance,
        }
    }

    /// Adopt `state` exactly. Rejects non-finite values, a non-positive
    /// distance, and rotations that are not unit quaternions.
    pub fn import_state(&mut self, state: &ManipulatorState) -> Result<()> {
        let rotation = Quat::from_array(state.rotation);
        let center = Vec3::from(state.center);
        if !rotation.is_finite() || !center.is_finite() || !state.distance.is_finite() {
            return Err(DisplayError::Configuration(
                "manipulator state has non-finite values".to_string(),
            ));
        }
        if state.distance <= 0.0 {
            return Err(DisplayError::Configuration(format!(
                "manipulator distance must be positive, got {}",
                state.distance
            )));
        }
        if (rotation.length() - 1.0).abs() > 1e-3 {
            return Err(DisplayError::Configuration(format!(
                "manipulator rotation {:?} is not a unit quaternion",
                state.rotation
            )));
        }
        self.rotation = rotation;
        self.center = center;
        self.distance = state.distance;
        Ok(())
    }

    /// Camera position.
    pub fn eye(&self) -> Vec3 {
        self.center + self.rotation * Vec3::Z * self.distance
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Rotate about the world Z axis and the camera's right axis (radians).
    pub fn orbit(&mut self, yaw: f32, pitch: f32) {
        let right = self.rotation * Vec3::X;
        let turn = Quat::from_axis_angle(Vec3::Z, yaw) * Quat::from_axis_angle(right, pitch);
        self.rotation = (turn * self.rotation).normalize();
    }

    pub fn zoom(&mut self, factor: f32) {
        if factor.is_finite() && factor > 0.0 {
            self.distance = (self.distance * factor).max(1e-3);
        }
    }

    /// World-space ray direction through normalised device coordinates
    /// (`-1..1`, y up) for a vertical field of view in radians.
    pub fn view_ray(&self, ndc_x: f32, ndc_y: f32, fov_y: f32, aspect: f32) -> Vec3 {
        let tan = (fov_y * 0.5).tan();
        let local = Vec3::new(ndc_x * tan * aspect, ndc_y * tan, -1.0);
        (self.rotation * local).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_import_round_trip() {
        let mut original = TrackballManipulator::new();
        original.orbit(0.7, -0.2);
        original.zoom(1.5);
        let state = original.export_state();

        let mut restored = TrackballManipulator::new();
        restored.import_state(&state).unwrap();
        assert_eq!(restored.export_state(), state);
        assert_eq!(restored, original);
    }

    #[test]
    fn test_state_json_shape() {
        let state: ManipulatorState = serde_json::from_str(
            r#"{"rotation": [0, 0, 0, 1], "center": [1, 2, 3], "distance": 4}"#,
        )
        .unwrap();
        let mut manipulator = TrackballManipulator::new();
        manipulator.import_state(&state).unwrap();
        assert_eq!(manipulator.eye(), Vec3::new(1.0, 2.0, 7.0));
        assert_eq!(manipulator.forward(), Vec3::NEG_Z);
    }

    #[test]
    fn test_rejects_invalid_state() {
        let mut manipulator = TrackballManipulator::new();
        let before = manipulator.export_state();
        for bad in [
            ManipulatorState { rotation: [0.0, 0.0, 0.0, 1.0], center: [0.0; 3], distance: 0.0 },
            ManipulatorState { rotation: [0.0, 0.0, 0.0, 2.0], center: [0.0; 3], distance: 1.0 },
            ManipulatorState { rotation: [0.0, 0.0, 0.0, 1.0], center: [f32::NAN, 0.0, 0.0], distance: 1.0 },
        ] {
            assert!(manipulator.import_state(&bad).is_err());
        }
        assert_eq!(manipulator.export_state(), before);
    }

    #[test]
    fn test_default_camera_looks_at_center() {
        let manipulator = TrackballManipulator::new();
        let to_center = (Vec3::ZERO - manipulator.eye()).normalize();
        assert!(to_center.dot(manipulator.forward()) > 0.999);
        assert!(manipulator.up().z > 0.0);
        let centre_ray = manipulator.view_ray(0.0, 0.0, 1.0, 1.5);
        assert!((centre_ray - manipulator.forward()).length() < 1e-5);
    }
}
