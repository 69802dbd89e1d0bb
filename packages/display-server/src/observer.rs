//! Observer pose shared between a pose producer and the render loop.
//!
//! The pose lives behind a mutex that is only held for a single read or
//! write. Readers always receive a complete copy.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};

/// One pose measurement of the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverPoseSample {
    pub position: Vec3,
    pub orientation: Quat,
    /// Seconds, in the caller's clock.
    pub timestamp: f64,
}

impl Default for ObserverPoseSample {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            timestamp: 0.0,
        }
    }
}

/// Per-frame observer pose in uniform-buffer layout.
///
/// `position.w` is 1; `time` holds the sample timestamp in `x` and the frame
/// index in `y`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ObserverUniform {
    pub position: [f32; 4],
    pub orientation: [f32; 4],
    pub time: [f32; 4],
}

impl ObserverUniform {
    pub fn from_sample(sample: &ObserverPoseSample, frame: u64) -> Self {
        Self {
            position: sample.position.extend(1.0).to_array(),
            orientation: sample.orientation.to_array(),
            time: [sample.timestamp as f32, frame as f32, 0.0, 0.0],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Thread-safe holder of the current observer pose.
///
/// Share it with a pose-producer thread through an `Arc`; the render loop
/// takes one [`snapshot`](Self::snapshot) per frame.
#[derive(Debug, Default)]
pub struct ObserverPosition {
    current: Mutex<ObserverPoseSample>,
}

impl ObserverPosition {
    pub fn new(initial: ObserverPoseSample) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.lock().position
    }

    /// Overwrite the position only, keeping orientation and timestamp.
    pub fn set_position(&self, position: Vec3) {
        self.lock().position = position;
    }

    /// Overwrite the whole sample.
    pub fn store(&self, sample: ObserverPoseSample) {
        *self.lock() = sample;
    }

    pub fn snapshot(&self) -> ObserverPoseSample {
        *self.lock()
    }

    /// The frame's single read of the pose, plus its uniform form.
    pub fn tick(&self, frame: u64) -> (ObserverPoseSample, ObserverUniform) {
        let sample = self.snapshot();
        (sample, ObserverUniform::from_sample(&sample, frame))
    }

    fn lock(&self) -> MutexGuard<'_, ObserverPoseSample> {
        // A panicking writer cannot leave a torn Copy value behind.
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_position_keeps_orientation() {
        let observer = ObserverPosition::new(ObserverPoseSample {
            position: Vec3::ZERO,
            orientation: Quat::from_rotation_z(1.0),
            timestamp: 2.0,
        });
        observer.set_position(Vec3::new(1.0, 2.0, 3.0));

        let sample = observer.snapshot();
        assert_eq!(sample.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(sample.orientation, Quat::from_rotation_z(1.0));
        assert_eq!(sample.timestamp, 2.0);
    }

    #[test]
    fn test_tick_packs_pose_for_upload() {
        let observer = ObserverPosition::new(ObserverPoseSample {
            position: Vec3::new(1.0, -2.0, 0.5),
            orientation: Quat::IDENTITY,
            timestamp: 3.5,
        });
        let (sample, uniform) = observer.tick(7);
        assert_eq!(sample, observer.snapshot());
        assert_eq!(uniform.position, [1.0, -2.0, 0.5, 1.0]);
        assert_eq!(uniform.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(uniform.time, [3.5, 7.0, 0.0, 0.0]);

        let bytes = uniform.as_bytes();
        assert_eq!(bytes.len(), 48);
        let back: &ObserverUniform = bytemuck::from_bytes(bytes);
        assert_eq!(*back, uniform);
    }

    #[test]
    fn test_concurrent_writer_never_tears_samples() {
        let observer = Arc::new(ObserverPosition::default());
        let writer = {
            let observer = Arc::clone(&observer);
            thread::spawn(move || {
                for i in 0..2000 {
                    let v = i as f32;
                    observer.store(ObserverPoseSample {
                        position: Vec3::splat(v),
                        orientation: Quat::IDENTITY,
                        timestamp: v as f64,
                    });
                }
            })
        };

        for _ in 0..2000 {
            let sample = observer.snapshot();
            let p = sample.position;
            assert!(p.x == p.y && p.y == p.z);
            assert_eq!(p.x as f64, sample.timestamp);
        }
        writer.join().unwrap();
        assert_eq!(observer.position(), Vec3::splat(1999.0));
    }
}
