use glam::{Quat, Vec3};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::SystemTime;

/// One reading from the MPU-9150.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Wall-clock time captured before the device exchange started.
    pub timestamp: SystemTime,
    /// Accelerometer, raw counts.
    pub accel: Vec3,
    /// Gyroscope angular velocity (rad/s).
    pub gyro: Vec3,
    /// Magnetometer, raw counts.
    pub mag: Vec3,
}

impl Sample {
    pub fn new(timestamp: SystemTime, accel: Vec3, gyro: Vec3, mag: Vec3) -> Self {
        Self {
            timestamp,
            accel,
            gyro,
            mag,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Sample [ax:{:.2} ay:{:.2} az:{:.2}] [gx:{:.2} gy:{:.2} gz:{:.2}] [mx:{:.2} my:{:.2} mz:{:.2}]>",
            self.accel.x,
            self.accel.y,
            self.accel.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.mag.x,
            self.mag.y,
            self.mag.z,
        )
    }
}

/// Fused orientation as of one acquisition.
///
/// Serializes as `{"quaternion": [x, y, z, w]}`, which is the shape
/// downstream consumers rely on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationFrame {
    /// Unit quaternion, scalar part in `w`.
    pub quaternion: Quat,
    /// The reading that produced this estimate.
    pub sample: Sample,
}

impl Serialize for OrientationFrame {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let q = self.quaternion;
        let mut state = s.serialize_struct("OrientationFrame", 1)?;
        state.serialize_field("quaternion", &[q.x, q.y, q.z, q.w])?;
        state.end()
    }
}

impl fmt::Display for OrientationFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.quaternion;
        write!(
            f,
            "<Quaternion [x:{:.2} y:{:.2} z:{:.2} w:{:.2}]>",
            q.x, q.y, q.z, q.w
        )
    }
}
