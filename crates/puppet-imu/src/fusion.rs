use crate::error::{Error, Result};
use crate::types::{OrientationFrame, Sample};
use glam::{Quat, Vec3, Vec4};
use std::sync::Arc;

/// Runtime tunables of the orientation filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// Gradient-descent gain. Higher = more responsive, noisier.
    pub beta: f32,
    /// Nominal sample rate (Hz). The integration step is `1 / sample_freq`.
    pub sample_freq: f32,
}

impl FilterConfig {
    pub fn new(beta: f32, sample_freq: f32) -> Result<Self> {
        validate_gain(beta)?;
        validate_frequency(sample_freq)?;
        Ok(Self { beta, sample_freq })
    }

    /// Nominal time between samples, in seconds.
    pub fn sample_period(&self) -> f32 {
        1.0 / self.sample_freq
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            beta: 0.0001,
            sample_freq: 60.0,
        }
    }
}

pub(crate) fn validate_frequency(hz: f32) -> Result<()> {
    if hz.is_finite() && hz > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "sample frequency must be a positive number of Hz, got {hz}"
        )))
    }
}

pub(crate) fn validate_gain(beta: f32) -> Result<()> {
    if beta.is_finite() && beta >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "filter gain must be finite and non-negative, got {beta}"
        )))
    }
}

/// Why the corrective step was skipped for a cycle.
#[derive(Debug, thiserror::Error)]
enum DegenerateInput {
    #[error("accelerometer reads exactly zero")]
    ZeroAccel,
    #[error("accelerometer magnitude too small to normalize")]
    Accel,
    #[error("magnetometer magnitude too small to normalize")]
    Magnetometer,
    #[error("gradient vanished")]
    Gradient,
}

/// Madgwick gradient-descent MARG filter.
///
/// Fuses gyro, accelerometer and magnetometer readings into a unit
/// quaternion. Exclusively owned by the sampling loop; everything else sees
/// the frames it emits.
pub struct OrientationFilter {
    config: FilterConfig,
    quaternion: Quat,
    last_frame: Option<Arc<OrientationFrame>>,
}

impl OrientationFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            quaternion: Quat::IDENTITY,
            last_frame: None,
        }
    }

    pub fn config(&self) -> FilterConfig {
        self.config
    }

    /// Current estimate.
    pub fn quaternion(&self) -> Quat {
        self.quaternion
    }

    /// Frame produced by the most recent update, if any.
    pub fn last_frame(&self) -> Option<Arc<OrientationFrame>> {
        self.last_frame.clone()
    }

    /// Takes effect on the next update.
    pub fn set_frequency(&mut self, hz: f32) -> Result<()> {
        validate_frequency(hz)?;
        self.config.sample_freq = hz;
        Ok(())
    }

    /// Takes effect on the next update.
    pub fn set_gain(&mut self, beta: f32) -> Result<()> {
        validate_gain(beta)?;
        self.config.beta = beta;
        Ok(())
    }

    /// Back to identity. Configuration and the last frame are kept.
    pub fn reset(&mut self) {
        self.quaternion = Quat::IDENTITY;
    }

    /// Fuse one sample using the nominal step `1 / sample_freq`.
    pub fn update(&mut self, sample: Sample) -> Arc<OrientationFrame> {
        let dt = self.config.sample_period();
        self.update_with_dt(sample, dt)
    }

    /// Fuse one sample, integrating over `dt` seconds.
    pub fn update_with_dt(&mut self, sample: Sample, dt: f32) -> Arc<OrientationFrame> {
        let q = self.quaternion;
        let (q0, q1, q2, q3) = (q.w, q.x, q.y, q.z);
        let g = sample.gyro;

        // Rate of change of quaternion from gyroscope, ordered (w, x, y, z).
        let mut q_dot = Vec4::new(
            0.5 * (-q1 * g.x - q2 * g.y - q3 * g.z),
            0.5 * (q0 * g.x + q2 * g.z - q3 * g.y),
            0.5 * (q0 * g.y - q1 * g.z + q3 * g.x),
            0.5 * (q0 * g.z + q1 * g.y - q2 * g.x),
        );

        match self.corrective_step(&sample) {
            Ok(step) => q_dot -= self.config.beta * step,
            Err(reason) => tracing::trace!(%reason, "Gyro-only integration"),
        }

        let integrated = Vec4::new(q0, q1, q2, q3) + q_dot * dt;
        match integrated.try_normalize() {
            Some(n) => self.quaternion = Quat::from_xyzw(n.y, n.z, n.w, n.x),
            None => tracing::warn!(?integrated, "Integration diverged, keeping previous estimate"),
        }

        let frame = Arc::new(OrientationFrame {
            quaternion: self.quaternion,
            sample,
        });
        self.last_frame = Some(frame.clone());
        frame
    }

    /// Normalized gradient of the gravity + magnetic field error, ordered
    /// (w, x, y, z).
    fn corrective_step(&self, sample: &Sample) -> std::result::Result<Vec4, DegenerateInput> {
        if sample.accel == Vec3::ZERO {
            return Err(DegenerateInput::ZeroAccel);
        }
        let a = sample.accel.try_normalize().ok_or(DegenerateInput::Accel)?;
        let m = sample.mag.try_normalize().ok_or(DegenerateInput::Magnetometer)?;

        let q = self.quaternion;
        let (q0, q1, q2, q3) = (q.w, q.x, q.y, q.z);

        let _2q0mx = 2.0 * q0 * m.x;
        let _2q0my = 2.0 * q0 * m.y;
        let _2q0mz = 2.0 * q0 * m.z;
        let _2q1mx = 2.0 * q1 * m.x;
        let _2q0 = 2.0 * q0;
        let _2q1 = 2.0 * q1;
        let _2q2 = 2.0 * q2;
        let _2q3 = 2.0 * q3;
        let _2q0q2 = 2.0 * q0 * q2;
        let _2q2q3 = 2.0 * q2 * q3;
        let q0q0 = q0 * q0;
        let q0q1 = q0 * q1;
        let q0q2 = q0 * q2;
        let q0q3 = q0 * q3;
        let q1q1 = q1 * q1;
        let q1q2 = q1 * q2;
        let q1q3 = q1 * q3;
        let q2q2 = q2 * q2;
        let q2q3 = q2 * q3;
        let q3q3 = q3 * q3;

        // Earth-frame field reference. The east component is folded into the
        // horizontal magnitude so the reference only has north and down.
        let hx = m.x * q0q0 - _2q0my * q3 + _2q0mz * q2 + m.x * q1q1 + _2q1 * m.y * q2
            + _2q1 * m.z * q3
            - m.x * q2q2
            - m.x * q3q3;
        let hy = _2q0mx * q3 + m.y * q0q0 - _2q0mz * q1 + _2q1mx * q2 - m.y * q1q1
            + m.y * q2q2
            + _2q2 * m.z * q3
            - m.y * q3q3;
        let _2bx = (hx * hx + hy * hy).sqrt();
        let _2bz = -_2q0mx * q2 + _2q0my * q1 + m.z * q0q0 + _2q1mx * q3 - m.z * q1q1
            + _2q2 * m.y * q3
            - m.z * q2q2
            + m.z * q3q3;
        let _4bx = 2.0 * _2bx;
        let _4bz = 2.0 * _2bz;

        // Objective function: predicted minus measured gravity and field.
        let f1 = 2.0 * q1q3 - _2q0q2 - a.x;
        let f2 = 2.0 * q0q1 + _2q2q3 - a.y;
        let f3 = 1.0 - 2.0 * q1q1 - 2.0 * q2q2 - a.z;
        let f4 = _2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - m.x;
        let f5 = _2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - m.y;
        let f6 = _2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - m.z;

        // Jacobian transpose times objective.
        let s0 = -_2q2 * f1 + _2q1 * f2 - _2bz * q2 * f4
            + (-_2bx * q3 + _2bz * q1) * f5
            + _2bx * q2 * f6;
        let s1 = _2q3 * f1 + _2q0 * f2 - 4.0 * q1 * f3
            + _2bz * q3 * f4
            + (_2bx * q2 + _2bz * q0) * f5
            + (_2bx * q3 - _4bz * q1) * f6;
        let s2 = -_2q0 * f1 + _2q3 * f2 - 4.0 * q2 * f3
            + (-_4bx * q2 - _2bz * q0) * f4
            + (_2bx * q1 + _2bz * q3) * f5
            + (_2bx * q0 - _4bz * q2) * f6;
        let s3 = _2q1 * f1 + _2q2 * f2
            + (-_4bx * q3 + _2bz * q1) * f4
            + (-_2bx * q0 + _2bz * q2) * f5
            + _2bx * q1 * f6;

        Vec4::new(s0, s1, s2, s3)
            .try_normalize()
            .ok_or(DegenerateInput::Gradient)
    }
}

impl Default for OrientationFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}
