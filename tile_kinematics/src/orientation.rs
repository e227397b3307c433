//! Sensor orientation estimation.
//!
//! Any fusion filter can stand behind [`OrientationFilter`]; the crate ships
//! a 6-DOF gradient-descent AHRS and a passthrough for orientations computed
//! elsewhere.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::quat::{Euler, Quat};
use crate::signal::Vec3;

pub trait OrientationFilter: Send + Sync {
    /// One orientation per sample. `accel` is in mG, `gyro` in mdps and `mag`
    /// in mGauss, all sampled at `fs`.
    fn estimate(&self, accel: &[Vec3], gyro: &[Vec3], mag: Option<&[Vec3]>, fs: f64) -> Vec<Quat>;
}

/// Gradient-descent AHRS (Madgwick form) over accelerometer and gyroscope.
/// The magnetometer is not used, so yaw is gyro-integrated only.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GradientAhrs {
    pub gain: f64,
}

impl Default for GradientAhrs {
    fn default() -> Self {
        Self { gain: 0.5 }
    }
}

/// Roll and pitch of a gravity reading, yaw zero.
fn level_from_accel(a: &Vec3) -> Quat {
    let [ax, ay, az] = *a;
    let roll = ay.atan2(az).to_degrees();
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees();
    Quat::from_euler(Euler::new(roll, pitch, 0.0))
}

impl GradientAhrs {
    fn step(&self, q: Quat, accel: &Vec3, gyro: &Vec3, dt: f64) -> Quat {
        let (q0, q1, q2, q3) = (q.w, q.x, q.y, q.z);
        let [gx, gy, gz] = gyro.map(|g| (g / 1000.0).to_radians());

        let mut dq = [
            0.5 * (-q1 * gx - q2 * gy - q3 * gz),
            0.5 * (q0 * gx + q2 * gz - q3 * gy),
            0.5 * (q0 * gy - q1 * gz + q3 * gx),
            0.5 * (q0 * gz + q1 * gy - q2 * gx),
        ];

        let norm = (accel[0] * accel[0] + accel[1] * accel[1] + accel[2] * accel[2]).sqrt();
        if norm > 0.0 {
            let [ax, ay, az] = accel.map(|a| a / norm);
            let (q0q0, q1q1, q2q2, q3q3) = (q0 * q0, q1 * q1, q2 * q2, q3 * q3);
            let s = [
                4.0 * q0 * q2q2 + 2.0 * q2 * ax + 4.0 * q0 * q1q1 - 2.0 * q1 * ay,
                4.0 * q1 * q3q3 - 2.0 * q3 * ax + 4.0 * q0q0 * q1 - 2.0 * q0 * ay - 4.0 * q1
                    + 8.0 * q1 * q1q1
                    + 8.0 * q1 * q2q2
                    + 4.0 * q1 * az,
                4.0 * q0q0 * q2 + 2.0 * q0 * ax + 4.0 * q2 * q3q3 - 2.0 * q3 * ay - 4.0 * q2
                    + 8.0 * q2 * q1q1
                    + 8.0 * q2 * q2q2
                    + 4.0 * q2 * az,
                4.0 * q1q1 * q3 - 2.0 * q1 * ax + 4.0 * q2q2 * q3 - 2.0 * q2 * ay,
            ];
            let s_norm = s.iter().map(|v| v * v).sum::<f64>().sqrt();
            if s_norm > 0.0 {
                for (d, v) in dq.iter_mut().zip(s) {
                    *d -= self.gain * v / s_norm;
                }
            }
        }

        Quat::new(q0 + dq[0] * dt, q1 + dq[1] * dt, q2 + dq[2] * dt, q3 + dq[3] * dt).normalized()
    }
}

impl OrientationFilter for GradientAhrs {
    fn estimate(&self, accel: &[Vec3], gyro: &[Vec3], _mag: Option<&[Vec3]>, fs: f64) -> Vec<Quat> {
        let Some(first) = accel.first() else {
            return Vec::new();
        };
        let dt = 1.0 / fs;
        let mut q = level_from_accel(first);
        let out: Vec<Quat> = accel
            .iter()
            .zip(gyro)
            .map(|(a, g)| {
                q = self.step(q, a, g, dt);
                q
            })
            .collect();
        debug!("AHRS estimated {} orientations (gain {})", out.len(), self.gain);
        out
    }
}

/// Orientations computed outside the crate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrecomputedOrientation(pub Vec<Quat>);

impl OrientationFilter for PrecomputedOrientation {
    fn estimate(&self, _accel: &[Vec3], _gyro: &[Vec3], _mag: Option<&[Vec3]>, _fs: f64) -> Vec<Quat> {
        self.0.clone()
    }
}
