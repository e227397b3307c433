//! Quaternion and Euler-angle helpers. Quaternions are `[w, x, y, z]` and
//! angles are degrees in the ZYX (yaw, pitch, roll) sequence.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Euler {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Euler {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn from_array([w, x, y, z]: [f64; 4]) -> Self {
        Self { w, x, y, z }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn dot(&self, other: &Quat) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Unit-length copy; a zero quaternion is divided by one instead.
    pub fn normalized(&self) -> Quat {
        let n = self.norm();
        let n = if n > 0.0 { n } else { 1.0 };
        self.scale(1.0 / n)
    }

    fn scale(&self, k: f64) -> Quat {
        Quat::new(self.w * k, self.x * k, self.y * k, self.z * k)
    }

    pub fn conjugate(&self) -> Quat {
        Quat::new(self.w, -self.x, -self.y, -self.z)
    }

    pub fn inverse(&self) -> Quat {
        self.normalized().conjugate()
    }

    /// Hamilton product `self * other`.
    pub fn multiply(&self, other: &Quat) -> Quat {
        let (a, b) = (self, other);
        Quat::new(
            a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        )
    }

    /// Conjugate `self` by `rot`: `rot * self * rot^-1`, or
    /// `rot^-1 * self * rot` when `inverse` is set.
    pub fn rotate(&self, rot: &Quat, inverse: bool) -> Quat {
        let r = rot.normalized();
        let q = self.normalized();
        if inverse {
            r.conjugate().multiply(&q).multiply(&r)
        } else {
            r.multiply(&q).multiply(&r.conjugate())
        }
    }

    pub fn to_euler(&self) -> Euler {
        let q = self.normalized();
        let (w, x, y, z) = (q.w, q.x, q.y, q.z);
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let s = 2.0 * (w * y - x * z);
        let pitch = 2.0 * (1.0 + s).max(0.0).sqrt().atan2((1.0 - s).max(0.0).sqrt()) - FRAC_PI_2;
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        Euler::new(roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
    }

    pub fn from_euler(e: Euler) -> Quat {
        let (sr, cr) = (e.roll.to_radians() / 2.0).sin_cos();
        let (sp, cp) = (e.pitch.to_radians() / 2.0).sin_cos();
        let (sy, cy) = (e.yaw.to_radians() / 2.0).sin_cos();
        Quat::new(
            cr * cp * cy + sr * sp * sy,
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
        )
    }

    /// Weighted mean orientation. Samples on the opposite hemisphere from the
    /// first one are flipped before summing so `q` and `-q` do not cancel.
    /// Missing weights count as one; an empty input averages to identity.
    pub fn average(quats: &[Quat], weights: Option<&[f64]>) -> Quat {
        let Some(first) = quats.first().map(Quat::normalized) else {
            return Quat::IDENTITY;
        };
        let mut acc = Quat::new(0.0, 0.0, 0.0, 0.0);
        for (i, q) in quats.iter().enumerate() {
            let mut q = q.normalized();
            if i > 0 && q.dot(&first) < 0.0 {
                q = q.scale(-1.0);
            }
            let w = weights.and_then(|ws| ws.get(i)).copied().unwrap_or(1.0);
            let q = q.scale(w);
            acc = Quat::new(acc.w + q.w, acc.x + q.x, acc.y + q.y, acc.z + q.z);
        }
        acc.normalized()
    }
}

/// Mounting rotation from the tile's sensor axes to the boot axes.
pub fn boot_mount() -> Quat {
    Quat::from_euler(Euler::new(0.0, 180.0, -90.0))
}

pub fn to_boot_frame(q: &Quat) -> Quat {
    q.rotate(&boot_mount(), true)
}
