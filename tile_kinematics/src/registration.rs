//! Static sensor-to-boot registration and the boot-frame orientation.
//!
//! At each peak (lift top, before the run) the boot stands still for a
//! while. The average sensor orientation over the longest still stretch
//! becomes a registration; from its timestamp on, the boot orientation is
//! re-levelled by the registration's roll and pitch.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::quat::{self, Euler, Quat};
use crate::signal::{self, Range};
use crate::KinError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrationParams {
    /// Windows with a smaller `mg` std dev count as still.
    pub stillness_std_mg: f64,
    pub coarse_window_s: f64,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            stillness_std_mg: 50.0,
            coarse_window_s: 0.25,
        }
    }
}

fn is_still(mg: &[f64], head: usize, len: usize, th: f64) -> bool {
    let w = Range::new(head, head + len).slice(mg);
    !w.is_empty() && signal::std(w) < th
}

/// Still stretches inside `within`: coarse non-overlapping windows merged
/// into runs, then each run edge pushed outward in tenth-window steps while
/// the shifted window stays still.
pub fn still_ranges(mg: &[f64], within: Range, params: &RegistrationParams, fs: f64) -> Vec<Range> {
    let w = signal::seconds_to_samples(params.coarse_window_s, fs).max(1);
    let fine = (w / 10).max(1);
    let th = params.stillness_std_mg;
    let end = within.end.min(mg.len());

    let mut runs: Vec<Range> = Vec::new();
    let mut head = within.start;
    while head + w <= end {
        if is_still(mg, head, w, th) {
            match runs.last_mut() {
                Some(last) if last.end == head => last.end = head + w,
                _ => runs.push(Range::new(head, head + w)),
            }
        }
        head += w;
    }

    let mut refined: Vec<Range> = Vec::with_capacity(runs.len());
    for run in runs {
        let mut start = run.start;
        while start >= within.start + fine && is_still(mg, start - fine, w, th) {
            start -= fine;
        }
        let mut stop = run.end;
        while stop + fine <= end && is_still(mg, stop + fine - w, w, th) {
            stop += fine;
        }
        match refined.last_mut() {
            Some(last) if start <= last.end => last.end = last.end.max(stop),
            _ => refined.push(Range::new(start, stop)),
        }
    }
    refined
}

/// The longest still stretch; the earliest on ties.
pub fn longest_still_range(
    mg: &[f64],
    within: Range,
    params: &RegistrationParams,
    fs: f64,
) -> Option<Range> {
    still_ranges(mg, within, params, fs)
        .into_iter()
        .rev()
        .max_by_key(|r| r.len())
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    /// Time of the last still sample.
    pub timestamp: f64,
    pub range: Range,
    /// Mean sensor orientation over `range`.
    pub avg_quat: Quat,
    /// Undoes the registration's boot-frame roll and pitch.
    pub tare: Quat,
}

impl Registration {
    pub fn new(timestamp: f64, range: Range, avg_quat: Quat) -> Self {
        let e = quat::to_boot_frame(&avg_quat).to_euler();
        let tare = Quat::from_euler(Euler::new(e.roll, e.pitch, 0.0)).inverse();
        Self {
            timestamp,
            range,
            avg_quat,
            tare,
        }
    }
}

/// Registrations in time order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Registrations {
    pub items: Vec<Registration>,
}

impl Registrations {
    /// One registration per peak range that contains a still stretch.
    pub fn identify(
        peak_ranges: &[Range],
        time: &[f64],
        mg: &[f64],
        quats: &[Quat],
        params: &RegistrationParams,
        fs: f64,
    ) -> Self {
        let items: Vec<Registration> = peak_ranges
            .iter()
            .filter_map(|&peak| {
                let r = longest_still_range(mg, peak, params, fs)?;
                let last = r.end.checked_sub(1)?;
                let timestamp = *time.get(last).or(time.last())?;
                let avg = Quat::average(r.slice(quats), None);
                debug!("Still range {}..{} in peak {}..{}", r.start, r.end, peak.start, peak.end);
                Some(Registration::new(timestamp, r, avg))
            })
            .collect();
        info!(
            "{} static registrations from {} peaks",
            items.len(),
            peak_ranges.len()
        );
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The latest registration strictly before `t`.
    pub fn most_recent(&self, t: f64) -> Option<&Registration> {
        let n = self.items.partition_point(|r| r.timestamp < t);
        n.checked_sub(1).map(|i| &self.items[i])
    }

    /// Correction applied to the boot orientation at `t`; identity before
    /// the first registration.
    pub fn quat_at(&self, t: f64) -> Quat {
        self.most_recent(t).map_or(Quat::IDENTITY, |r| r.tare)
    }
}

/// Boot-frame orientation of every sample.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BootOrientation {
    pub quat: Vec<Quat>,
    pub euler: Vec<Euler>,
    /// Roll unwrapped to a continuous signal, degrees.
    pub roll: Vec<f64>,
    pub d_roll_dt: Vec<f64>,
}

impl BootOrientation {
    pub fn compute(
        quats: &[Quat],
        time: &[f64],
        registrations: &Registrations,
        fs: f64,
        derivative_cutoff: f64,
    ) -> Result<Self, KinError> {
        let quat: Vec<Quat> = quats
            .iter()
            .zip(time)
            .map(|(q, &t)| quat::to_boot_frame(q).multiply(&registrations.quat_at(t)))
            .collect();
        let euler: Vec<Euler> = quat.iter().map(Quat::to_euler).collect();
        let raw_roll: Vec<f64> = euler.iter().map(|e| e.roll).collect();
        let (roll, skips) = signal::unclamp(&raw_roll, 360.0);
        if !skips.is_empty() {
            debug!("Boot roll unwrapped at {} samples", skips.len());
        }
        let d_roll_dt = signal::derivative5pt(&roll, 1.0 / fs, Some(derivative_cutoff))?;
        Ok(Self {
            quat,
            euler,
            roll,
            d_roll_dt,
        })
    }
}
