//! Sweep specification and point enumeration.
//!
//! A PDSHG sweep visits the cartesian product of three axes in a fixed,
//! restart-safe order: wavelength outermost, power in the middle, analyzer
//! angle innermost. The innermost axis changes fastest so the expensive
//! wavelength and power moves happen as rarely as possible.

use crate::error::ShgError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Declarative description of one polarization-dependent SHG sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Wavelength axis, nm (outer loop).
    pub wavelengths_nm: Vec<f64>,
    /// Target power axis, mW (middle loop).
    pub powers_mw: Vec<f64>,
    /// Analyzer angle axis, degrees (inner loop).
    pub angles_deg: Vec<f64>,
    /// Detector reads averaged per point.
    #[serde(default = "default_averages")]
    pub averages: usize,
    /// Settle delay after each actuator move.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Capture a shutter-blocked background per wavelength and subtract it.
    #[serde(default = "default_subtract_background")]
    pub subtract_background: bool,
    /// Upper bound on any single device operation during the sweep; a hung
    /// actuator or detector surfaces as
    /// [`crate::error::DeviceError::Timeout`] instead of stalling the run.
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,
}

fn default_averages() -> usize {
    3
}
fn default_settle() -> Duration {
    Duration::from_millis(50)
}
fn default_subtract_background() -> bool {
    true
}
fn default_device_timeout() -> Duration {
    Duration::from_secs(10)
}

impl SweepSpec {
    /// Total number of sweep points.
    pub fn total_points(&self) -> usize {
        self.wavelengths_nm.len() * self.powers_mw.len() * self.angles_deg.len()
    }

    /// Reject sweeps that cannot produce data.
    pub fn validate(&self) -> Result<(), ShgError> {
        if self.wavelengths_nm.is_empty() || self.powers_mw.is_empty() || self.angles_deg.is_empty()
        {
            return Err(ShgError::Config(
                "sweep requires at least one wavelength, power, and angle".into(),
            ));
        }
        if self.averages == 0 {
            return Err(ShgError::Config("averages must be at least 1".into()));
        }
        Ok(())
    }

    /// Coordinate of the `index`-th point in deterministic sweep order.
    ///
    /// Index arithmetic rather than stored state keeps the order
    /// restart-safe: the same index always maps to the same coordinate.
    pub fn coord(&self, index: usize) -> Option<SweepCoord> {
        if index >= self.total_points() {
            return None;
        }
        let n_angles = self.angles_deg.len();
        let n_powers = self.powers_mw.len();
        let angle_index = index % n_angles;
        let power_index = (index / n_angles) % n_powers;
        let wavelength_index = index / (n_angles * n_powers);
        Some(SweepCoord {
            index,
            wavelength_index,
            power_index,
            angle_index,
            wavelength_nm: self.wavelengths_nm[wavelength_index],
            power_mw: self.powers_mw[power_index],
            angle_deg: self.angles_deg[angle_index],
        })
    }

    /// Iterator over all coordinates in sweep order.
    pub fn coords(&self) -> impl Iterator<Item = SweepCoord> + '_ {
        (0..self.total_points()).filter_map(|i| self.coord(i))
    }
}

/// One position in the sweep, with both grid indices and physical values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepCoord {
    /// Linear index in sweep order.
    pub index: usize,
    /// Index on the wavelength axis.
    pub wavelength_index: usize,
    /// Index on the power axis.
    pub power_index: usize,
    /// Index on the angle axis.
    pub angle_index: usize,
    /// Wavelength at this point, nm.
    pub wavelength_nm: f64,
    /// Target power at this point, mW.
    pub power_mw: f64,
    /// Analyzer angle at this point, degrees.
    pub angle_deg: f64,
}

/// Actuator values actually commanded for a point, after calibration
/// lookups and corrections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandedValues {
    /// EOM drive voltage from the power table, V.
    pub drive_v: f64,
    /// Rotator angle after phase and coupling correction, degrees.
    pub rotator_deg: f64,
}

/// One recorded sweep point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Where in the sweep the point was taken.
    pub coord: SweepCoord,
    /// Actuator values commanded for the point.
    pub commanded: CommandedValues,
    /// Background-subtracted detector signal, averaged over reads.
    pub measured: f64,
    /// Background level subtracted (0 when background capture is off).
    pub background: f64,
    /// Acquisition time, UTC.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SweepSpec {
        SweepSpec {
            wavelengths_nm: vec![800.0, 900.0],
            powers_mw: vec![1.0, 2.0, 4.0],
            angles_deg: vec![0.0, 45.0],
            averages: 1,
            settle: Duration::from_millis(0),
            subtract_background: false,
            device_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn order_is_wavelength_outer_angle_inner() {
        let s = spec();
        assert_eq!(s.total_points(), 12);
        let coords: Vec<_> = s.coords().collect();
        // First two points differ only in angle.
        assert_eq!(coords[0].angle_deg, 0.0);
        assert_eq!(coords[1].angle_deg, 45.0);
        assert_eq!(coords[0].power_mw, coords[1].power_mw);
        // Power advances after the angle axis wraps.
        assert_eq!(coords[2].power_mw, 2.0);
        assert_eq!(coords[2].angle_deg, 0.0);
        // Wavelength advances last.
        assert_eq!(coords[5].wavelength_nm, 800.0);
        assert_eq!(coords[6].wavelength_nm, 900.0);
        assert_eq!(coords[6].power_mw, 1.0);
        assert_eq!(coords[6].angle_deg, 0.0);
    }

    #[test]
    fn coord_round_trips_linear_index() {
        let s = spec();
        for (i, c) in s.coords().enumerate() {
            assert_eq!(c.index, i);
        }
        assert!(s.coord(12).is_none());
    }

    #[test]
    fn empty_axis_is_rejected() {
        let mut s = spec();
        s.powers_mw.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let s: SweepSpec = toml::from_str(
            r#"
            wavelengths_nm = [800.0, 850.0]
            powers_mw = [1.0, 2.0]
            angles_deg = [0.0, 30.0, 60.0]
            settle = "20ms"
            "#,
        )
        .unwrap();
        assert_eq!(s.total_points(), 12);
        assert_eq!(s.averages, 3);
        assert_eq!(s.settle, Duration::from_millis(20));
        assert!(s.subtract_background);
        assert_eq!(s.device_timeout, Duration::from_secs(10));
    }
}
