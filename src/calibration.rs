//! Per-channel calibration points and polynomial calibration curves.
//!
//! While the device is in calibration mode it streams `[channel, raw]` pairs.
//! A calibration point pairs a known reference input (a concentration, for
//! instance) with the latest raw reading for that channel. With at least
//! [`MIN_POINTS`] points a polynomial of degree `min(n - 1, 2)` is fitted,
//! mapping raw readings to the reference scale.

use chrono::{DateTime, Local};

use crate::protocol::NUM_CHANNELS;
use crate::types::CalibrationSample;

/// Points kept per channel.
pub const MAX_POINTS: usize = 6;
/// Points required before a curve can be fitted.
pub const MIN_POINTS: usize = 2;
/// Highest polynomial degree fitted.
pub const MAX_DEGREE: usize = 2;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("channel {0} out of range")]
    UnknownChannel(usize),
    #[error("no calibration reading received yet for channel {0}")]
    NoReading(usize),
    #[error("channel {0} already has {MAX_POINTS} points")]
    Full(usize),
    #[error("channel {channel} has {have} point(s), at least {MIN_POINTS} required")]
    TooFewPoints { channel: usize, have: usize },
    #[error("calibration fit failed")]
    FitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    /// Known reference value.
    pub input: f64,
    /// Raw reading observed for it.
    pub reading: f64,
}

/// A fitted polynomial, coefficients highest degree first.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCurve {
    coefficients: Vec<f64>,
    r_squared: f64,
    fitted_at: DateTime<Local>,
}

impl CalibrationCurve {
    /// Build a curve from coefficients and score it against `points`.
    pub fn from_coefficients(coefficients: Vec<f64>, points: &[CalibrationPoint]) -> Self {
        let mut curve = Self {
            coefficients,
            r_squared: 0.0,
            fitted_at: Local::now(),
        };
        curve.r_squared = curve.score(points);
        curve
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn r_squared(&self) -> f64 {
        self.r_squared
    }

    pub fn fitted_at(&self) -> DateTime<Local> {
        self.fitted_at
    }

    /// Evaluate at `raw` (Horner's scheme).
    pub fn apply(&self, raw: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, c| acc * raw + c)
    }

    /// Coefficient of determination over `points`; 0 when the inputs have
    /// no variance.
    fn score(&self, points: &[CalibrationPoint]) -> f64 {
        if points.is_empty() {
            return 0.0;
        }
        let mean = points.iter().map(|p| p.input).sum::<f64>() / points.len() as f64;
        let ss_tot: f64 = points.iter().map(|p| (p.input - mean).powi(2)).sum();
        if ss_tot == 0.0 {
            return 0.0;
        }
        let ss_res: f64 = points
            .iter()
            .map(|p| (p.input - self.apply(p.reading)).powi(2))
            .sum();
        1.0 - ss_res / ss_tot
    }

    /// Human-readable form, e.g. `y = 0.000120x² + 0.500000x + 3.000000`.
    pub fn formula(&self) -> String {
        let degree = self.degree();
        let terms: Vec<String> = self
            .coefficients
            .iter()
            .enumerate()
            .map(|(i, c)| match degree - i {
                0 => format!("{c:.6}"),
                1 => format!("{c:.6}x"),
                2 => format!("{c:.6}x²"),
                n => format!("{c:.6}x^{n}"),
            })
            .collect();
        format!("y = {}", terms.join(" + "))
    }
}

/// Fit a polynomial of `degree` through `(x, y)` by least squares.
/// Returns coefficients highest degree first, or `None` if the system is
/// singular.
pub fn least_squares(xs: &[f64], ys: &[f64], degree: usize) -> Option<Vec<f64>> {
    let n = degree + 1;
    if xs.len() != ys.len() || xs.len() < n {
        return None;
    }

    // Normal equations: row i is [Σx^(i+j) for j in 0..n | Σy·x^i].
    let mut m = vec![vec![0.0f64; n + 1]; n];
    for (&x, &y) in xs.iter().zip(ys) {
        for (i, row) in m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().take(n).enumerate() {
                *cell += x.powi((i + j) as i32);
            }
            row[n] += y * x.powi(i as i32);
        }
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        let pivot_row = m[col].clone();
        for (r, row) in m.iter_mut().enumerate() {
            if r != col {
                let factor = row[col] / pivot_row[col];
                for (cell, p) in row.iter_mut().zip(&pivot_row).skip(col) {
                    *cell -= factor * p;
                }
            }
        }
    }

    // Solved lowest degree first; callers want highest first.
    Some((0..n).rev().map(|i| m[i][n] / m[i][i]).collect())
}

/// Calibration points collected for every channel.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSession {
    points: [Vec<CalibrationPoint>; NUM_CHANNELS],
    latest: [Option<CalibrationSample>; NUM_CHANNELS],
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `sample` as the current reading for its channel.
    pub fn record_sample(&mut self, sample: &CalibrationSample) {
        if let Some(slot) = self.latest.get_mut(sample.channel) {
            *slot = Some(*sample);
        }
    }

    pub fn latest(&self, channel: usize) -> Option<&CalibrationSample> {
        self.latest.get(channel)?.as_ref()
    }

    pub fn points(&self, channel: usize) -> &[CalibrationPoint] {
        self.points.get(channel).map(Vec::as_slice).unwrap_or_default()
    }

    /// Pair `input` with the latest reading on `channel`. Returns the number
    /// of points now held for the channel.
    pub fn add_point(&mut self, channel: usize, input: f64) -> Result<usize, CalibrationError> {
        let reading = self
            .latest
            .get(channel)
            .ok_or(CalibrationError::UnknownChannel(channel))?
            .ok_or(CalibrationError::NoReading(channel))?
            .raw_value as f64;
        let points = &mut self.points[channel];
        if points.len() >= MAX_POINTS {
            return Err(CalibrationError::Full(channel));
        }
        points.push(CalibrationPoint { input, reading });
        Ok(points.len())
    }

    pub fn clear(&mut self, channel: usize) {
        if let Some(points) = self.points.get_mut(channel) {
            points.clear();
        }
        if let Some(slot) = self.latest.get_mut(channel) {
            *slot = None;
        }
    }

    /// Fit `channel` with the built-in least-squares fitter.
    pub fn fit(&self, channel: usize) -> Result<CalibrationCurve, CalibrationError> {
        self.fit_with(channel, least_squares)
    }

    /// Fit `channel` with a caller-supplied fitter.
    ///
    /// `fitter(readings, inputs, degree)` must return coefficients highest
    /// degree first, or `None` on failure.
    pub fn fit_with<F>(&self, channel: usize, fitter: F) -> Result<CalibrationCurve, CalibrationError>
    where
        F: FnOnce(&[f64], &[f64], usize) -> Option<Vec<f64>>,
    {
        let points = self
            .points
            .get(channel)
            .ok_or(CalibrationError::UnknownChannel(channel))?;
        if points.len() < MIN_POINTS {
            return Err(CalibrationError::TooFewPoints {
                channel,
                have: points.len(),
            });
        }
        let readings: Vec<f64> = points.iter().map(|p| p.reading).collect();
        let inputs: Vec<f64> = points.iter().map(|p| p.input).collect();
        let degree = (points.len() - 1).min(MAX_DEGREE);
        let coefficients = fitter(&readings, &inputs, degree)
            .filter(|c| !c.is_empty() && c.iter().all(|v| v.is_finite()))
            .ok_or(CalibrationError::FitFailed)?;
        Ok(CalibrationCurve::from_coefficients(coefficients, points))
    }
}
