//! Piecewise-linear calibration of raw transducer values.
//!
//! A [`CalibrationCurve`] is built from two or more anchor points with
//! strictly increasing inputs. Values between two anchors are
//! interpolated on the bracketing segment. Values outside the anchors
//! continue the slope of the nearest segment: the first one below the
//! range, the last one above it. Transducers driven past their top
//! calibration point keep following the last measured slope, they are
//! neither clipped nor extrapolated with the initial slope.

use serde::Serialize;
use std::fmt;

/// One `(input, output)` anchor of a calibration curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CalibrationPoint {
    pub input: f64,
    pub output: f64,
}

impl CalibrationPoint {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

impl From<(f64, f64)> for CalibrationPoint {
    fn from((input, output): (f64, f64)) -> Self {
        Self { input, output }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CalibrationError {
    TooFewPoints(usize),
    NotIncreasing { index: usize },
    NotFinite { index: usize },
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CalibrationError::*;
        match self {
            TooFewPoints(count) => write!(
                f,
                "Calibration curve needs at least 2 points, got {}",
                count
            ),
            NotIncreasing { index } => write!(
                f,
                "Calibration input at point {} does not increase strictly",
                index
            ),
            NotFinite { index } => write!(f, "Calibration point {} is not finite", index),
        }
    }
}

impl std::error::Error for CalibrationError {}

/// An immutable, validated piecewise-linear curve.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationCurve {
    points: Vec<CalibrationPoint>,
}

impl CalibrationCurve {
    pub fn new<I, P>(points: I) -> Result<Self, CalibrationError>
    where
        I: IntoIterator<Item = P>,
        P: Into<CalibrationPoint>,
    {
        let points: Vec<CalibrationPoint> = points.into_iter().map(Into::into).collect();
        if points.len() < 2 {
            return Err(CalibrationError::TooFewPoints(points.len()));
        }
        for (index, point) in points.iter().enumerate() {
            if !point.input.is_finite() || !point.output.is_finite() {
                return Err(CalibrationError::NotFinite { index });
            }
        }
        for (index, pair) in points.windows(2).enumerate() {
            if let [lower, upper] = pair {
                // Equal inputs would divide by zero in `map`
                if upper.input <= lower.input {
                    return Err(CalibrationError::NotIncreasing { index: index + 1 });
                }
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Map a raw value into calibrated units.
    pub fn map(&self, raw: f64) -> f64 {
        let segments = self.points.windows(2).count();
        let index = self
            .points
            .windows(2)
            .position(|pair| matches!(pair, [_, upper] if raw <= upper.input))
            .unwrap_or(segments.saturating_sub(1));
        match self.points.get(index..=index + 1) {
            Some([lower, upper]) => map_segment(raw, *lower, *upper),
            // Unreachable for a validated curve
            _ => raw,
        }
    }
}

#[allow(clippy::float_cmp)]
fn map_segment(raw: f64, lower: CalibrationPoint, upper: CalibrationPoint) -> f64 {
    // Anchors map exactly onto their outputs
    if raw == lower.input {
        return lower.output;
    }
    if raw == upper.input {
        return upper.output;
    }
    lower.output + (raw - lower.input) * (upper.output - lower.output) / (upper.input - lower.input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oxygen_curve() -> CalibrationCurve {
        CalibrationCurve::new(vec![(1.592, 0.0), (5.425, 10.475), (8.34, 20.95)]).unwrap()
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn two_point_curve() {
        let curve = CalibrationCurve::new(vec![(0.0, 0.0), (10.0, 100.0)]).unwrap();
        assert_eq!(50.0, curve.map(5.0));
        assert_eq!(-50.0, curve.map(-5.0));
        assert_eq!(150.0, curve.map(15.0));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn anchors_map_exactly() {
        let curves = vec![
            oxygen_curve(),
            CalibrationCurve::new(vec![(0.1, 0.3), (0.7, 0.9), (1.3, -2.2), (4.0, 1.0 / 3.0)])
                .unwrap(),
        ];
        for curve in curves {
            for point in curve.points() {
                assert_eq!(point.output, curve.map(point.input));
            }
        }
    }

    #[test]
    fn interpolation_is_monotonic_between_anchors() {
        let curve = CalibrationCurve::new(vec![(0.0, 10.0), (1.0, 20.0), (2.0, 5.0)]).unwrap();
        // Rising segment
        let mut last = curve.map(0.0);
        for step in 1..100 {
            let next = curve.map(f64::from(step) / 100.0);
            assert!(next > last && next < 20.0);
            last = next;
        }
        // Falling segment
        let mut last = curve.map(1.0);
        for step in 101..200 {
            let next = curve.map(f64::from(step) / 100.0);
            assert!(next < last && next > 5.0);
            last = next;
        }
    }

    #[test]
    fn picks_bracket_in_multi_segment_curve() {
        let curve = oxygen_curve();
        let mid_first = curve.map((1.592 + 5.425) / 2.0);
        assert!((mid_first - 10.475 / 2.0).abs() < 1e-9);
        let mid_second = curve.map((5.425 + 8.34) / 2.0);
        assert!((mid_second - (10.475 + 20.95) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn extrapolates_above_with_last_slope() {
        let curve = oxygen_curve();
        let last_slope = (20.95 - 10.475) / (8.34 - 5.425);
        let expected = 20.95 + (10.0 - 8.34) * last_slope;
        assert!((curve.map(10.0) - expected).abs() < 1e-9);

        let first_slope = 10.475 / (5.425 - 1.592);
        let wrong = 20.95 + (10.0 - 8.34) * first_slope;
        assert!((curve.map(10.0) - wrong).abs() > 1e-3);
    }

    #[test]
    fn extrapolates_below_with_first_slope() {
        let curve = oxygen_curve();
        let first_slope = 10.475 / (5.425 - 1.592);
        let expected = (0.5 - 1.592) * first_slope;
        assert!((curve.map(0.5) - expected).abs() < 1e-9);
        assert!(curve.map(0.5) < 0.0);
    }

    #[test]
    fn rejects_malformed_curves() {
        assert_eq!(
            Err(CalibrationError::TooFewPoints(0)),
            CalibrationCurve::new(Vec::<(f64, f64)>::new())
        );
        assert_eq!(
            Err(CalibrationError::TooFewPoints(1)),
            CalibrationCurve::new(vec![(1.0, 1.0)])
        );
        assert_eq!(
            Err(CalibrationError::NotIncreasing { index: 1 }),
            CalibrationCurve::new(vec![(1.0, 1.0), (1.0, 2.0)])
        );
        assert_eq!(
            Err(CalibrationError::NotIncreasing { index: 2 }),
            CalibrationCurve::new(vec![(1.0, 1.0), (2.0, 2.0), (1.5, 3.0)])
        );
        assert_eq!(
            Err(CalibrationError::NotFinite { index: 1 }),
            CalibrationCurve::new(vec![(1.0, 1.0), (f64::NAN, 2.0)])
        );
    }
}
