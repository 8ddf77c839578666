//! Focus curve fitting
//!
//! [`CurveFitter`] decides where the focuser goes next and, once the minimum
//! is bracketed, fits one of three models to the (position, HFD) samples:
//!
//! - **Trend lines**: least-squares lines through the samples left and right
//!   of the best one, intersected
//! - **Parabolic**: least-squares `y = ax² + bx + c`
//! - **Hyperbolic**: `y = sqrt(k²(x - x0)² + b²)`, seeded by the parabola and
//!   refined iteratively
//!
//! Probing starts by moving outward `steps × step_size`, then walks inward
//! one `step_size` at a time until `steps` samples lie on each side of the
//! best sample. The run fails after `4 × steps + 1` samples.

use crate::device_ops::{FocusCurveFitter, FocusMove, FocusStep};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Points per fitted curve in chart data
const CHART_SAMPLES: usize = 10;

/// MAD to standard deviation
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CurveModel {
    TrendLines,
    Parabolic,
    #[default]
    Hyperbolic,
}

/// Probing and fitting parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FocusFitSettings {
    /// Samples wanted on each side of the minimum
    pub steps: u32,
    pub step_size: i32,
    pub model: CurveModel,
    /// Residual rejection threshold in sigmas, 0 disables
    pub outlier_sigma: f64,
}

impl Default for FocusFitSettings {
    fn default() -> Self {
        Self {
            steps: 4,
            step_size: 100,
            model: CurveModel::Hyperbolic,
            outlier_sigma: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FittedCurve {
    pub model: CurveModel,
    pub points: Vec<ChartPoint>,
    pub minimum: f64,
}

/// Samples and fitted curves, republished after every autofocus step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusChart {
    pub points: Vec<ChartPoint>,
    pub curves: Vec<FittedCurve>,
    /// Minimum of the selected model
    pub focus_point: Option<f64>,
}

// =============================================================================
// MODELS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Line {
    slope: f64,
    intercept: f64,
}

impl Line {
    fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Curve {
    Trend { left: Line, right: Line },
    /// Coefficients relative to `origin` to keep the normal equations well
    /// conditioned at large focuser positions
    Parabola { a: f64, b: f64, c: f64, origin: f64 },
    Hyperbola { x0: f64, k: f64, b: f64 },
}

impl Curve {
    fn at(&self, x: f64) -> f64 {
        match *self {
            Curve::Trend { left, right } => left.at(x).max(right.at(x)),
            Curve::Parabola { a, b, c, origin } => {
                let u = x - origin;
                a * u * u + b * u + c
            }
            Curve::Hyperbola { x0, k, b } => ((k * (x - x0)).powi(2) + b * b).sqrt(),
        }
    }

    fn minimum(&self) -> f64 {
        match *self {
            Curve::Trend { left, right } => (right.intercept - left.intercept) / (left.slope - right.slope),
            Curve::Parabola { a, b, origin, .. } => origin - b / (2.0 * a),
            Curve::Hyperbola { x0, .. } => x0,
        }
    }
}

fn by_x(a: &ChartPoint, b: &ChartPoint) -> Ordering {
    a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal)
}

fn by_y(a: &ChartPoint, b: &ChartPoint) -> Ordering {
    a.y.partial_cmp(&b.y).unwrap_or(Ordering::Equal)
}

/// Sorts `values` in place. Even counts average the two middle values.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn fit_line(points: &[ChartPoint]) -> Option<Line> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.x - mean_x).powi(2)).sum();
    if sxx < 1e-12 {
        return None;
    }
    let sxy: f64 = points.iter().map(|p| (p.x - mean_x) * (p.y - mean_y)).sum();
    let slope = sxy / sxx;
    Some(Line {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Least-squares parabola through `(x, y)` pairs, solved with Cramer's rule
fn fit_quadratic(points: &[(f64, f64)]) -> Option<(f64, f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let origin = points.iter().map(|p| p.0).sum::<f64>() / n;

    let (mut sx, mut sy, mut sx2, mut sx3, mut sx4, mut sxy, mut sx2y) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    for &(x, y) in points {
        let u = x - origin;
        sx += u;
        sy += y;
        sx2 += u * u;
        sx3 += u * u * u;
        sx4 += u * u * u * u;
        sxy += u * y;
        sx2y += u * u * y;
    }

    let det = n * (sx2 * sx4 - sx3 * sx3) - sx * (sx * sx4 - sx2 * sx3) + sx2 * (sx * sx3 - sx2 * sx2);
    if det.abs() < 1e-10 {
        return None;
    }
    let det_c = sy * (sx2 * sx4 - sx3 * sx3) - sx * (sxy * sx4 - sx2y * sx3) + sx2 * (sxy * sx3 - sx2y * sx2);
    let det_b = n * (sxy * sx4 - sx2y * sx3) - sy * (sx * sx4 - sx2 * sx3) + sx2 * (sx * sx2y - sxy * sx2);
    let det_a = n * (sx2 * sx2y - sx3 * sxy) - sx * (sx * sx2y - sx2 * sxy) + sy * (sx * sx3 - sx2 * sx2);

    Some((det_a / det, det_b / det, det_c / det, origin))
}

fn fit_parabola(points: &[ChartPoint]) -> Result<Curve, String> {
    let pairs: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
    let (a, b, c, origin) = fit_quadratic(&pairs).ok_or("Singular matrix in parabolic fit")?;
    if a <= 0.0 {
        return Err("Parabola does not have a minimum".to_string());
    }
    Ok(Curve::Parabola { a, b, c, origin })
}

fn fit_trend_lines(points: &[ChartPoint]) -> Result<Curve, String> {
    let best = points.iter().copied().min_by(by_y).ok_or("No samples")?;
    let left: Vec<ChartPoint> = points.iter().copied().filter(|p| p.x < best.x).collect();
    let right: Vec<ChartPoint> = points.iter().copied().filter(|p| p.x > best.x).collect();

    // The best sample belongs to both halves
    let with_best = |mut side: Vec<ChartPoint>| {
        side.push(best);
        side
    };
    let left = fit_line(&with_best(left)).ok_or("Not enough samples left of the minimum")?;
    let right = fit_line(&with_best(right)).ok_or("Not enough samples right of the minimum")?;

    if left.slope >= 0.0 || right.slope <= 0.0 {
        return Err("Trend lines do not form a V".to_string());
    }
    Ok(Curve::Trend { left, right })
}

fn fit_hyperbola(points: &[ChartPoint]) -> Result<Curve, String> {
    let seed = fit_parabola(points)?.minimum();

    // y² is a parabola in x with the same vertex
    let squared: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y * p.y)).collect();
    let (a, linear, c, origin) = fit_quadratic(&squared).ok_or("Singular matrix in hyperbolic fit")?;
    if a <= 0.0 {
        return Err("Hyperbola does not have a minimum".to_string());
    }
    let k = a.sqrt();
    let vertex = origin - linear / (2.0 * a);
    let floor = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let b_sq = c - linear * linear / (4.0 * a);
    let b = if b_sq > 0.0 { b_sq.sqrt().min(floor) } else { floor * 0.5 };

    let mut x0 = 0.5 * (seed + vertex);
    for _ in 0..10 {
        let mut sum = 0.0;
        let mut count = 0.0;
        for p in points {
            let excess = p.y * p.y - b * b;
            if excess <= 0.0 {
                continue;
            }
            let offset = excess.sqrt() / k;
            sum += p.x - offset * (p.x - x0).signum();
            count += 1.0;
        }
        if count > 0.0 {
            x0 = 0.7 * x0 + 0.3 * (sum / count);
        }
    }

    Ok(Curve::Hyperbola { x0, k, b })
}

fn fit(model: CurveModel, points: &[ChartPoint]) -> Result<Curve, String> {
    match model {
        CurveModel::TrendLines => fit_trend_lines(points),
        CurveModel::Parabolic => fit_parabola(points),
        CurveModel::Hyperbolic => fit_hyperbola(points),
    }
}

/// Drop samples whose residual against a parabola exceeds `sigma` robust
/// standard deviations. Returns the input when too few samples would remain.
fn reject_outliers(points: &[ChartPoint], sigma: f64) -> Vec<ChartPoint> {
    if sigma <= 0.0 || points.len() < 5 {
        return points.to_vec();
    }
    let Ok(curve) = fit_parabola(points) else {
        return points.to_vec();
    };
    let residuals: Vec<f64> = points.iter().map(|p| p.y - curve.at(p.x)).collect();
    let mut centered = residuals.clone();
    let center = median(&mut centered);
    let mut deviations: Vec<f64> = residuals.iter().map(|r| (r - center).abs()).collect();
    let mad = median(&mut deviations);
    if mad <= f64::EPSILON {
        return points.to_vec();
    }

    let threshold = sigma * MAD_SCALE * mad;
    let kept: Vec<ChartPoint> = points
        .iter()
        .zip(&residuals)
        .filter(|(_, r)| (*r - center).abs() <= threshold)
        .map(|(p, _)| *p)
        .collect();

    if kept.len() < 3 {
        points.to_vec()
    } else {
        if kept.len() < points.len() {
            tracing::debug!("Rejected {} focus samples as outliers", points.len() - kept.len());
        }
        kept
    }
}

// =============================================================================
// FITTER
// =============================================================================

/// Default [`FocusCurveFitter`]
#[derive(Debug, Clone)]
pub struct CurveFitter {
    settings: FocusFitSettings,
    samples: Vec<ChartPoint>,
    taken: u32,
}

impl CurveFitter {
    pub fn new(settings: FocusFitSettings) -> Self {
        Self {
            settings,
            samples: Vec::new(),
            taken: 0,
        }
    }

    fn max_samples(&self) -> u32 {
        4 * self.settings.steps + 1
    }

    fn best(&self) -> Option<ChartPoint> {
        self.samples.iter().copied().min_by(by_y)
    }

    /// Samples strictly left and right of the best one
    fn sides(&self) -> (u32, u32) {
        let Some(best) = self.best() else {
            return (0, 0);
        };
        let left = self.samples.iter().filter(|p| p.x < best.x).count() as u32;
        let right = self.samples.iter().filter(|p| p.x > best.x).count() as u32;
        (left, right)
    }

    fn sampled(&self, position: i32) -> bool {
        self.samples.iter().any(|p| p.x as i32 == position)
    }

    fn extent(&self) -> Option<(f64, f64)> {
        let lo = self.samples.iter().copied().min_by(by_x)?.x;
        let hi = self.samples.iter().copied().max_by(by_x)?.x;
        Some((lo, hi))
    }

    fn finish(&self) -> FocusStep {
        let points = reject_outliers(&self.samples, self.settings.outlier_sigma);
        let curve = match fit(self.settings.model, &points) {
            Ok(curve) => curve,
            Err(reason) => return FocusStep::Failed(reason),
        };
        let focus = curve.minimum();
        let Some((lo, hi)) = self.extent() else {
            return FocusStep::Failed("No samples".to_string());
        };
        if !focus.is_finite() || focus < lo || focus > hi {
            return FocusStep::Failed(format!(
                "Fitted focus point {:.0} lies outside the sampled range {:.0}..{:.0}",
                focus, lo, hi
            ));
        }
        FocusStep::Completed {
            focus_point: focus.round() as i32,
        }
    }
}

impl FocusCurveFitter for CurveFitter {
    fn add(&mut self, position: i32, hfd: f64) -> FocusStep {
        self.taken += 1;
        if hfd.is_finite() && hfd > 0.0 {
            self.samples.push(ChartPoint {
                x: position as f64,
                y: hfd,
            });
        } else {
            tracing::warn!("Ignoring invalid HFD {} at position {}", hfd, position);
        }

        let steps = self.settings.steps.max(1);
        let step_size = self.settings.step_size.max(1);

        if self.taken == 1 {
            return FocusStep::Move(FocusMove::Absolute(position + steps as i32 * step_size));
        }

        let (left, right) = self.sides();
        if left >= steps && right >= steps {
            return self.finish();
        }
        if self.taken >= self.max_samples() {
            return FocusStep::Failed(format!(
                "No focus minimum found after {} samples",
                self.taken
            ));
        }

        let Some((_, hi)) = self.extent() else {
            // Nothing usable yet, keep walking inward
            return FocusStep::Move(FocusMove::Relative(-step_size));
        };
        let target = if left < steps {
            let mut target = position - step_size;
            while self.sampled(target) {
                target -= step_size;
            }
            target
        } else {
            hi as i32 + step_size
        };
        if target == position - step_size {
            FocusStep::Move(FocusMove::Relative(-step_size))
        } else if target == position + step_size {
            FocusStep::Move(FocusMove::Relative(step_size))
        } else {
            FocusStep::Move(FocusMove::Absolute(target))
        }
    }

    fn chart(&self) -> FocusChart {
        let mut points = self.samples.clone();
        points.sort_by(by_x);

        let mut chart = FocusChart {
            points,
            ..FocusChart::default()
        };
        let Some((lo, hi)) = self.extent() else {
            return chart;
        };
        let fitted = reject_outliers(&self.samples, self.settings.outlier_sigma);

        for model in [CurveModel::TrendLines, CurveModel::Parabolic, CurveModel::Hyperbolic] {
            let Ok(curve) = fit(model, &fitted) else {
                continue;
            };
            let span = hi - lo;
            let points = (0..CHART_SAMPLES)
                .map(|i| {
                    let x = lo + span * i as f64 / (CHART_SAMPLES - 1) as f64;
                    ChartPoint { x, y: curve.at(x) }
                })
                .collect();
            if model == self.settings.model {
                chart.focus_point = Some(curve.minimum());
            }
            chart.curves.push(FittedCurve {
                model,
                points,
                minimum: curve.minimum(),
            });
        }
        chart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyperbola(x: f64) -> f64 {
        ((0.01 * (x - 5000.0)).powi(2) + 2.0f64.powi(2)).sqrt()
    }

    fn points(samples: &[(f64, f64)]) -> Vec<ChartPoint> {
        samples.iter().map(|&(x, y)| ChartPoint { x, y }).collect()
    }

    /// Feed the fitter the way the autofocus task does
    fn drive(fitter: &mut CurveFitter, start: i32, hfd: impl Fn(f64) -> f64) -> FocusStep {
        let mut position = start;
        loop {
            match fitter.add(position, hfd(position as f64)) {
                FocusStep::Move(FocusMove::Absolute(target)) => position = target,
                FocusStep::Move(FocusMove::Relative(delta)) => position += delta,
                done => return done,
            }
        }
    }

    #[test]
    fn test_parabolic_fit() {
        let samples = points(&[
            (4500.0, 3.5),
            (4700.0, 2.5),
            (4900.0, 2.1),
            (5000.0, 2.0),
            (5100.0, 2.1),
            (5300.0, 2.5),
            (5500.0, 3.5),
        ]);
        let curve = fit_parabola(&samples).unwrap();
        assert!((curve.minimum() - 5000.0).abs() < 50.0);
    }

    #[test]
    fn test_trend_lines_intersect_at_the_v() {
        let samples = points(&[(1000.0, 5.0), (1100.0, 4.0), (1200.0, 3.0), (1300.0, 4.0), (1400.0, 5.0)]);
        let curve = fit_trend_lines(&samples).unwrap();
        assert!((curve.minimum() - 1200.0).abs() < 1.0);
    }

    #[test]
    fn test_hyperbolic_fit_recovers_center() {
        let samples: Vec<ChartPoint> = (0..9)
            .map(|i| {
                let x = 4600.0 + 100.0 * i as f64;
                ChartPoint { x, y: hyperbola(x) }
            })
            .collect();
        let curve = fit_hyperbola(&samples).unwrap();
        assert!((curve.minimum() - 5000.0).abs() < 10.0, "got {}", curve.minimum());
    }

    #[test]
    fn test_median_of_star_sizes() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        // Two stars at 2.0 and two at 3.0 give 2.5, not the upper 3.0
        assert_eq!(median(&mut [3.0, 2.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn test_outlier_is_rejected() {
        let mut samples: Vec<ChartPoint> = (0..9)
            .map(|i| {
                let x = 1000.0 + 100.0 * i as f64;
                ChartPoint { x, y: 2.0 + ((x - 1400.0) / 200.0).powi(2) }
            })
            .collect();
        samples[2].y = 12.0;
        let kept = reject_outliers(&samples, 3.0);
        assert_eq!(kept.len(), 8);
        assert!(kept.iter().all(|p| p.y < 12.0));
    }

    #[test]
    fn test_probing_starts_outward_then_steps_inward() {
        let mut fitter = CurveFitter::new(FocusFitSettings::default());
        assert_eq!(fitter.add(5000, hyperbola(5000.0)), FocusStep::Move(FocusMove::Absolute(5400)));
        for position in [5400, 5300, 5200] {
            assert_eq!(
                fitter.add(position, hyperbola(position as f64)),
                FocusStep::Move(FocusMove::Relative(-100))
            );
        }
        // 5000 was the starting sample
        assert_eq!(fitter.add(5100, hyperbola(5100.0)), FocusStep::Move(FocusMove::Absolute(4900)));
    }

    #[test]
    fn test_converges_on_synthetic_curve() {
        for model in [CurveModel::TrendLines, CurveModel::Parabolic, CurveModel::Hyperbolic] {
            let mut fitter = CurveFitter::new(FocusFitSettings {
                model,
                ..FocusFitSettings::default()
            });
            match drive(&mut fitter, 5200, hyperbola) {
                FocusStep::Completed { focus_point } => {
                    assert!((focus_point - 5000).abs() <= 60, "{:?}: {}", model, focus_point)
                }
                other => panic!("{:?}: {:?}", model, other),
            }

            let chart = fitter.chart();
            assert!(chart.focus_point.is_some());
            assert!(chart.curves.iter().all(|c| c.points.len() == CHART_SAMPLES));
        }
    }

    #[test]
    fn test_fails_without_minimum() {
        let settings = FocusFitSettings::default();
        let mut fitter = CurveFitter::new(settings);
        // Keeps improving inward, the minimum is never bracketed
        let result = drive(&mut fitter, 5000, |x| x / 1000.0);
        assert!(matches!(result, FocusStep::Failed(_)));
        assert_eq!(fitter.taken, 4 * settings.steps + 1);
    }
}
