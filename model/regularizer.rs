//! # Smoothness Regularizer
//!
//! Penalizes jagged population-size histories. A natural cubic spline is fitted
//! through one control point per epoch, with the abscissa at the midpoint of the
//! epoch in log-time and the ordinate at the epoch's start size (optionally in
//! log space). The penalty is the integrated squared second derivative of that
//! spline, scaled by a user penalty:
//!
//! ```text
//! penalty * sum_k  ∫_0^{h_k} (6 a_k u + 2 b_k)^2 du
//!         = penalty * sum_k (12 a_k^2 h_k^3 + 12 a_k b_k h_k^2 + 4 b_k^2 h_k)
//! ```
//!
//! Everything is generic over [`Scalar`], so evaluating on a [`Dual`]-lifted model
//! yields the gradient of the penalty with respect to the model coordinates.
//!
//! [`Dual`]: crate::dual::Dual

use crate::demography::DemographicModel;
use crate::dual::Scalar;
use crate::tridiagonal::{TridiagonalError, solve_tridiagonal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegularizationError {
    #[error("Spline regularization needs at least two epochs, but the model has {0}.")]
    InvalidModel(usize),

    #[error("Penalty must be finite and positive, got {0}.")]
    InvalidPenalty(f64),

    #[error("Unknown regularizer metric '{0}'. Expected abs, quadratic, logabs or logquadratic.")]
    UnknownMetric(String),

    #[error("Cannot take the log of non-positive size {size} at epoch {epoch}.")]
    NonPositiveSize { epoch: usize, size: f64 },

    #[error("Spline knots must be strictly increasing; knot {0} is not.")]
    NonIncreasingKnots(usize),

    #[error("Spline needs matching knot and value counts of at least two, got {knots} and {values}.")]
    KnotCountMismatch { knots: usize, values: usize },

    #[error("Spline system could not be solved: {0}")]
    Solver(#[from] TridiagonalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    Abs,
    Quadratic,
}

/// Regularizer metric selector, written `abs`, `quadratic`, `logabs` or
/// `logquadratic`.
///
/// Only the `log` prefix changes the penalty: it moves the size axis into log
/// space before the spline is fitted. The curvature integral does not depend on
/// the abs/quadratic kind, which is kept for configuration compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegularizerMetric {
    pub log: bool,
    pub kind: MetricKind,
}

impl Default for RegularizerMetric {
    fn default() -> Self {
        Self {
            log: false,
            kind: MetricKind::Quadratic,
        }
    }
}

impl FromStr for RegularizerMetric {
    type Err = RegularizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (log, rest) = match s.strip_prefix("log") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let kind = match rest {
            "abs" => MetricKind::Abs,
            "quadratic" => MetricKind::Quadratic,
            _ => return Err(RegularizationError::UnknownMetric(s.to_string())),
        };
        Ok(Self { log, kind })
    }
}

impl fmt::Display for RegularizerMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.log {
            f.write_str("log")?;
        }
        f.write_str(match self.kind {
            MetricKind::Abs => "abs",
            MetricKind::Quadratic => "quadratic",
        })
    }
}

impl TryFrom<String> for RegularizerMetric {
    type Error = RegularizationError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegularizerMetric> for String {
    fn from(metric: RegularizerMetric) -> Self {
        metric.to_string()
    }
}

/// Coefficients of `a·u³ + b·u² + c·u + d` on one spline segment, `u = x - x_k`.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineSegment<S> {
    pub a: S,
    pub b: S,
    pub c: S,
    pub d: S,
}

/// Natural cubic spline: zero second derivative at both end knots.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalCubicSpline<S> {
    knots: Vec<f64>,
    segments: Vec<SplineSegment<S>>,
}

impl<S: Scalar> NaturalCubicSpline<S> {
    /// Fits the spline through `(x[k], y[k])`.
    ///
    /// The unknowns are the quadratic coefficients `b_k` at every knot; interior
    /// rows read `h_{k-1}/3 b_{k-1} + 2(h_{k-1}+h_k)/3 b_k + h_k/3 b_{k+1} =
    /// Δ_k - Δ_{k-1}` with `Δ_k` the secant slope, and the end rows pin `b` to 0.
    pub fn fit(x: &[f64], y: &[S]) -> Result<Self, RegularizationError> {
        let k = x.len();
        if k < 2 || y.len() != k {
            return Err(RegularizationError::KnotCountMismatch {
                knots: k,
                values: y.len(),
            });
        }
        if let Some(i) = (1..k).find(|&i| !(x[i] > x[i - 1])) {
            return Err(RegularizationError::NonIncreasingKnots(i));
        }

        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        let slopes: Vec<S> = (0..k - 1)
            .map(|i| (y[i + 1].clone() - y[i].clone()) / h[i])
            .collect();

        let mut sub = vec![S::zero(); k - 1];
        let mut diag = vec![S::one(); k];
        let mut sup = vec![S::zero(); k - 1];
        let mut rhs = vec![S::zero(); k];
        for row in 1..k - 1 {
            sub[row - 1] = S::constant(h[row - 1] / 3.0);
            diag[row] = S::constant(2.0 * (h[row - 1] + h[row]) / 3.0);
            sup[row] = S::constant(h[row] / 3.0);
            rhs[row] = slopes[row].clone() - slopes[row - 1].clone();
        }
        let b = solve_tridiagonal(&sub, &diag, &sup, &rhs)?;

        let segments = (0..k - 1)
            .map(|i| SplineSegment {
                a: (b[i + 1].clone() - b[i].clone()) / (3.0 * h[i]),
                b: b[i].clone(),
                c: slopes[i].clone() - (b[i].clone() * 2.0 + b[i + 1].clone()) * (h[i] / 3.0),
                d: y[i].clone(),
            })
            .collect();
        Ok(Self {
            knots: x.to_vec(),
            segments,
        })
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn segments(&self) -> &[SplineSegment<S>] {
        &self.segments
    }

    /// Integrated squared second derivative over the whole knot range.
    pub fn curvature(&self) -> S {
        self.segments
            .iter()
            .zip(self.knots.windows(2))
            .fold(S::zero(), |acc, (seg, w)| {
                let h = w[1] - w[0];
                let a = seg.a.clone();
                let b = seg.b.clone();
                acc + a.clone() * a.clone() * (12.0 * h.powi(3))
                    + a * b.clone() * (12.0 * h * h)
                    + b.clone() * b * (4.0 * h)
            })
    }

    /// Evaluates the spline, extrapolating with the end segments outside the knots.
    pub fn evaluate(&self, x: f64) -> S {
        let last = self.segments.len() - 1;
        let idx = self.knots.partition_point(|&knot| knot <= x).saturating_sub(1).min(last);
        let seg = &self.segments[idx];
        let u = x - self.knots[idx];
        seg.a.clone() * u.powi(3) + seg.b.clone() * (u * u) + seg.c.clone() * u + seg.d.clone()
    }
}

/// Control-point abscissae for epochs with the given spans: midpoints of the
/// log cumulative boundaries, with the last point on the final boundary.
pub fn control_abscissae(spans: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    let log_bounds: Vec<f64> = spans
        .iter()
        .map(|s| {
            acc += s;
            f64::ln(acc)
        })
        .collect();
    let mut xs: Vec<f64> = log_bounds.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    if let Some(&last) = log_bounds.last() {
        xs.push(last);
    }
    xs
}

/// Fits the smoothing spline through the model's size trajectory.
pub fn fit_size_spline<S: Scalar>(
    model: &DemographicModel<S>,
    metric: RegularizerMetric,
) -> Result<NaturalCubicSpline<S>, RegularizationError> {
    let k = model.num_epochs();
    if k < 2 {
        return Err(RegularizationError::InvalidModel(k));
    }
    let x = control_abscissae(model.spans());
    let sizes = model.start_sizes();
    let y: Vec<S> = if metric.log {
        sizes
            .iter()
            .enumerate()
            .map(|(epoch, size)| {
                if size.value() > 0.0 {
                    Ok(size.clone().ln())
                } else {
                    Err(RegularizationError::NonPositiveSize {
                        epoch,
                        size: size.value(),
                    })
                }
            })
            .collect::<Result<_, _>>()?
    } else {
        sizes.to_vec()
    };
    NaturalCubicSpline::fit(&x, &y)
}

/// Curvature penalty of the model's size trajectory, scaled by `penalty`.
pub fn regularizer<S: Scalar>(
    model: &DemographicModel<S>,
    penalty: f64,
    metric: RegularizerMetric,
) -> Result<S, RegularizationError> {
    if !(penalty.is_finite() && penalty > 0.0) {
        return Err(RegularizationError::InvalidPenalty(penalty));
    }
    let spline = fit_size_spline(model, metric)?;
    Ok(spline.curvature() * penalty)
}

/// A penalty on a model, usable with any scalar kind.
pub trait Penalizer {
    fn penalize<S: Scalar>(&self, model: &DemographicModel<S>) -> Result<S, RegularizationError>;
}

/// The spline curvature penalty with a fixed weight and metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplineRegularizer {
    penalty: f64,
    metric: RegularizerMetric,
}

impl SplineRegularizer {
    pub fn new(penalty: f64, metric: RegularizerMetric) -> Result<Self, RegularizationError> {
        if !(penalty.is_finite() && penalty > 0.0) {
            return Err(RegularizationError::InvalidPenalty(penalty));
        }
        Ok(Self { penalty, metric })
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn metric(&self) -> RegularizerMetric {
        self.metric
    }
}

impl Penalizer for SplineRegularizer {
    fn penalize<S: Scalar>(&self, model: &DemographicModel<S>) -> Result<S, RegularizationError> {
        regularizer(model, self.penalty, self.metric)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoPenalty;

impl Penalizer for NoPenalty {
    fn penalize<S: Scalar>(&self, _model: &DemographicModel<S>) -> Result<S, RegularizationError> {
        Ok(S::zero())
    }
}
