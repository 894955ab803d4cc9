//! # SFS Pretraining
//!
//! Calibrates the free size coordinates of a [`DemographicModel`] against an
//! observed distinguished SFS before the full HMM fit. The objective is the
//! cross-entropy between the observed undistinguished SFS and the one predicted
//! by the oracle, plus a regularization penalty. Value and gradient come from a
//! single forward-mode pass over a [`Dual`]-lifted copy of the model.
//!
//! Box constraints are handled by a logistic reparameterization: each coordinate
//! `x ∈ (low, high)` is driven by an unconstrained `z` with
//! `x = low + (high - low) · σ(z)`, and the quasi-Newton search runs in `z`.
//!
//! [`Dual`]: crate::dual::Dual

use super::oracle::{OracleError, SfsOracle, T_MAX};
use super::sfs::{SfsError, cross_entropy, normalize_sfs, undistinguished_sfs};
use crate::demography::{Coordinate, CoordinateBounds, DemographicModel, ModelError};
use crate::regularizer::{Penalizer, RegularizationError};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use thiserror::Error;
use wolfe_bfgs::Bfgs;

/// Keeps starting points this fraction of the bound width away from the walls,
/// where the logistic map saturates.
const BOUNDARY_MARGIN: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum PretrainError {
    #[error("SFS oracle failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("Regularization failed: {0}")]
    Regularization(#[from] RegularizationError),

    #[error("Model update failed: {0}")]
    Model(#[from] ModelError),

    #[error("Objective evaluation failed: {0}")]
    Sfs(#[from] SfsError),

    #[error("Observed SFS is unusable: {0}")]
    InvalidObservedSfs(String),

    #[error("Mutation rate scale theta0 must be finite and positive, got {0}.")]
    InvalidTheta(f64),

    #[error("No bounds were supplied for coordinate {0}.")]
    MissingBounds(Coordinate),

    #[error("Bounds ({low}, {high}) for coordinate {coord} must be finite with low < high.")]
    InvalidBounds { coord: Coordinate, low: f64, high: f64 },

    #[error("Oracle returned an SFS of shape {found:?}; expected {expected:?}.")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Pretraining objective is not finite at the starting point: {0}")]
    NonFiniteObjective(f64),

    #[error("Pretraining optimization failed: {0}")]
    OptimizationFailed(String),
}

/// Stopping rules for the quasi-Newton search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    /// Convergence tolerance on the gradient norm, measured in the unconstrained
    /// (logistic) coordinates the search runs in. This is not a tolerance on the
    /// change in parameter values between iterations.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            max_iterations: 100,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Logistic map between `R^d` and the open box of per-coordinate bounds.
struct BoxTransform {
    low: Vec<f64>,
    high: Vec<f64>,
}

impl BoxTransform {
    fn to_bounded(&self, z: &Array1<f64>) -> Vec<f64> {
        z.iter()
            .zip(self.low.iter().zip(&self.high))
            .map(|(&z, (&lo, &hi))| lo + (hi - lo) * sigmoid(z))
            .collect()
    }

    fn to_unbounded(&self, x: &[f64]) -> Array1<f64> {
        x.iter()
            .zip(self.low.iter().zip(&self.high))
            .map(|(&x, (&lo, &hi))| {
                let p = ((x - lo) / (hi - lo)).clamp(BOUNDARY_MARGIN, 1.0 - BOUNDARY_MARGIN);
                (p / (1.0 - p)).ln()
            })
            .collect()
    }

    /// `dx/dz` for every coordinate, evaluated at the bounded point `x`.
    fn jacobian(&self, x: &[f64]) -> Array1<f64> {
        x.iter()
            .zip(self.low.iter().zip(&self.high))
            .map(|(&x, (&lo, &hi))| ((x - lo) * (hi - x) / (hi - lo)).max(0.0))
            .collect()
    }
}

/// Objective state for one pretraining run. Holds the first fatal error so that
/// no further oracle calls are made once one has failed, and the best finite
/// point seen so far.
struct PretrainObjective<'a, O, P> {
    model: &'a DemographicModel,
    coords: &'a [Coordinate],
    observed: Array1<f64>,
    expected_shape: (usize, usize),
    sample_size: usize,
    theta0: f64,
    folded: bool,
    oracle: &'a O,
    penalizer: &'a P,
    transform: BoxTransform,
    fatal: RefCell<Option<PretrainError>>,
    best: RefCell<Option<(f64, Array1<f64>)>>,
    evaluations: Cell<usize>,
}

impl<O: SfsOracle, P: Penalizer> PretrainObjective<'_, O, P> {
    /// Objective value and gradient with respect to the bounded coordinates.
    fn evaluate(&self, x: &[f64]) -> Result<(f64, Array1<f64>), PretrainError> {
        self.evaluations.set(self.evaluations.get() + 1);
        let trial = self.model.lift(self.coords, x)?;

        log::debug!("requesting pooled sfs at {x:?}");
        let raw = self
            .oracle
            .raw_sfs(&trial, self.sample_size, 0.0, T_MAX, true)?;
        if raw.dim() != self.expected_shape {
            return Err(PretrainError::ShapeMismatch {
                expected: self.expected_shape,
                found: raw.dim(),
            });
        }

        let predicted = undistinguished_sfs(normalize_sfs(&raw, self.theta0).view(), self.folded);
        let divergence = cross_entropy(self.observed.view(), &predicted)?;
        let penalty = self.penalizer.penalize(&trial)?;
        log::debug!(
            "divergence {:.6}, penalty {:.6}",
            divergence.value(),
            penalty.value()
        );

        let total = divergence + penalty;
        Ok((total.value(), total.partials(self.coords.len())))
    }

    /// Value and gradient in the unconstrained space, in the form the solver wants.
    fn cost_and_grad(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let dim = z.len();
        if self.fatal.borrow().is_some() {
            return (f64::INFINITY, Array1::zeros(dim));
        }
        let x = self.transform.to_bounded(z);
        match self.evaluate(&x) {
            Ok((value, grad)) if value.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                let mut best = self.best.borrow_mut();
                if best.as_ref().is_none_or(|(cost, _)| value < *cost) {
                    *best = Some((value, z.clone()));
                }
                (value, grad * &self.transform.jacobian(&x))
            }
            Ok((value, _)) => {
                log::warn!("non-finite pretraining objective {value} at {x:?}");
                (f64::INFINITY, Array1::zeros(dim))
            }
            Err(PretrainError::Sfs(SfsError::NonPositiveProbability { index, value })) => {
                log::warn!("predicted SFS entry {index} is {value} at {x:?}; rejecting step");
                (f64::INFINITY, Array1::zeros(dim))
            }
            Err(err) => {
                log::warn!("pretraining aborted: {err}");
                *self.fatal.borrow_mut() = Some(err);
                (f64::INFINITY, Array1::zeros(dim))
            }
        }
    }

    fn take_fatal(&self) -> Option<PretrainError> {
        self.fatal.borrow_mut().take()
    }
}

/// Fits model sizes to an observed SFS by bounded quasi-Newton search.
#[derive(Debug, Clone)]
pub struct SfsPretrainer<'a, O, P> {
    oracle: &'a O,
    penalizer: &'a P,
    theta0: f64,
    folded: bool,
    config: PretrainConfig,
}

impl<'a, O: SfsOracle, P: Penalizer> SfsPretrainer<'a, O, P> {
    pub fn new(oracle: &'a O, penalizer: &'a P, theta0: f64) -> Result<Self, PretrainError> {
        if !(theta0.is_finite() && theta0 > 0.0) {
            return Err(PretrainError::InvalidTheta(theta0));
        }
        Ok(Self {
            oracle,
            penalizer,
            theta0,
            folded: false,
            config: PretrainConfig::default(),
        })
    }

    /// Compare folded spectra, for data without a reliable ancestral allele.
    pub fn folded(mut self, folded: bool) -> Self {
        self.folded = folded;
        self
    }

    pub fn with_config(mut self, config: PretrainConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs pretraining and writes the optimum back into `model`.
    ///
    /// `observed` is the empirical distinguished SFS of shape `(3, n + 1)`. Every
    /// optimizable coordinate of `model` needs an entry in `bounds`. On success the
    /// oracle is queried once more, without pooling, at the fitted parameters and
    /// that raw SFS is returned. Oracle failures abort the run without retry and
    /// leave `model` unchanged.
    pub fn run(
        &self,
        model: &mut DemographicModel,
        observed: ArrayView2<f64>,
        bounds: &CoordinateBounds,
    ) -> Result<Array2<f64>, PretrainError> {
        let (rows, cols) = observed.dim();
        if rows != 3 || cols < 2 {
            return Err(PretrainError::InvalidObservedSfs(format!(
                "expected shape (3, n + 1) with n >= 1, got ({rows}, {cols})"
            )));
        }
        if observed.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PretrainError::InvalidObservedSfs(
                "entries must be finite and non-negative".to_string(),
            ));
        }
        let sample_size = cols + 1;
        let observed_usfs = undistinguished_sfs(observed, self.folded);
        if observed_usfs.sum() <= 0.0 {
            return Err(PretrainError::InvalidObservedSfs(
                "spectrum carries no mass".to_string(),
            ));
        }

        let coords = model.optimizable_coordinates();
        let mut low = Vec::with_capacity(coords.len());
        let mut high = Vec::with_capacity(coords.len());
        let mut x0 = Vec::with_capacity(coords.len());
        for &coord in &coords {
            let &(lo, hi) = bounds
                .get(&coord)
                .ok_or(PretrainError::MissingBounds(coord))?;
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(PretrainError::InvalidBounds {
                    coord,
                    low: lo,
                    high: hi,
                });
            }
            low.push(lo);
            high.push(hi);
            x0.push(*model.get(coord)?);
        }
        log::debug!(
            "pretraining {} coordinates against an SFS with sample size {sample_size}",
            coords.len()
        );

        let fitted = {
            let objective = PretrainObjective {
                model: &*model,
                coords: &coords,
                observed: observed_usfs,
                expected_shape: (rows, cols),
                sample_size,
                theta0: self.theta0,
                folded: self.folded,
                oracle: self.oracle,
                penalizer: self.penalizer,
                transform: BoxTransform { low, high },
                fatal: RefCell::new(None),
                best: RefCell::new(None),
                evaluations: Cell::new(0),
            };

            let z0 = objective.transform.to_unbounded(&x0);
            let (initial_cost, _) = objective.cost_and_grad(&z0);
            if let Some(err) = objective.take_fatal() {
                return Err(err);
            }
            if !initial_cost.is_finite() {
                return Err(PretrainError::NonFiniteObjective(initial_cost));
            }
            log::debug!("initial pretraining objective: {initial_cost:.6}");

            let result = Bfgs::new(z0, |z: &Array1<f64>| objective.cost_and_grad(z))
                .with_tolerance(self.config.tolerance)
                .with_max_iterations(self.config.max_iterations)
                .run();
            if let Some(err) = objective.take_fatal() {
                return Err(err);
            }
            let final_point = match result {
                Ok(solution) => {
                    log::debug!(
                        "pretraining converged after {} iterations and {} evaluations, objective {:.6}",
                        solution.iterations,
                        objective.evaluations.get(),
                        solution.final_value
                    );
                    solution.final_point
                }
                Err(err) => {
                    // Line-search stalls and the iteration cap keep the best point found.
                    let Some((cost, point)) = objective.best.borrow_mut().take() else {
                        return Err(PretrainError::OptimizationFailed(format!("{err:?}")));
                    };
                    log::warn!(
                        "pretraining stopped early ({err:?}); keeping best objective {cost:.6} after {} evaluations",
                        objective.evaluations.get()
                    );
                    point
                }
            };
            objective.transform.to_bounded(&final_point)
        };

        for (&coord, &value) in coords.iter().zip(&fitted) {
            model.set(coord, value)?;
        }
        log::info!("pre-trained model:\n{model}");

        Ok(self
            .oracle
            .raw_sfs(&*model, sample_size, 0.0, T_MAX, false)?)
    }
}

/// Pretrains `model` against `observed` with the default stopping rules.
pub fn pretrain<O: SfsOracle, P: Penalizer>(
    model: &mut DemographicModel,
    observed: ArrayView2<f64>,
    bounds: &CoordinateBounds,
    theta0: f64,
    penalizer: &P,
    folded: bool,
    oracle: &O,
) -> Result<Array2<f64>, PretrainError> {
    SfsPretrainer::new(oracle, penalizer, theta0)?
        .folded(folded)
        .run(model, observed, bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dual::Scalar;
    use crate::regularizer::NoPenalty;
    use ndarray::array;

    /// Fails on the `fail_at`-th call and counts every call it receives.
    struct FlakyOracle {
        fail_at: usize,
        calls: Cell<usize>,
    }

    impl SfsOracle for FlakyOracle {
        fn raw_sfs<S: Scalar>(
            &self,
            model: &DemographicModel<S>,
            sample_size: usize,
            _t_min: f64,
            _t_max: f64,
            _pooled: bool,
        ) -> Result<Array2<S>, OracleError> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if call >= self.fail_at {
                return Err(OracleError::NumericalInstability(format!("call {call}")));
            }
            let size = model.start_sizes()[0].clone();
            Ok(Array2::from_shape_fn((3, sample_size - 1), |(i, j)| {
                size.clone() * (0.01 / (1 + i + j) as f64)
            }))
        }
    }

    fn observed() -> Array2<f64> {
        array![[0.9, 0.02, 0.01], [0.03, 0.01, 0.005], [0.01, 0.005, 0.01]]
    }

    fn model() -> DemographicModel {
        DemographicModel::new(vec![1.0, 2.0], 1.0)
            .unwrap()
            .with_flat_pieces([0, 1])
            .unwrap()
    }

    #[test]
    fn oracle_failure_at_start_is_fatal() {
        let oracle = FlakyOracle {
            fail_at: 1,
            calls: Cell::new(0),
        };
        let mut m = model();
        let bounds = m.bounds();
        let err = pretrain(&mut m, observed().view(), &bounds, 1.0, &NoPenalty, false, &oracle)
            .unwrap_err();
        assert!(matches!(
            err,
            PretrainError::Oracle(OracleError::NumericalInstability(_))
        ));
        assert_eq!(oracle.calls.get(), 1);
    }

    #[test]
    fn oracle_failure_mid_run_stops_further_queries_and_leaves_model_alone() {
        let oracle = FlakyOracle {
            fail_at: 3,
            calls: Cell::new(0),
        };
        let mut m = model();
        let before = m.clone();
        let bounds = m.bounds();
        let err = pretrain(&mut m, observed().view(), &bounds, 1.0, &NoPenalty, false, &oracle)
            .unwrap_err();
        assert!(matches!(err, PretrainError::Oracle(_)));
        assert_eq!(oracle.calls.get(), 3);
        assert_eq!(m, before);
    }

    #[test]
    fn every_coordinate_needs_bounds() {
        let oracle = FlakyOracle {
            fail_at: usize::MAX,
            calls: Cell::new(0),
        };
        let mut m = model();
        let mut bounds = m.bounds();
        let first = *bounds.keys().next().unwrap();
        bounds.remove(&first);
        assert!(matches!(
            pretrain(&mut m, observed().view(), &bounds, 1.0, &NoPenalty, false, &oracle),
            Err(PretrainError::MissingBounds(c)) if c == first
        ));

        let mut inverted = m.bounds();
        inverted.insert(first, (2.0, 1.0));
        assert!(matches!(
            pretrain(&mut m, observed().view(), &inverted, 1.0, &NoPenalty, false, &oracle),
            Err(PretrainError::InvalidBounds { .. })
        ));
        assert_eq!(oracle.calls.get(), 0);
    }

    #[test]
    fn rejects_malformed_inputs() {
        let oracle = FlakyOracle {
            fail_at: usize::MAX,
            calls: Cell::new(0),
        };
        assert!(matches!(
            SfsPretrainer::new(&oracle, &NoPenalty, 0.0),
            Err(PretrainError::InvalidTheta(_))
        ));
        let mut m = model();
        let bounds = m.bounds();
        let wrong_rows = Array2::<f64>::ones((2, 3));
        assert!(matches!(
            pretrain(&mut m, wrong_rows.view(), &bounds, 1.0, &NoPenalty, false, &oracle),
            Err(PretrainError::InvalidObservedSfs(_))
        ));
    }

    #[test]
    fn box_transform_round_trips_and_stays_inside() {
        let transform = BoxTransform {
            low: vec![0.1, -2.0],
            high: vec![10.0, 3.0],
        };
        let x = [2.5, 0.0];
        let back = transform.to_bounded(&transform.to_unbounded(&x));
        assert!((back[0] - 2.5).abs() < 1e-10 && back[1].abs() < 1e-10);

        let extreme = transform.to_bounded(&array![-800.0, 800.0]);
        assert!(extreme[0] >= 0.1 && extreme[1] <= 3.0);
        let jac = transform.jacobian(&x);
        assert!((jac[0] - (2.4 * 7.5 / 9.9)).abs() < 1e-12);
    }

    /// Spectrum linear in the epoch start sizes, one distinct shape per epoch.
    struct LinearOracle;

    impl SfsOracle for LinearOracle {
        fn raw_sfs<S: Scalar>(
            &self,
            model: &DemographicModel<S>,
            sample_size: usize,
            _t_min: f64,
            _t_max: f64,
            _pooled: bool,
        ) -> Result<Array2<S>, OracleError> {
            let sizes = model.start_sizes();
            Ok(Array2::from_shape_fn((3, sample_size - 1), |(i, j)| {
                let m = (i + j) as i32;
                sizes.iter().enumerate().fold(S::zero(), |acc, (k, size)| {
                    acc + size.clone() * (0.002 * ((k + 1) as f64).powi(m) / f64::from(m + 1))
                })
            }))
        }
    }

    fn three_epochs(sizes: [f64; 3]) -> DemographicModel {
        let mut m = DemographicModel::new(vec![0.5, 1.0, 2.0], 1.0)
            .unwrap()
            .with_flat_pieces(0..3)
            .unwrap();
        for (coord, size) in m.optimizable_coordinates().into_iter().zip(sizes) {
            m.set(coord, size).unwrap();
        }
        m
    }

    fn uniform_bounds(m: &DemographicModel, low: f64, high: f64) -> CoordinateBounds {
        m.optimizable_coordinates()
            .into_iter()
            .map(|coord| (coord, (low, high)))
            .collect()
    }

    /// Pseudo-counts drawn from the constant-size history at `theta0`.
    fn observed_at_truth(theta0: f64) -> Array2<f64> {
        let raw = LinearOracle
            .raw_sfs(&three_epochs([1.0; 3]), 5, 0.0, T_MAX, false)
            .unwrap();
        normalize_sfs(&raw, theta0) * 1.0e4
    }

    fn divergence(m: &DemographicModel, observed: &Array2<f64>, theta0: f64) -> f64 {
        let raw = LinearOracle.raw_sfs(m, 5, 0.0, T_MAX, false).unwrap();
        let predicted = undistinguished_sfs(normalize_sfs(&raw, theta0).view(), false);
        cross_entropy(undistinguished_sfs(observed.view(), false).view(), &predicted).unwrap()
    }

    #[test]
    fn iteration_cap_keeps_the_best_point_found() {
        let observed = observed_at_truth(1.0);
        let mut m = three_epochs([2.0, 0.5, 1.5]);
        let bounds = uniform_bounds(&m, 0.1, 3.0);
        let before = divergence(&m, &observed, 1.0);

        let sfs = SfsPretrainer::new(&LinearOracle, &NoPenalty, 1.0)
            .unwrap()
            .with_config(PretrainConfig {
                tolerance: 1e-12,
                max_iterations: 1,
            })
            .run(&mut m, observed.view(), &bounds)
            .unwrap();

        assert_eq!(sfs.dim(), (3, 4));
        assert!(divergence(&m, &observed, 1.0) < before);
        assert_ne!(m.start_sizes(), &[2.0, 0.5, 1.5][..]);
    }

    #[test]
    fn infeasible_spectrum_rejects_the_step_without_aborting() {
        // At this scale the no-variant cell goes negative once sizes grow past ~1.25.
        let theta0 = 3.0;
        let observed = observed_at_truth(theta0);
        let m = three_epochs([1.2, 0.9, 1.1]);
        let coords = m.optimizable_coordinates();
        let objective = PretrainObjective {
            model: &m,
            coords: &coords,
            observed: undistinguished_sfs(observed.view(), false),
            expected_shape: (3, 4),
            sample_size: 5,
            theta0,
            folded: false,
            oracle: &LinearOracle,
            penalizer: &NoPenalty,
            transform: BoxTransform {
                low: vec![0.1; 3],
                high: vec![3.0; 3],
            },
            fatal: RefCell::new(None),
            best: RefCell::new(None),
            evaluations: Cell::new(0),
        };

        let z = objective.transform.to_unbounded(&[2.9, 2.9, 2.9]);
        let (cost, grad) = objective.cost_and_grad(&z);
        assert_eq!(cost, f64::INFINITY);
        assert!(grad.iter().all(|g| *g == 0.0));
        assert!(objective.take_fatal().is_none());
        assert!(objective.best.borrow().is_none());

        // The next feasible point is still evaluated normally.
        let z = objective.transform.to_unbounded(&[1.0, 1.0, 1.0]);
        assert!(objective.cost_and_grad(&z).0.is_finite());
        assert_eq!(objective.evaluations.get(), 2);

        let mut fitted = m.clone();
        let bounds = uniform_bounds(&fitted, 0.1, 3.0);
        SfsPretrainer::new(&LinearOracle, &NoPenalty, theta0)
            .unwrap()
            .with_config(PretrainConfig {
                tolerance: 1e-9,
                max_iterations: 500,
            })
            .run(&mut fitted, observed.view(), &bounds)
            .unwrap();
        for &size in fitted.start_sizes() {
            assert!((0.1..=3.0).contains(&size));
            assert!((size - 1.0).abs() < 1e-2, "{size}");
        }
    }
}
