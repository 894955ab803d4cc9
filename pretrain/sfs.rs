//! Site-frequency-spectrum helpers shared by the pretraining objective.
//!
//! A *distinguished* SFS is indexed by (derived count among the two distinguished
//! lineages, derived count among the `n` undistinguished lineages) and has shape
//! `(3, n + 1)`. Cell `(0, 0)` holds the probability of observing no derived
//! allele at all.

use crate::dual::Scalar;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SfsError {
    #[error("Observed SFS has {observed} entries but the predicted one has {predicted}.")]
    LengthMismatch { observed: usize, predicted: usize },

    #[error("Predicted SFS entry {index} is {value}, but observed mass there requires it to be positive.")]
    NonPositiveProbability { index: usize, value: f64 },
}

/// Rescales a raw oracle SFS by `theta0` and puts the remaining mass in `(0, 0)`.
pub fn normalize_sfs<S: Scalar>(raw: &Array2<S>, theta0: f64) -> Array2<S> {
    let mut sfs = raw.clone();
    sfs[[0, 0]] = S::zero();
    sfs.mapv_inplace(|v| v * theta0);
    let variant_mass = sfs.iter().cloned().fold(S::zero(), |acc, v| acc + v);
    sfs[[0, 0]] = S::one() - variant_mass;
    sfs
}

/// Collapses a distinguished SFS onto the total derived allele count.
///
/// The result has `a + n + 1` entries for an input of shape `(a + 1, n + 1)`.
/// With `folded`, entry `k` absorbs entry `N - k` for every `k < N - k`, and the
/// upper half is zeroed.
pub fn undistinguished_sfs<S: Scalar>(sfs: ArrayView2<S>, folded: bool) -> Array1<S> {
    let (rows, cols) = sfs.dim();
    let total = rows + cols - 2;
    let mut usfs = Array1::from_elem(total + 1, S::zero());
    for ((i, j), value) in sfs.indexed_iter() {
        usfs[i + j] = usfs[i + j].clone() + value.clone();
    }
    if folded {
        let mut k = 0;
        while k < total - k {
            let mirrored = std::mem::replace(&mut usfs[total - k], S::zero());
            usfs[k] = usfs[k].clone() + mirrored;
            k += 1;
        }
    }
    usfs
}

/// Negative weighted log-likelihood `-Σ observed[k] · ln(predicted[k])`.
///
/// Cells with zero observed weight do not contribute.
pub fn cross_entropy<S: Scalar>(
    observed: ArrayView1<f64>,
    predicted: &Array1<S>,
) -> Result<S, SfsError> {
    if observed.len() != predicted.len() {
        return Err(SfsError::LengthMismatch {
            observed: observed.len(),
            predicted: predicted.len(),
        });
    }
    let mut total = S::zero();
    for (index, (&weight, q)) in observed.iter().zip(predicted.iter()).enumerate() {
        if weight == 0.0 {
            continue;
        }
        if !(q.value() > 0.0) {
            return Err(SfsError::NonPositiveProbability {
                index,
                value: q.value(),
            });
        }
        total = total - q.clone().ln() * weight;
    }
    Ok(total)
}
