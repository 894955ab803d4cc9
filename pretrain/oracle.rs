use crate::demography::DemographicModel;
use crate::dual::Scalar;
use ndarray::Array2;
use thiserror::Error;

/// Upper end of the time window for conditioned-SFS queries, in coalescent units.
pub const T_MAX: f64 = 1.0e6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Conditioned SFS computation became numerically unstable: {0}")]
    NumericalInstability(String),

    #[error("Conditioned SFS is unavailable for this model: {0}")]
    Unsupported(String),
}

/// Source of expected (conditioned) site-frequency spectra for a model.
///
/// Implementations must be deterministic in the model's current coordinates. The
/// returned array has shape `(3, sample_size - 1)`: distinguished derived count
/// by undistinguished derived count, scaled per unit mutation rate. The value in
/// cell `(0, 0)` is ignored by callers.
///
/// `pooled` allows a coarser internal time discretization for repeated queries
/// during optimization.
pub trait SfsOracle {
    fn raw_sfs<S: Scalar>(
        &self,
        model: &DemographicModel<S>,
        sample_size: usize,
        t_min: f64,
        t_max: f64,
        pooled: bool,
    ) -> Result<Array2<S>, OracleError>;
}
