#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod demography;
pub mod dual;
pub mod regularizer;
pub mod time_grid;
pub mod tridiagonal;

#[path = "../reduce/mod.rs"]
pub mod reduce;

#[path = "../pretrain/mod.rs"]
pub mod pretrain;

pub use config::{ConfigError, EstimationConfig};
pub use demography::{Coordinate, CoordinateBounds, DemographicModel, ParameterAxis};
pub use regularizer::{Penalizer, RegularizerMetric, SplineRegularizer};
