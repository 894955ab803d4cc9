//! Run configuration, stored as TOML.

use crate::demography::{DEFAULT_SIZE_BOUNDS, DemographicModel, ModelError};
use crate::pretrain::PretrainConfig;
use crate::reduce::LONG_SPAN_CUTOFF;
use crate::regularizer::{RegularizationError, RegularizerMetric, SplineRegularizer};
use crate::time_grid::{PieceSpec, TimeGridError, build_time_grid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid time partition: {0}")]
    TimeGrid(#[from] TimeGridError),
    #[error("Invalid model settings: {0}")]
    Model(#[from] ModelError),
    #[error("Invalid regularization settings: {0}")]
    Regularization(#[from] RegularizationError),
}

/// Everything needed to prepare a model and its data for estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Piece string such as `"4+25*2+4+6"`.
    pub pieces: String,
    /// Fixed early epoch durations that precede the log-spaced pieces.
    pub time_prefix: Vec<f64>,
    /// End of the last piece, in coalescent units.
    pub horizon: f64,
    pub initial_size: f64,
    pub size_bounds: (f64, f64),
    /// Epochs with constant size. `None` makes every epoch flat.
    pub flat_pieces: Option<Vec<usize>>,
    pub thinning: usize,
    /// Segments no longer than this are dropped after splitting at long missing spans.
    pub length_cutoff: u64,
    /// Worker count for thinning; one per logical core when unset.
    pub threads: Option<usize>,
    pub penalty: f64,
    pub metric: RegularizerMetric,
    /// Scale applied to raw oracle spectra before comparison with data.
    pub theta0: f64,
    pub folded: bool,
    pub pretrain: PretrainConfig,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            pieces: "4+25*2+4+6".to_string(),
            time_prefix: vec![0.01],
            horizon: 15.0,
            initial_size: 1.0,
            size_bounds: DEFAULT_SIZE_BOUNDS,
            flat_pieces: None,
            thinning: 500,
            length_cutoff: LONG_SPAN_CUTOFF,
            threads: None,
            penalty: 6.0,
            metric: RegularizerMetric::default(),
            theta0: 1.0e-3,
            folded: false,
            pretrain: PretrainConfig::default(),
        }
    }
}

impl EstimationConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn piece_spec(&self) -> Result<PieceSpec, ConfigError> {
        Ok(self.pieces.parse()?)
    }

    /// Epoch durations: the fixed prefix followed by one duration per piece.
    pub fn time_grid(&self) -> Result<Vec<f64>, ConfigError> {
        let spans = self.piece_spec()?.expand();
        Ok(build_time_grid(&self.time_prefix, self.horizon, &spans)?)
    }

    /// A constant-size model over [`time_grid`](Self::time_grid) with the configured
    /// bounds and flat epochs.
    pub fn build_model(&self) -> Result<DemographicModel, ConfigError> {
        let grid = self.time_grid()?;
        let num_epochs = grid.len();
        let (low, high) = self.size_bounds;
        let model = DemographicModel::new(grid, self.initial_size)?.with_size_bounds(low, high)?;
        let model = match &self.flat_pieces {
            Some(epochs) => model.with_flat_pieces(epochs.iter().copied())?,
            None => model.with_flat_pieces(0..num_epochs)?,
        };
        log::debug!(
            "built model with {num_epochs} epochs, {} flat",
            model.flat_pieces().len()
        );
        Ok(model)
    }

    pub fn penalizer(&self) -> Result<SplineRegularizer, ConfigError> {
        Ok(SplineRegularizer::new(self.penalty, self.metric)?)
    }
}
