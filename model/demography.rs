//! # Piecewise Demographic Model
//!
//! A population-size history made of `K` consecutive epochs. Each epoch has a size
//! at its start (axis 0, the axis the regularizer smooths), a size at its end
//! (axis 1) and a duration. Flat epochs tie their end size to their start size,
//! so only axis 0 is free for them.
//!
//! The model is generic over [`Scalar`] so the same structure can be lifted into
//! [`Dual`] values for gradient evaluation without touching the caller's copy.

use crate::dual::{Dual, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("A demographic model needs at least one epoch.")]
    NoEpochs,

    #[error("Epoch {epoch} has invalid span {span}; spans must be finite and positive.")]
    InvalidSpan { epoch: usize, span: f64 },

    #[error("Population size {0} must be finite and positive.")]
    InvalidSize(f64),

    #[error("Epoch {epoch} is out of range for a model with {num_epochs} epochs.")]
    EpochOutOfRange { epoch: usize, num_epochs: usize },

    #[error("Epoch {0} is flat; its end size is tied to its start size.")]
    FlatCoordinate(usize),

    #[error("Size bounds ({0}, {1}) must satisfy 0 < low < high.")]
    InvalidBounds(f64, f64),

    #[error("Got {values} values for {coordinates} coordinates.")]
    CoordinateCountMismatch { coordinates: usize, values: usize },
}

/// Which of the two per-epoch size parameters a coordinate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParameterAxis {
    /// Size at the start of the epoch (axis 0).
    Start,
    /// Size at the end of the epoch (axis 1).
    End,
}

impl ParameterAxis {
    pub fn index(self) -> usize {
        match self {
            Self::Start => 0,
            Self::End => 1,
        }
    }
}

/// An `(axis, epoch)` address into the model's size parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub axis: ParameterAxis,
    pub epoch: usize,
}

impl Coordinate {
    pub fn new(axis: ParameterAxis, epoch: usize) -> Self {
        Self { axis, epoch }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.axis.index(), self.epoch)
    }
}

/// Box constraints per optimizable coordinate.
pub type CoordinateBounds = BTreeMap<Coordinate, (f64, f64)>;

pub const DEFAULT_SIZE_BOUNDS: (f64, f64) = (1.0e-3, 1.0e3);

#[derive(Debug, Clone, PartialEq)]
pub struct DemographicModel<S = f64> {
    start: Vec<S>,
    end: Vec<S>,
    spans: Vec<f64>,
    flat: BTreeSet<usize>,
    size_bounds: (f64, f64),
}

impl DemographicModel<f64> {
    /// Builds a constant-size model over the given epoch durations, typically the
    /// output of [`build_time_grid`](crate::time_grid::build_time_grid).
    pub fn new(spans: Vec<f64>, initial_size: f64) -> Result<Self, ModelError> {
        if spans.is_empty() {
            return Err(ModelError::NoEpochs);
        }
        if let Some((epoch, &span)) = spans
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || **s <= 0.0)
        {
            return Err(ModelError::InvalidSpan { epoch, span });
        }
        if !initial_size.is_finite() || initial_size <= 0.0 {
            return Err(ModelError::InvalidSize(initial_size));
        }
        let k = spans.len();
        Ok(Self {
            start: vec![initial_size; k],
            end: vec![initial_size; k],
            spans,
            flat: BTreeSet::new(),
            size_bounds: DEFAULT_SIZE_BOUNDS,
        })
    }

    pub fn with_size_bounds(mut self, low: f64, high: f64) -> Result<Self, ModelError> {
        if !(low > 0.0 && low < high && high.is_finite()) {
            return Err(ModelError::InvalidBounds(low, high));
        }
        self.size_bounds = (low, high);
        Ok(self)
    }

    /// Default bounds for every optimizable coordinate.
    pub fn bounds(&self) -> CoordinateBounds {
        self.optimizable_coordinates()
            .into_iter()
            .map(|coord| (coord, self.size_bounds))
            .collect()
    }

    /// Copies the model into [`Dual`] values, seeding one gradient direction per
    /// entry of `coords` at the matching entry of `values`.
    pub fn lift(
        &self,
        coords: &[Coordinate],
        values: &[f64],
    ) -> Result<DemographicModel<Dual>, ModelError> {
        if coords.len() != values.len() {
            return Err(ModelError::CoordinateCountMismatch {
                coordinates: coords.len(),
                values: values.len(),
            });
        }
        let mut lifted = self.map_scalar(|v| Dual::constant(*v));
        let dim = coords.len();
        for (i, (&coord, &value)) in coords.iter().zip(values).enumerate() {
            lifted.set(coord, Dual::variable(value, i, dim))?;
        }
        Ok(lifted)
    }
}

impl<S: Scalar> DemographicModel<S> {
    /// Number of epochs, `K`.
    pub fn num_epochs(&self) -> usize {
        self.spans.len()
    }

    pub fn spans(&self) -> &[f64] {
        &self.spans
    }

    pub fn start_sizes(&self) -> &[S] {
        &self.start
    }

    pub fn size_bounds(&self) -> (f64, f64) {
        self.size_bounds
    }

    /// Cumulative epoch boundaries: `t[k] = spans[0] + ... + spans[k]`.
    pub fn cumulative_times(&self) -> Vec<f64> {
        self.spans
            .iter()
            .scan(0.0, |acc, s| {
                *acc += s;
                Some(*acc)
            })
            .collect()
    }

    pub fn is_flat(&self, epoch: usize) -> bool {
        self.flat.contains(&epoch)
    }

    pub fn flat_pieces(&self) -> &BTreeSet<usize> {
        &self.flat
    }

    pub fn with_flat_pieces(
        mut self,
        epochs: impl IntoIterator<Item = usize>,
    ) -> Result<Self, ModelError> {
        for epoch in epochs {
            self.check_epoch(epoch)?;
            self.flat.insert(epoch);
        }
        Ok(self)
    }

    /// Axis 0 for every epoch, axis 1 only where the epoch is not flat; epoch-major.
    pub fn optimizable_coordinates(&self) -> Vec<Coordinate> {
        (0..self.num_epochs())
            .flat_map(|epoch| {
                let end = (!self.is_flat(epoch)).then_some(ParameterAxis::End);
                std::iter::once(ParameterAxis::Start)
                    .chain(end)
                    .map(move |axis| Coordinate::new(axis, epoch))
            })
            .collect()
    }

    /// Size at the end of `epoch`; equals the start size for flat epochs.
    pub fn end_size(&self, epoch: usize) -> &S {
        if self.is_flat(epoch) {
            &self.start[epoch]
        } else {
            &self.end[epoch]
        }
    }

    pub fn get(&self, coord: Coordinate) -> Result<&S, ModelError> {
        self.check_epoch(coord.epoch)?;
        Ok(match coord.axis {
            ParameterAxis::Start => &self.start[coord.epoch],
            ParameterAxis::End => self.end_size(coord.epoch),
        })
    }

    pub fn set(&mut self, coord: Coordinate, value: S) -> Result<(), ModelError> {
        self.check_epoch(coord.epoch)?;
        match coord.axis {
            ParameterAxis::Start => self.start[coord.epoch] = value,
            ParameterAxis::End if self.is_flat(coord.epoch) => {
                return Err(ModelError::FlatCoordinate(coord.epoch));
            }
            ParameterAxis::End => self.end[coord.epoch] = value,
        }
        Ok(())
    }

    pub fn map_scalar<T>(&self, f: impl Fn(&S) -> T) -> DemographicModel<T> {
        DemographicModel {
            start: self.start.iter().map(&f).collect(),
            end: self.end.iter().map(&f).collect(),
            spans: self.spans.clone(),
            flat: self.flat.clone(),
            size_bounds: self.size_bounds,
        }
    }

    fn check_epoch(&self, epoch: usize) -> Result<(), ModelError> {
        if epoch >= self.num_epochs() {
            return Err(ModelError::EpochOutOfRange {
                epoch,
                num_epochs: self.num_epochs(),
            });
        }
        Ok(())
    }
}

impl<S: Scalar> fmt::Display for DemographicModel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>6} {:>12} {:>12} {:>12}", "epoch", "start", "end", "span")?;
        for k in 0..self.num_epochs() {
            let marker = if self.is_flat(k) { " (flat)" } else { "" };
            writeln!(
                f,
                "{:>6} {:>12.4} {:>12.4} {:>12.4}{marker}",
                k,
                self.start[k].value(),
                self.end_size(k).value(),
                self.spans[k]
            )?;
        }
        Ok(())
    }
}
