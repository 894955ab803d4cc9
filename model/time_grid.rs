//! # Time Partition
//!
//! Turns a PSMC-style piece string (`"4+25*2+4+6"`) into the epoch durations that
//! a [`DemographicModel`](crate::demography::DemographicModel) is built from.
//!
//! Pieces are measured in units of an underlying log-spaced grid: a piece of span
//! `s` covers `s` consecutive log-spaced intervals between the last fixed early
//! boundary and the time horizon.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeGridError {
    #[error("Malformed piece token '{token}' in '{spec}': {reason}")]
    Format {
        spec: String,
        token: String,
        reason: &'static str,
    },

    #[error("Fixed time prefix must be non-empty with finite positive entries, got {0:?}.")]
    InvalidPrefix(Vec<f64>),

    #[error("Time horizon {horizon} must be finite and exceed the last fixed boundary {last}.")]
    InvalidHorizon { horizon: f64, last: f64 },

    #[error("The piece schedule is empty or contains a zero-width piece.")]
    EmptySchedule,

    #[error("The piece schedule covers more than {} log-spaced intervals.", MAX_TOTAL_SPAN)]
    ScheduleTooLarge,
}

/// Upper limit on the number of log-spaced intervals a schedule may cover.
pub const MAX_TOTAL_SPAN: usize = 1 << 20;

/// A parsed piece specification: ordered `(count, span)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceSpec {
    pieces: Vec<(usize, usize)>,
}

impl PieceSpec {
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pieces
    }

    /// Flat chronological list of spans, each pair repeated `count` times.
    pub fn expand(&self) -> Vec<usize> {
        self.pieces
            .iter()
            .flat_map(|&(count, span)| std::iter::repeat_n(span, count))
            .collect()
    }

    /// Number of epochs the specification expands to.
    pub fn num_pieces(&self) -> usize {
        self.pieces.iter().map(|&(count, _)| count).sum()
    }

    /// Number of underlying log-spaced intervals covered.
    pub fn total_span(&self) -> usize {
        self.pieces.iter().map(|&(count, span)| count * span).sum()
    }
}

impl FromStr for PieceSpec {
    type Err = TimeGridError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let format_error = |token: &str, reason| TimeGridError::Format {
            spec: spec.to_string(),
            token: token.to_string(),
            reason,
        };
        let parse_positive = |token: &str, field: &str| -> Result<usize, TimeGridError> {
            let value: i64 = field
                .trim()
                .parse()
                .map_err(|_| format_error(token, "not an integer"))?;
            if value <= 0 {
                return Err(format_error(token, "values must be positive"));
            }
            usize::try_from(value).map_err(|_| format_error(token, "value out of range"))
        };

        let mut pieces = Vec::new();
        let mut total = 0usize;
        for token in spec.split('+') {
            let fields: Vec<&str> = token.split('*').collect();
            let pair = match fields.as_slice() {
                [span] => (1, parse_positive(token, span)?),
                [count, span] => (parse_positive(token, count)?, parse_positive(token, span)?),
                _ => return Err(format_error(token, "expected SPAN or COUNT*SPAN")),
            };
            total = pair
                .0
                .checked_mul(pair.1)
                .and_then(|covered| total.checked_add(covered))
                .filter(|&t| t <= MAX_TOTAL_SPAN)
                .ok_or_else(|| format_error(token, "value out of range"))?;
            pieces.push(pair);
        }
        Ok(Self { pieces })
    }
}

impl fmt::Display for PieceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(count, span)) in self.pieces.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            if count == 1 {
                write!(f, "{span}")?;
            } else {
                write!(f, "{count}*{span}")?;
            }
        }
        Ok(())
    }
}

/// Parses a piece string and expands it into a flat list of spans.
///
/// `"2*3+5"` becomes `[3, 3, 5]`.
pub fn expand_piece_spec(spec: &str) -> Result<Vec<usize>, TimeGridError> {
    Ok(spec.parse::<PieceSpec>()?.expand())
}

/// Builds epoch durations from a fixed prefix, a horizon and a piece schedule.
///
/// `sum(spans) + 1` points are log-spaced between the last prefix entry and
/// `horizon`; the consecutive differences are summed in runs of `spans[i]` to give
/// one duration per piece. The returned grid is `fixed_prefix` followed by those
/// durations.
pub fn build_time_grid(
    fixed_prefix: &[f64],
    horizon: f64,
    spans: &[usize],
) -> Result<Vec<f64>, TimeGridError> {
    let last = match fixed_prefix.last() {
        Some(&last) if fixed_prefix.iter().all(|t| t.is_finite() && *t > 0.0) => last,
        _ => return Err(TimeGridError::InvalidPrefix(fixed_prefix.to_vec())),
    };
    if !horizon.is_finite() || horizon <= last {
        return Err(TimeGridError::InvalidHorizon { horizon, last });
    }
    if spans.is_empty() || spans.contains(&0) {
        return Err(TimeGridError::EmptySchedule);
    }

    let total = spans
        .iter()
        .try_fold(0usize, |acc, &span| acc.checked_add(span))
        .filter(|&t| t <= MAX_TOTAL_SPAN)
        .ok_or(TimeGridError::ScheduleTooLarge)?;
    let log_start = last.ln();
    let log_step = (horizon.ln() - log_start) / total as f64;
    let points: Vec<f64> = (0..=total)
        .map(|i| match i {
            0 => last,
            i if i == total => horizon,
            i => (log_start + log_step * i as f64).exp(),
        })
        .collect();
    let deltas: Vec<f64> = points.windows(2).map(|w| w[1] - w[0]).collect();

    let mut grid = Vec::with_capacity(fixed_prefix.len() + spans.len());
    grid.extend_from_slice(fixed_prefix);
    let mut offset = 0;
    for &span in spans {
        grid.push(deltas[offset..offset + span].iter().sum());
        offset += span;
    }
    log::debug!(
        "time grid from {} pieces over [{last}, {horizon}]: {grid:?}",
        spans.len()
    );
    Ok(grid)
}
