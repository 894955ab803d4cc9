use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReductionError {
    #[error("Thinning factor must be at least 1, got {0}.")]
    InvalidThinning(usize),

    #[error("Chromosome {chromosome}, row {row}: {reason}")]
    InvalidRecord {
        chromosome: usize,
        row: usize,
        reason: &'static str,
    },

    #[error("Failed to build the thinning worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// One run of consecutive sites with identical observed statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Number of sites covered.
    pub span: u64,
    /// Derived allele count among the distinguished lineages, or [`Self::MISSING`].
    pub distinguished: i32,
    /// Derived allele count among the undistinguished lineages.
    pub undistinguished: i32,
    /// Number of undistinguished lineages observed; 0 when that part is missing.
    pub sample_size: i32,
}

impl ObservationRecord {
    pub const MISSING: i32 = -1;

    pub fn new(span: u64, distinguished: i32, undistinguished: i32, sample_size: i32) -> Self {
        Self {
            span,
            distinguished,
            undistinguished,
            sample_size,
        }
    }

    /// The single-site fully missing row placed at the head of every segment.
    pub fn missing_sentinel() -> Self {
        Self::new(1, Self::MISSING, 0, 0)
    }

    pub fn is_missing(&self) -> bool {
        self.distinguished == Self::MISSING
    }

    /// Statistics shared by every site of the run, i.e. everything except `span`.
    pub fn statistics(&self) -> (i32, i32, i32) {
        (self.distinguished, self.undistinguished, self.sample_size)
    }

    /// The same statistics with the undistinguished part marked missing.
    pub fn without_undistinguished(&self, span: u64) -> Self {
        Self::new(span, self.distinguished, 0, 0)
    }

    /// Derived alleles carried by the distinguished lineages over the whole run.
    pub fn derived_count(&self) -> u64 {
        if self.is_missing() {
            0
        } else {
            self.span * u64::from(self.distinguished.unsigned_abs())
        }
    }
}

pub(crate) fn validate_records(
    rows: &[ObservationRecord],
    chromosome: usize,
) -> Result<(), ReductionError> {
    for (row, record) in rows.iter().enumerate() {
        let reason = if record.span == 0 {
            "span must be positive"
        } else if record.distinguished < ObservationRecord::MISSING {
            "distinguished count must be non-negative or the missing sentinel"
        } else if record.undistinguished < 0 || record.sample_size < 0 {
            "undistinguished counts must be non-negative"
        } else if record.undistinguished > record.sample_size {
            "undistinguished derived count exceeds its sample size"
        } else {
            continue;
        };
        return Err(ReductionError::InvalidRecord {
            chromosome,
            row,
            reason,
        });
    }
    Ok(())
}

/// Merges consecutive rows with identical statistics by summing their spans.
pub fn compress_repeated_observations(
    rows: impl IntoIterator<Item = ObservationRecord>,
) -> Vec<ObservationRecord> {
    rows.into_iter()
        .coalesce(|prev, next| {
            if prev.statistics() == next.statistics() {
                Ok(ObservationRecord {
                    span: prev.span + next.span,
                    ..prev
                })
            } else {
                Err((prev, next))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_merges_only_adjacent_identical_rows() {
        let rows = vec![
            ObservationRecord::new(3, 0, 0, 0),
            ObservationRecord::new(2, 0, 0, 0),
            ObservationRecord::new(1, 1, 2, 4),
            ObservationRecord::new(5, 0, 0, 0),
            ObservationRecord::new(1, 1, 2, 4),
            ObservationRecord::new(1, 1, 2, 4),
        ];
        let compressed = compress_repeated_observations(rows);
        assert_eq!(
            compressed,
            vec![
                ObservationRecord::new(5, 0, 0, 0),
                ObservationRecord::new(1, 1, 2, 4),
                ObservationRecord::new(5, 0, 0, 0),
                ObservationRecord::new(2, 1, 2, 4),
            ]
        );
        assert!(compress_repeated_observations(Vec::new()).is_empty());
    }

    #[test]
    fn validation_names_the_offending_row() {
        let rows = [
            ObservationRecord::new(10, 0, 0, 2),
            ObservationRecord::new(0, 0, 0, 2),
        ];
        match validate_records(&rows, 3) {
            Err(ReductionError::InvalidRecord { chromosome, row, .. }) => {
                assert_eq!((chromosome, row), (3, 1));
            }
            other => panic!("expected InvalidRecord, got {other:?}"),
        }
        assert!(validate_records(&[ObservationRecord::new(1, -2, 0, 0)], 0).is_err());
        assert!(validate_records(&[ObservationRecord::missing_sentinel()], 0).is_ok());
    }
}
