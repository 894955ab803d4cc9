use super::observations::{ObservationRecord, ReductionError, validate_records};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Missing runs at least this long split a chromosome into independent segments.
pub const LONG_SPAN_CUTOFF: u64 = 100_000;

/// Descriptive statistics of one retained segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentAttributes {
    /// Start coordinate in the chromosome's original (unsegmented) coordinates.
    pub start: u64,
    /// End coordinate (exclusive) in original coordinates.
    pub end: u64,
    /// Total span of the segment, sentinel row included.
    pub span: u64,
    /// Sum of non-missing distinguished derived counts over `span`.
    pub derived_fraction: f64,
    /// Sum of undistinguished derived counts over `span`.
    pub undistinguished_fraction: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentedDataset {
    /// Retained segments, each prefixed with [`ObservationRecord::missing_sentinel`].
    pub segments: Vec<Vec<ObservationRecord>>,
    /// Attributes of the retained segments keyed by chromosome index.
    pub attributes: BTreeMap<usize, Vec<SegmentAttributes>>,
}

/// Fully missing, long, and without any undistinguished sample.
pub fn is_long_missing(record: &ObservationRecord) -> bool {
    record.span >= LONG_SPAN_CUTOFF && record.is_missing() && record.sample_size == 0
}

fn describe(segment: &[ObservationRecord], start: u64, end: u64) -> SegmentAttributes {
    let span: u64 = segment.iter().map(|r| r.span).sum();
    let derived: i64 = segment
        .iter()
        .filter(|r| !r.is_missing())
        .map(|r| i64::from(r.distinguished))
        .sum();
    let undistinguished: i64 = segment.iter().map(|r| i64::from(r.undistinguished)).sum();
    SegmentAttributes {
        start,
        end,
        span,
        derived_fraction: derived as f64 / span as f64,
        undistinguished_fraction: undistinguished as f64 / span as f64,
    }
}

/// Splits every chromosome at its long missing spans.
///
/// The rows between consecutive long missing spans, and after the last one, form
/// candidate segments. Candidates whose span does not exceed `length_cutoff` are
/// dropped; that is a filtering policy and only logged.
pub fn break_long_spans(
    dataset: &[Vec<ObservationRecord>],
    length_cutoff: u64,
) -> Result<SegmentedDataset, ReductionError> {
    let mut out = SegmentedDataset::default();
    for (chromosome, rows) in dataset.iter().enumerate() {
        validate_records(rows, chromosome)?;

        let positions: Vec<u64> = std::iter::once(0)
            .chain(rows.iter().scan(0u64, |acc, r| {
                *acc += r.span;
                Some(*acc)
            }))
            .collect();
        let long_spans: Vec<usize> = rows.iter().positions(is_long_missing).collect();
        if !long_spans.is_empty() {
            log::debug!(
                "chromosome {chromosome}: {} long missing spans at rows {long_spans:?}",
                long_spans.len()
            );
        }

        let mut begin = 0;
        for brk in long_spans.into_iter().chain(std::iter::once(rows.len())) {
            let run = &rows[begin..brk];
            let total: u64 = run.iter().map(|r| r.span).sum();
            if total > length_cutoff {
                let segment: Vec<ObservationRecord> =
                    std::iter::once(ObservationRecord::missing_sentinel())
                        .chain(run.iter().copied())
                        .collect();
                let attributes = describe(&segment, positions[begin], positions[brk]);
                out.attributes.entry(chromosome).or_default().push(attributes);
                out.segments.push(segment);
            } else {
                log::info!(
                    "omitting sequence of length {total} on chromosome {chromosome}: not above length cutoff {length_cutoff}"
                );
            }
            begin = brk + 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(span: u64, d: i32, u: i32, n: i32) -> ObservationRecord {
        ObservationRecord::new(span, d, u, n)
    }

    #[test]
    fn long_span_classification_requires_all_three_conditions() {
        assert!(is_long_missing(&record(100_000, -1, 0, 0)));
        assert!(!is_long_missing(&record(99_999, -1, 0, 0)));
        assert!(!is_long_missing(&record(200_000, 0, 0, 0)));
        assert!(!is_long_missing(&record(200_000, -1, 0, 3)));
    }

    #[test]
    fn splits_at_long_spans_and_tracks_original_coordinates() {
        let rows = vec![
            record(500, 0, 0, 4),
            record(1, 1, 2, 4),
            record(150_000, -1, 0, 0),
            record(10, 0, 0, 4),
            record(120_000, -1, 0, 0),
            record(800, 2, 1, 4),
        ];
        let out = break_long_spans(&[rows], 100).unwrap();

        assert_eq!(out.segments.len(), 2);
        assert_eq!(
            out.segments[0],
            vec![
                ObservationRecord::missing_sentinel(),
                record(500, 0, 0, 4),
                record(1, 1, 2, 4)
            ]
        );
        assert_eq!(
            out.segments[1],
            vec![ObservationRecord::missing_sentinel(), record(800, 2, 1, 4)]
        );

        let attrs = &out.attributes[&0];
        assert_eq!(attrs.len(), 2);
        assert_eq!((attrs[0].start, attrs[0].end, attrs[0].span), (0, 501, 502));
        assert_eq!(attrs[0].derived_fraction, 1.0 / 502.0);
        assert_eq!(attrs[0].undistinguished_fraction, 2.0 / 502.0);
        assert_eq!(
            (attrs[1].start, attrs[1].end, attrs[1].span),
            (270_511, 271_311, 801)
        );
    }

    #[test]
    fn chromosome_without_long_spans_is_one_segment() {
        let rows = vec![record(40_000, 0, 0, 2), record(3, 1, 1, 2), record(90_000, -1, 0, 0)];
        let out = break_long_spans(std::slice::from_ref(&rows), 1_000).unwrap();

        let mut expected = vec![ObservationRecord::missing_sentinel()];
        expected.extend_from_slice(&rows);
        assert_eq!(out.segments, vec![expected]);
        assert_eq!(out.attributes[&0].len(), 1);
    }

    #[test]
    fn short_segments_are_dropped_without_attributes() {
        let dataset = vec![
            vec![record(50, 0, 0, 2), record(100_000, -1, 0, 0), record(30, 1, 0, 2)],
            vec![record(5_000, 0, 0, 2)],
        ];
        let out = break_long_spans(&dataset, 1_000).unwrap();
        assert_eq!(out.segments.len(), 1);
        assert!(!out.attributes.contains_key(&0));
        assert_eq!(out.attributes[&1][0].span, 5_001);
    }

    #[test]
    fn everything_below_cutoff_yields_nothing() {
        let out = break_long_spans(&[vec![record(10, 0, 0, 2)]], 10).unwrap();
        assert!(out.segments.is_empty());
        assert!(out.attributes.is_empty());
    }
}
