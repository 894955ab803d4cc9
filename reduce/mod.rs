// Observation reduction: passes run once over raw per-chromosome rows before
// any optimization.
pub mod observations;
pub mod segments;
pub mod thinning;

pub use observations::{ObservationRecord, ReductionError, compress_repeated_observations};
pub use segments::{
    LONG_SPAN_CUTOFF, SegmentAttributes, SegmentedDataset, break_long_spans, is_long_missing,
};
pub use thinning::{thin_dataset, thin_observations};
