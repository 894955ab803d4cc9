//! # Thinning
//!
//! Consecutive sites along a chromosome are strongly correlated, so emitting the
//! full frequency spectrum at every site over-counts information. Thinning keeps
//! the distinguished lineages at every site but only reports the undistinguished
//! sample at every `thinning`-th site. The result is run-length compressed.
//!
//! Chromosomes are independent and are reduced in parallel on a worker pool that
//! lives for exactly one call.

use super::observations::{
    ObservationRecord, ReductionError, compress_repeated_observations, validate_records,
};
use rayon::prelude::*;

/// Thins one chromosome.
///
/// The site counter starts at `chromosome % thinning`, staggering where full
/// sites fall on different chromosomes. Total span and derived allele count of
/// the distinguished lineages are preserved exactly.
pub fn thin_observations(
    rows: &[ObservationRecord],
    thinning: usize,
    chromosome: usize,
) -> Result<Vec<ObservationRecord>, ReductionError> {
    if thinning == 0 {
        return Err(ReductionError::InvalidThinning(thinning));
    }
    validate_records(rows, chromosome)?;

    let thinning = thinning as u64;
    let mut counter = chromosome as u64 % thinning;
    let mut out = Vec::with_capacity(rows.len());
    for record in rows {
        let mut remaining = record.span;
        while remaining > 0 {
            let until_full = thinning - counter;
            if remaining >= until_full {
                if until_full > 1 {
                    out.push(record.without_undistinguished(until_full - 1));
                }
                out.push(ObservationRecord { span: 1, ..*record });
                remaining -= until_full;
                counter = 0;
            } else {
                out.push(record.without_undistinguished(remaining));
                counter += remaining;
                remaining = 0;
            }
        }
    }
    Ok(out)
}

/// Thins and compresses every chromosome of `dataset` in parallel.
///
/// The pool has `threads` workers, or one per logical core when `None`, and is
/// torn down before this returns. The first failing chromosome fails the call.
pub fn thin_dataset(
    dataset: &[Vec<ObservationRecord>],
    thinning: usize,
    threads: Option<usize>,
) -> Result<Vec<Vec<ObservationRecord>>, ReductionError> {
    if thinning == 0 {
        return Err(ReductionError::InvalidThinning(thinning));
    }
    let num_threads = threads.unwrap_or_else(num_cpus::get).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("popsize-thin-{i}"))
        .build()?;
    log::debug!(
        "thinning {} chromosomes every {thinning} sites on {num_threads} workers",
        dataset.len()
    );

    let reduced = pool.install(|| {
        dataset
            .par_iter()
            .enumerate()
            .map(|(chromosome, rows)| {
                let thinned = thin_observations(rows, thinning, chromosome)?;
                Ok(compress_repeated_observations(thinned))
            })
            .collect::<Result<Vec<_>, ReductionError>>()
    });
    drop(pool);

    if let Ok(chromosomes) = &reduced {
        let before: usize = dataset.iter().map(Vec::len).sum();
        let after: usize = chromosomes.iter().map(Vec::len).sum();
        log::debug!("thinning reduced {before} rows to {after}");
    }
    reduced
}
