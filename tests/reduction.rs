use popsize::reduce::{
    LONG_SPAN_CUTOFF, ObservationRecord, break_long_spans, compress_repeated_observations,
    thin_dataset, thin_observations,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_chromosome(rng: &mut StdRng, rows: usize) -> Vec<ObservationRecord> {
    (0..rows)
        .map(|_| {
            if rng.gen_bool(0.05) {
                return ObservationRecord::new(rng.gen_range(100_000..300_000), -1, 0, 0);
            }
            let sample_size = rng.gen_range(0..=6);
            let undistinguished = if sample_size == 0 {
                0
            } else {
                rng.gen_range(0..=sample_size)
            };
            ObservationRecord::new(
                rng.gen_range(1..2_000),
                rng.gen_range(-1..=2),
                undistinguished,
                sample_size,
            )
        })
        .collect()
}

fn totals(rows: &[ObservationRecord]) -> (u64, u64) {
    (
        rows.iter().map(|r| r.span).sum(),
        rows.iter().map(ObservationRecord::derived_count).sum(),
    )
}

#[test]
fn thinning_preserves_span_and_derived_count() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(17);
    let dataset: Vec<Vec<ObservationRecord>> =
        (0..4).map(|_| random_chromosome(&mut rng, 200)).collect();

    for thinning in 1..=9 {
        let thinned = thin_dataset(&dataset, thinning, Some(2)).unwrap();
        assert_eq!(thinned.len(), dataset.len());
        for (before, after) in dataset.iter().zip(&thinned) {
            assert_eq!(totals(before), totals(after), "thinning {thinning}");
            assert!(after.windows(2).all(|w| w[0].statistics() != w[1].statistics()));
        }
    }
}

#[test]
fn full_sites_appear_once_per_thinning_window() {
    let rows = vec![ObservationRecord::new(1_000, 0, 1, 3)];
    for thinning in [1usize, 7, 50, 999, 1_000, 5_000] {
        for chromosome in 0..3 {
            let thinned = thin_observations(&rows, thinning, chromosome).unwrap();
            let full: u64 = thinned
                .iter()
                .filter(|r| r.sample_size > 0)
                .map(|r| r.span)
                .sum();
            let offset = (chromosome % thinning) as u64;
            let expected = (1_000 + offset) / thinning as u64;
            assert_eq!(full, expected, "thinning {thinning}, chromosome {chromosome}");
        }
    }
}

#[test]
fn parallel_thinning_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(3);
    let dataset: Vec<Vec<ObservationRecord>> =
        (0..6).map(|_| random_chromosome(&mut rng, 80)).collect();
    let parallel = thin_dataset(&dataset, 13, None).unwrap();
    for (chromosome, rows) in dataset.iter().enumerate() {
        let sequential =
            compress_repeated_observations(thin_observations(rows, 13, chromosome).unwrap());
        assert_eq!(parallel[chromosome], sequential);
    }
}

#[test]
fn segments_cover_everything_between_long_spans() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(99);
    let dataset: Vec<Vec<ObservationRecord>> =
        (0..3).map(|_| random_chromosome(&mut rng, 150)).collect();
    let out = break_long_spans(&dataset, 0).unwrap();

    for (chromosome, rows) in dataset.iter().enumerate() {
        let kept: u64 = rows
            .iter()
            .filter(|r| !(r.span >= LONG_SPAN_CUTOFF && r.is_missing() && r.sample_size == 0))
            .map(|r| r.span)
            .sum();
        let attributes = out.attributes.get(&chromosome).map_or(&[][..], Vec::as_slice);
        let covered: u64 = attributes.iter().map(|a| a.span - 1).sum();
        assert_eq!(covered, kept);
        for a in attributes {
            assert_eq!(a.end - a.start, a.span - 1);
            assert!(a.derived_fraction >= 0.0 && a.undistinguished_fraction >= 0.0);
        }
    }

    for segment in &out.segments {
        assert_eq!(segment[0], ObservationRecord::missing_sentinel());
        assert!(segment[1..].iter().all(|r| !popsize::reduce::is_long_missing(r)));
    }
}

#[test]
fn thinned_then_segmented_pipeline() {
    let mut rng = StdRng::seed_from_u64(5);
    let dataset: Vec<Vec<ObservationRecord>> =
        (0..2).map(|_| random_chromosome(&mut rng, 120)).collect();
    let thinned = thin_dataset(&dataset, 25, Some(1)).unwrap();
    let out = break_long_spans(&thinned, 5_000).unwrap();
    assert!(out.segments.iter().all(|s| s.iter().map(|r| r.span).sum::<u64>() > 5_001));
    let described: usize = out.attributes.values().map(Vec::len).sum();
    assert_eq!(described, out.segments.len());
}
