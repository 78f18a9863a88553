use std::ops::Range;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Seeded random permutation of `0..n`.
pub fn permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    order
}

/// Rows held out by `fold` when `n` rows are split into `fold_count`
/// contiguous folds.
pub fn fold_range(fold: usize, fold_count: usize, n: usize) -> Range<usize> {
    (fold * n / fold_count)..((fold + 1) * n / fold_count)
}

/// Every fold range, in order.
pub fn fold_ranges(fold_count: usize, n: usize) -> impl Iterator<Item = Range<usize>> {
    (0..fold_count).map(move |fold| fold_range(fold, fold_count, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_is_seeded() {
        let a = permutation(50, 1234);
        assert_eq!(a, permutation(50, 1234));
        assert_ne!(a, permutation(50, 4321));

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn folds_are_contiguous_disjoint_and_covering() {
        for (fold_count, n) in [(10, 100), (10, 500), (5, 5), (3, 10), (10, 487)] {
            let ranges: Vec<_> = fold_ranges(fold_count, n).collect();
            assert_eq!(ranges.len(), fold_count);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[fold_count - 1].end, n);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(ranges.iter().all(|r| !r.is_empty()));
            assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), n);
        }
    }

    #[test]
    fn even_splits_have_equal_folds() {
        assert!(fold_ranges(10, 100).all(|r| r.len() == 10));
        assert_eq!(fold_range(3, 10, 100), 30..40);
    }
}
