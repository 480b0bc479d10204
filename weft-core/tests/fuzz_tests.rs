//! Property-based tests for the substring miner.
//!
//! Random symbol sequences exercise the suffix-array path: every mined
//! substring must really occur at each reported index, occur at least
//! twice, and survive the overlap filter only with pairwise-disjoint
//! ranges.

use proptest::prelude::*;
use weft_core::stringify::filter_overlaps;
use weft_core::suffix_tree::{occurrences_agree, repeat_substrings};

proptest! {
    #[test]
    fn prop_mined_substrings_occur_at_every_start(
        symbols in proptest::collection::vec(0u32..6, 0..96)
    ) {
        for substring in repeat_substrings(&symbols) {
            prop_assert!(substring.start_indices.len() >= 2);
            prop_assert!(substring.length >= 2);
            prop_assert!(occurrences_agree(&symbols, &substring));
        }
    }

    #[test]
    fn prop_overlap_filter_leaves_disjoint_ranges(
        symbols in proptest::collection::vec(0u32..4, 0..96)
    ) {
        let kept = filter_overlaps(repeat_substrings(&symbols));
        let mut ranges: Vec<(usize, usize)> = kept
            .iter()
            .flat_map(|s| {
                s.start_indices
                    .iter()
                    .map(move |&start| (start, start + s.length))
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0, "ranges {pair:?} overlap");
        }
        for substring in &kept {
            prop_assert!(substring.start_indices.len() >= 2);
            prop_assert!(occurrences_agree(&symbols, substring));
        }
    }

    #[test]
    fn prop_start_indices_are_sorted(
        symbols in proptest::collection::vec(0u32..6, 0..64)
    ) {
        for substring in repeat_substrings(&symbols) {
            let mut sorted = substring.start_indices.clone();
            sorted.sort_unstable();
            prop_assert_eq!(&sorted, &substring.start_indices);
        }
    }
}
