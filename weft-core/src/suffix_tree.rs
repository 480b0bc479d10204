//! Repeated-substring mining over the linearized program.
//!
//! A suffix array (prefix doubling) plus an LCP array (Kasai) enumerate
//! the branching repeats of the symbol sequence — the internal nodes a
//! suffix tree would expose — as LCP intervals: each interval yields one
//! repeated substring with all of its occurrences.

/// A substring of the symbol sequence occurring at least twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedSubstring {
    /// Number of symbols in the substring.
    pub length: usize,
    /// Every program index the substring starts at, ascending.
    pub start_indices: Vec<usize>,
}

/// Substrings shorter than this are never worth a call.
const MIN_LENGTH: usize = 2;

/// All repeated substrings of `symbols` with at least two occurrences,
/// one entry per branching repeat.
pub fn repeat_substrings(symbols: &[u32]) -> Vec<RepeatedSubstring> {
    if symbols.len() < 2 * MIN_LENGTH {
        return Vec::new();
    }
    let sa = suffix_array(symbols);
    let lcp = lcp_array(symbols, &sa);
    let mut out = Vec::new();

    // Enumerate LCP intervals with a stack of (lcp value, left boundary).
    let n = symbols.len();
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for i in 1..=n {
        let current = if i < n { lcp[i] } else { 0 };
        let mut left = i - 1;
        while let Some(&(top_lcp, top_left)) = stack.last() {
            if top_lcp <= current {
                break;
            }
            stack.pop();
            left = top_left;
            if top_lcp >= MIN_LENGTH {
                let mut starts: Vec<usize> = sa[top_left..i].to_vec();
                starts.sort_unstable();
                out.push(RepeatedSubstring {
                    length: top_lcp,
                    start_indices: starts,
                });
            }
        }
        let top = stack.last().map_or(0, |&(h, _)| h);
        if current >= MIN_LENGTH && current > top {
            stack.push((current, left));
        }
    }

    // Deterministic order: longest first, then by first occurrence.
    out.sort_by(|a, b| {
        b.length
            .cmp(&a.length)
            .then_with(|| a.start_indices.cmp(&b.start_indices))
    });
    out
}

/// Suffix array by prefix doubling.
fn suffix_array(symbols: &[u32]) -> Vec<usize> {
    let n = symbols.len();
    let mut sa: Vec<usize> = (0..n).collect();
    let mut rank: Vec<i64> = symbols.iter().map(|s| *s as i64).collect();
    let mut tmp = vec![0i64; n];
    let mut k = 1;
    loop {
        let key = |i: usize| {
            let second = if i + k < n { rank[i + k] } else { -1 };
            (rank[i], second)
        };
        sa.sort_by_key(|&i| key(i));
        tmp[sa[0]] = 0;
        for w in 1..n {
            tmp[sa[w]] = tmp[sa[w - 1]] + i64::from(key(sa[w]) != key(sa[w - 1]));
        }
        rank.copy_from_slice(&tmp);
        if rank[sa[n - 1]] == (n - 1) as i64 {
            break;
        }
        k *= 2;
    }
    sa
}

/// Kasai's algorithm: `lcp[i]` is the longest common prefix of the
/// suffixes at `sa[i - 1]` and `sa[i]`; `lcp[0]` is 0.
fn lcp_array(symbols: &[u32], sa: &[usize]) -> Vec<usize> {
    let n = symbols.len();
    let mut rank = vec![0usize; n];
    for (i, &s) in sa.iter().enumerate() {
        rank[s] = i;
    }
    let mut lcp = vec![0usize; n];
    let mut h = 0usize;
    for i in 0..n {
        if rank[i] > 0 {
            let j = sa[rank[i] - 1];
            while i + h < n && j + h < n && symbols[i + h] == symbols[j + h] {
                h += 1;
            }
            lcp[rank[i]] = h;
            h = h.saturating_sub(1);
        } else {
            h = 0;
        }
    }
    lcp
}

/// Invariant check: every reported occurrence actually spells the
/// substring out.
pub fn occurrences_agree(symbols: &[u32], substring: &RepeatedSubstring) -> bool {
    let first = substring.start_indices[0];
    if first + substring.length > symbols.len() {
        return false;
    }
    let window = &symbols[first..first + substring.length];
    substring.start_indices.iter().all(|&s| {
        s + substring.length <= symbols.len() && &symbols[s..s + substring.length] == window
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_repeat_found() {
        // "1 2 3 . 1 2 3" with a unique separator between.
        let symbols = vec![1, 2, 3, 99, 1, 2, 3];
        let found = repeat_substrings(&symbols);
        let best = &found[0];
        assert_eq!(best.length, 3);
        assert_eq!(best.start_indices, vec![0, 4]);
        for sub in &found {
            assert!(occurrences_agree(&symbols, sub));
            assert!(sub.start_indices.len() >= 2);
        }
    }

    #[test]
    fn test_nested_repeats_reported_per_depth() {
        let symbols = vec![1, 2, 3, 99, 1, 2, 3, 98, 2, 3];
        let found = repeat_substrings(&symbols);
        // "1 2 3" twice, and "2 3" three times.
        assert!(found
            .iter()
            .any(|s| s.length == 3 && s.start_indices == vec![0, 4]));
        assert!(found
            .iter()
            .any(|s| s.length == 2 && s.start_indices == vec![1, 5, 8]));
    }

    #[test]
    fn test_no_repeats_in_unique_sequence() {
        let symbols = vec![1, 2, 3, 4, 5, 6, 7];
        assert!(repeat_substrings(&symbols).is_empty());
    }

    #[test]
    fn test_overlapping_occurrences_all_reported() {
        let symbols = vec![7, 7, 7, 7];
        let found = repeat_substrings(&symbols);
        // "7 7" occurs at 0, 1, 2; the overlap filter prunes later.
        assert!(found
            .iter()
            .any(|s| s.length == 2 && s.start_indices == vec![0, 1, 2]));
        for sub in &found {
            assert!(occurrences_agree(&symbols, sub));
        }
    }
}
