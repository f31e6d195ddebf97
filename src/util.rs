use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;

pub(crate) const TAB: char = '\t';

pub(crate) fn create_out_directory<T: AsRef<Path>>(
    raw_path: T,
) -> anyhow::Result<()> {
    let p = raw_path.as_ref();
    if !p.exists() {
        info!("creating directory at {p:?}");
        std::fs::create_dir_all(p)?;
    }
    Ok(())
}

pub(crate) fn get_ticker() -> ProgressBar {
    let ticker = ProgressBar::new_spinner();
    ticker.set_style(ProgressStyle::with_template("> {pos} {msg}").unwrap());
    ticker
}

fn get_master_progress_bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.green/yellow} {pos:>7}/{len:7} {msg}",
    )
    .unwrap()
    .progress_chars("##-")
}

pub(crate) fn get_master_progress_bar<
    T: num_traits::Num + num_traits::cast::AsPrimitive<u64>,
>(
    n: T,
) -> ProgressBar {
    ProgressBar::new(n.as_()).with_style(get_master_progress_bar_style())
}

pub fn format_int_with_commas(val: isize) -> String {
    let mut num = val
        .abs()
        .to_string()
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(std::str::from_utf8)
        .collect::<Result<Vec<&str>, _>>()
        .unwrap()
        .join(",");
    if val < 0 {
        num = format!("-{num}")
    }
    num
}

/// Count positions at which the two byte ranges differ, returning early once
/// `max` differences have been seen. Panics when either range runs past the
/// end of its slice.
#[inline]
pub fn mismatches(
    lhs: &[u8],
    lhs_start: usize,
    rhs: &[u8],
    rhs_start: usize,
    length: usize,
    max: usize,
) -> usize {
    assert!(
        lhs_start + length <= lhs.len(),
        "range {}..{} out of bounds for lhs of length {}",
        lhs_start,
        lhs_start + length,
        lhs.len()
    );
    assert!(
        rhs_start + length <= rhs.len(),
        "range {}..{} out of bounds for rhs of length {}",
        rhs_start,
        rhs_start + length,
        rhs.len()
    );
    let mut count = 0usize;
    for i in 0..length {
        if lhs[lhs_start + i] != rhs[rhs_start + i] {
            count += 1;
            if count >= max {
                return count;
            }
        }
    }
    count
}

const CANONICAL_BASES: &[u8] = b"ACGT";
const AMBIGUITY_BASES: &[u8] = b"ACGTRYSWKMBDHVN";

#[inline]
pub fn is_valid_base(b: u8, allow_ambiguity: bool) -> bool {
    if allow_ambiguity {
        AMBIGUITY_BASES.contains(&b)
    } else {
        CANONICAL_BASES.contains(&b)
    }
}

#[inline]
pub fn are_valid_bases(bs: &[u8], allow_ambiguity: bool) -> bool {
    bs.iter().all(|&b| is_valid_base(b, allow_ambiguity))
}

/// Offset of the first occurrence of `needle` at or after `from`.
pub(crate) fn find_subsequence(
    haystack: &[u8],
    needle: &[u8],
    from: usize,
) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

pub(crate) const PHRED_OFFSET: u8 = 33;

/// Mean PHRED score across a set of ranges of the quality string. Panics when
/// a range runs past the end of the qualities.
pub(crate) fn mean_quality(
    quals: &[u8],
    ranges: &[std::ops::Range<usize>],
) -> f64 {
    let mut total = 0u64;
    let mut n = 0u64;
    for range in ranges {
        assert!(
            range.end <= quals.len(),
            "quality range {range:?} out of bounds for length {}",
            quals.len()
        );
        for &q in &quals[range.start..range.end] {
            total += (q - PHRED_OFFSET) as u64;
            n += 1;
        }
    }
    if n == 0 {
        0f64
    } else {
        total as f64 / n as f64
    }
}

#[cfg(test)]
mod util_tests {
    use super::*;

    #[test]
    fn test_mismatches_counts_and_early_exit() {
        let lhs = b"ACGTACGT";
        let rhs = b"ACGAACGA";
        assert_eq!(mismatches(lhs, 0, rhs, 0, 8, 8), 2);
        assert_eq!(mismatches(lhs, 0, rhs, 0, 8, 1), 1);
        assert_eq!(mismatches(lhs, 0, lhs, 0, 8, 8), 0);
        assert_eq!(mismatches(lhs, 4, rhs, 4, 4, 4), 1);
    }

    #[test]
    #[should_panic]
    fn test_mismatches_panics_out_of_range() {
        mismatches(b"ACGT", 2, b"ACGT", 0, 4, 4);
    }

    #[test]
    fn test_valid_bases() {
        assert!(are_valid_bases(b"ACGT", false));
        assert!(!are_valid_bases(b"ACGN", false));
        assert!(are_valid_bases(b"ACGN", true));
        assert!(!are_valid_bases(b"acgt", false));
        assert!(!is_valid_base(b'.', true));
    }

    #[test]
    fn test_find_subsequence() {
        let read = b"AAGGCCTTGGCC";
        assert_eq!(find_subsequence(read, b"GGCC", 0), Some(2));
        assert_eq!(find_subsequence(read, b"GGCC", 3), Some(8));
        assert_eq!(find_subsequence(read, b"GGCC", 9), None);
        assert_eq!(find_subsequence(read, b"TTT", 0), None);
    }

    #[test]
    fn test_mean_quality() {
        // 'I' is PHRED 40, '5' is PHRED 20
        let quals = b"IIII5555";
        assert_eq!(mean_quality(quals, &[0..4]), 40f64);
        assert_eq!(mean_quality(quals, &[4..8]), 20f64);
        assert_eq!(mean_quality(quals, &[0..4, 4..8]), 30f64);
    }

    #[test]
    fn test_format_int_with_commas() {
        assert_eq!(format_int_with_commas(2_500_000), "2,500,000");
        assert_eq!(format_int_with_commas(-1234), "-1,234");
        assert_eq!(format_int_with_commas(999), "999");
    }
}
