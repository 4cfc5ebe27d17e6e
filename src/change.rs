//! Change-significance estimation between two text blobs.
//!
//! The repair loop uses [`change_fraction`] to decide whether an applied
//! fix is "real" or noise: a score of `0.0` means nothing changed, `1.0`
//! means the texts share nothing. The score is `1 - similarity_ratio`
//! where the similarity ratio is a longest-common-subsequence style
//! measure in the `2*M / (len_a + len_b)` shape.
//!
//! Small inputs are compared at character granularity via
//! `strsim::normalized_levenshtein`; larger blobs (typically full test
//! output) are compared line-by-line with an LCS over the line
//! sequences, which keeps the comparison tractable on big outputs.

/// Inputs larger than this (in bytes) are compared line-by-line instead
/// of character-by-character.
const CHAR_LEVEL_MAX_BYTES: usize = 2048;

/// Line-level comparison considers at most this many lines per side,
/// keeping the head and tail of longer outputs.
const MAX_COMPARED_LINES: usize = 4000;

/// Score how different two text blobs are, in `[0.0, 1.0]`.
///
/// `None` is treated as the empty string. Identical inputs (including
/// both empty) score `0.0`. Any degenerate internal result fails open
/// to `1.0`: when in doubt, a fix is treated as significant rather than
/// silently discarded.
///
/// # Example
///
/// ```
/// use mend::change::change_fraction;
///
/// assert_eq!(change_fraction(Some("abc"), Some("abc")), 0.0);
/// assert_eq!(change_fraction(None, None), 0.0);
/// assert!(change_fraction(Some("left"), Some("right")) > 0.0);
/// ```
#[must_use]
pub fn change_fraction(old: Option<&str>, new: Option<&str>) -> f64 {
    let old = old.unwrap_or("");
    let new = new.unwrap_or("");

    if old == new {
        return 0.0;
    }

    let ratio = similarity_ratio(old, new);
    if !ratio.is_finite() {
        return 1.0;
    }

    (1.0 - ratio).clamp(0.0, 1.0)
}

/// LCS-style similarity ratio between two texts, in `[0.0, 1.0]`.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    if a.len() <= CHAR_LEVEL_MAX_BYTES && b.len() <= CHAR_LEVEL_MAX_BYTES {
        return strsim::normalized_levenshtein(a, b);
    }

    let a_lines = clipped_lines(a);
    let b_lines = clipped_lines(b);
    let total = a_lines.len() + b_lines.len();
    if total == 0 {
        return 1.0;
    }

    let matched = lcs_length(&a_lines, &b_lines);
    2.0 * matched as f64 / total as f64
}

/// Split into lines, clipping very long outputs to head + tail.
fn clipped_lines(text: &str) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= MAX_COMPARED_LINES {
        return lines;
    }

    let head = MAX_COMPARED_LINES / 2;
    let tail = MAX_COMPARED_LINES - head;
    let mut clipped = Vec::with_capacity(MAX_COMPARED_LINES);
    clipped.extend_from_slice(&lines[..head]);
    clipped.extend_from_slice(&lines[lines.len() - tail..]);
    clipped
}

/// Length of the longest common subsequence of two line sequences.
///
/// Standard dynamic program with a rolling row, O(n*m) time and O(m)
/// space.
fn lcs_length(a: &[&str], b: &[&str]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for line_a in a {
        for (j, line_b) in b.iter().enumerate() {
            curr[j + 1] = if line_a == line_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs_score_zero() {
        assert_eq!(change_fraction(Some("hello"), Some("hello")), 0.0);
        let big = "line\n".repeat(5000);
        assert_eq!(change_fraction(Some(&big), Some(&big)), 0.0);
    }

    #[test]
    fn test_both_empty_score_zero() {
        assert_eq!(change_fraction(Some(""), Some("")), 0.0);
        assert_eq!(change_fraction(None, None), 0.0);
        assert_eq!(change_fraction(None, Some("")), 0.0);
    }

    #[test]
    fn test_absent_treated_as_empty() {
        let against_empty = change_fraction(None, Some("content"));
        let explicit_empty = change_fraction(Some(""), Some("content"));
        assert_eq!(against_empty, explicit_empty);
        assert!(against_empty > 0.9);
    }

    #[test]
    fn test_different_inputs_score_positive() {
        let score = change_fraction(Some("assertion failed at foo"), Some("all tests passed"));
        assert!(score > 0.0);
        assert!(score <= 1.0);
    }

    #[test]
    fn test_disjoint_inputs_score_near_one() {
        let score = change_fraction(Some("aaaaaaaaaaaa"), Some("zzzzzzzzzzzz"));
        assert!(score > 0.9);
    }

    #[test]
    fn test_small_edit_scores_low() {
        let old = "test result: FAILED. 3 passed; 1 failed";
        let new = "test result: FAILED. 3 passed; 2 failed";
        let score = change_fraction(Some(old), Some(new));
        assert!(score > 0.0);
        assert!(score < 0.10, "one-char edit should be below threshold, got {score}");
    }

    #[test]
    fn test_result_always_in_unit_interval() {
        let samples = [
            ("", "x"),
            ("x", ""),
            ("short", "a much longer and quite different string"),
            ("line\n", "line\nline\n"),
        ];
        for (old, new) in samples {
            let score = change_fraction(Some(old), Some(new));
            assert!((0.0..=1.0).contains(&score), "{old:?} vs {new:?} gave {score}");
        }
    }

    #[test]
    fn test_line_level_comparison_for_large_outputs() {
        // Two large outputs differing in a single line: almost identical.
        let old: String = (0..200).map(|i| format!("test case {i} ... ok\n")).collect();
        let new = old.replace("test case 150 ... ok", "test case 150 ... FAILED");
        assert!(old.len() > CHAR_LEVEL_MAX_BYTES);

        let score = change_fraction(Some(&old), Some(&new));
        assert!(score > 0.0);
        assert!(score < 0.05, "single differing line should score low, got {score}");
    }

    #[test]
    fn test_line_level_rewrite_scores_high() {
        let old: String = (0..200).map(|i| format!("module alpha check {i} passed\n")).collect();
        let new: String = (0..200).map(|i| format!("ERROR: beta stage {i} exploded\n")).collect();
        let score = change_fraction(Some(&old), Some(&new));
        assert!(score > 0.9);
    }

    #[test]
    fn test_lcs_length_basic() {
        assert_eq!(lcs_length(&["a", "b", "c"], &["a", "c"]), 2);
        assert_eq!(lcs_length(&["a", "b"], &["c", "d"]), 0);
        assert_eq!(lcs_length(&[], &["a"]), 0);
        assert_eq!(lcs_length(&["x", "y", "z"], &["x", "y", "z"]), 3);
    }

    #[test]
    fn test_clipped_lines_keeps_head_and_tail() {
        let text: String = (0..(MAX_COMPARED_LINES + 100))
            .map(|i| format!("line {i}\n"))
            .collect();
        let clipped = clipped_lines(&text);
        assert_eq!(clipped.len(), MAX_COMPARED_LINES);
        assert_eq!(clipped[0], "line 0");
        assert_eq!(
            clipped[MAX_COMPARED_LINES - 1],
            format!("line {}", MAX_COMPARED_LINES + 99)
        );
    }
}
