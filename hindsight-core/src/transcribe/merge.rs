//! Suffix-prefix overlap deduplication for session transcripts.
//!
//! Consecutive recordings often share audio (the pre-roll of recording
//! N+1 overlaps the tail of recording N), so their transcripts repeat
//! text at the seam. Given the previous transcript `S` and the new
//! transcript `P`, the merge strips the longest string `X` such that `S`
//! ends with `X` and `P` starts with `X`. Comparison is case-sensitive
//! and whitespace-preserving.

/// Return `new` with its longest overlap against the end of `previous`
/// removed. Returns `new` verbatim when there is no overlap, and an empty
/// string when `new` is entirely a suffix of `previous`.
pub fn dedup_overlap(previous: &str, new: &str) -> String {
    let overlap = overlap_len(previous, new);
    new[overlap..].to_string()
}

/// Length in bytes of the longest `X` with `previous.ends_with(X)` and
/// `new.starts_with(X)`.
fn overlap_len(previous: &str, new: &str) -> usize {
    let max = previous.len().min(new.len());
    // Scan longest-first so the greediest overlap wins; bounds stay on
    // char boundaries because both substrings come from the same text.
    for len in (1..=max).rev() {
        if !new.is_char_boundary(len) {
            continue;
        }
        let prefix = &new[..len];
        if previous.ends_with(prefix) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_overlap_passes_through_verbatim() {
        assert_eq!(
            dedup_overlap("Hello world", "Completely new sentence"),
            "Completely new sentence"
        );
    }

    #[test]
    fn shared_seam_is_stripped() {
        assert_eq!(
            dedup_overlap("Hello world", "world and then some"),
            " and then some"
        );
    }

    #[test]
    fn full_containment_yields_empty() {
        assert_eq!(dedup_overlap("we said exactly this", "exactly this"), "");
    }

    #[test]
    fn identical_strings_yield_empty() {
        assert_eq!(dedup_overlap("same text", "same text"), "");
    }

    #[test]
    fn comparison_is_case_sensitive() {
        assert_eq!(dedup_overlap("Hello World", "world peace"), "world peace");
    }

    #[test]
    fn whitespace_is_preserved_not_normalized() {
        // Trailing space in the previous transcript is part of the match.
        assert_eq!(dedup_overlap("counting one two ", "two three"), "two three");
        assert_eq!(
            dedup_overlap("counting one two ", "two  three"),
            "two  three"
        );
        assert_eq!(dedup_overlap("counting one two", "two three"), " three");
    }

    #[test]
    fn longest_overlap_wins_over_shorter_one() {
        // Both "abc" and "c" are suffix/prefix matches; take "abc".
        assert_eq!(dedup_overlap("xxabc", "abcabcdef"), "abcdef");
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(dedup_overlap("", "new text"), "new text");
        assert_eq!(dedup_overlap("old text", ""), "");
    }

    #[test]
    fn multibyte_text_stays_on_char_boundaries() {
        assert_eq!(dedup_overlap("voilà", "à bientôt"), " bientôt");
        assert_eq!(dedup_overlap("日本語のテスト", "テストです"), "です");
    }
}
