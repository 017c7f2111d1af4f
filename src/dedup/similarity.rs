//! File identity comparison
//!
//! Checksum equality is decisive; otherwise the score blends exact-size
//! match (0.3) with filename similarity (0.7), where filename similarity
//! is 1 − normalized Levenshtein distance over lowercased,
//! separator-normalized names.

use serde::Serialize;

const SIZE_WEIGHT: f64 = 0.3;
const NAME_WEIGHT: f64 = 0.7;

/// Minimal identity of a file for comparison purposes.
#[derive(Debug, Clone, PartialEq)]
pub struct FileIdentity {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityResult {
    pub is_exact_match: bool,
    pub checksum_match: bool,
    pub size_match: bool,
    pub filename_match: bool,
    pub score: f64,
}

/// Lowercase and collapse every non-alphanumeric run into a single
/// space, so separator style ("-", "_", ".") never distorts the edit
/// distance.
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classic two-row Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Name similarity in [0,1]: 1 − edit distance / longer length.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);

    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }

    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

/// Score how likely two files are the same content.
pub fn compare_file_similarity(a: &FileIdentity, b: &FileIdentity) -> SimilarityResult {
    let checksum_match =
        !a.checksum.is_empty() && !b.checksum.is_empty() && a.checksum == b.checksum;
    let size_match = a.size == b.size;
    let name_score = name_similarity(&a.filename, &b.filename);
    let filename_match = name_score >= 1.0;

    let score = if checksum_match {
        1.0
    } else {
        SIZE_WEIGHT * f64::from(u8::from(size_match)) + NAME_WEIGHT * name_score
    };

    SimilarityResult {
        is_exact_match: checksum_match && size_match,
        checksum_match,
        size_match,
        filename_match,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, size: u64, checksum: &str) -> FileIdentity {
        FileIdentity {
            filename: name.to_string(),
            size,
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
    }

    #[test]
    fn identical_file_scores_one() {
        let file = identity("take_01.wav", 4096, "abcd");
        let result = compare_file_similarity(&file, &file.clone());
        assert!(result.is_exact_match);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn checksum_match_is_decisive() {
        let a = identity("old name.wav", 4096, "abcd");
        let b = identity("completely different.flac", 9999, "abcd");
        let result = compare_file_similarity(&a, &b);
        assert!(result.checksum_match);
        assert!(!result.is_exact_match); // sizes differ
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn empty_checksums_never_match() {
        let a = identity("a.wav", 100, "");
        let b = identity("a.wav", 100, "");
        let result = compare_file_similarity(&a, &b);
        assert!(!result.checksum_match);
        assert!(result.size_match);
        assert_eq!(result.score, 1.0); // 0.3 size + 0.7 identical name
    }

    #[test]
    fn punctuation_is_ignored_in_names() {
        assert_eq!(name_similarity("My-Track_(final).mp3", "my track final mp3"), 1.0);
        assert_eq!(name_similarity("My-Track_(final).mp3", "my.track.final.mp3"), 1.0);
        assert_eq!(name_similarity("take__01.wav", "take 01.wav"), 1.0);
    }

    #[test]
    fn blended_score_for_near_names() {
        let a = identity("interview_part1.wav", 1000, "x");
        let b = identity("interview_part2.wav", 1000, "y");
        let result = compare_file_similarity(&a, &b);
        assert!(result.size_match);
        assert!(!result.checksum_match);
        assert!(result.score > 0.9, "score was {}", result.score);
        assert!(result.score < 1.0);
    }

    #[test]
    fn unrelated_files_score_low() {
        let a = identity("a.wav", 100, "x");
        let b = identity("zzzzzzzzzzzzzz.mp4", 90_000, "y");
        let result = compare_file_similarity(&a, &b);
        assert!(result.score < 0.4, "score was {}", result.score);
    }
}
