//! Duplicate-content detection
//!
//! Best-effort: a store failure degrades to "keep both" with a reason
//! instead of blocking ingestion. Exact checksum matches short-circuit;
//! fuzzy matching restricts the search to files within a size window and
//! scores them with the blended similarity metric.

mod similarity;

pub use similarity::{compare_file_similarity, levenshtein, name_similarity, FileIdentity, SimilarityResult};

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DedupConfig;
use crate::store::{MediaStore, StoreError, StoredFile};

/// What the detector recommends doing with a candidate upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Skip,
    PromptUser,
    KeepBoth,
}

/// Caller-chosen resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Skip,
    Replace,
    KeepBoth,
    PromptUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub file: StoredFile,
    pub similarity: SimilarityResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheckResult {
    pub has_duplicates: bool,
    pub exact_matches: Vec<StoredFile>,
    pub similar: Vec<DuplicateMatch>,
    pub recommended: RecommendedAction,
    pub reason: String,
}

/// Outcome of applying a [`DuplicatePolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Reuse the already-stored file; no new work.
    UseExisting { file_id: String, message: String },
    /// Overwrite the existing file's content.
    Overwrite { file_id: String, message: String },
    /// Store the candidate under a fresh, non-colliding name.
    StoreAs { filename: String, message: String },
}

pub struct DuplicateDetector {
    store: Arc<MediaStore>,
    config: DedupConfig,
}

impl DuplicateDetector {
    pub fn new(store: Arc<MediaStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Files whose checksum matches the candidate exactly.
    pub fn find_exact_matches(&self, checksum: &str) -> Result<Vec<StoredFile>, StoreError> {
        self.store.find_files_by_checksum(checksum)
    }

    /// Fuzzy search: size within the configured window, scored and
    /// filtered at `threshold`, sorted best-first.
    pub fn find_similar(
        &self,
        candidate: &FileIdentity,
        threshold: f64,
    ) -> Result<Vec<DuplicateMatch>, StoreError> {
        let window = candidate.size / 100 * u64::from(self.config.size_window_pct);
        let min = candidate.size.saturating_sub(window);
        let max = candidate.size.saturating_add(window);

        let mut matches: Vec<DuplicateMatch> = self
            .store
            .find_files_by_size_range(min, max)?
            .into_iter()
            .map(|file| {
                let existing = FileIdentity {
                    filename: file.filename.clone(),
                    size: file.size,
                    checksum: file.checksum.clone(),
                };
                let similarity = compare_file_similarity(candidate, &existing);
                DuplicateMatch { file, similarity }
            })
            .filter(|m| m.similarity.score >= threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .score
                .partial_cmp(&a.similarity.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(matches)
    }

    /// Full duplicate check with a recommendation.
    ///
    /// Never fails: lookup errors degrade to `KeepBoth` with a reason.
    pub fn check_for_duplicates(&self, candidate: &FileIdentity) -> DuplicateCheckResult {
        if !self.config.enabled {
            return DuplicateCheckResult {
                has_duplicates: false,
                exact_matches: Vec::new(),
                similar: Vec::new(),
                recommended: RecommendedAction::KeepBoth,
                reason: "duplicate detection disabled".to_string(),
            };
        }

        let exact_matches = match self.find_exact_matches(&candidate.checksum) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "Exact-match lookup failed, keeping both");
                return degraded_result(e);
            }
        };

        if !exact_matches.is_empty() {
            debug!(
                checksum = %candidate.checksum,
                count = exact_matches.len(),
                "Exact duplicate found"
            );
            return DuplicateCheckResult {
                has_duplicates: true,
                exact_matches,
                similar: Vec::new(),
                recommended: RecommendedAction::Skip,
                reason: "identical content already exists".to_string(),
            };
        }

        let similar = if self.config.fuzzy_matching {
            match self.find_similar(candidate, self.config.similarity_threshold) {
                Ok(similar) => similar,
                Err(e) => {
                    warn!(error = %e, "Similarity search failed, keeping both");
                    return degraded_result(e);
                }
            }
        } else {
            Vec::new()
        };

        if similar.is_empty() {
            return DuplicateCheckResult {
                has_duplicates: false,
                exact_matches: Vec::new(),
                similar,
                recommended: RecommendedAction::KeepBoth,
                reason: "no duplicates found".to_string(),
            };
        }

        let best_score = similar[0].similarity.score;
        let recommended = if best_score > self.config.prompt_threshold {
            RecommendedAction::PromptUser
        } else {
            RecommendedAction::KeepBoth
        };
        let reason = format!(
            "{} similar file(s) found, best similarity {:.2}",
            similar.len(),
            best_score
        );

        DuplicateCheckResult {
            has_duplicates: true,
            exact_matches: Vec::new(),
            similar,
            recommended,
            reason,
        }
    }

    /// Deterministic mapping from a chosen policy to a resolution.
    pub fn resolve_policy(
        &self,
        candidate: &FileIdentity,
        existing: &StoredFile,
        policy: DuplicatePolicy,
    ) -> Resolution {
        match policy {
            DuplicatePolicy::Skip => Resolution::UseExisting {
                file_id: existing.file_id.clone(),
                message: format!("reusing existing file {}", existing.filename),
            },
            DuplicatePolicy::Replace => Resolution::Overwrite {
                file_id: existing.file_id.clone(),
                message: format!("replacing existing file {}", existing.filename),
            },
            DuplicatePolicy::KeepBoth | DuplicatePolicy::PromptUser => {
                let filename = suffixed_filename(&candidate.filename);
                Resolution::StoreAs {
                    message: format!("storing as {}", filename),
                    filename,
                }
            }
        }
    }
}

fn degraded_result(error: StoreError) -> DuplicateCheckResult {
    DuplicateCheckResult {
        has_duplicates: false,
        exact_matches: Vec::new(),
        similar: Vec::new(),
        recommended: RecommendedAction::KeepBoth,
        reason: format!("duplicate check unavailable ({error}), keeping file"),
    }
}

/// Insert a short random suffix before the extension so the new name
/// cannot collide with the existing one.
fn suffixed_filename(filename: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();

    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, suffix, ext),
        None => format!("{}_{}", filename, suffix),
    }
}
