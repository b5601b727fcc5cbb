#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::ports::GeneratedChange;
use crate::types::{DiffArtifact, RunId};
use chrono::Utc;
use sha2::{Digest, Sha256};

const FILE_WEIGHT: f64 = 0.35;
const SIZE_WEIGHT: f64 = 0.35;
const SENSITIVE_WEIGHT: f64 = 0.7;
const FILES_AT_FULL_WEIGHT: f64 = 20.0;
const LINES_AT_FULL_WEIGHT: f64 = 500.0;

const SENSITIVE_MARKERS: [&str; 7] = [
    "migrations/",
    "auth",
    "billing",
    "payment",
    "secrets",
    "permissions",
    ".sql",
];

/// Whether a changed path falls in an area that always deserves review.
#[must_use]
pub fn is_sensitive_path(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    SENSITIVE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn changed_lines(unified_diff: &str) -> usize {
    unified_diff
        .lines()
        .filter(|line| {
            (line.starts_with('+') && !line.starts_with("+++"))
                || (line.starts_with('-') && !line.starts_with("---"))
        })
        .count()
}

/// Risk in `[0, 1]` from breadth, size, and sensitive paths of a change.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn risk_score(files_changed: &[String], unified_diff: &str) -> f64 {
    let file_factor = (files_changed.len() as f64 / FILES_AT_FULL_WEIGHT).min(1.0);
    let size_factor = (changed_lines(unified_diff) as f64 / LINES_AT_FULL_WEIGHT).min(1.0);
    let sensitive = if files_changed.iter().any(|path| is_sensitive_path(path)) {
        SENSITIVE_WEIGHT
    } else {
        0.0
    };
    FILE_WEIGHT
        .mul_add(file_factor, SIZE_WEIGHT.mul_add(size_factor, sensitive))
        .clamp(0.0, 1.0)
}

#[must_use]
pub fn content_hash(unified_diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unified_diff.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Scored, hashed artifact for one generate step.
#[must_use]
pub fn diff_artifact(run_id: RunId, iteration: u32, change: &GeneratedChange) -> DiffArtifact {
    DiffArtifact {
        run_id,
        iteration,
        unified_diff: change.unified_diff.clone(),
        files_changed: change.files_changed.clone(),
        risk_score: risk_score(&change.files_changed, &change.unified_diff),
        content_hash: content_hash(&change.unified_diff),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|path| (*path).to_string()).collect()
    }

    #[test]
    fn small_source_change_is_low_risk() {
        let diff = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n";
        let score = risk_score(&files(&["src/lib.rs"]), diff);
        assert!(score < 0.1, "score was {score}");
    }

    #[test]
    fn touching_migrations_crosses_approval_threshold() {
        let score = risk_score(&files(&["migrations/0003_add_deals.sql"]), "+create table deals;\n");
        assert!(score >= 0.7, "score was {score}");
    }

    #[test]
    fn auth_paths_are_sensitive_case_insensitively() {
        assert!(is_sensitive_path("src/Auth/session.rs"));
        assert!(!is_sensitive_path("src/contacts/list.rs"));
    }

    #[test]
    fn score_is_clamped_for_huge_sensitive_changes() {
        let many: Vec<String> = (0..50).map(|n| format!("src/auth/file_{n}.rs")).collect();
        let diff = "+line\n".repeat(2_000);
        assert!((risk_score(&many, &diff) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn content_hash_is_stable_sha256_hex() {
        let first = content_hash("+hello\n");
        assert_eq!(first.len(), 64);
        assert_eq!(first, content_hash("+hello\n"));
        assert_ne!(first, content_hash("+hello!\n"));
    }
}
