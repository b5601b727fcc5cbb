#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::config::RetryConfig;
use crate::types::{FailureSignal, FailureType, RetryState, StepName};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
enum BackoffError {
    #[error("exponent {0} overflows the backoff computation")]
    Overflow(u32),
    #[error("invalid retry configuration: {0}")]
    InvalidConfig(String),
}

/// Directories a patch may never touch at any depth.
const DENIED_FRAGMENTS: &[&str] = &[
    ".git/",
    "node_modules/",
    "__pycache__/",
    ".venv/",
    ".cache/",
];

/// Build output and vendored trees, denied only at the repository root.
const DENIED_ROOT_DIRS: &[&str] = &["vendor/", "target/", "dist/", "build/"];

/// File names (or prefixes) a patch may never touch.
const DENIED_NAMES: &[&str] = &[".env", "id_rsa", ".npmrc", ".pypirc"];

/// Directory prefixes a patch may write under.
const ALLOWED_PREFIXES: &[&str] = &[
    "src/",
    "app/",
    "apps/",
    "lib/",
    "pkg/",
    "cmd/",
    "internal/",
    "components/",
    "pages/",
    "public/",
    "static/",
    "templates/",
    "test/",
    "tests/",
    "spec/",
    "__tests__/",
    "migrations/",
    "db/migrations/",
];

/// Source, template and test extensions accepted outside the allowed prefixes.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "ts", "tsx", "js", "jsx", "rb", "java", "kt", "cs", "php", "sql", "html",
    "css", "scss", "vue", "svelte",
];

/// Backoff computation and the patch path allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Seconds to wait before retrying `step`.
    ///
    /// A server-specified `retry_after_seconds` on a rate-limit signal is returned
    /// verbatim. Otherwise `base * 2^attempts` using the attempt count before
    /// this retry is recorded, capped at `max_seconds`. Computation errors yield
    /// `fallback_seconds`.
    #[must_use]
    pub fn next_backoff_seconds(
        &self,
        signal: &FailureSignal,
        step: StepName,
        retry_state: &RetryState,
    ) -> u64 {
        if signal.failure_type == FailureType::RateLimit {
            if let Some(seconds) = signal.retry_after_seconds() {
                return seconds;
            }
        }

        let attempts = retry_state.attempts_for(step);
        self.exponential(attempts).unwrap_or_else(|error| {
            warn!(%error, step = %step, "backoff computation failed; using fallback");
            self.config.fallback_seconds
        })
    }

    fn exponential(&self, attempts: u32) -> Result<u64, BackoffError> {
        if self.config.base_seconds == 0 {
            return Err(BackoffError::InvalidConfig(
                "base_seconds must be positive".to_string(),
            ));
        }
        if self.config.max_seconds < self.config.base_seconds {
            return Err(BackoffError::InvalidConfig(format!(
                "max_seconds {} below base_seconds {}",
                self.config.max_seconds, self.config.base_seconds
            )));
        }

        let raw = 2_u64
            .checked_pow(attempts)
            .and_then(|factor| factor.checked_mul(self.config.base_seconds));
        match raw {
            Some(seconds) => Ok(seconds.min(self.config.max_seconds)),
            // Past the overflow point the cap applies anyway.
            None if attempts > 0 => Ok(self.config.max_seconds),
            None => Err(BackoffError::Overflow(attempts)),
        }
    }

    /// Default-deny allowlist for patch targets.
    #[must_use]
    pub fn is_path_allowed(path: &str) -> bool {
        let normalized = path.trim().replace('\\', "/");
        let normalized = normalized.trim_start_matches("./");

        if normalized.is_empty()
            || normalized.starts_with('/')
            || normalized.split('/').any(|segment| segment == "..")
        {
            return false;
        }

        let with_slash = format!("/{normalized}");
        if DENIED_FRAGMENTS
            .iter()
            .any(|fragment| with_slash.contains(&format!("/{fragment}")))
        {
            return false;
        }
        if DENIED_ROOT_DIRS
            .iter()
            .any(|dir| normalized.starts_with(dir))
        {
            return false;
        }

        let file_name = normalized.rsplit('/').next().unwrap_or(normalized);
        if DENIED_NAMES
            .iter()
            .any(|denied| file_name == *denied || file_name.starts_with(&format!("{denied}.")))
        {
            return false;
        }
        if normalized.starts_with("config/secrets") || file_name.starts_with("secrets.") {
            return false;
        }

        if ALLOWED_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            return true;
        }

        file_name
            .rsplit_once('.')
            .is_some_and(|(stem, extension)| {
                !stem.is_empty() && ALLOWED_EXTENSIONS.contains(&extension)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
