//! Identity process configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use autotrust_agreement::{StrategyParams, DIFFICULTY};
use tracing::warn;

use crate::history::HistoryParams;

/// Configuration for an identity process.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// How long to wait for capabilities at startup, and for histories
    /// after announcing.
    pub init_timeout: Duration,

    /// How long a vote on a newcomer stays open.
    pub vote_timeout: Duration,

    /// Retry interval for queued messages; also bounds outbound sends.
    pub cadence: Duration,

    /// Maximum queued wrong-phase messages.
    pub pending_limit: usize,

    /// Minimum rank whose vote counts under authority agreement.
    pub threshold_rank: i64,

    /// Leading zero bytes for work agreement.
    pub difficulty: usize,

    /// Hash of the software package; newcomers must match it.
    pub package_hash: String,

    /// Where identity, peers and group are persisted, if anywhere.
    pub cfg_dir: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(5),
            vote_timeout: Duration::from_secs(5),
            cadence: Duration::from_millis(100),
            pending_limit: 256,
            threshold_rank: 0,
            difficulty: DIFFICULTY,
            package_hash: String::new(),
            cfg_dir: None,
        }
    }
}

impl IdentityConfig {
    /// Create config from `AUTOTRUST_*` environment variables, falling back to
    /// the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            init_timeout: env_millis("AUTOTRUST_INIT_TIMEOUT_MS", defaults.init_timeout),
            vote_timeout: env_millis("AUTOTRUST_VOTE_TIMEOUT_MS", defaults.vote_timeout),
            cadence: env_millis("AUTOTRUST_CADENCE_MS", defaults.cadence),
            pending_limit: env_parse("AUTOTRUST_PENDING_LIMIT", defaults.pending_limit),
            threshold_rank: env_parse("AUTOTRUST_THRESHOLD_RANK", defaults.threshold_rank),
            difficulty: env_parse("AUTOTRUST_DIFFICULTY", defaults.difficulty),
            package_hash: std::env::var("AUTOTRUST_PACKAGE_HASH").unwrap_or(defaults.package_hash),
            cfg_dir: std::env::var("AUTOTRUST_CFG_DIR").ok().map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    #[must_use]
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    #[must_use]
    pub fn with_threshold_rank(mut self, rank: i64) -> Self {
        self.threshold_rank = rank;
        self
    }

    #[must_use]
    pub fn with_difficulty(mut self, difficulty: usize) -> Self {
        self.difficulty = difficulty;
        self
    }

    #[must_use]
    pub fn with_package_hash(mut self, hash: impl Into<String>) -> Self {
        self.package_hash = hash.into();
        self
    }

    #[must_use]
    pub fn with_cfg_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg_dir = Some(dir.into());
        self
    }

    pub fn history_params(&self) -> HistoryParams {
        HistoryParams {
            timeout: self.vote_timeout,
            strategy: StrategyParams {
                difficulty: self.difficulty,
                threshold_rank: self.threshold_rank,
            },
        }
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_parse(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = IdentityConfig::default()
            .with_init_timeout(Duration::from_millis(50))
            .with_threshold_rank(3)
            .with_difficulty(1)
            .with_package_hash("abc")
            .with_cfg_dir("/tmp/node");
        assert_eq!(config.init_timeout, Duration::from_millis(50));
        assert_eq!(config.vote_timeout, Duration::from_secs(5));
        assert_eq!(config.package_hash, "abc");
        let params = config.history_params();
        assert_eq!(params.strategy.threshold_rank, 3);
        assert_eq!(params.strategy.difficulty, 1);
    }

    #[test]
    fn env_overrides_and_fallbacks() {
        std::env::set_var("AUTOTRUST_TEST_GOOD", "42");
        std::env::set_var("AUTOTRUST_TEST_BAD", "forty-two");
        assert_eq!(env_parse("AUTOTRUST_TEST_GOOD", 7usize), 42);
        assert_eq!(env_parse("AUTOTRUST_TEST_BAD", 7usize), 7);
        assert_eq!(env_parse("AUTOTRUST_TEST_MISSING", -1i64), -1);
        assert_eq!(
            env_millis("AUTOTRUST_TEST_GOOD", Duration::from_secs(1)),
            Duration::from_millis(42)
        );
    }
}
