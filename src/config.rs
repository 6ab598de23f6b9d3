use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_RECENT_WINDOW: u32 = 100;
pub const DEFAULT_LOCAL_LOOKBACK: u32 = 10;
pub const DEFAULT_GLOBAL_LOOKBACK: u32 = 50;
pub const DEFAULT_CONFIRM_STALENESS_SECS: u64 = 60;
pub const DEFAULT_BAN_SCORE: u32 = 100;
pub const DEFAULT_MAX_TRACKED_BLOCKS: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Fraction of the delegate set a tally must strictly exceed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumRatio {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for QuorumRatio {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl QuorumRatio {
    /// Largest tally that is still short of quorum for a set of `set_size`.
    pub fn threshold(&self, set_size: usize) -> usize {
        set_size * self.numerator as usize / self.denominator as usize
    }

    /// Smallest tally that reaches quorum.
    pub fn min_votes(&self, set_size: usize) -> usize {
        self.threshold(set_size) + 1
    }

    pub fn is_reached(&self, count: usize, set_size: usize) -> bool {
        set_size > 0 && count > self.threshold(set_size)
    }
}

/// Tunables of the finality subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalityConfig {
    /// Node produces blocks and therefore votes.
    pub gen_block: bool,
    /// Tips older than this are not confirmed.
    pub confirm_staleness_secs: u64,
    /// Accepted vote heights are within this distance of the tip.
    pub recent_window: u32,
    /// Ancestors scanned for local finality.
    pub local_lookback: u32,
    /// Ancestors scanned for global finality.
    pub global_lookback: u32,
    pub quorum: QuorumRatio,
    /// Capacity of the known-vote and per-peer known sets.
    pub known_cache_size: usize,
    /// Capacity of the broadcast record.
    pub broadcast_cache_size: usize,
    /// Block collections each vote store keeps.
    pub max_tracked_blocks: usize,
    /// Misbehavior score at which a peer is banned.
    pub ban_score: u32,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            gen_block: false,
            confirm_staleness_secs: DEFAULT_CONFIRM_STALENESS_SECS,
            recent_window: DEFAULT_RECENT_WINDOW,
            local_lookback: DEFAULT_LOCAL_LOOKBACK,
            global_lookback: DEFAULT_GLOBAL_LOOKBACK,
            quorum: QuorumRatio::default(),
            known_cache_size: 10_000,
            broadcast_cache_size: 1_000,
            max_tracked_blocks: DEFAULT_MAX_TRACKED_BLOCKS,
            ban_score: DEFAULT_BAN_SCORE,
        }
    }
}

impl FinalityConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: FinalityConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum.denominator == 0 || self.quorum.numerator >= self.quorum.denominator {
            return Err(ConfigError::Invalid(format!(
                "quorum ratio {}/{} must be a proper fraction",
                self.quorum.numerator, self.quorum.denominator
            )));
        }
        if self.local_lookback == 0 || self.global_lookback == 0 {
            return Err(ConfigError::Invalid("lookback windows must be non-zero".into()));
        }
        if self.known_cache_size == 0
            || self.broadcast_cache_size == 0
            || self.max_tracked_blocks == 0
        {
            return Err(ConfigError::Invalid("cache sizes must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_thirds_threshold() {
        let q = QuorumRatio::default();
        // N=4: more than floor(8/3)=2 -> 3 votes.
        assert_eq!(q.min_votes(4), 3);
        assert!(!q.is_reached(2, 4));
        assert!(q.is_reached(3, 4));
        assert!(q.is_reached(4, 4));
        // N=21: more than 14 -> 15.
        assert_eq!(q.min_votes(21), 15);
        assert!(!q.is_reached(0, 0));
    }

    #[test]
    fn test_quorum_tolerates_a_third_faulty() {
        let q = QuorumRatio::default();
        for n in 1..=40usize {
            let faulty = (n - 1) / 3;
            assert!(q.min_votes(n) <= n - faulty, "n={}", n);
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FinalityConfig::from_json_str(r#"{ "gen_block": true, "local_lookback": 12 }"#)
            .unwrap();
        assert!(config.gen_block);
        assert_eq!(config.local_lookback, 12);
        assert_eq!(config.global_lookback, DEFAULT_GLOBAL_LOOKBACK);
        assert_eq!(config.recent_window, DEFAULT_RECENT_WINDOW);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let err = FinalityConfig::from_json_str(r#"{ "quorum": { "numerator": 3, "denominator": 3 } }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }
}
