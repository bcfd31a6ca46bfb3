//! Client and prefetch configuration

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::CacheDescriptor;
use crate::channel::TransportKind;
use crate::error::{Error, Result};
use crate::history::HISTORY_SIZE;
use crate::movement::MovementModel;

/// How the prefetcher turns history into candidate precincts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStrategy {
    /// Every precinct of the box enclosing all past windows
    BoundingBox,
    /// Neighbors of past windows weighted by the movement model
    #[default]
    WeightedWoi,
}

/// Configuration for prefetching behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Enable prefetching
    pub enabled: bool,

    pub strategy: PrefetchStrategy,

    /// Movement probabilities weighting neighbor windows
    pub movement: MovementModel,

    /// Overlap thresholds derived from the layer slopes
    pub penalty_buckets: usize,

    /// Penalty added per threshold exceeding a precinct's overlap
    pub penalty_step: f64,

    /// Per-precinct relevance file replacing the overlap penalty
    pub scaling_model: Option<PathBuf>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: PrefetchStrategy::WeightedWoi,
            movement: MovementModel::default(),
            penalty_buckets: 25,
            penalty_step: 0.001,
            scaling_model: None,
        }
    }
}

impl PrefetchConfig {
    /// Creates a disabled prefetch configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Creates an aggressive prefetch configuration
    ///
    /// Partially covered precincts are not penalized.
    pub fn aggressive() -> Self {
        Self {
            enabled: true,
            penalty_step: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.penalty_buckets == 0 {
            return Err(Error::Config("penalty_buckets must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&(self.penalty_step * self.penalty_buckets as f64)) {
            return Err(Error::Config(format!(
                "penalty_step {} over {} buckets leaves [0, 1]",
                self.penalty_step, self.penalty_buckets
            )));
        }
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target (image) name on the server
    pub target: String,

    /// Transport requested for new channels
    pub channel_transport: TransportKind,

    /// Keep channels open between requests
    pub keep_alive: bool,

    /// Keep received precincts across windows
    pub reuse_cache: bool,

    /// Ledger size enforced after each decoded window, unbounded if unset
    pub max_cache_bytes: Option<u64>,

    /// Main header download attempts before giving up
    pub header_attempts: u32,

    /// Windows remembered for prediction
    pub history_capacity: usize,

    /// Cache model format for stateless requests
    pub cache_descriptor: CacheDescriptor,

    pub prefetch: PrefetchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            channel_transport: TransportKind::Http,
            keep_alive: true,
            reuse_cache: true,
            max_cache_bytes: None,
            header_attempts: 3,
            history_capacity: HISTORY_SIZE,
            cache_descriptor: CacheDescriptor::default(),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for `target`
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Loads and validates a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: ClientConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(Error::Config("target must not be empty".to_string()));
        }
        if self.header_attempts == 0 {
            return Err(Error::Config("header_attempts must be at least 1".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(Error::Config("history_capacity must be at least 1".to_string()));
        }
        if !self.reuse_cache && self.channel_transport.is_stateful() {
            // a server-side session model would keep withholding dropped data
            return Err(Error::Config(
                "cache reuse can only be disabled on stateless channels".to_string(),
            ));
        }
        self.cache_descriptor.validate()?;
        self.prefetch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DescriptorForm, DescriptorQualifier};
    use crate::movement::Direction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("map.jp2");
        assert!(config.validate().is_ok());
        assert_eq!(config.header_attempts, 3);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.prefetch.penalty_buckets, 25);
        assert_eq!(config.prefetch.strategy, PrefetchStrategy::WeightedWoi);
    }

    #[test]
    fn test_presets() {
        assert!(!PrefetchConfig::disabled().enabled);
        let aggressive = PrefetchConfig::aggressive();
        assert!(aggressive.enabled);
        assert_eq!(aggressive.penalty_step, 0.0);
        assert!(aggressive.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "target": "map.jp2",
                "keep_alive": false,
                "prefetch": {{
                    "strategy": "bounding_box",
                    "movement": {{"right":0.5,"up_right":0,"up":0,"up_left":0,"left":0.5,
                                  "down_left":0,"down":0,"down_right":0,"zoom_in":0,"zoom_out":0}}
                }}
            }}"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.target, "map.jp2");
        assert!(!config.keep_alive);
        assert_eq!(config.prefetch.strategy, PrefetchStrategy::BoundingBox);
        assert_eq!(config.prefetch.movement.probability(Direction::Left), 0.5);
        assert_eq!(config.prefetch.penalty_buckets, 25);
    }

    #[test]
    fn test_from_file_rejects_bad_movement() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target":"x","prefetch":{{"movement":{{"right":0.9,"up_right":0.9,"up":0,
                "up_left":0,"left":0,"down_left":0,"down":0,"down_right":0,"zoom_in":0,"zoom_out":0}}}}}}"#
        )
        .unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_illegal_descriptor() {
        let mut config = ClientConfig::new("x");
        config.cache_descriptor = CacheDescriptor {
            form: DescriptorForm::Implicit,
            qualifier: DescriptorQualifier::NumberOfBytes,
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidCacheDescriptor { .. })
        ));
    }

    #[test]
    fn test_reuse_off_needs_stateless_channels() {
        let mut config = ClientConfig::new("x");
        config.reuse_cache = false;
        assert!(config.validate().is_err());
        config.channel_transport = TransportKind::None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_penalty() {
        let mut config = ClientConfig::new("x");
        config.prefetch.penalty_step = 0.5;
        assert!(config.validate().is_err());
        config.prefetch.penalty_step = 0.001;
        config.prefetch.penalty_buckets = 0;
        assert!(config.validate().is_err());
    }
}
