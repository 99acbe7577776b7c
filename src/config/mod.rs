//! Configuration management
//!
//! The configuration file is also the durable store of forward rules: the
//! CLI adds and removes `[[forwards]]` entries, and `run` replays them.

use crate::forward::{
    ForwardError, ForwardOptions, ForwardRule, SpliceOptions, DEFAULT_BUFFER_SIZE,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
use crate::intent::{RuleAction, RuleIntent};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Engine tuning
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Stored forward rules, in insertion order
    #[serde(default)]
    pub forwards: Vec<ForwardRule>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        for rule in &config.forwards {
            rule.validate()
                .map_err(|e| crate::Error::Config(format!("Invalid forward: {}", e)))?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Stored rules, for registration and replay
    pub fn rules(&self) -> &[ForwardRule] {
        &self.forwards
    }

    /// Append a rule; returns `false` if an identical rule is already stored
    pub fn add_rule(&mut self, rule: ForwardRule) -> bool {
        if self.forwards.contains(&rule) {
            return false;
        }
        self.forwards.push(rule);
        true
    }

    /// Remove every stored rule with the same identity; returns `false` if
    /// none matched
    pub fn remove_rule(&mut self, rule: &ForwardRule) -> bool {
        let before = self.forwards.len();
        self.forwards.retain(|stored| stored != rule);
        self.forwards.len() != before
    }

    /// Apply an add or remove intent to the stored rules.
    ///
    /// Adding validates the rule first and fails with `AlreadyExists` for a
    /// stored duplicate; removing fails with `NotFound`.
    pub fn apply(&mut self, intent: &RuleIntent) -> crate::Result<()> {
        let rule = &intent.rule;
        match intent.action {
            RuleAction::Add => {
                rule.validate()?;
                if !self.add_rule(rule.clone()) {
                    return Err(ForwardError::AlreadyExists(rule.clone()).into());
                }
            }
            RuleAction::Remove => {
                if !self.remove_rule(rule) {
                    return Err(ForwardError::NotFound(rule.clone()).into());
                }
            }
        }
        Ok(())
    }
}

/// Forwarding engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Destination connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Half-close grace period in seconds
    pub drain_timeout_secs: u64,
    /// Per-direction copy buffer in bytes
    pub buffer_size: usize,
    /// Maximum concurrent connections per forward
    pub max_connections: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ForwardingConfig {
    /// Runtime options for the registry
    pub fn options(&self) -> ForwardOptions {
        ForwardOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            splice: SpliceOptions {
                buffer_size: self.buffer_size,
                drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            },
            max_connections: self.max_connections,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        forwarding: ForwardingConfig::default(),
        logging: LoggingConfig::default(),
        forwards: vec![ForwardRule::new("127.0.0.1", 8080, "127.0.0.1", 80)],
    }
}
