use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Waits after mutations whose effects propagate asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct SettleConfig {
    #[serde(default)]
    pub mode: SettleMode,

    /// Wait after creating a principal, before granting it a role.
    #[serde(default = "default_principal_delay")]
    pub principal_delay_secs: u64,

    /// Wait after instantiating the application template.
    #[serde(default = "default_template_delay")]
    pub template_delay_secs: u64,

    /// Wait after attaching a token-signing certificate.
    #[serde(default = "default_certificate_delay")]
    pub certificate_delay_secs: u64,

    /// Backoff used in `poll` mode.
    #[serde(default)]
    pub poll: PollConfig,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            mode: SettleMode::default(),
            principal_delay_secs: default_principal_delay(),
            template_delay_secs: default_template_delay(),
            certificate_delay_secs: default_certificate_delay(),
            poll: PollConfig::default(),
        }
    }
}

impl SettleConfig {
    /// No waiting at all. Used by dry runs and tests.
    pub fn immediate() -> Self {
        Self {
            mode: SettleMode::Fixed,
            principal_delay_secs: 0,
            template_delay_secs: 0,
            certificate_delay_secs: 0,
            poll: PollConfig {
                initial_delay_ms: 0,
                max_delay_ms: 0,
                jitter: 0.0,
                ..PollConfig::default()
            },
        }
    }

    /// Fixed delay for a settle point.
    pub fn delay_for(&self, point: SettlePoint) -> Duration {
        Duration::from_secs(match point {
            SettlePoint::Principal => self.principal_delay_secs,
            SettlePoint::Template => self.template_delay_secs,
            SettlePoint::Certificate => self.certificate_delay_secs,
        })
    }

    pub(super) fn validate(&self) -> Result<(), String> {
        if self.mode == SettleMode::Poll && self.poll.max_attempts == 0 {
            return Err("settle.poll.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.poll.jitter) {
            return Err("settle.poll.jitter must be between 0.0 and 1.0".into());
        }
        if self.poll.multiplier < 1.0 {
            return Err("settle.poll.multiplier must be at least 1.0".into());
        }
        Ok(())
    }
}

/// How a settle point waits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum SettleMode {
    /// Sleep for the configured duration.
    #[default]
    Fixed,
    /// Check a visibility condition with bounded exponential backoff.
    Poll,
}

/// Points in the run that wait for propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettlePoint {
    Principal,
    Template,
    Certificate,
}

impl std::fmt::Display for SettlePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlePoint::Principal => write!(f, "principal"),
            SettlePoint::Template => write!(f, "template"),
            SettlePoint::Certificate => write!(f, "certificate"),
        }
    }
}

/// Backoff for `poll` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_poll_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_poll_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_poll_multiplier")]
    pub multiplier: f64,

    /// Random jitter as a fraction of the delay (0.0-1.0).
    #[serde(default = "default_poll_jitter")]
    pub jitter: f64,

    /// Checks before giving up. The run continues either way.
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_poll_initial_delay_ms(),
            max_delay_ms: default_poll_max_delay_ms(),
            multiplier: default_poll_multiplier(),
            jitter: default_poll_jitter(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

impl PollConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        super::http::backoff_delay(
            self.initial_delay_ms,
            self.max_delay_ms,
            self.multiplier,
            self.jitter,
            attempt,
        )
    }
}

fn default_principal_delay() -> u64 {
    30
}

fn default_template_delay() -> u64 {
    20
}

fn default_certificate_delay() -> u64 {
    10
}

fn default_poll_initial_delay_ms() -> u64 {
    1_000
}

fn default_poll_max_delay_ms() -> u64 {
    15_000
}

fn default_poll_multiplier() -> f64 {
    2.0
}

fn default_poll_jitter() -> f64 {
    0.2
}

fn default_poll_max_attempts() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_propagation() {
        let config = SettleConfig::default();
        assert_eq!(config.mode, SettleMode::Fixed);
        assert_eq!(config.delay_for(SettlePoint::Principal), Duration::from_secs(30));
        assert_eq!(config.delay_for(SettlePoint::Template), Duration::from_secs(20));
        assert_eq!(config.delay_for(SettlePoint::Certificate), Duration::from_secs(10));
    }

    #[test]
    fn test_immediate_is_zero() {
        let config = SettleConfig::immediate();
        assert_eq!(config.delay_for(SettlePoint::Principal), Duration::ZERO);
        assert_eq!(config.poll.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_poll_requires_attempts() {
        let config = SettleConfig {
            mode: SettleMode::Poll,
            poll: PollConfig {
                max_attempts: 0,
                ..PollConfig::default()
            },
            ..SettleConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
