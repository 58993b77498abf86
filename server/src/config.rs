//! Authority configuration and the policy switches for behaviours that
//! differ between deployments.

use crate::error::ConfigError;
use shared::{DEFAULT_MAX_SLOTS, MAX_SLOTS_LIMIT};
use std::time::Duration;

/// Delay before a transport disconnect is believed, absorbing churn where a
/// disconnect and an immediate reconnect arrive out of order.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);
/// How long a disconnected participant keeps its record and entity.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Silence after which the UDP transport reports a connection as lost.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Who counts towards "enough players to start".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    /// Minimum number of counted, connected participants.
    pub min_players: usize,
    /// Whether connected spectators count towards `min_players`.
    /// Spectators never block a start by being un-ready.
    pub count_spectators: bool,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            min_players: 1,
            count_spectators: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub max_slots: usize,
    pub settle_delay: Duration,
    pub grace_period: Duration,
    pub start_policy: StartPolicy,
    /// Refuse never-seen identities once every slot is taken. Known
    /// identities are always let back in.
    pub reject_new_when_full: bool,
    /// Start as soon as the start precondition holds.
    pub auto_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            settle_delay: DEFAULT_SETTLE_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
            start_policy: StartPolicy::default(),
            reject_new_when_full: false,
            auto_start: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_slots == 0 {
            return Err(ConfigError::Invalid("max_slots must be at least 1".into()));
        }
        if self.max_slots > MAX_SLOTS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_slots {} exceeds the limit of {}",
                self.max_slots, MAX_SLOTS_LIMIT
            )));
        }
        if self.grace_period < self.settle_delay {
            return Err(ConfigError::Invalid(format!(
                "grace period {:?} is shorter than the settle delay {:?}",
                self.grace_period, self.settle_delay
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_slots, 5);
        assert_eq!(config.start_policy.min_players, 1);
        assert!(!config.start_policy.count_spectators);
        assert!(!config.reject_new_when_full);
    }

    #[test]
    fn test_zero_slots_rejected() {
        let config = SessionConfig {
            max_slots: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_slot_limit() {
        let at_limit = SessionConfig {
            max_slots: MAX_SLOTS_LIMIT,
            ..SessionConfig::default()
        };
        assert!(at_limit.validate().is_ok());

        let over = SessionConfig {
            max_slots: 120,
            ..SessionConfig::default()
        };
        assert!(matches!(over.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_grace_shorter_than_settle_rejected() {
        let config = SessionConfig {
            settle_delay: Duration::from_secs(2),
            grace_period: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
