//! Replication configuration

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Primary/backup replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Address the primary listens on for backups
    pub listen_addr: SocketAddr,

    /// Primary a backup connects to
    pub primary_addr: Option<SocketAddr>,

    /// Heartbeat and report interval
    pub heartbeat_interval: Duration,

    /// A connection with no traffic for this long is torn down
    pub idle_timeout: Duration,

    /// Connect timeout for backups
    pub connect_timeout: Duration,

    /// Largest DATA frame body
    pub max_transfer_bytes: usize,

    /// First reconnect delay
    pub backoff_initial: Duration,

    /// Reconnect delay cap
    pub backoff_max: Duration,

    /// Reset the local store and start over when the primary reports a gap
    pub full_resync_on_gap: bool,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10912)),
            primary_addr: None,
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(3),
            max_transfer_bytes: 32 * 1024, // 32 KB
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            full_resync_on_gap: true,
        }
    }
}

impl HaConfig {
    /// Primary side listening on `listen_addr`
    pub fn primary(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Backup side replicating from `primary_addr`
    pub fn backup(primary_addr: SocketAddr) -> Self {
        Self {
            primary_addr: Some(primary_addr),
            ..Default::default()
        }
    }

    /// Short intervals for local clusters and tests
    pub fn fast(mut self) -> Self {
        self.heartbeat_interval = Duration::from_millis(50);
        self.idle_timeout = Duration::from_millis(500);
        self.connect_timeout = Duration::from_millis(500);
        self.backoff_initial = Duration::from_millis(20);
        self.backoff_max = Duration::from_millis(200);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_transfer_bytes(mut self, bytes: usize) -> Self {
        self.max_transfer_bytes = bytes;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn with_full_resync_on_gap(mut self, enabled: bool) -> Self {
        self.full_resync_on_gap = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(ClusterError::InvalidConfig(format!(
                "idle_timeout {:?} must exceed heartbeat_interval {:?}",
                self.idle_timeout, self.heartbeat_interval
            )));
        }
        if self.max_transfer_bytes == 0 {
            return Err(ClusterError::InvalidConfig(
                "max_transfer_bytes must be positive".into(),
            ));
        }
        if self.backoff_initial.is_zero() || self.backoff_max < self.backoff_initial {
            return Err(ClusterError::InvalidConfig(
                "backoff_max must be at least backoff_initial, which must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Reconnect delay after `attempt` consecutive failures
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_initial
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HaConfig::default();
        assert!(config.primary_addr.is_none());
        assert!(config.full_resync_on_gap);
        assert!(config.validate().is_ok());
        assert!(HaConfig::default().fast().validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let config = HaConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_millis(1000));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate() {
        let config = HaConfig::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_idle_timeout(Duration::from_secs(5));
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfig(_))));

        let config = HaConfig::default().with_max_transfer_bytes(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let addr: SocketAddr = "127.0.0.1:10912".parse().unwrap();
        let config = HaConfig::backup(addr);
        let json = serde_json::to_string(&config).unwrap();
        let back: HaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.primary_addr, Some(addr));
    }
}
