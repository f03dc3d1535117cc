// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client options.
//!
//! Supports both programmatic (`with_*` setters) and file-based (TOML)
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::correlation::ReapPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Options recognised by [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Connection name shown in broker management tooling.
    /// Generated as `amqp-rpc-client#<hex>` when absent.
    pub name: Option<String>,

    /// Keep transport adapter logging to errors only.
    pub quiet_transport_logs: bool,

    /// Listener poll cadence (seconds).
    pub poll_interval_secs: f64,

    /// How long `connect` waits for the listener to report ready (seconds).
    pub connect_timeout_secs: f64,

    /// Requeue attempts for an unmatched correlation id before it is dropped.
    pub max_requeue: u32,

    /// Grace period before a timed-out wait is reclaimed (seconds).
    pub abandoned_wait_grace_secs: f64,

    /// Upper bound on the life of an un-awaited request (seconds, 0 = unbounded).
    pub pending_ttl_secs: f64,

    /// How long consumed ids are remembered (seconds).
    pub retired_ttl_secs: f64,

    /// How often the listener reaps the correlation store (seconds).
    pub reap_interval_secs: f64,

    /// Merged into the connection's client properties.
    pub extra_properties: BTreeMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: None,
            extra_properties: BTreeMap::new(),
            quiet_transport_logs: false,
            poll_interval_secs: 0.01,
            connect_timeout_secs: 10.0,
            max_requeue: 3,
            abandoned_wait_grace_secs: 30.0,
            pending_ttl_secs: 600.0,
            retired_ttl_secs: 60.0,
            reap_interval_secs: 1.0,
        }
    }
}

impl ClientOptions {
    /// Load options from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: ClientOptions = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate option values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("reap_interval_secs", self.reap_interval_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number of seconds, got {}",
                    key, value
                )));
            }
        }

        for (key, value) in [
            ("abandoned_wait_grace_secs", self.abandoned_wait_grace_secs),
            ("pending_ttl_secs", self.pending_ttl_secs),
            ("retired_ttl_secs", self.retired_ttl_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be zero or more seconds, got {}",
                    key, value
                )));
            }
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("name must not be blank".into()));
            }
        }

        Ok(())
    }

    /// Set the connection name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add one client property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_properties.insert(key.into(), value.into());
        self
    }

    /// Quiet the transport adapter.
    pub fn with_quiet_transport_logs(mut self, quiet: bool) -> Self {
        self.quiet_transport_logs = quiet;
        self
    }

    /// Set the listener poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs_f64();
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set the requeue cap for unmatched replies.
    pub fn with_max_requeue(mut self, attempts: u32) -> Self {
        self.max_requeue = attempts;
        self
    }

    /// Set the grace period for timed-out waits.
    pub fn with_abandoned_wait_grace(mut self, grace: Duration) -> Self {
        self.abandoned_wait_grace_secs = grace.as_secs_f64();
        self
    }

    /// Set the pending TTL (`None` = unbounded).
    pub fn with_pending_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.pending_ttl_secs = ttl.map_or(0.0, |d| d.as_secs_f64());
        self
    }

    /// Set how long consumed ids are remembered.
    pub fn with_retired_ttl(mut self, ttl: Duration) -> Self {
        self.retired_ttl_secs = ttl.as_secs_f64();
        self
    }

    /// Set the reap cadence.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        secs(self.reap_interval_secs)
    }

    /// Store reclamation policy derived from these options.
    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            abandoned_wait_grace: secs(self.abandoned_wait_grace_secs),
            pending_ttl: (self.pending_ttl_secs > 0.0).then(|| secs(self.pending_ttl_secs)),
            retired_ttl: secs(self.retired_ttl_secs),
        }
    }
}

/// Seconds to `Duration`, clamping values `Duration` cannot hold.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let opts = ClientOptions::default();
        assert!(opts.validate().is_ok());
        assert!((opts.poll_interval().as_secs_f64() - 0.01).abs() < 1e-9);
        assert_eq!(opts.connect_timeout(), Duration::from_secs(10));
        assert_eq!(opts.max_requeue, 3);

        let policy = opts.reap_policy();
        assert_eq!(policy.abandoned_wait_grace, Duration::from_secs(30));
        assert_eq!(policy.pending_ttl, Some(Duration::from_secs(600)));
        assert_eq!(policy.retired_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validation() {
        let opts = ClientOptions::default().with_poll_interval(Duration::ZERO);
        assert!(opts.validate().is_err());

        let mut opts = ClientOptions::default();
        opts.connect_timeout_secs = f64::NAN;
        assert!(opts.validate().is_err());

        let mut opts = ClientOptions::default();
        opts.retired_ttl_secs = -1.0;
        assert!(opts.validate().is_err());

        let opts = ClientOptions::default().with_name("  ");
        assert!(opts.validate().is_err());

        let opts = ClientOptions::default().with_max_requeue(0);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_zero_pending_ttl_disables_expiry() {
        let opts = ClientOptions::default().with_pending_ttl(None);
        assert_eq!(opts.pending_ttl_secs, 0.0);
        assert_eq!(opts.reap_policy().pending_ttl, None);
    }

    #[test]
    fn test_builder() {
        let opts = ClientOptions::default()
            .with_name("billing-rpc")
            .with_property("team", "billing")
            .with_quiet_transport_logs(true)
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(opts.name.as_deref(), Some("billing-rpc"));
        assert_eq!(opts.extra_properties["team"], "billing");
        assert!(opts.quiet_transport_logs);
        assert!((opts.poll_interval().as_secs_f64() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
name = "orders"
poll_interval_secs = 0.05
max_requeue = 5

[extra_properties]
team = "orders"
"#
        )
        .expect("write");

        let opts = ClientOptions::from_file(file.path()).expect("load");
        assert_eq!(opts.name.as_deref(), Some("orders"));
        assert_eq!(opts.max_requeue, 5);
        assert_eq!(opts.extra_properties["team"], "orders");
        // Unset keys keep their defaults
        assert_eq!(opts.connect_timeout_secs, 10.0);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "poll_interval_secs = -1.0").expect("write");
        assert!(matches!(
            ClientOptions::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            ClientOptions::from_file("/nonexistent/amqp-rpc.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let opts = ClientOptions::default().with_name("orders");
        let toml_str = toml::to_string_pretty(&opts).expect("serialize");
        assert!(toml_str.contains("name = \"orders\""));
        let back: ClientOptions = toml::from_str(&toml_str).expect("parse");
        assert_eq!(back, opts);
    }
}
