// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for RPC client operations.

use crate::config::ConfigError;
use crate::correlation::CorrelationId;
use crate::transport::TransportError;
use std::fmt;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur during RPC operations
#[derive(Debug)]
pub enum RpcError {
    /// Invalid DSN or client options
    Config(String),

    /// Options file could not be loaded
    ConfigFile(ConfigError),

    /// Transport could not open the connection, channel or reply queue
    Connect(TransportError),

    /// Publish rejected, including after the reconnect-and-retry
    Publish(TransportError),

    /// Listener did not confirm it was consuming within the connect timeout
    NotReady(String),

    /// Correlation id was never issued by this client, or is already consumed
    UnknownId(CorrelationId),

    /// Correlation id is already registered
    DuplicateId(CorrelationId),

    /// Client was stopped
    Shutdown,

    /// Internal error
    Internal(String),
}

impl RpcError {
    /// True for failures a later `connect()` or `send()` may get past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Publish(_) | Self::NotReady(_) | Self::Shutdown
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Invalid client configuration: {}", msg),
            Self::ConfigFile(e) => write!(f, "Failed to load client options: {}", e),
            Self::Connect(e) => write!(f, "Failed to connect to the message broker: {}", e),
            Self::Publish(e) => write!(f, "Failed to publish request: {}", e),
            Self::NotReady(msg) => write!(f, "Reply listener not ready: {}", msg),
            Self::UnknownId(id) => write!(f, "No request with correlation id {} was sent", id),
            Self::DuplicateId(id) => write!(f, "Correlation id {} is already registered", id),
            Self::Shutdown => write!(f, "RPC client shut down"),
            Self::Internal(msg) => write!(f, "Internal RPC error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigFile(e) => Some(e),
            Self::Connect(e) | Self::Publish(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for RpcError {
    fn from(e: ConfigError) -> Self {
        Self::ConfigFile(e)
    }
}
