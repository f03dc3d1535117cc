// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction.
//!
//! The client never speaks the wire protocol itself. It drives a
//! [`Transport`] through one mutex, so publishing and acknowledging never
//! run concurrently on the same channel.
//!
//! Adapters:
//! - [`memory`] - in-process broker, used by tests and the probe's `--in-memory` mode
//! - `amqp` (feature `amqp`) - RabbitMQ / AMQP 0.9.1 via `amiquip`

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{BrokerMessage, BrokerStats, ExchangeKind, MemoryBroker, MemoryTransport};

/// Content encoding stamped on every request body.
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

// ============================================================================
// Messages
// ============================================================================

/// A request ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination exchange ("" = default exchange)
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message body
    pub body: Vec<u8>,
    /// Correlation id the reply must echo
    pub correlation_id: String,
    /// Queue the reply must be published to
    pub reply_to: String,
    /// Content encoding of `body`
    pub content_encoding: Option<String>,
    /// Ask the broker to persist the message
    pub persistent: bool,
}

/// A message taken from the reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned tag used for ack/reject
    pub delivery_tag: u64,
    /// Correlation id, if the sender set one
    pub correlation_id: Option<String>,
    /// Message body
    pub body: Vec<u8>,
    /// Content encoding announced by the sender
    pub content_encoding: Option<String>,
    /// True if the broker delivered this message before
    pub redelivered: bool,
}

/// What the consumer decided to do with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement
    Reject {
        /// Put the message back on the queue
        requeue: bool,
    },
}

// ============================================================================
// Connection properties
// ============================================================================

/// Metadata presented to the broker when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionProperties {
    /// Connection name shown in broker management tooling
    pub connection_name: String,
    /// Client properties (extra caller keys merged under generated ones)
    pub client_properties: BTreeMap<String, String>,
    /// Adapters keep their own diagnostics to errors only
    pub quiet: bool,
    /// Upper bound on opening the connection (None = adapter default)
    pub connect_timeout: Option<Duration>,
}

impl ConnectionProperties {
    /// Build properties for `connection_name`, merging `extra` under the generated keys.
    pub fn new(connection_name: &str, extra: &BTreeMap<String, String>, quiet: bool) -> Self {
        let mut client_properties = extra.clone();
        let generated = [
            ("connection_name", connection_name.to_string()),
            ("product", "amqp-rpc".to_string()),
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            (
                "platform",
                format!("Rust ({}/{})", std::env::consts::OS, std::env::consts::ARCH),
            ),
            (
                "information",
                "Licensed under Apache-2.0 OR MIT. See the LICENSE files supplied with this library"
                    .to_string(),
            ),
        ];
        for (key, value) in generated {
            client_properties.insert(key.to_string(), value);
        }

        Self {
            connection_name: connection_name.to_string(),
            client_properties,
            quiet,
            connect_timeout: None,
        }
    }

    /// Bound the time spent opening the connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be opened
    Connect(String),
    /// Channel could not be opened
    Channel(String),
    /// Channel is closed or in the wrong state for the operation
    ChannelClosed(String),
    /// Connection to the broker is gone
    ConnectionClosed(String),
    /// Broker refused the publish
    Publish(String),
    /// Queue declaration, deletion or consumption failed
    Queue(String),
    /// Operation called out of order (e.g. consume before declare)
    Protocol(String),
}

impl TransportError {
    /// True when a fresh channel may fix the failure.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::ConnectionClosed(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect failed: {}", msg),
            Self::Channel(msg) => write!(f, "channel open failed: {}", msg),
            Self::ChannelClosed(msg) => write!(f, "channel closed: {}", msg),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {}", msg),
            Self::Publish(msg) => write!(f, "publish failed: {}", msg),
            Self::Queue(msg) => write!(f, "queue operation failed: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol misuse: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Transport trait
// ============================================================================

/// Handler invoked for every inbound message during [`Transport::process_events`].
pub type DeliveryHandler<'a> = dyn FnMut(&InboundMessage) -> Disposition + 'a;

/// Connection, channel and reply-queue operations the client needs from a broker.
///
/// Implementations are driven from one thread at a time; the client wraps
/// the transport in a mutex shared with the listener.
pub trait Transport: Send {
    /// Open the connection.
    fn connect(&mut self, dsn: &str, properties: &ConnectionProperties)
        -> Result<(), TransportError>;

    /// Open a fresh channel, closing the previous one if any.
    fn open_channel(&mut self) -> Result<(), TransportError>;

    /// Declare an exclusive, auto-deleting, non-durable, broker-named queue.
    fn declare_reply_queue(&mut self) -> Result<String, TransportError>;

    /// Register as the exclusive consumer of `queue` with manual acknowledgements.
    fn consume(&mut self, queue: &str) -> Result<(), TransportError>;

    /// Publish a message on the current channel.
    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Hand pending inbound messages to `handler` and apply its dispositions.
    ///
    /// Waits up to `timeout` for the first message when none is ready.
    /// Returns the number of messages handled.
    fn process_events(
        &mut self,
        timeout: Duration,
        handler: &mut DeliveryHandler<'_>,
    ) -> Result<usize, TransportError>;

    /// Stop consuming.
    fn cancel_consumer(&mut self) -> Result<(), TransportError>;

    /// Delete `queue`.
    fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError>;

    /// True if both connection and channel are usable.
    fn is_open(&self) -> bool;

    /// True if the connection (regardless of channel) is usable.
    fn is_connected(&self) -> bool;

    /// Close channel and connection. Safe to call when already closed.
    fn close(&mut self) -> Result<(), TransportError>;

    /// True if the connection name and client properties reach the broker.
    fn presents_client_properties(&self) -> bool {
        true
    }
}
