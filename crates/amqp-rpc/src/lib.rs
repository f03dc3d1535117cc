// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation-based request/reply over an AMQP message broker.
//!
//! A request is published with a random correlation id and the client's
//! exclusive reply queue; a background listener matches replies back to
//! ids so callers can `send` and later `await_response` as if the call
//! were synchronous.
//!
//! # Features
//!
//! - **Correlation store**: exactly-once delivery per id, timed waits,
//!   reclamation of abandoned and expired requests
//! - **Connection lifecycle**: connect on demand, reconnect and retry once
//!   on a stale channel, idempotent stop that wakes every waiter
//! - **Transports**: in-process [`MemoryBroker`], and RabbitMQ through
//!   `amiquip` with the `amqp` feature
//!
//! # Quick Start
//!
//! ```rust
//! use amqp_rpc::{Client, ClientOptions, MemoryBroker};
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//! broker.declare_queue("jobs");
//!
//! // Remote worker: echo every request back in upper case
//! let worker = {
//!     let broker = broker.clone();
//!     std::thread::spawn(move || {
//!         if let Some(request) = broker.wait_get("jobs", Duration::from_secs(5)) {
//!             let body = String::from_utf8_lossy(&request.body).to_uppercase();
//!             let _ = broker.reply(&request, body);
//!         }
//!     })
//! };
//!
//! let client = Client::open("memory://local", ClientOptions::default(), broker.transport())?;
//! let reply = client.call("ping", "", "jobs", Some(Duration::from_secs(5)))?;
//! assert_eq!(reply.map(|p| p.body), Some(b"PING".to_vec()));
//!
//! worker.join().expect("worker");
//! client.stop();
//! # Ok::<(), amqp_rpc::RpcError>(())
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "billing-rpc"
//! poll_interval_secs = 0.01
//! connect_timeout_secs = 10.0
//! max_requeue = 3
//!
//! [extra_properties]
//! team = "billing"
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod listener;
pub mod transport;

pub use client::{Client, ConnectionState, SendOutcome};
pub use config::{ClientOptions, ConfigError};
pub use correlation::{CorrelationId, CorrelationStore, DeliverOutcome, Payload, ReapPolicy};
pub use error::{RpcError, RpcResult};
pub use listener::ListenerStats;
#[cfg(feature = "amqp")]
pub use transport::AmqpTransport;
pub use transport::{
    BrokerMessage, ConnectionProperties, Disposition, ExchangeKind, InboundMessage,
    MemoryBroker, MemoryTransport, OutboundMessage, Transport, TransportError,
};
