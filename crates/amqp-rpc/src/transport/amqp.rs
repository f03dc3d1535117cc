// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AMQP 0.9.1 transport backed by `amiquip`.
//!
//! Replies are pulled with `basic.get` rather than pushed by `basic.consume`:
//! amiquip consumers borrow their channel, which does not fit a transport
//! that owns both. amiquip closes a channel on any channel-level error, so
//! every failure after connect is reported as [`TransportError::ChannelClosed`].

use amiquip::{
    AmqpProperties, Channel, Connection, Publish, QueueDeclareOptions, QueueDeleteOptions,
};
use std::time::{Duration, Instant};

use super::{
    ConnectionProperties, DeliveryHandler, Disposition, InboundMessage, OutboundMessage,
    Transport, TransportError,
};

/// Delivery mode 2: persistent.
const PERSISTENT: u8 = 2;

/// Pause between empty `basic.get` polls while waiting for a reply.
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(5);

/// [`Transport`] talking to a real broker.
pub struct AmqpTransport {
    connection: Option<Connection>,
    channel: Option<Channel>,
    consuming: Option<String>,
    quiet: bool,
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AmqpTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self {
            connection: None,
            channel: None,
            consuming: None,
            quiet: false,
        }
    }

    fn channel(&self) -> Result<&Channel, TransportError> {
        if self.connection.is_none() {
            return Err(TransportError::ConnectionClosed("not connected".to_string()));
        }
        self.channel
            .as_ref()
            .ok_or_else(|| TransportError::ChannelClosed("channel is not open".to_string()))
    }

    fn drop_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                if !self.quiet {
                    log::debug!("[AMQP] channel close: {}", e);
                }
            }
        }
        self.consuming = None;
    }

    /// Forget a channel amiquip already considers dead.
    fn stale(&mut self, e: amiquip::Error) -> TransportError {
        self.channel = None;
        self.consuming = None;
        TransportError::ChannelClosed(e.to_string())
    }
}

impl Transport for AmqpTransport {
    fn connect(
        &mut self,
        dsn: &str,
        properties: &ConnectionProperties,
    ) -> Result<(), TransportError> {
        let _ = self.close();
        self.quiet = properties.quiet;

        let url = with_connection_timeout(dsn, properties.connect_timeout);
        let connection =
            Connection::insecure_open(&url).map_err(|e| TransportError::Connect(e.to_string()))?;
        if !self.quiet {
            log::info!("[AMQP] connected as '{}'", properties.connection_name);
        }
        self.connection = Some(connection);
        Ok(())
    }

    fn open_channel(&mut self) -> Result<(), TransportError> {
        self.drop_channel();
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionClosed("not connected".to_string()))?;
        match connection.open_channel(None) {
            Ok(channel) => {
                self.channel = Some(channel);
                Ok(())
            }
            Err(e) => {
                // A connection that cannot open channels is gone
                self.connection = None;
                Err(TransportError::ConnectionClosed(e.to_string()))
            }
        }
    }

    fn declare_reply_queue(&mut self) -> Result<String, TransportError> {
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let result = self
            .channel()?
            .queue_declare("", options)
            .map(|queue| queue.name().to_string());
        result.map_err(|e| self.stale(e))
    }

    fn consume(&mut self, queue: &str) -> Result<(), TransportError> {
        self.channel()?;
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut properties = AmqpProperties::default()
            .with_correlation_id(message.correlation_id.clone())
            .with_reply_to(message.reply_to.clone());
        if let Some(encoding) = &message.content_encoding {
            properties = properties.with_content_encoding(encoding.clone());
        }
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let result = self.channel()?.basic_publish(
            message.exchange.as_str(),
            Publish::with_properties(&message.body, message.routing_key.as_str(), properties),
        );
        result.map_err(|e| self.stale(e))
    }

    fn process_events(
        &mut self,
        timeout: Duration,
        handler: &mut DeliveryHandler<'_>,
    ) -> Result<usize, TransportError> {
        let queue = match &self.consuming {
            Some(queue) => queue.clone(),
            None => return Ok(0),
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut handled = 0usize;
        // Bound the pass by what was queued at the first get, so requeued
        // messages are not seen twice in one call
        let mut budget: Option<u32> = None;

        loop {
            if budget == Some(0) {
                break;
            }
            let fetched = self.channel()?.basic_get(queue.as_str(), false);
            let get = match fetched {
                Ok(Some(get)) => get,
                Ok(None) => {
                    let left = match deadline {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        None => Duration::MAX,
                    };
                    if handled > 0 || left.is_zero() {
                        break;
                    }
                    std::thread::sleep(EMPTY_POLL_BACKOFF.min(left));
                    continue;
                }
                Err(e) => return Err(self.stale(e)),
            };

            budget = Some(match budget {
                None => get.message_count,
                Some(left) => left - 1,
            });

            let delivery = get.delivery;
            let inbound = InboundMessage {
                delivery_tag: delivery.delivery_tag(),
                correlation_id: delivery.properties.correlation_id().clone(),
                body: delivery.body.clone(),
                content_encoding: delivery.properties.content_encoding().clone(),
                redelivered: delivery.redelivered,
            };
            let disposition = handler(&inbound);

            let channel = self.channel()?;
            let settled = match disposition {
                Disposition::Ack => delivery.ack(channel),
                Disposition::Reject { requeue } => delivery.reject(channel, requeue),
            };
            settled.map_err(|e| self.stale(e))?;
            handled += 1;
        }
        Ok(handled)
    }

    fn cancel_consumer(&mut self) -> Result<(), TransportError> {
        self.consuming = None;
        Ok(())
    }

    fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        let result = self
            .channel()?
            .queue_delete(queue, QueueDeleteOptions::default());
        result.map(|_| ()).map_err(|e| self.stale(e))
    }

    fn is_open(&self) -> bool {
        self.connection.is_some() && self.channel.is_some()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn presents_client_properties(&self) -> bool {
        // insecure_open takes no client-properties table
        false
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.drop_channel();
        if let Some(connection) = self.connection.take() {
            connection
                .close()
                .map_err(|e| TransportError::ConnectionClosed(e.to_string()))?;
        }
        Ok(())
    }
}

/// Add amiquip's `connection_timeout` query parameter (milliseconds) to `dsn`
/// unless the caller already set one. Timeouts too large to be useful are
/// left to the OS.
fn with_connection_timeout(dsn: &str, timeout: Option<Duration>) -> String {
    let Some(timeout) = timeout else {
        return dsn.to_string();
    };
    let millis = timeout.as_millis();
    if millis == 0 || millis > u128::from(u32::MAX) {
        return dsn.to_string();
    }
    let (base, query) = match dsn.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (dsn, None),
    };
    match query {
        Some(query) if query.split('&').any(|kv| kv.starts_with("connection_timeout=")) => {
            dsn.to_string()
        }
        Some(query) if !query.is_empty() => {
            format!("{}?{}&connection_timeout={}", base, query, millis)
        }
        _ => format!("{}?connection_timeout={}", base, millis),
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
