// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process message broker and matching [`Transport`].
//!
//! Mirrors the AMQP semantics the client relies on:
//! - default exchange routes by queue name; declared exchanges route
//!   through bindings (direct, fanout, topic)
//! - exclusive queues belong to one connection and vanish with it
//! - auto-delete queues vanish when their last consumer goes away
//! - consumers live on a channel; closing the channel drops them
//! - a requeued message comes back with `redelivered = true`
//!
//! The broker side is also usable directly (declare, bind, get, reply),
//! which lets tests and the probe play the remote worker.
//!
//! Failure injection: [`MemoryBroker::refuse_connections`],
//! [`MemoryBroker::close_channels`], [`MemoryBroker::drop_connections`],
//! [`MemoryBroker::fail_next_publishes`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    ConnectionProperties, DeliveryHandler, Disposition, InboundMessage, OutboundMessage,
    Transport, TransportError,
};

// ============================================================================
// Broker types
// ============================================================================

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key
    Direct,
    /// Every bound queue receives a copy
    Fanout,
    /// Dot-separated words; `*` matches one word, `#` zero or more
    Topic,
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerMessage {
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Message body
    pub body: Vec<u8>,
    /// Correlation id property
    pub correlation_id: Option<String>,
    /// Reply-to property
    pub reply_to: Option<String>,
    /// Content-encoding property
    pub content_encoding: Option<String>,
    /// Delivery mode 2
    pub persistent: bool,
    /// Set when the message was requeued after a delivery
    pub redelivered: bool,
}

impl From<&OutboundMessage> for BrokerMessage {
    fn from(msg: &OutboundMessage) -> Self {
        Self {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            body: msg.body.clone(),
            correlation_id: Some(msg.correlation_id.clone()),
            reply_to: Some(msg.reply_to.clone()),
            content_encoding: msg.content_encoding.clone(),
            persistent: msg.persistent,
            redelivered: false,
        }
    }
}

/// Counters kept by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages accepted by an exchange
    pub published: u64,
    /// Messages that matched no queue
    pub unroutable: u64,
    /// Positive acknowledgements
    pub acked: u64,
    /// Rejections with requeue
    pub requeued: u64,
    /// Rejections without requeue
    pub dead_lettered: u64,
    /// Connections opened
    pub connections_opened: u64,
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<BrokerMessage>,
    /// Exclusive owner connection
    owner: Option<u64>,
    auto_delete: bool,
    /// Connection whose channel consumes this queue
    consumer: Option<u64>,
    had_consumer: bool,
}

impl QueueState {
    fn new(owner: Option<u64>, auto_delete: bool) -> Self {
        Self {
            messages: VecDeque::new(),
            owner,
            auto_delete,
            consumer: None,
            had_consumer: false,
        }
    }
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (binding key, queue)
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct ConnectionRecord {
    name: String,
    client_properties: BTreeMap<String, String>,
    open: bool,
    channel_open: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    connections: HashMap<u64, ConnectionRecord>,
    next_connection: u64,
    next_tag: u64,
    refuse_connections: bool,
    fail_publishes: usize,
    stats: BrokerStats,
}

impl BrokerState {
    /// Route `msg` and return how many queues received it.
    fn route(&mut self, msg: BrokerMessage) -> Result<usize, TransportError> {
        let targets: Vec<String> = if msg.exchange.is_empty() {
            if self.queues.contains_key(&msg.routing_key) {
                vec![msg.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let exchange = self.exchanges.get(&msg.exchange).ok_or_else(|| {
                TransportError::ChannelClosed(format!(
                    "NOT_FOUND - no exchange '{}'",
                    msg.exchange
                ))
            })?;
            let mut targets: Vec<String> = exchange
                .bindings
                .iter()
                .filter(|(key, _)| match exchange.kind {
                    ExchangeKind::Direct => key == &msg.routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(key, &msg.routing_key),
                })
                .map(|(_, queue)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        self.stats.published += 1;
        let mut routed = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(msg.clone());
                routed += 1;
            }
        }
        if routed == 0 {
            self.stats.unroutable += 1;
        }
        Ok(routed)
    }

    fn close_channel(&mut self, connection: u64) {
        if let Some(record) = self.connections.get_mut(&connection) {
            record.channel_open = false;
        }
        let mut doomed = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.consumer == Some(connection) {
                queue.consumer = None;
                if queue.auto_delete && queue.had_consumer {
                    doomed.push(name.clone());
                }
            }
        }
        for name in doomed {
            self.delete_queue(&name);
        }
    }

    fn drop_connection(&mut self, connection: u64) {
        self.close_channel(connection);
        if let Some(record) = self.connections.get_mut(&connection) {
            record.open = false;
        }
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        if removed {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(_, queue)| queue != name);
            }
        }
        removed
    }

    fn check_channel(&self, connection: Option<u64>) -> Result<u64, TransportError> {
        let id = connection
            .ok_or_else(|| TransportError::ConnectionClosed("not connected".to_string()))?;
        match self.connections.get(&id) {
            Some(record) if !record.open => Err(TransportError::ConnectionClosed(
                "connection closed by broker".to_string(),
            )),
            Some(record) if !record.channel_open => Err(TransportError::ChannelClosed(
                "channel is not open".to_string(),
            )),
            Some(_) => Ok(id),
            None => Err(TransportError::ConnectionClosed(
                "unknown connection".to_string(),
            )),
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    matches(&pattern, &key)
}

// ============================================================================
// Broker handle
// ============================================================================

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    arrived: Condvar,
}

/// Cloneable handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport connected to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// Declare a plain shared queue. Redeclaring is a no-op.
    pub fn declare_queue(&self, name: &str) {
        let mut state = self.shared.state.lock();
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(None, false));
    }

    /// Declare an exchange. Redeclaring keeps existing bindings.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        let mut state = self.shared.state.lock();
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
    }

    /// Bind `queue` to `exchange` with `binding_key`.
    pub fn bind(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Queue(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = state.exchanges.get_mut(exchange).ok_or_else(|| {
            TransportError::Queue(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let binding = (binding_key.to_string(), queue.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    /// Publish from outside any client connection. Returns the number of queues reached.
    pub fn publish(&self, message: BrokerMessage) -> Result<usize, TransportError> {
        let mut state = self.shared.state.lock();
        let routed = state.route(message)?;
        drop(state);
        if routed > 0 {
            self.shared.arrived.notify_all();
        }
        Ok(routed)
    }

    /// Answer `request` on its reply-to queue, echoing its correlation id.
    pub fn reply(&self, request: &BrokerMessage, body: impl Into<Vec<u8>>) -> Result<usize, TransportError> {
        let reply_to = request
            .reply_to
            .clone()
            .ok_or_else(|| TransportError::Protocol("request has no reply_to".to_string()))?;
        self.publish(BrokerMessage {
            exchange: String::new(),
            routing_key: reply_to,
            body: body.into(),
            correlation_id: request.correlation_id.clone(),
            content_encoding: request.content_encoding.clone(),
            ..BrokerMessage::default()
        })
    }

    /// Pop the next message from `queue` (auto-ack).
    pub fn get(&self, queue: &str) -> Option<BrokerMessage> {
        let mut state = self.shared.state.lock();
        let msg = state.queues.get_mut(queue)?.messages.pop_front()?;
        state.stats.acked += 1;
        Some(msg)
    }

    /// Pop the next message from `queue`, waiting up to `timeout` for one.
    pub fn wait_get(&self, queue: &str, timeout: Duration) -> Option<BrokerMessage> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state
                .queues
                .get_mut(queue)
                .and_then(|q| q.messages.pop_front())
            {
                state.stats.acked += 1;
                return Some(msg);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .arrived
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return None;
                    }
                }
                None => self.shared.arrived.wait(&mut state),
            }
        }
    }

    /// Number of ready messages in `queue`, or None if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    /// True if `queue` exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    /// Names of the currently open connections.
    pub fn connection_names(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state
            .connections
            .values()
            .filter(|r| r.open)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Client properties presented by the open connection called `name`.
    pub fn client_properties(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let state = self.shared.state.lock();
        state
            .connections
            .values()
            .find(|r| r.open && r.name == name)
            .map(|r| r.client_properties.clone())
    }

    /// Broker counters.
    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_connections = refuse;
    }

    /// Close every open channel, as the broker does after a channel error.
    pub fn close_channels(&self) {
        let mut state = self.shared.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        drop(state);
        self.shared.arrived.notify_all();
    }

    /// Drop every connection, deleting their exclusive queues.
    pub fn drop_connections(&self) {
        let mut state = self.shared.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id);
        }
        drop(state);
        self.shared.arrived.notify_all();
    }

    /// Make the next `count` client publishes fail and close their channel.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().fail_publishes = count;
    }
}

// ============================================================================
// Transport
// ============================================================================

/// [`Transport`] backed by a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    connection: Option<u64>,
    consuming: Option<String>,
    quiet: bool,
}

impl MemoryTransport {
    /// Create a disconnected transport for `broker`.
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            connection: None,
            consuming: None,
            quiet: false,
        }
    }

    /// Broker this transport talks to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn release_connection(&mut self) {
        if let Some(id) = self.connection.take() {
            let mut state = self.broker.shared.state.lock();
            state.drop_connection(id);
            state.connections.remove(&id);
        }
        self.consuming = None;
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &mut self,
        dsn: &str,
        properties: &ConnectionProperties,
    ) -> Result<(), TransportError> {
        self.release_connection();
        self.quiet = properties.quiet;

        let mut state = self.broker.shared.state.lock();
        if state.refuse_connections {
            return Err(TransportError::Connect(format!(
                "connection to {} refused",
                dsn
            )));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(
            id,
            ConnectionRecord {
                name: properties.connection_name.clone(),
                client_properties: properties.client_properties.clone(),
                open: true,
                channel_open: false,
            },
        );
        state.stats.connections_opened += 1;
        drop(state);

        self.connection = Some(id);
        if !self.quiet {
            log::debug!(
                "[MEMORY-BROKER] connection {} opened as '{}'",
                id,
                properties.connection_name
            );
        }
        Ok(())
    }

    fn open_channel(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        let id = self
            .connection
            .ok_or_else(|| TransportError::Channel("not connected".to_string()))?;
        let open = state.connections.get(&id).is_some_and(|r| r.open);
        if !open {
            return Err(TransportError::ConnectionClosed(
                "connection closed by broker".to_string(),
            ));
        }
        state.close_channel(id);
        if let Some(record) = state.connections.get_mut(&id) {
            record.channel_open = true;
        }
        self.consuming = None;
        Ok(())
    }

    fn declare_reply_queue(&mut self) -> Result<String, TransportError> {
        let mut state = self.broker.shared.state.lock();
        let id = state.check_channel(self.connection)?;
        let mut suffix = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut suffix);
        let name = format!("amq.gen-{}", URL_SAFE_NO_PAD.encode(suffix));
        state
            .queues
            .insert(name.clone(), QueueState::new(Some(id), true));
        Ok(name)
    }

    fn consume(&mut self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        let id = state.check_channel(self.connection)?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Queue(format!("NOT_FOUND - no queue '{}'", queue)))?;
        if entry.owner.is_some_and(|owner| owner != id) {
            return Err(TransportError::Queue(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                queue
            )));
        }
        if entry.consumer.is_some_and(|c| c != id) {
            return Err(TransportError::Queue(format!(
                "ACCESS_REFUSED - queue '{}' already has an exclusive consumer",
                queue
            )));
        }
        entry.consumer = Some(id);
        entry.had_consumer = true;
        drop(state);
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        let id = state.check_channel(self.connection)?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            state.close_channel(id);
            return Err(TransportError::ChannelClosed(
                "channel in wrong state for publishing".to_string(),
            ));
        }

        match state.route(BrokerMessage::from(message)) {
            Ok(routed) => {
                drop(state);
                if routed > 0 {
                    self.broker.shared.arrived.notify_all();
                }
                Ok(())
            }
            Err(e) => {
                // Channel-level error: the broker closes the channel
                if e.is_stale() {
                    state.close_channel(id);
                }
                Err(e)
            }
        }
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

        let batch: Vec<(u64, BrokerMessage)> = {
            let mut state = self.broker.shared.state.lock();
            state.check_channel(self.connection)?;
            let deadline = Instant::now().checked_add(timeout);
            loop {
                let ready = match state.queues.get(&queue) {
                    Some(q) => !q.messages.is_empty(),
                    None => {
                        return Err(TransportError::ChannelClosed(format!(
                            "queue '{}' no longer exists",
                            queue
                        )))
                    }
                };
                if ready || timeout.is_zero() {
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        if self
                            .broker
                            .shared
                            .arrived
                            .wait_until(&mut state, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    None => self.broker.shared.arrived.wait(&mut state),
                }
                state.check_channel(self.connection)?;
            }

            let messages: Vec<BrokerMessage> = match state.queues.get_mut(&queue) {
                Some(q) => q.messages.drain(..).collect(),
                None => Vec::new(),
            };
            messages
                .into_iter()
                .map(|msg| {
                    state.next_tag += 1;
                    (state.next_tag, msg)
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(batch.len());
        for (tag, msg) in batch {
            let inbound = InboundMessage {
                delivery_tag: tag,
                correlation_id: msg.correlation_id.clone(),
                body: msg.body.clone(),
                content_encoding: msg.content_encoding.clone(),
                redelivered: msg.redelivered,
            };
            let disposition = handler(&inbound);
            outcomes.push((msg, disposition));
        }

        let handled = outcomes.len();
        let mut state = self.broker.shared.state.lock();
        for (mut msg, disposition) in outcomes {
            match disposition {
                Disposition::Ack => state.stats.acked += 1,
                Disposition::Reject { requeue: false } => state.stats.dead_lettered += 1,
                Disposition::Reject { requeue: true } => {
                    state.stats.requeued += 1;
                    msg.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.messages.push_back(msg);
                    }
                }
            }
        }
        Ok(handled)
    }

    fn cancel_consumer(&mut self) -> Result<(), TransportError> {
        let Some(queue) = self.consuming.take() else {
            return Ok(());
        };
        let mut state = self.broker.shared.state.lock();
        let mut delete = false;
        if let Some(q) = state.queues.get_mut(&queue) {
            if q.consumer == self.connection {
                q.consumer = None;
                delete = q.auto_delete;
            }
        }
        if delete {
            state.delete_queue(&queue);
        }
        Ok(())
    }

    fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        state.check_channel(self.connection)?;
        state.delete_queue(queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker
            .shared
            .state
            .lock()
            .check_channel(self.connection)
            .is_ok()
    }

    fn is_connected(&self) -> bool {
        let Some(id) = self.connection else {
            return false;
        };
        self.broker
            .shared
            .state
            .lock()
            .connections
            .get(&id)
            .is_some_and(|r| r.open)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(id) = self.connection {
            if !self.quiet {
                log::debug!("[MEMORY-BROKER] connection {} closed", id);
            }
        }
        self.release_connection();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.release_connection();
    }
}
