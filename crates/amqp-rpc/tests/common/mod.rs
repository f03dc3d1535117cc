// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for integration tests.

#![allow(dead_code)]

use amqp_rpc::transport::DeliveryHandler;
use amqp_rpc::{
    BrokerMessage, ClientOptions, ConnectionProperties, ExchangeKind, MemoryBroker,
    MemoryTransport, OutboundMessage, Transport, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const JOBS_EXCHANGE: &str = "jobs";
pub const WORKER_QUEUE: &str = "worker.a";
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options tuned for fast tests.
pub fn fast_options() -> ClientOptions {
    ClientOptions::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_reap_interval(Duration::from_millis(5))
        .with_connect_timeout(Duration::from_secs(5))
}

/// Broker with a `jobs` direct exchange routing `worker.a` to the `worker.a` queue.
pub fn broker_with_worker_queue() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare_queue(WORKER_QUEUE);
    broker.declare_exchange(JOBS_EXCHANGE, ExchangeKind::Direct);
    broker
        .bind(WORKER_QUEUE, JOBS_EXCHANGE, WORKER_QUEUE)
        .expect("bind worker queue");
    broker
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Remote worker answering every request on a queue.
pub struct Responder {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl Responder {
    /// Reply `"pong"` to everything.
    pub fn pong(broker: &MemoryBroker, queue: &str) -> Self {
        Self::spawn(broker, queue, |_| b"pong".to_vec())
    }

    /// Reply with the request body unchanged.
    pub fn echo(broker: &MemoryBroker, queue: &str) -> Self {
        Self::spawn(broker, queue, |req| req.body.clone())
    }

    pub fn spawn<F>(broker: &MemoryBroker, queue: &str, reply: F) -> Self
    where
        F: Fn(&BrokerMessage) -> Vec<u8> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let broker = broker.clone();
        let queue = queue.to_string();

        let handle = thread::Builder::new()
            .name("test-responder".to_string())
            .spawn(move || {
                let mut answered = 0usize;
                while flag.load(Ordering::Relaxed) {
                    if let Some(request) = broker.wait_get(&queue, Duration::from_millis(20)) {
                        if broker.reply(&request, reply(&request)).is_ok() {
                            answered += 1;
                        }
                    }
                }
                answered
            })
            .expect("spawn responder");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop and return how many requests were answered.
    pub fn finish(mut self) -> usize {
        self.running.store(false, Ordering::Relaxed);
        self.handle
            .take()
            .map(|h| h.join().expect("responder panicked"))
            .unwrap_or(0)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Memory transport that, like a socket-backed adapter, only learns its
/// connection is gone when an operation on it fails.
pub struct HandleTransport {
    inner: MemoryTransport,
    has_handle: bool,
    presents_properties: bool,
}

impl HandleTransport {
    pub fn new(broker: &MemoryBroker) -> Self {
        Self {
            inner: broker.transport(),
            has_handle: false,
            presents_properties: true,
        }
    }

    /// Claim the broker never sees the connection name or client properties.
    pub fn without_client_properties(mut self) -> Self {
        self.presents_properties = false;
        self
    }
}

impl Transport for HandleTransport {
    fn connect(
        &mut self,
        dsn: &str,
        properties: &ConnectionProperties,
    ) -> Result<(), TransportError> {
        self.has_handle = false;
        self.inner.connect(dsn, properties)?;
        self.has_handle = true;
        Ok(())
    }

    fn open_channel(&mut self) -> Result<(), TransportError> {
        self.inner.open_channel()
    }

    fn declare_reply_queue(&mut self) -> Result<String, TransportError> {
        self.inner.declare_reply_queue()
    }

    fn consume(&mut self, queue: &str) -> Result<(), TransportError> {
        self.inner.consume(queue)
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.inner.publish(message)
    }

    fn process_events(
        &mut self,
        timeout: Duration,
        handler: &mut DeliveryHandler<'_>,
    ) -> Result<usize, TransportError> {
        self.inner.process_events(timeout, handler)
    }

    fn cancel_consumer(&mut self) -> Result<(), TransportError> {
        self.inner.cancel_consumer()
    }

    fn delete_queue(&mut self, queue: &str) -> Result<(), TransportError> {
        self.inner.delete_queue(queue)
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn is_connected(&self) -> bool {
        self.has_handle
    }

    fn presents_client_properties(&self) -> bool {
        self.presents_properties
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.has_handle = false;
        self.inner.close()
    }
}
