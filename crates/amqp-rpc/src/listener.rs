// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reply listener thread.
//!
//! One listener runs per live session. It is the only consumer of the
//! reply queue and routes every inbound message into the correlation store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐        ┌───────────────────────────────┐
//! │ Client (caller threads)     │        │ amqp-rpc-listener thread      │
//! │                             │ ready  │                               │
//! │  wait_ready() ◄─────────────┼────────┤ consume + first drain         │
//! │                             │        │ loop:                         │
//! │  stop() ────────────────────┼──────► │   lock transport, drain       │
//! │                             │  stop  │   reap store (periodic)       │
//! │  send() ─► transport lock   │        │   recv_timeout(poll_interval) │
//! └─────────────────────────────┘        └───────────────────────────────┘
//! ```
//!
//! Per-message protocol:
//! - no correlation id: reject, no requeue
//! - delivered: ack
//! - payload already waiting for the id: reject, no requeue
//! - id issued here but already consumed or reclaimed: reject, no requeue
//! - id unknown: reject with requeue, at most `max_requeue` times per id

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::correlation::{CorrelationId, CorrelationStore, DeliverOutcome, Payload};
use crate::error::{RpcError, RpcResult};
use crate::transport::{Disposition, InboundMessage, Transport, TransportError};

/// Transport shared between the client and its listener.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Thread name of the listener.
pub const LISTENER_THREAD_NAME: &str = "amqp-rpc-listener";

/// Unmatched ids whose requeue attempts are tracked at once.
const REQUEUE_TRACKING_CAPACITY: usize = 4096;

// ============================================================================
// Configuration & stats
// ============================================================================

/// Listener tunables.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Sleep between drain passes; also bounds stop latency
    pub poll_interval: Duration,
    /// How often the correlation store is reaped
    pub reap_interval: Duration,
    /// Requeue attempts for an unmatched id before it is dropped
    pub max_requeue: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            reap_interval: Duration::from_secs(1),
            max_requeue: 3,
        }
    }
}

/// Listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Replies matched to a pending request
    pub delivered: u64,
    /// Second copies refused for an id whose payload is still waiting
    pub duplicates: u64,
    /// Messages without a correlation id
    pub malformed: u64,
    /// Rejections with requeue
    pub requeued: u64,
    /// Unmatched replies dropped (retired id or requeue cap reached)
    pub dropped: u64,
    /// Store slots reclaimed or purged by reaping
    pub reclaimed: u64,
}

impl ListenerStats {
    fn accumulate(&mut self, other: ListenerStats) {
        self.delivered += other.delivered;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.requeued += other.requeued;
        self.dropped += other.dropped;
        self.reclaimed += other.reclaimed;
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    reclaimed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Running total of stats across listener restarts.
#[derive(Debug, Default)]
pub struct StatsLedger {
    retired: ListenerStats,
}

impl StatsLedger {
    /// Fold a finished listener's counters into the total.
    pub fn retire(&mut self, listener: &ListenerHandle) {
        self.retired.accumulate(listener.stats());
    }

    /// Total including the live listener, if any.
    pub fn total(&self, live: Option<&ListenerHandle>) -> ListenerStats {
        let mut total = self.retired;
        if let Some(listener) = live {
            total.accumulate(listener.stats());
        }
        total
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Applies the per-message protocol.
struct Dispatcher {
    store: Arc<CorrelationStore>,
    attempts: LruCache<String, u32>,
    max_requeue: u32,
    counters: Arc<Counters>,
}

impl Dispatcher {
    fn new(store: Arc<CorrelationStore>, max_requeue: u32, counters: Arc<Counters>) -> Self {
        let capacity = NonZeroUsize::new(REQUEUE_TRACKING_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            attempts: LruCache::new(capacity),
            max_requeue,
            counters,
        }
    }

    fn handle(&mut self, msg: &InboundMessage) -> Disposition {
        let Some(raw_id) = msg.correlation_id.as_deref().filter(|id| !id.is_empty()) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "[RPC-LISTENER] Rejecting message {} without correlation id ({} bytes)",
                msg.delivery_tag,
                msg.body.len()
            );
            return Disposition::Reject { requeue: false };
        };

        let id = CorrelationId::from(raw_id);
        let payload = Payload {
            body: msg.body.clone(),
            content_encoding: msg.content_encoding.clone(),
        };

        match self.store.deliver(&id, payload) {
            DeliverOutcome::Delivered => {
                self.attempts.pop(raw_id);
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                log::debug!("[RPC-LISTENER] Delivered reply for {}", id);
                Disposition::Ack
            }
            DeliverOutcome::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                log::warn!("[RPC-LISTENER] Dropping duplicate reply for {}", id);
                Disposition::Reject { requeue: false }
            }
            DeliverOutcome::UnknownCorrelation { retired: true } => {
                self.attempts.pop(raw_id);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[RPC-LISTENER] Dropping late reply for {} (already consumed or reclaimed)",
                    id
                );
                Disposition::Reject { requeue: false }
            }
            DeliverOutcome::UnknownCorrelation { retired: false } => {
                let seen = self.attempts.get(raw_id).copied().unwrap_or(0);
                if seen < self.max_requeue {
                    self.attempts.put(raw_id.to_string(), seen + 1);
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[RPC-LISTENER] No pending request for {}, requeueing (attempt {}/{})",
                        id,
                        seen + 1,
                        self.max_requeue
                    );
                    Disposition::Reject { requeue: true }
                } else {
                    self.attempts.pop(raw_id);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "[RPC-LISTENER] No pending request for {} after {} requeue(s), dropping",
                        id,
                        seen
                    );
                    Disposition::Reject { requeue: false }
                }
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug)]
enum ListenerEvent {
    Ready,
    Failed(TransportError),
}

/// Handle to a running listener thread.
pub struct ListenerHandle {
    stop_tx: Sender<()>,
    ready_rx: Receiver<ListenerEvent>,
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    queue: String,
}

impl ListenerHandle {
    /// Spawn a listener consuming `queue`.
    ///
    /// The thread starts consuming immediately; call [`wait_ready`](Self::wait_ready)
    /// to learn whether the first pass succeeded.
    pub fn spawn(
        transport: SharedTransport,
        store: Arc<CorrelationStore>,
        queue: String,
        config: ListenerConfig,
    ) -> RpcResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded(1);
        let (ready_tx, ready_rx) = channel::bounded(1);
        let failed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            transport,
            dispatcher: Dispatcher::new(Arc::clone(&store), config.max_requeue, Arc::clone(&counters)),
            store,
            queue: queue.clone(),
            config,
            failed: Arc::clone(&failed),
        };

        let thread = thread::Builder::new()
            .name(LISTENER_THREAD_NAME.to_string())
            .spawn(move || worker.run(stop_rx, ready_tx))
            .map_err(|e| {
                RpcError::Connect(TransportError::Protocol(format!(
                    "failed to spawn listener thread: {}",
                    e
                )))
            })?;

        Ok(Self {
            stop_tx,
            ready_rx,
            thread: Some(thread),
            failed,
            counters,
            queue,
        })
    }

    /// Wait for the listener's first pass.
    pub fn wait_ready(&self, timeout: Duration) -> RpcResult<()> {
        match self.ready_rx.recv_timeout(timeout) {
            Ok(ListenerEvent::Ready) => Ok(()),
            Ok(ListenerEvent::Failed(e)) => Err(RpcError::Connect(e)),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::NotReady(format!(
                "listener on {} did not start consuming within {:?}",
                self.queue, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::NotReady(format!(
                "listener on {} exited before consuming",
                self.queue
            ))),
        }
    }

    /// True once the listener has seen the transport fail.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// True while the thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Queue this listener consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }

    /// Stop the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if thread.join().is_err() {
            log::error!("[RPC-LISTENER] Listener thread panicked");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Thread body
// ============================================================================

struct Worker {
    transport: SharedTransport,
    store: Arc<CorrelationStore>,
    dispatcher: Dispatcher,
    queue: String,
    config: ListenerConfig,
    failed: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self, stop_rx: Receiver<()>, ready_tx: Sender<ListenerEvent>) {
        match self.first_pass() {
            Ok(handled) => {
                log::info!(
                    "[RPC-LISTENER] Consuming {} ({} message(s) on first pass)",
                    self.queue,
                    handled
                );
                let _ = ready_tx.send(ListenerEvent::Ready);
            }
            Err(e) => {
                log::error!("[RPC-LISTENER] Could not consume {}: {}", self.queue, e);
                self.failed.store(true, Ordering::Release);
                let _ = ready_tx.send(ListenerEvent::Failed(e));
                return;
            }
        }

        let mut last_reap = Instant::now();
        loop {
            if let Err(e) = self.drain() {
                log::error!("[RPC-LISTENER] Transport lost on {}: {}", self.queue, e);
                self.failed.store(true, Ordering::Release);
                break;
            }

            if last_reap.elapsed() >= self.config.reap_interval {
                let now = Instant::now();
                let reclaimed = self.store.reap(now);
                self.dispatcher
                    .counters
                    .reclaimed
                    .fetch_add(reclaimed as u64, Ordering::Relaxed);
                last_reap = now;
            }

            match stop_rx.recv_timeout(self.config.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("[RPC-LISTENER] Stopped consuming {}", self.queue);
    }

    fn first_pass(&mut self) -> Result<usize, TransportError> {
        let mut transport = self.transport.lock();
        transport.consume(&self.queue)?;
        let dispatcher = &mut self.dispatcher;
        transport.process_events(Duration::ZERO, &mut |msg: &InboundMessage| {
            dispatcher.handle(msg)
        })
    }

    fn drain(&mut self) -> Result<usize, TransportError> {
        let mut transport = self.transport.lock();
        if !transport.is_open() {
            return Err(TransportError::ChannelClosed(
                "channel closed under the listener".to_string(),
            ));
        }
        let dispatcher = &mut self.dispatcher;
        transport.process_events(Duration::ZERO, &mut |msg: &InboundMessage| {
            dispatcher.handle(msg)
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
