// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation store: pending waits and received payloads keyed by correlation id.
//!
//! # Slot lifecycle
//!
//! ```text
//!   register()          deliver()           take_payload()
//!  ----------> Pending ----------> Delivered -------------> Retired --(retired_ttl)--> purged
//!                 |                                            ^
//!                 | wait() timed out, grace elapsed            |
//!                 | or pending_ttl elapsed (reap)              |
//!                 +--------------------------------------------+
//! ```
//!
//! A single mutex guards the whole map so that "store then signal" and
//! "check then remove" are each one critical section. Waiters share one
//! condvar and re-check their own slot after every wake-up.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{RpcError, RpcResult};

/// Number of random bytes behind every correlation id.
pub const CORRELATION_ID_BYTES: usize = 32;

/// Opaque, unguessable identifier correlating a request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id from 256 bits of OS-seeded randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CORRELATION_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wire representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A reply body received for a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Raw reply bytes
    pub body: Vec<u8>,
    /// Content encoding announced by the replier, if any
    pub content_encoding: Option<String>,
}

impl Payload {
    /// Payload without a content encoding.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_encoding: None,
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Consume the payload, keeping only the body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Result of routing an inbound reply into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// Payload stored and the waiter signalled
    Delivered,
    /// A payload is already waiting for this id; the new one was refused
    Duplicate,
    /// No pending wait matches the id.
    ///
    /// `retired` is true when the id was issued here but has already been
    /// consumed or reclaimed, so the reply can never be matched.
    UnknownCorrelation { retired: bool },
}

impl DeliverOutcome {
    /// True if the payload was stored.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Lifetimes applied by [`CorrelationStore::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// How long a wait that timed out stays claimable before it is reclaimed
    pub abandoned_wait_grace: Duration,
    /// Upper bound on the life of a pending wait (None = unbounded)
    pub pending_ttl: Option<Duration>,
    /// How long a consumed or reclaimed id is remembered
    pub retired_ttl: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            abandoned_wait_grace: Duration::from_secs(30),
            pending_ttl: Some(Duration::from_secs(600)),
            retired_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Pending {
        registered_at: Instant,
        /// Set when a wait timed out; reclaim after this deadline
        abandon_at: Option<Instant>,
        /// Callers currently blocked on this slot
        waiters: usize,
    },
    Delivered {
        payload: Payload,
    },
    Retired {
        since: Instant,
    },
}

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<CorrelationId, Slot>,
    closed: bool,
}

/// Instance-owned map from correlation id to pending wait or received payload.
#[derive(Debug)]
pub struct CorrelationStore {
    slots: Mutex<Slots>,
    signal: Condvar,
    policy: ReapPolicy,
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new(ReapPolicy::default())
    }
}

impl CorrelationStore {
    /// Create an empty store with the given reclaim policy.
    pub fn new(policy: ReapPolicy) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            signal: Condvar::new(),
            policy,
        }
    }

    /// Reclaim policy in force.
    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// Create a fresh pending wait for `id`.
    pub fn register(&self, id: &CorrelationId) -> RpcResult<()> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(RpcError::Shutdown);
        }
        if slots.map.contains_key(id) {
            return Err(RpcError::DuplicateId(id.clone()));
        }
        slots.map.insert(
            id.clone(),
            Slot::Pending {
                registered_at: Instant::now(),
                abandon_at: None,
                waiters: 0,
            },
        );
        Ok(())
    }

    /// Store `payload` for `id` and wake its waiter.
    pub fn deliver(&self, id: &CorrelationId, payload: Payload) -> DeliverOutcome {
        let mut slots = self.slots.lock();
        let outcome = match slots.map.get_mut(id) {
            Some(slot @ Slot::Pending { .. }) => {
                *slot = Slot::Delivered { payload };
                DeliverOutcome::Delivered
            }
            Some(Slot::Delivered { .. }) => DeliverOutcome::Duplicate,
            Some(Slot::Retired { .. }) => DeliverOutcome::UnknownCorrelation { retired: true },
            None => DeliverOutcome::UnknownCorrelation { retired: false },
        };
        if outcome.is_delivered() {
            self.signal.notify_all();
        }
        outcome
    }

    /// Remove and return the payload for `id` if it has arrived.
    ///
    /// Pending and already-consumed ids yield `Ok(None)`; ids this store
    /// never saw yield [`RpcError::UnknownId`].
    pub fn take_payload(&self, id: &CorrelationId) -> RpcResult<Option<Payload>> {
        let mut slots = self.slots.lock();
        Self::take_locked(&mut slots, id)
    }

    fn take_locked(slots: &mut Slots, id: &CorrelationId) -> RpcResult<Option<Payload>> {
        match slots.map.get_mut(id) {
            None => Err(RpcError::UnknownId(id.clone())),
            Some(Slot::Pending { .. }) | Some(Slot::Retired { .. }) => Ok(None),
            Some(slot @ Slot::Delivered { .. }) => {
                let retired = Slot::Retired {
                    since: Instant::now(),
                };
                match std::mem::replace(slot, retired) {
                    Slot::Delivered { payload } => Ok(Some(payload)),
                    _ => Err(RpcError::Internal("slot changed under lock".to_string())),
                }
            }
        }
    }

    /// Block until `id` is delivered or `timeout` elapses.
    ///
    /// Returns `Ok(true)` once a payload is waiting, `Ok(false)` on timeout.
    /// A timed-out wait is marked abandoned and reclaimed by [`reap`](Self::reap)
    /// after the grace period unless a reply or another wait claims it first.
    pub fn wait(&self, id: &CorrelationId, timeout: Option<Duration>) -> RpcResult<bool> {
        // A timeout too large to express as an instant waits forever
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(RpcError::Shutdown);
        }

        match slots.map.get_mut(id) {
            None | Some(Slot::Retired { .. }) => return Err(RpcError::UnknownId(id.clone())),
            Some(Slot::Delivered { .. }) => return Ok(true),
            Some(Slot::Pending {
                abandon_at,
                waiters,
                ..
            }) => {
                *abandon_at = None;
                *waiters += 1;
            }
        }

        let result = loop {
            if slots.closed {
                break Err(RpcError::Shutdown);
            }
            match slots.map.get(id) {
                Some(Slot::Delivered { .. }) => break Ok(true),
                // Reclaimed or taken by another reader while we slept
                None | Some(Slot::Retired { .. }) => break Ok(false),
                Some(Slot::Pending { .. }) => {}
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Ok(false);
                    }
                    self.signal.wait_until(&mut slots, deadline);
                }
                None => self.signal.wait(&mut slots),
            }
        };

        if let Some(Slot::Pending {
            abandon_at,
            waiters,
            ..
        }) = slots.map.get_mut(id)
        {
            *waiters = waiters.saturating_sub(1);
            if matches!(result, Ok(false)) && *waiters == 0 {
                *abandon_at = Instant::now().checked_add(self.policy.abandoned_wait_grace);
            }
        }
        result
    }

    /// Block until delivered, then take the payload in the same critical section.
    pub fn wait_and_take(
        &self,
        id: &CorrelationId,
        timeout: Option<Duration>,
    ) -> RpcResult<Option<Payload>> {
        if !self.wait(id, timeout)? {
            return Ok(None);
        }
        let mut slots = self.slots.lock();
        match Self::take_locked(&mut slots, id) {
            // Reclaimed between wake-up and take
            Err(RpcError::UnknownId(_)) => Ok(None),
            other => other,
        }
    }

    /// Drop the slot for a request that was never published.
    pub fn forget(&self, id: &CorrelationId) {
        let mut slots = self.slots.lock();
        if slots.map.remove(id).is_some() {
            self.signal.notify_all();
        }
    }

    /// Reclaim abandoned and expired waits and purge old tombstones.
    ///
    /// Returns the number of slots reclaimed or purged.
    pub fn reap(&self, now: Instant) -> usize {
        let policy = self.policy;
        let mut slots = self.slots.lock();
        let mut touched = 0usize;

        slots.map.retain(|_, slot| match slot {
            Slot::Retired { since } => {
                let keep = now.saturating_duration_since(*since) < policy.retired_ttl;
                if !keep {
                    touched += 1;
                }
                keep
            }
            _ => true,
        });

        for slot in slots.map.values_mut() {
            let reclaim = match slot {
                Slot::Pending {
                    registered_at,
                    abandon_at,
                    waiters,
                } => {
                    let abandoned = abandon_at.is_some_and(|at| now >= at);
                    let expired = policy
                        .pending_ttl
                        .is_some_and(|ttl| now.saturating_duration_since(*registered_at) >= ttl);
                    *waiters == 0 && (abandoned || expired)
                }
                _ => false,
            };
            if reclaim {
                *slot = Slot::Retired { since: now };
                touched += 1;
            }
        }

        if touched > 0 {
            log::debug!("[CORRELATION] reaped {} slot(s)", touched);
            self.signal.notify_all();
        }
        touched
    }

    /// Wake every waiter with [`RpcError::Shutdown`] and drop all slots.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.map.clear();
        self.signal.notify_all();
    }

    /// Accept registrations again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.slots.lock().closed = false;
    }

    /// True once [`close`](Self::close) has been called and not reopened.
    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    /// Number of slots of any kind.
    pub fn len(&self) -> usize {
        self.slots.lock().map.len()
    }

    /// True when no slot is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.slots
            .lock()
            .map
            .values()
            .filter(|s| matches!(s, Slot::Pending { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn short_policy() -> ReapPolicy {
        ReapPolicy {
            abandoned_wait_grace: Duration::from_millis(20),
            pending_ttl: None,
            retired_ttl: Duration::from_millis(20),
        }
    }

    #[test]
    fn generated_ids_are_long_and_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
        // 32 bytes -> 43 base64 chars without padding
        assert!(ids.iter().all(|id| id.as_str().len() == 43));
        assert!(ids
            .iter()
            .all(|id| id.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')));
    }

    #[test]
    fn deliver_then_wait_returns_payload() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        assert_eq!(
            store.deliver(&id, Payload::new(b"pong".to_vec())),
            DeliverOutcome::Delivered
        );
        let payload = store.wait_and_take(&id, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(payload.unwrap().body, b"pong");
    }

    #[test]
    fn register_twice_is_rejected() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        assert!(matches!(store.register(&id), Err(RpcError::DuplicateId(_))));
    }

    #[test]
    fn unknown_ids_fail_on_wait_and_take() {
        let store = CorrelationStore::default();
        let id = CorrelationId::from("never-sent");
        assert!(matches!(store.wait(&id, Some(Duration::ZERO)), Err(RpcError::UnknownId(_))));
        assert!(matches!(store.take_payload(&id), Err(RpcError::UnknownId(_))));
    }

    #[test]
    fn payload_is_consumed_exactly_once() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        store.deliver(&id, Payload::new(b"once".to_vec()));

        assert!(store.take_payload(&id).unwrap().is_some());
        assert_eq!(store.take_payload(&id).unwrap(), None);
        // A consumed id can no longer be awaited
        assert!(matches!(store.wait(&id, Some(Duration::ZERO)), Err(RpcError::UnknownId(_))));
    }

    #[test]
    fn second_delivery_before_collection_is_a_duplicate() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        assert!(store.deliver(&id, Payload::new(b"first".to_vec())).is_delivered());
        assert_eq!(
            store.deliver(&id, Payload::new(b"second".to_vec())),
            DeliverOutcome::Duplicate
        );
        assert_eq!(store.take_payload(&id).unwrap().unwrap().body, b"first");
    }

    #[test]
    fn delivery_after_collection_is_unknown_correlation() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        store.deliver(&id, Payload::new(b"first".to_vec()));
        store.take_payload(&id).unwrap();

        assert_eq!(
            store.deliver(&id, Payload::new(b"late".to_vec())),
            DeliverOutcome::UnknownCorrelation { retired: true }
        );
        assert_eq!(store.take_payload(&id).unwrap(), None);
    }

    #[test]
    fn delivery_for_unregistered_id_never_matches_a_waiter() {
        let store = Arc::new(CorrelationStore::default());
        let mine = CorrelationId::generate();
        store.register(&mine).unwrap();

        let stranger = CorrelationId::generate();
        assert_eq!(
            store.deliver(&stranger, Payload::new(b"foreign".to_vec())),
            DeliverOutcome::UnknownCorrelation { retired: false }
        );
        assert!(!store.wait(&mine, Some(Duration::from_millis(10))).unwrap());
        assert_eq!(store.take_payload(&mine).unwrap(), None);
    }

    #[test]
    fn wait_times_out_and_wait_can_be_retried() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        let start = Instant::now();
        assert!(!store.wait(&id, Some(Duration::from_millis(50))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));

        // Still claimable until reaped
        store.deliver(&id, Payload::new(b"slow".to_vec()));
        assert!(store.wait(&id, Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn waiter_is_woken_by_concurrent_delivery() {
        let store = Arc::new(CorrelationStore::default());
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        let producer = {
            let store = Arc::clone(&store);
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                store.deliver(&id, Payload::new(b"late-but-in-time".to_vec()))
            })
        };

        let payload = store.wait_and_take(&id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(payload.unwrap().body, b"late-but-in-time");
        assert!(producer.join().unwrap().is_delivered());
    }

    #[test]
    fn many_waiters_each_get_their_own_reply() {
        let store = Arc::new(CorrelationStore::default());
        let ids: Vec<_> = (0..16).map(|_| CorrelationId::generate()).collect();
        for id in &ids {
            store.register(id).unwrap();
        }

        let waiters: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let payload = store.wait_and_take(&id, Some(Duration::from_secs(5))).unwrap();
                    (id, payload)
                })
            })
            .collect();

        for id in ids.iter().rev() {
            store.deliver(id, Payload::new(id.as_str().as_bytes().to_vec()));
        }

        for handle in waiters {
            let (id, payload) = handle.join().unwrap();
            assert_eq!(payload.unwrap().body, id.as_str().as_bytes());
        }
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn abandoned_wait_is_reclaimed_after_grace() {
        let store = CorrelationStore::new(short_policy());
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        assert!(!store.wait(&id, Some(Duration::from_millis(5))).unwrap());

        // Not yet past the grace period
        assert_eq!(store.reap(Instant::now()), 0);
        assert_eq!(store.pending_count(), 1);

        let later = Instant::now() + Duration::from_millis(25);
        assert_eq!(store.reap(later), 1);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(
            store.deliver(&id, Payload::new(b"too late".to_vec())),
            DeliverOutcome::UnknownCorrelation { retired: true }
        );
        assert_eq!(store.take_payload(&id).unwrap(), None);

        // Tombstone purged once the retired TTL passes
        store.reap(later + Duration::from_millis(25));
        assert!(store.is_empty());
    }

    #[test]
    fn wait_with_unbounded_duration_still_gets_its_reply() {
        let store = Arc::new(CorrelationStore::default());
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        let producer = {
            let store = Arc::clone(&store);
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.deliver(&id, Payload::new(b"pong".to_vec()))
            })
        };

        let payload = store.wait_and_take(&id, Some(Duration::MAX)).unwrap();
        assert_eq!(payload.unwrap().body, b"pong");
        assert!(producer.join().unwrap().is_delivered());
    }

    #[test]
    fn unbounded_grace_never_reclaims_a_timed_out_wait() {
        let store = CorrelationStore::new(ReapPolicy {
            abandoned_wait_grace: Duration::MAX,
            pending_ttl: None,
            ..short_policy()
        });
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        assert!(!store.wait(&id, Some(Duration::from_millis(5))).unwrap());
        assert_eq!(store.reap(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(store.pending_count(), 1);

        store.deliver(&id, Payload::new(b"eventually".to_vec()));
        assert_eq!(store.take_payload(&id).unwrap().unwrap().body, b"eventually");
    }

    #[test]
    fn pending_ttl_bounds_unawaited_requests() {
        let store = CorrelationStore::new(ReapPolicy {
            pending_ttl: Some(Duration::from_millis(10)),
            ..short_policy()
        });
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        assert_eq!(store.reap(Instant::now() + Duration::from_millis(15)), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let store = Arc::new(CorrelationStore::default());
        let id = CorrelationId::generate();
        store.register(&id).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            let id = id.clone();
            thread::spawn(move || store.wait(&id, None))
        };
        thread::sleep(Duration::from_millis(20));
        store.close();

        assert!(matches!(waiter.join().unwrap(), Err(RpcError::Shutdown)));
        assert!(store.is_empty());
        assert!(matches!(store.register(&id), Err(RpcError::Shutdown)));

        store.reopen();
        store.register(&id).unwrap();
    }

    #[test]
    fn forget_removes_the_slot() {
        let store = CorrelationStore::default();
        let id = CorrelationId::generate();
        store.register(&id).unwrap();
        store.forget(&id);
        assert!(matches!(store.take_payload(&id), Err(RpcError::UnknownId(_))));
    }
}
