//! Per-key request coalescing.
//!
//! At most one fetch per key is in flight. The first caller for a key becomes
//! the [`Slot::Leader`] and owns the broadcast sender; everyone arriving while
//! the marker is registered becomes a [`Slot::Follower`] and waits on a
//! receiver. Registration and lookup happen under one map-entry lock, so a
//! caller is never both too late to join and too early to lead.
//!
//! Each round also carries a stale flag. [`Singleflight::mark_stale`] sets it
//! for one key only, telling that round its result must not be kept.

use std::{
    borrow::Borrow,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::broadcast;

/// Registered state of one in-flight round.
struct Flight<V> {
    sender: broadcast::Sender<V>,
    stale: Arc<AtomicBool>,
}

/// What the leader of a round needs to run and publish it.
pub(crate) struct Ticket<V> {
    sender: broadcast::Sender<V>,
    stale: Arc<AtomicBool>,
}

impl<V> Ticket<V> {
    /// Attaches the leader's own receiver before the fetch starts.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<V> {
        self.sender.subscribe()
    }
}

/// Outcome of [`Singleflight::acquire`].
pub(crate) enum Slot<V> {
    /// No fetch was in flight; the caller must run it and publish through
    /// the ticket.
    Leader(Ticket<V>),
    /// A fetch is already in flight; its result arrives on this receiver.
    Follower(broadcast::Receiver<V>),
}

/// Registry of in-flight fetches keyed by `K`.
pub(crate) struct Singleflight<K, V> {
    in_flight: DashMap<K, Flight<V>>,
}

impl<K, V> Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self { in_flight: DashMap::new() }
    }

    /// Atomically joins the in-flight fetch for `key` or registers a new one.
    pub(crate) fn acquire(&self, key: K) -> Slot<V> {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => Slot::Follower(entry.get().sender.subscribe()),
            Entry::Vacant(entry) => {
                // One message per round, so a single slot suffices.
                let (sender, _rx) = broadcast::channel(1);
                let stale = Arc::new(AtomicBool::new(false));
                entry.insert(Flight { sender: sender.clone(), stale: Arc::clone(&stale) });
                Slot::Leader(Ticket { sender, stale })
            },
        }
    }

    /// Flags the in-flight round for `key`, if any, as stale.
    ///
    /// Returns `true` if a round was flagged.
    pub(crate) fn mark_stale<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.in_flight.get(key) {
            Some(flight) => {
                flight.stale.store(true, Ordering::SeqCst);
                true
            },
            None => false,
        }
    }

    /// Clears the in-flight marker for `key`.
    pub(crate) fn complete(&self, key: &K) {
        self.in_flight.remove(key);
    }

    /// Number of keys with a fetch in flight.
    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Clears the in-flight marker on drop, including when the fetch panics.
///
/// Dropping the guard without [`publish`](Self::publish) also drops the last
/// sender, so every waiter observes a closed channel instead of hanging.
pub(crate) struct FlightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    flights: &'a Singleflight<K, V>,
    key: K,
    stale: Arc<AtomicBool>,
    sender: Option<broadcast::Sender<V>>,
}

impl<'a, K, V> FlightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new(flights: &'a Singleflight<K, V>, key: K, ticket: Ticket<V>) -> Self {
        Self { flights, key, stale: ticket.stale, sender: Some(ticket.sender) }
    }

    /// Returns `true` once [`Singleflight::mark_stale`] has flagged this round.
    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Clears the marker, then fans `value` out to every attached waiter.
    ///
    /// The marker goes first: a caller that misses after this point starts a
    /// new round instead of subscribing to a channel that has already fired.
    pub(crate) fn publish(mut self, value: V) {
        self.flights.complete(&self.key);
        if let Some(sender) = self.sender.take() {
            // No receivers left is fine: every waiter gave up.
            let _ = sender.send(value);
        }
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.flights.complete(&self.key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_first_acquire_leads_second_follows() {
        let flights: Singleflight<String, u32> = Singleflight::new();

        assert!(matches!(flights.acquire("k".into()), Slot::Leader(_)));
        assert!(matches!(flights.acquire("k".into()), Slot::Follower(_)));
        assert!(matches!(flights.acquire("other".into()), Slot::Leader(_)));
        assert_eq!(flights.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_followers_and_clears_marker() {
        let flights: Singleflight<String, u32> = Singleflight::new();

        let Slot::Leader(ticket) = flights.acquire("k".into()) else { panic!("expected leader") };
        let Slot::Follower(mut rx) = flights.acquire("k".into()) else {
            panic!("expected follower")
        };

        FlightGuard::new(&flights, "k".to_owned(), ticket).publish(7);

        assert_eq!(rx.recv().await.unwrap(), 7);
        assert_eq!(flights.len(), 0);
        assert!(matches!(flights.acquire("k".into()), Slot::Leader(_)), "next miss starts a new round");
    }

    #[tokio::test]
    async fn test_dropped_guard_closes_channel() {
        let flights: Singleflight<String, u32> = Singleflight::new();

        let Slot::Leader(ticket) = flights.acquire("k".into()) else { panic!("expected leader") };
        let Slot::Follower(mut rx) = flights.acquire("k".into()) else {
            panic!("expected follower")
        };

        drop(FlightGuard::new(&flights, "k".to_owned(), ticket));

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(flights.len(), 0);
    }

    #[test]
    fn test_mark_stale_flags_only_that_key() {
        let flights: Singleflight<String, u32> = Singleflight::new();

        let Slot::Leader(a) = flights.acquire("a".into()) else { panic!("expected leader") };
        let Slot::Leader(b) = flights.acquire("b".into()) else { panic!("expected leader") };
        let guard_a = FlightGuard::new(&flights, "a".to_owned(), a);
        let guard_b = FlightGuard::new(&flights, "b".to_owned(), b);

        assert!(flights.mark_stale("a"));
        assert!(!flights.mark_stale("missing"), "nothing in flight to flag");

        assert!(guard_a.is_stale());
        assert!(!guard_b.is_stale());
    }

    #[test]
    fn test_new_round_starts_fresh_after_stale_round() {
        let flights: Singleflight<String, u32> = Singleflight::new();

        let Slot::Leader(first) = flights.acquire("k".into()) else { panic!("expected leader") };
        flights.mark_stale("k");
        FlightGuard::new(&flights, "k".to_owned(), first).publish(1);

        let Slot::Leader(second) = flights.acquire("k".into()) else { panic!("expected leader") };
        assert!(!FlightGuard::new(&flights, "k".to_owned(), second).is_stale());
    }
}
