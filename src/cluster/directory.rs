//! Watchable key/value directories.
//!
//! A [`WatchableMap`] is an observable map: readers take consistent
//! snapshots through visitor closures, subscribers see every delta in
//! delivery order (after an initial snapshot), and blocked callers can wait
//! until a predicate holds for one key. Subscribers run synchronously under
//! the map lock, so a subscriber that reduces one map into another never
//! reorders deltas.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, TrySendError, after, bounded, never};
use thiserror::Error;

use crate::cluster::signal::Signal;

/// Why a blocking directory wait ended without the predicate holding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("operation interrupted")]
    Interrupted,
    #[error("wait timed out")]
    TimedOut,
}

type Subscriber<K, V> = Box<dyn Fn(&K, Option<&V>) + Send + Sync>;

struct MapState<K, V> {
    entries: BTreeMap<K, V>,
    subscribers: Vec<Subscriber<K, V>>,
    waiters: Vec<Sender<()>>,
}

pub struct WatchableMap<K, V> {
    state: Arc<Mutex<MapState<K, V>>>,
}

impl<K, V> Clone for WatchableMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> Default for WatchableMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WatchableMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MapState {
                entries: BTreeMap::new(),
                subscribers: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapState<K, V>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn set(&self, key: K, value: V) {
        let mut state = self.lock();
        state.entries.insert(key.clone(), value.clone());
        Self::deliver(&mut state, &key, Some(&value));
    }

    pub fn remove(&self, key: &K) {
        let mut state = self.lock();
        if state.entries.remove(key).is_some() {
            Self::deliver(&mut state, key, None);
        }
    }

    /// Read-modify-write one key under the lock. Returning `None` deletes
    /// the entry.
    pub fn update(&self, key: &K, f: impl FnOnce(Option<V>) -> Option<V>) {
        let mut state = self.lock();
        let current = state.entries.get(key).cloned();
        let existed = current.is_some();
        match f(current) {
            Some(value) => {
                state.entries.insert(key.clone(), value.clone());
                Self::deliver(&mut state, key, Some(&value));
            }
            None => {
                if existed {
                    state.entries.remove(key);
                    Self::deliver(&mut state, key, None);
                }
            }
        }
    }

    fn deliver(state: &mut MapState<K, V>, key: &K, value: Option<&V>) {
        for subscriber in &state.subscribers {
            subscriber(key, value);
        }
        state.waiters.retain(|waiter| match waiter.try_send(()) {
            Ok(()) => true,
            // Already pinged since it last looked; one wakeup is enough.
            Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        });
    }

    /// Visit every entry under the lock.
    pub fn read_all(&self, mut visitor: impl FnMut(&K, &V)) {
        let state = self.lock();
        for (key, value) in &state.entries {
            visitor(key, value);
        }
    }

    /// Visit one entry (or its absence) under the lock.
    pub fn read_key<R>(&self, key: &K, visitor: impl FnOnce(Option<&V>) -> R) -> R {
        let state = self.lock();
        visitor(state.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Register a subscriber. Every existing entry is delivered to it before
    /// this returns, then every delta in order.
    pub fn subscribe(&self, subscriber: impl Fn(&K, Option<&V>) + Send + Sync + 'static) {
        let mut state = self.lock();
        for (key, value) in &state.entries {
            subscriber(key, Some(value));
        }
        state.subscribers.push(Box::new(subscriber));
    }

    /// Block until `pred` holds for `key`, the interruptor pulses, or the
    /// timeout lapses. The predicate sees the current value (or `None`)
    /// under the lock.
    pub fn run_key_until_satisfied(
        &self,
        key: &K,
        mut pred: impl FnMut(Option<&V>) -> bool,
        interruptor: &Signal,
        timeout: Option<Duration>,
    ) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let interrupt_rx = interruptor.watch();
        loop {
            let update_rx = {
                let mut state = self.lock();
                if pred(state.entries.get(key)) {
                    return Ok(());
                }
                let (tx, rx) = bounded(1);
                state.waiters.push(tx);
                rx
            };
            let timeout_rx = match deadline {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };
            crossbeam::select! {
                recv(update_rx) -> _ => {}
                recv(interrupt_rx) -> _ => return Err(WaitError::Interrupted),
                recv(timeout_rx) -> _ => return Err(WaitError::TimedOut),
            }
        }
    }
}
