use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One-shot completion latch for a single resolution episode.
///
/// The worker completes the latch exactly once; every caller that
/// joined the episode with a bounded wait holds its own `Arc` to the
/// latch and waits on it with a deadline. Spurious wakeups re-check the
/// completion state.
#[derive(Debug)]
pub(super) struct Episode<V> {
    done: Mutex<Option<V>>,
    resolved: Condvar,
}

impl<V: Clone> Episode<V> {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(None),
            resolved: Condvar::new(),
        })
    }

    /// Publishes the resolved value and wakes every waiter. Later calls
    /// keep the first value; the engine logs such misuse at its level.
    pub(super) fn complete(&self, value: V) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if done.is_none() {
            *done = Some(value);
        }
        drop(done);
        self.resolved.notify_all();
    }

    /// Blocks the caller until the episode completes or `timeout`
    /// elapses, whichever comes first.
    pub(super) fn wait(&self, timeout: Duration) -> Option<V> {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = done.as_ref() {
                return Some(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            done = self
                .resolved
                .wait_timeout(done, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Holder for a caller-registered callback that can be claimed exactly
/// once, by either the worker (to invoke it) or the registering caller
/// (to withdraw it after a successful bounded wait). The claim race is
/// what keeps synchronous return and callback delivery mutually
/// exclusive per `lookup` call.
pub(super) struct CallbackSlot<K, V> {
    callback: Mutex<Option<Box<dyn FnOnce(&K, &V) + Send>>>,
}

impl<K, V> CallbackSlot<K, V> {
    pub(super) fn new(callback: impl FnOnce(&K, &V) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Takes the callback out of the slot. Returns `None` if the other
    /// side already claimed it.
    pub(super) fn claim(&self) -> Option<Box<dyn FnOnce(&K, &V) + Send>> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<K, V> std::fmt::Debug for CallbackSlot<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSlot").finish_non_exhaustive()
    }
}

/// Whether a `lookup` call opened a new episode (and must enqueue the
/// key) or joined one already in flight (and must not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum JoinOutcome {
    Created,
    Joined,
}

#[derive(Debug)]
pub(super) struct PendingEntry<K, V> {
    pub(super) episode: Arc<Episode<V>>,
    pub(super) callbacks: Vec<Arc<CallbackSlot<K, V>>>,
}

/// Table of in-flight keys and the callbacks awaiting each of them.
///
/// A key appears here for exactly the span of one episode: inserted
/// when the first caller requests it, removed when the worker stores
/// the resolved value. Callers arriving in between join the existing
/// entry, which is what collapses concurrent requests for one key into
/// a single resolver invocation.
#[derive(Debug)]
pub(super) struct PendingTable<K, V> {
    entries: HashMap<K, PendingEntry<K, V>>,
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> PendingTable<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Registers `slot` under `key`, creating the episode if the key is
    /// not already in flight. A `Created` outcome must be paired with
    /// exactly one queue send for the key; a `Joined` outcome must not
    /// enqueue again.
    pub(super) fn join_or_create(
        &mut self,
        key: &K,
        slot: Arc<CallbackSlot<K, V>>,
    ) -> (JoinOutcome, Arc<Episode<V>>) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.callbacks.push(slot);
                (JoinOutcome::Joined, Arc::clone(&entry.episode))
            }
            None => {
                let episode = Episode::new();
                self.entries.insert(
                    key.clone(),
                    PendingEntry {
                        episode: Arc::clone(&episode),
                        callbacks: vec![slot],
                    },
                );
                (JoinOutcome::Created, episode)
            }
        }
    }

    /// Ends the episode for `key`, handing back its latch and callback
    /// list. Returns `None` if no episode is in flight for the key.
    pub(super) fn complete(&mut self, key: &K) -> Option<PendingEntry<K, V>> {
        self.entries.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_join_or_create_dedupes() {
        let mut table: PendingTable<String, u32> = PendingTable::default();
        let key = "k".to_string();

        let (first, ep1) = table.join_or_create(&key, CallbackSlot::new(|_, _| {}));
        let (second, ep2) = table.join_or_create(&key, CallbackSlot::new(|_, _| {}));
        assert_eq!(first, JoinOutcome::Created);
        assert_eq!(second, JoinOutcome::Joined);
        assert!(Arc::ptr_eq(&ep1, &ep2));

        let entry = table.complete(&key).unwrap();
        assert_eq!(entry.callbacks.len(), 2);
        assert!(table.complete(&key).is_none());
    }

    #[test]
    fn test_episode_wait_times_out() {
        let episode: Arc<Episode<u32>> = Episode::new();
        assert_eq!(episode.wait(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_episode_wakes_waiters() {
        let episode: Arc<Episode<u32>> = Episode::new();
        let waiter = {
            let episode = Arc::clone(&episode);
            std::thread::spawn(move || episode.wait(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        episode.complete(7);
        assert_eq!(waiter.join().unwrap(), Some(7));
        // Value stays observable for waiters arriving after completion.
        assert_eq!(episode.wait(Duration::ZERO), Some(7));
    }

    #[test]
    fn test_callback_slot_claimed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<CallbackSlot<String, u32>> = CallbackSlot::new({
            let calls = Arc::clone(&calls);
            move |_: &String, _: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        let claimed = slot.claim().unwrap();
        claimed(&"k".to_string(), &1);
        assert!(slot.claim().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
