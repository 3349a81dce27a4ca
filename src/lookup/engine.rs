use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;

use super::cache::TtlCache;
use super::pending::{CallbackSlot, JoinOutcome, PendingTable};

/// A blocking resolution function, executed exclusively on the engine's
/// worker thread.
///
/// Resolution failure is not an error at this level: the value type
/// carries its own success flag (e.g. a metadata record whose
/// `successful` field is false), and failed values are cached under the
/// same TTL as successes so that a permanently failing key is retried
/// once per TTL window instead of on every call.
///
/// A resolver may perform nested blocking sub-resolutions by calling
/// itself directly — it already runs on the worker thread, and a second
/// trip through the engine queue would deadlock a single-consumer
/// design. Implementations doing so must guard against re-entering a
/// key they are already resolving.
pub trait Resolver: Send + 'static {
    type Key: Clone + Eq + Hash + fmt::Display + Send + 'static;
    type Value: Clone + Send + 'static;

    fn resolve(&mut self, key: &Self::Key) -> Self::Value;
}

enum Job<K> {
    Resolve(K),
    Shutdown,
}

struct State<K, V> {
    cache: TtlCache<K, V>,
    pending: PendingTable<K, V>,
    // Queue sends happen while this state is locked, so the channel
    // order is exactly the episode creation order.
    queue: Sender<Job<K>>,
}

/// Asynchronous, deduplicating, TTL-cached facade over a blocking
/// [`Resolver`].
///
/// `lookup` never blocks the caller beyond its `max_wait` budget: cache
/// hits return synchronously, misses are resolved on a single dedicated
/// worker thread and delivered through the registered callback.
/// Concurrent lookups for the same key are collapsed into one resolver
/// invocation, and every caller of that episode observes the same
/// value.
pub struct AsyncLookupEngine<R: Resolver> {
    name: &'static str,
    state: Arc<Mutex<State<R::Key, R::Value>>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<R: Resolver> AsyncLookupEngine<R> {
    /// Creates the engine and starts its worker thread. `name` tags log
    /// lines; `ttl` bounds how long resolved values (including failed
    /// ones) are served from cache.
    pub fn new(name: &'static str, ttl: Duration, resolver: R) -> Self {
        let (queue, jobs) = mpsc::channel();
        let state = Arc::new(Mutex::new(State {
            cache: TtlCache::new(ttl),
            pending: PendingTable::default(),
            queue,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::Builder::new()
            .name(format!("{name}-lookup"))
            .spawn({
                let state = Arc::clone(&state);
                let stop = Arc::clone(&stop);
                move || worker_loop(name, &state, &stop, &jobs, resolver)
            })
            .expect("failed to spawn lookup worker thread");

        Self {
            name,
            state,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Requests the value for `key`.
    ///
    /// Returns `Some(value)` when the value is available within this
    /// call: a fresh cache hit, or a miss that resolved inside the
    /// `max_wait` budget. In that case `callback` is never invoked.
    /// Returns `None` when the caller stopped waiting (or never waited,
    /// with `max_wait == 0`); the value is then delivered exactly once
    /// via `callback`, on the worker thread, at some later point.
    ///
    /// `max_wait` bounds only the caller's patience — the resolution
    /// itself keeps running and its value is cached regardless.
    pub fn lookup(
        &self,
        key: R::Key,
        max_wait: Duration,
        callback: impl FnOnce(&R::Key, &R::Value) + Send + 'static,
    ) -> Option<R::Value> {
        let slot = CallbackSlot::new(callback);
        let episode = {
            let mut state = self.lock_state();
            if let Some(value) = state.cache.get(&key) {
                return Some(value.clone());
            }
            let (outcome, episode) = state.pending.join_or_create(&key, Arc::clone(&slot));
            if outcome == JoinOutcome::Created {
                log::trace!("({}) enqueueing key [{}]", self.name, key);
                if state.queue.send(Job::Resolve(key.clone())).is_err() {
                    // Worker already exited; the episode can never
                    // complete, so withdraw it instead of parking the
                    // caller.
                    log::warn!("({}) lookup for [{}] after shutdown, dropping", self.name, key);
                    state.pending.complete(&key);
                    return None;
                }
            }
            episode
        };

        if max_wait.is_zero() {
            return None;
        }

        let value = episode.wait(max_wait)?;
        // The worker may have fired our callback while we were waking
        // up. Whoever claims the slot first wins: claiming it back here
        // makes this a synchronous return, losing the race means the
        // callback was (or is being) invoked and this call reports
        // nothing.
        if slot.claim().is_some() {
            Some(value)
        } else {
            None
        }
    }

    /// Stops the worker thread and joins it. Keys enqueued but not yet
    /// started are abandoned; an in-flight resolver call is allowed to
    /// finish. Idempotent, and also invoked by `Drop`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        {
            let state = self.lock_state();
            let _ = state.queue.send(Job::Shutdown);
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            log::debug!("({}) stopping lookup worker", self.name);
            if worker.join().is_err() {
                log::error!("({}) lookup worker panicked", self.name);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<R::Key, R::Value>> {
        // A poisoning panic on another thread must not take down the
        // host process; the state itself stays consistent because every
        // critical section leaves it whole.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Resolver> Drop for AsyncLookupEngine<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<R: Resolver>(
    name: &'static str,
    state: &Mutex<State<R::Key, R::Value>>,
    stop: &AtomicBool,
    jobs: &Receiver<Job<R::Key>>,
    mut resolver: R,
) {
    while let Ok(job) = jobs.recv() {
        let key = match job {
            Job::Resolve(key) => key,
            Job::Shutdown => break,
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        log::debug!("({name}) dequeued key [{key}]");
        let value = resolver.resolve(&key);
        store_value(name, state, &key, value);
    }
    log::debug!("({name}) lookup worker exiting");
}

/// Writes the resolved value into the cache, ends the key's pending
/// episode, and fires every callback the episode still owns. Resolution
/// is strictly by key identity, so an episode that was re-requested or
/// raced with shutdown cannot deliver to the wrong callers.
fn store_value<K, V>(name: &str, state: &Mutex<State<K, V>>, key: &K, value: V)
where
    K: Clone + Eq + Hash + fmt::Display,
    V: Clone,
{
    let entry = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.cache.put(key.clone(), value.clone());
        state.pending.complete(key)
    };
    let Some(entry) = entry else {
        log::warn!("({name}) stored value for key [{key}] with no pending episode, ignoring");
        return;
    };

    // Wake bounded waiters first so they get a chance to claim their
    // own slots back before the callback sweep reaches them.
    entry.episode.complete(value.clone());
    for slot in entry.callbacks {
        if let Some(callback) = slot.claim() {
            callback(key, &value);
        }
    }
}
