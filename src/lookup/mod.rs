//! Asynchronous key-value lookup engine for blocking metadata sources.
//!
//! Enriching live process/container telemetry requires answers that can
//! only be obtained through slow, blocking operations — reading cgroup
//! pseudo-files, inspecting containers over a runtime socket. The
//! calling path sits on the critical event-processing loop of a
//! syscall-tracing agent, so those operations must never run on a
//! caller thread. This module turns any blocking `resolve(key) -> value`
//! function into a non-blocking, callback-driven API with an optional
//! bounded-wait fast path.
//!
//! # Key Components
//!
//! - [`Resolver`] — the pluggable blocking resolution function, run
//!   exclusively on the engine's worker thread.
//! - [`AsyncLookupEngine`] — TTL cache, request deduplication, work
//!   queue, and worker-thread lifecycle behind a single `lookup` call.
//!
//! # Guarantees
//!
//! - At most one resolver invocation is in flight per key; concurrent
//!   lookups for the same key join the same resolution episode and all
//!   observe the same value.
//! - A `lookup` call yields its result exactly once: either
//!   synchronously (fresh cache hit, or resolution inside the wait
//!   budget) or through its callback — never both.
//! - Failed resolutions are cached like successes, bounding retries
//!   against an absent or misbehaving metadata source to once per TTL
//!   window.

mod cache;
mod engine;
mod pending;

pub use engine::{AsyncLookupEngine, Resolver};
