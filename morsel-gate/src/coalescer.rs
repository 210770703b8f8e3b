//! Request coalescing ("singleflight").
//!
//! Concurrent callers that ask for the same key share one in-flight
//! operation. The first caller (the leader) starts it; everyone arriving
//! before it settles attaches to the same shared future.
//!
//! # Lifecycle of an entry
//!
//! The operation runs on its own spawned task. When it settles, that task
//! removes the registry entry *before* the result becomes visible to any
//! waiter, so the next caller with the same key always starts fresh instead
//! of replaying a stale error.
//!
//! Because the operation is spawned, a waiter that stops awaiting (timeout,
//! superseded request, dropped future) never cancels the work for the
//! others. The operation always runs to completion.
//!
//! Coalescing is per process. Two processes asking the same question make
//! two upstream calls.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;

/// A coalesced result.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced<T> {
    pub value: T,
    /// `true` when this caller attached to an operation started by another.
    pub was_shared: bool,
}

/// How a spawned operation ended.
#[derive(Clone)]
enum Settled<T, E> {
    Done(Result<T, E>),
    Panicked(String),
    Aborted,
}

struct InFlight<T, E> {
    generation: u64,
    result: Shared<BoxFuture<'static, Settled<T, E>>>,
}

/// Point-in-time coalescer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerStats {
    pub leader_calls: u64,
    pub shared_calls: u64,
    pub in_flight: usize,
}

/// Per-process in-flight registry for one result type.
///
/// `T` and `E` are cloned once per waiter.
pub struct Coalescer<T, E> {
    inflight: Arc<DashMap<String, InFlight<T, E>>>,
    next_generation: AtomicU64,
    leader_calls: AtomicU64,
    shared_calls: AtomicU64,
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            leader_calls: AtomicU64::new(0),
            shared_calls: AtomicU64::new(0),
        }
    }

    /// Run `operation` under `key`, or attach to the run already in flight.
    ///
    /// `operation` is only called by the leader. It is invoked while the
    /// key's registry shard is locked, so it must only build the future and
    /// must not call back into this coalescer synchronously.
    ///
    /// An error is delivered unchanged to every attached waiter and is not
    /// retried here.
    ///
    /// # Panics
    ///
    /// Re-raises, in every waiter, a panic from the operation. A leader whose
    /// own operation is dropped by its runtime panics as well.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Result<Coalesced<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut operation = Some(operation);
        loop {
            let (result, was_shared) = match self.inflight.entry(key.to_string()) {
                Entry::Occupied(occupied) => {
                    self.shared_calls.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key, "Joining in-flight operation");
                    (occupied.get().result.clone(), true)
                }
                Entry::Vacant(vacant) => {
                    let work = match operation.take() {
                        Some(operation) => operation(),
                        None => raise_aborted(key),
                    };
                    self.leader_calls.fetch_add(1, Ordering::Relaxed);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let deregister = Deregister {
                        registry: Arc::clone(&self.inflight),
                        key: key.to_string(),
                        generation,
                    };

                    // The spawned task blocks on this shard until `insert` below
                    // releases it, so removal can never precede registration.
                    let handle = tokio::spawn(async move {
                        let _deregister = deregister;
                        work.await
                    });

                    let result = handle.map(settle).boxed().shared();
                    vacant.insert(InFlight {
                        generation,
                        result: result.clone(),
                    });
                    (result, false)
                }
            };

            match result.await {
                Settled::Done(Ok(value)) => return Ok(Coalesced { value, was_shared }),
                Settled::Done(Err(e)) => return Err(e),
                Settled::Panicked(message) => std::panic::resume_unwind(Box::new(message)),
                // The runtime that owned the operation dropped it. A waiter
                // that still holds its own operation takes over the key.
                Settled::Aborted if operation.is_some() => {
                    tracing::debug!(key, "In-flight operation aborted, retrying as leader");
                }
                Settled::Aborted => raise_aborted(key),
            }
        }
    }

    /// Number of keys with an operation currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Whether `key` has an operation currently running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leader_calls: self.leader_calls.load(Ordering::Relaxed),
            shared_calls: self.shared_calls.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Removes the registry entry when the spawned operation finishes, panics,
/// or is dropped by a shutting-down runtime. Runs before the task's output
/// is published to waiters.
struct Deregister<T, E> {
    registry: Arc<DashMap<String, InFlight<T, E>>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for Deregister<T, E> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .remove_if(&self.key, |_, entry| entry.generation == generation);
    }
}

fn settle<T, E>(joined: Result<Result<T, E>, JoinError>) -> Settled<T, E> {
    match joined {
        Ok(outcome) => Settled::Done(outcome),
        Err(e) if e.is_panic() => Settled::Panicked(panic_message(e.into_panic())),
        Err(_) => Settled::Aborted,
    }
}

fn raise_aborted(key: &str) -> ! {
    std::panic::resume_unwind(Box::new(format!("coalesced operation for {key} was aborted")))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "coalesced operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn slow_value(calls: Arc<AtomicUsize>, value: u32) -> Result<u32, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(value)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .execute("k", move || slow_value(calls, 7))
                    .await
            }));
        }

        let mut shared = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.value, 7);
            if result.was_shared {
                shared += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 9);
        let stats = coalescer.stats();
        assert_eq!(stats.leader_calls, 1);
        assert_eq!(stats.shared_calls, 9);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let coalescer = Coalescer::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = coalescer
                .execute("k", move || slow_value(calls, 1))
                .await
                .unwrap();
            assert!(!result.was_shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_share() {
        let coalescer = Coalescer::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let calls = Arc::clone(&calls);
            coalescer.execute("a", move || slow_value(calls, 1))
        };
        let b = {
            let calls = Arc::clone(&calls);
            coalescer.execute("b", move || slow_value(calls, 2))
        };
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap().value, 1);
        assert_eq!(b.unwrap().value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_is_shared_and_key_is_freed() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<u32, _>("upstream down".to_string())
        };
        let (first, second) = tokio::join!(
            coalescer.execute("k", failing),
            coalescer.execute("k", failing)
        );
        assert_eq!(first.unwrap_err(), "upstream down");
        assert_eq!(second.unwrap_err(), "upstream down");
        assert!(!coalescer.is_in_flight("k"));

        let retried = coalescer
            .execute("k", || async { Ok::<_, String>(5) })
            .await
            .unwrap();
        assert_eq!(retried.value, 5);
        assert!(!retried.was_shared);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_operation() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let op = {
            let calls = Arc::clone(&calls);
            let finished = Arc::clone(&finished);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(9)
            }
        };

        let leader = tokio::time::timeout(Duration::from_millis(5), coalescer.execute("k", op)).await;
        assert!(leader.is_err());
        assert!(coalescer.is_in_flight("k"));

        let follower = coalescer
            .execute("k", || async { Ok::<_, String>(0) })
            .await
            .unwrap();
        assert_eq!(follower.value, 9);
        assert!(follower.was_shared);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_before_waiters_resume() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());
        let result = coalescer
            .execute("k", || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        assert_eq!(result.value, 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_reraised() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());
        let inner = Arc::clone(&coalescer);
        let joined = tokio::spawn(async move {
            inner
                .execute("k", || async {
                    if true {
                        panic!("boom");
                    }
                    Ok::<u32, String>(0)
                })
                .await
        })
        .await;

        let err = joined.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[test]
    fn test_waiter_takes_over_when_leader_runtime_stops() {
        let coalescer = Arc::new(Coalescer::<u32, String>::new());
        let leader_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let waiter_rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let leader = Arc::clone(&coalescer);
        leader_rt.spawn(async move {
            let _ = leader
                .execute("k", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<u32, String>(1)
                })
                .await;
        });
        for _ in 0..200 {
            if coalescer.is_in_flight("k") {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(coalescer.is_in_flight("k"));

        let waiter = Arc::clone(&coalescer);
        let outcome = waiter_rt.block_on(async move {
            let attached = waiter.execute("k", || async { Ok::<u32, String>(2) });
            let stop = async move {
                tokio::task::yield_now().await;
                leader_rt.shutdown_background();
            };
            let (outcome, ()) =
                tokio::join!(tokio::time::timeout(Duration::from_secs(2), attached), stop);
            outcome
        });

        let result = outcome.expect("waiter should settle").unwrap();
        assert_eq!(result.value, 2);
        assert!(!result.was_shared);
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(coalescer.stats().leader_calls, 2);
    }
}
