use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::category_proxy;

pub const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(2);
pub const BODY_HASH_PREFIX_BYTES: usize = 4096;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DedupError {
    #[error("shared producer for {key} did not complete")]
    ProducerFailed { key: String },
}

/// `METHOD|url|sha256(first 4 KiB of body)`
pub fn request_identity_key(method: &str, url: &str, body: &[u8]) -> String {
    let prefix = &body[..body.len().min(BODY_HASH_PREFIX_BYTES)];
    format!(
        "{}|{}|{}",
        method.to_ascii_uppercase(),
        url,
        hex::encode(Sha256::digest(prefix))
    )
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DedupStats {
    pub produced_total: u64,
    pub joined_total: u64,
    pub recent_hits_total: u64,
    pub in_flight: usize,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, DedupError>>>;

struct InFlight<T: Clone> {
    generation: u64,
    result: SharedResult<T>,
}

struct DedupState<T: Clone> {
    in_flight: HashMap<String, InFlight<T>>,
    recent: HashMap<String, (Instant, T)>,
    next_generation: u64,
}

#[derive(Default)]
struct DedupCounters {
    produced_total: AtomicU64,
    joined_total: AtomicU64,
    recent_hits_total: AtomicU64,
}

/// Collapses concurrent identical work onto one spawned producer.
pub struct InFlightDedup<T: Clone> {
    recent_window: Duration,
    state: Arc<Mutex<DedupState<T>>>,
    counters: DedupCounters,
}

impl<T> InFlightDedup<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `recent_window` of zero disables replay of completed results.
    pub fn new(recent_window: Duration) -> Self {
        Self {
            recent_window,
            state: Arc::new(Mutex::new(DedupState {
                in_flight: HashMap::new(),
                recent: HashMap::new(),
                next_generation: 0,
            })),
            counters: DedupCounters::default(),
        }
    }

    pub fn recent_window(&self) -> Duration {
        self.recent_window
    }

    /// Runs `producer` unless an equal key is already in flight, in which
    /// case the caller waits for that producer's result instead. The producer
    /// runs on its own task, so it finishes even if every caller goes away.
    pub async fn execute_once<F, Fut>(&self, key: &str, producer: F) -> Result<T, DedupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut state = self.state.lock().expect("dedup lock poisoned");

            if !self.recent_window.is_zero()
                && let Some((completed_at, value)) = state.recent.get(key)
                && completed_at.elapsed() < self.recent_window
            {
                self.counters
                    .recent_hits_total
                    .fetch_add(1, Ordering::Relaxed);
                debug!("{} replaying recent result for {key}", category_proxy());
                return Ok(value.clone());
            }

            if let Some(entry) = state.in_flight.get(key) {
                self.counters.joined_total.fetch_add(1, Ordering::Relaxed);
                debug!("{} joining in-flight producer for {key}", category_proxy());
                entry.result.clone()
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let result = self.spawn_producer(key.to_string(), generation, producer());
                state.in_flight.insert(
                    key.to_string(),
                    InFlight {
                        generation,
                        result: result.clone(),
                    },
                );
                self.counters.produced_total.fetch_add(1, Ordering::Relaxed);
                result
            }
        };
        shared.await
    }

    fn spawn_producer<Fut>(&self, key: String, generation: u64, work: Fut) -> SharedResult<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let recent_window = self.recent_window;
        let failed_key = key.clone();
        let supervisor = tokio::spawn(async move {
            let result = tokio::spawn(work).await.map_err(|err| {
                warn!("{} producer for {key} failed: {err}", category_proxy());
                DedupError::ProducerFailed { key: key.clone() }
            });

            let mut state = state.lock().expect("dedup lock poisoned");
            if state
                .in_flight
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                state.in_flight.remove(&key);
            }
            if !recent_window.is_zero() {
                state
                    .recent
                    .retain(|_, (completed_at, _)| completed_at.elapsed() < recent_window);
                if let Ok(value) = &result {
                    state.recent.insert(key, (Instant::now(), value.clone()));
                }
            }
            result
        });

        async move {
            supervisor
                .await
                .unwrap_or(Err(DedupError::ProducerFailed { key: failed_key }))
        }
        .boxed()
        .shared()
    }

    /// Drops completed results so the next caller of any key produces anew.
    /// In-flight producers are left alone.
    pub fn forget_recent(&self) {
        self.state
            .lock()
            .expect("dedup lock poisoned")
            .recent
            .clear();
    }

    pub fn stats(&self) -> DedupStats {
        let in_flight = self
            .state
            .lock()
            .expect("dedup lock poisoned")
            .in_flight
            .len();
        DedupStats {
            produced_total: self.counters.produced_total.load(Ordering::Relaxed),
            joined_total: self.counters.joined_total.load(Ordering::Relaxed),
            recent_hits_total: self.counters.recent_hits_total.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

impl<T> Default for InFlightDedup<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;
    use tokio::sync::Notify;

    use super::*;

    #[test]
    fn identity_key_hashes_only_the_body_prefix() {
        let mut long = vec![b'a'; BODY_HASH_PREFIX_BYTES];
        let base = request_identity_key("post", "/api/data/v9.2/accounts", &long);
        long.extend_from_slice(b"tail");
        assert_eq!(
            request_identity_key("POST", "/api/data/v9.2/accounts", &long),
            base
        );
        assert!(base.starts_with("POST|/api/data/v9.2/accounts|"));
        assert_ne!(
            request_identity_key("POST", "/api/data/v9.2/accounts", b"other"),
            base
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_producer() {
        let dedup: Arc<InFlightDedup<Arc<String>>> = Arc::new(InFlightDedup::new(Duration::ZERO));
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let waiters = (0..8).map(|_| {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            async move {
                dedup
                    .execute_once("GET|/x|h", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Arc::new("payload".to_string())
                    })
                    .await
            }
        });
        let all = tokio::spawn(join_all(waiters));
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        let results = all.await.expect("waiters should join");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].clone().expect("producer should succeed");
        for result in &results {
            let value = result.clone().expect("producer should succeed");
            assert!(Arc::ptr_eq(&value, &first));
        }
        let stats = dedup.stats();
        assert_eq!(stats.produced_total, 1);
        assert_eq!(stats.joined_total, 7);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn completed_key_gets_a_fresh_producer() {
        let dedup = InFlightDedup::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 1..=2 {
            let counter = Arc::clone(&calls);
            let value = dedup
                .execute_once("k", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await
                .expect("producer should succeed");
            assert_eq!(value, expected);
        }
    }

    #[tokio::test]
    async fn recent_window_replays_completed_result() {
        let dedup = InFlightDedup::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&calls);
            let value = dedup
                .execute_once("k", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "done"
                })
                .await
                .expect("producer should succeed");
            assert_eq!(value, "done");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.stats().recent_hits_total, 2);
    }

    #[tokio::test]
    async fn forgotten_results_are_produced_again() {
        let dedup = InFlightDedup::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        for round in 0..2 {
            let counter = Arc::clone(&calls);
            dedup
                .execute_once("k", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst) + round
                })
                .await
                .expect("producer should succeed");
            dedup.forget_recent();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.stats().recent_hits_total, 0);
    }

    async fn exploding_producer() -> u32 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        panic!("producer exploded")
    }

    #[tokio::test]
    async fn panicking_producer_fails_every_waiter_and_clears_entry() {
        let dedup: Arc<InFlightDedup<u32>> = Arc::new(InFlightDedup::new(Duration::ZERO));
        let waiters = (0..3).map(|_| {
            let dedup = Arc::clone(&dedup);
            async move {
                dedup.execute_once("boom", exploding_producer).await
            }
        });
        let results = join_all(waiters).await;
        for result in results {
            assert_eq!(
                result,
                Err(DedupError::ProducerFailed {
                    key: "boom".to_string()
                })
            );
        }

        let value = dedup
            .execute_once("boom", || async { 7 })
            .await
            .expect("fresh producer should succeed");
        assert_eq!(value, 7);
    }
}
