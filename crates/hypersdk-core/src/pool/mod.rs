//! Connection Pool: a bounded set of reusable, health-checked hypervisor
//! client sessions shared across concurrent jobs.

use crate::error::PoolError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Binds session creation and liveness checking to whatever hypervisor
/// client the embedding collaborator needs. The core never constructs a
/// session itself.
#[async_trait]
pub trait SessionFactory<S>: Send + Sync {
    async fn create(&self) -> Result<S, PoolError>;
    async fn check_liveness(&self, session: &S) -> bool;
}

struct Entry<S> {
    id: u64,
    session: S,
    created_at: Instant,
    last_used_at: Instant,
}

/// A session on loan from the pool. Must be returned via
/// [`ConnectionPool::release`]; dropping without releasing leaks the
/// semaphore permit (treated as a held-forever session, matching the
/// "a closed session is never returned to a caller" invariant by simply
/// never returning it).
pub struct PoolEntry<S> {
    id: u64,
    session: Option<S>,
}

impl<S> PoolEntry<S> {
    pub fn session(&self) -> &S {
        self.session.as_ref().expect("session taken")
    }

    pub fn session_mut(&mut self) -> &mut S {
        self.session.as_mut().expect("session taken")
    }
}

struct PoolState<S> {
    idle: VecDeque<Entry<S>>,
}

/// Bounded pool of authenticated hypervisor sessions.
pub struct ConnectionPool<S> {
    factory: Arc<dyn SessionFactory<S> + Send + Sync>,
    state: Mutex<PoolState<S>>,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
    live_count: AtomicU64,
}

impl<S: Send + Sync + 'static> ConnectionPool<S> {
    pub fn new(
        factory: Arc<dyn SessionFactory<S> + Send + Sync>,
        max_connections: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
            }),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            idle_timeout,
            next_id: AtomicU64::new(1),
            live_count: AtomicU64::new(0),
        })
    }

    /// Acquires a session, creating one if the pool is below capacity,
    /// otherwise blocking until one is returned or `cancel` fires.
    pub async fn acquire(&self, cancel: CancellationToken) -> Result<PoolEntry<S>, PoolError> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
            _ = cancel.cancelled() => return Err(PoolError::AcquireCancelled),
        };
        // The permit represents the right to hold one live session; it is
        // intentionally forgotten here and recreated on release so the
        // count of outstanding permits always equals live sessions.
        permit.forget();

        let mut state = self.state.lock().await;
        if let Some(entry) = state.idle.pop_front() {
            drop(state);
            debug!(session_id = entry.id, "acquired idle pooled session");
            return Ok(PoolEntry {
                id: entry.id,
                session: Some(entry.session),
            });
        }
        drop(state);

        match self.factory.create().await {
            Ok(session) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.live_count.fetch_add(1, Ordering::SeqCst);
                debug!(session_id = id, "created new pooled session");
                Ok(PoolEntry {
                    id,
                    session: Some(session),
                })
            }
            Err(e) => {
                self.semaphore.add_permits(1);
                Err(e)
            }
        }
    }

    /// Returns the entry to the pool. If `healthy` is false the entry is
    /// closed and removed instead. Never errors.
    pub async fn release(&self, mut entry: PoolEntry<S>, healthy: bool) {
        let session = entry.session.take();
        let Some(session) = session else { return };

        if !healthy {
            self.live_count.fetch_sub(1, Ordering::SeqCst);
            self.semaphore.add_permits(1);
            debug!(session_id = entry.id, "released unhealthy session, closing");
            return;
        }

        let mut state = self.state.lock().await;
        state.idle.push_back(Entry {
            id: entry.id,
            session,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
        });
        drop(state);
        self.semaphore.add_permits(1);
    }

    pub fn live_count(&self) -> u64 {
        self.live_count.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// One sweep cycle: evicts idle entries past `idle_timeout` and pings
    /// the rest, removing any that fail liveness. Liveness failures are
    /// absorbed (Transient), never surfaced.
    pub async fn sweep(&self) {
        let mut expired = Vec::new();
        let mut survivors = VecDeque::new();
        {
            let mut state = self.state.lock().await;
            while let Some(entry) = state.idle.pop_front() {
                if entry.last_used_at.elapsed() > self.idle_timeout {
                    expired.push(entry);
                } else {
                    survivors.push_back(entry);
                }
            }
            state.idle = survivors;
        }

        for entry in expired {
            self.live_count.fetch_sub(1, Ordering::SeqCst);
            self.semaphore.add_permits(1);
            debug!(session_id = entry.id, "evicted idle session");
        }

        let candidates: Vec<Entry<S>> = {
            let mut state = self.state.lock().await;
            state.idle.drain(..).collect()
        };
        let mut alive = VecDeque::new();
        for entry in candidates {
            if self.factory.check_liveness(&entry.session).await {
                alive.push_back(entry);
            } else {
                warn!(session_id = entry.id, "liveness check failed during sweep");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                self.semaphore.add_permits(1);
            }
        }
        self.state.lock().await.idle = alive;
    }

    /// Spawns the background sweeper task on the current runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingFactory {
        created: AtomicU32,
    }

    #[async_trait]
    impl SessionFactory<u32> for CountingFactory {
        async fn create(&self) -> Result<u32, PoolError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
        async fn check_liveness(&self, _session: &u32) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn never_exceeds_max_connections_under_concurrency() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let pool = ConnectionPool::new(factory, 2, Duration::from_secs(60));

        let max_concurrent = Arc::new(AtomicU32::new(0));
        let observed_max = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            let max_concurrent = max_concurrent.clone();
            let observed_max = observed_max.clone();
            handles.push(tokio::spawn(async move {
                let entry = pool.acquire(CancellationToken::new()).await.unwrap();
                let now = max_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                max_concurrent.fetch_sub(1, Ordering::SeqCst);
                pool.release(entry, true).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(observed_max.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn unhealthy_release_shrinks_live_count() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let pool = ConnectionPool::new(factory, 2, Duration::from_secs(60));

        let entry = pool.acquire(CancellationToken::new()).await.unwrap();
        assert_eq!(pool.live_count(), 1);
        pool.release(entry, false).await;
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn acquire_respects_cancellation() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let pool = ConnectionPool::new(factory, 1, Duration::from_secs(60));

        let _held = pool.acquire(CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pool.acquire(cancel).await;
        assert!(matches!(result, Err(PoolError::AcquireCancelled)));
    }
}
