//! End-to-end pool contention scenario: with `max_connections = 2` and 5
//! jobs that each hold a session for 1 second, total wall time must be
//! bounded by the number of contention rounds, not by serializing every
//! job onto one connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hypersdk_core::error::PoolError;
use hypersdk_core::pool::{ConnectionPool, SessionFactory};
use tokio_util::sync::CancellationToken;

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
async fn five_one_second_jobs_over_two_connections_take_about_three_rounds() {
    let factory = Arc::new(CountingFactory {
        created: AtomicU32::new(0),
    });
    let pool = ConnectionPool::new(factory, 2, Duration::from_secs(60));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let entry = pool.acquire(CancellationToken::new()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            pool.release(entry, true).await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let elapsed = start.elapsed();

    // 5 jobs / 2 connections = 3 serialized rounds of ~1s each.
    assert!(elapsed >= Duration::from_millis(2_500), "finished too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(4_000), "finished too slow: {elapsed:?}");
    assert_eq!(pool.live_count(), 2);
}
