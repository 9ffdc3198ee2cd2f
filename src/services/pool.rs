//! Process-wide connection pool manager.
//!
//! Keyed by datasource id; enforces a per-datasource cap and a process cap
//! via FIFO semaphores under a single acquisition deadline. Idle
//! connections are health-probed before reuse; reopening retries with
//! jittered exponential backoff.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::models::{Datasource, QueryOptions, QueryResult};
use crate::services::adapter::{DatabaseAdapter, create_adapter_for};
use crate::utils::backoff::connect_backoff;
use crate::utils::{EngineError, EngineResult};

const CONNECT_RETRIES: u32 = 3;

pub type AdapterFactoryFn =
    Arc<dyn Fn(&Datasource) -> EngineResult<Box<dyn DatabaseAdapter>> + Send + Sync>;

pub struct PoolManager {
    config: PoolConfig,
    pools: DashMap<String, Arc<DatasourcePool>>,
    global_permits: Arc<Semaphore>,
    factory: AdapterFactoryFn,
}

#[derive(Debug)]
struct DatasourcePool {
    datasource: Datasource,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
}

#[derive(Debug)]
struct IdleConnection {
    adapter: Box<dyn DatabaseAdapter>,
    last_checked_at: Instant,
}

/// A checked-out connection. Returned to the idle list on drop unless the
/// caller marked it broken.
#[derive(Debug)]
pub struct PooledConnection {
    adapter: Option<Box<dyn DatabaseAdapter>>,
    last_checked_at: Instant,
    pool: Arc<DatasourcePool>,
    broken: bool,
    _ds_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn adapter_mut(&mut self) -> &mut dyn DatabaseAdapter {
        self.adapter.as_mut().expect("connection present until drop").as_mut()
    }

    /// Keep this connection out of the idle list; its state is suspect.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Execute with automatic discard on transport-level failures. SQL
    /// errors leave the connection reusable.
    pub async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let result = match self.adapter.as_mut() {
            Some(adapter) => adapter.execute(sql, options).await,
            None => Err(EngineError::internal("connection already released")),
        };
        if let Err(e) = &result
            && matches!(e, EngineError::DbTransient(_) | EngineError::Timeout(_))
        {
            self.broken = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        if let Some(adapter) = self.adapter.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push_back(IdleConnection { adapter, last_checked_at: self.last_checked_at });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolUsage {
    pub in_use: usize,
    pub idle: usize,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_in_use: usize,
    pub max_total: usize,
    pub per_datasource: HashMap<String, PoolUsage>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, Arc::new(|ds: &Datasource| create_adapter_for(ds)))
    }

    /// Custom adapter factory (used by tests).
    pub fn with_factory(config: PoolConfig, factory: AdapterFactoryFn) -> Self {
        let global_permits = Arc::new(Semaphore::new(config.max_total));
        Self { config, pools: DashMap::new(), global_permits, factory }
    }

    /// Check a connection out under the acquisition deadline. FIFO across
    /// waiters; fails with `POOL_EXHAUSTED` once the deadline passes.
    pub async fn acquire(&self, datasource: &Datasource) -> EngineResult<PooledConnection> {
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_timeout_ms);
        let pool = self.pool_entry(datasource);

        let global_permit =
            acquire_permit(&self.global_permits, deadline, "process-wide pool").await?;
        let ds_permit = acquire_permit(
            &pool.permits,
            deadline,
            &format!("datasource '{}' pool", datasource.name),
        )
        .await?;

        let health_interval = Duration::from_millis(self.config.health_interval_ms);

        // Reuse a healthy idle connection if one exists.
        loop {
            let candidate = {
                let mut idle = pool
                    .idle
                    .lock()
                    .map_err(|_| EngineError::internal("pool idle list poisoned"))?;
                idle.pop_front()
            };
            let Some(mut idle_conn) = candidate else {
                break;
            };

            if idle_conn.last_checked_at.elapsed() <= health_interval {
                return Ok(PooledConnection {
                    adapter: Some(idle_conn.adapter),
                    last_checked_at: idle_conn.last_checked_at,
                    pool: Arc::clone(&pool),
                    broken: false,
                    _ds_permit: ds_permit,
                    _global_permit: global_permit,
                });
            }

            match idle_conn.adapter.ping().await {
                Ok(()) => {
                    return Ok(PooledConnection {
                        adapter: Some(idle_conn.adapter),
                        last_checked_at: Instant::now(),
                        pool: Arc::clone(&pool),
                        broken: false,
                        _ds_permit: ds_permit,
                        _global_permit: global_permit,
                    });
                },
                Err(e) => {
                    tracing::warn!(
                        "Discarding stale connection for datasource {}: {}",
                        datasource.id,
                        e
                    );
                    // Fall through and try the next idle candidate.
                },
            }
        }

        let adapter = self.open_with_retry(datasource).await?;
        Ok(PooledConnection {
            adapter: Some(adapter),
            last_checked_at: Instant::now(),
            pool,
            broken: false,
            _ds_permit: ds_permit,
            _global_permit: global_permit,
        })
    }

    /// Open a fresh connection, retrying transient failures with jittered
    /// backoff (100ms, 400ms, 1.6s).
    async fn open_with_retry(&self, datasource: &Datasource) -> EngineResult<Box<dyn DatabaseAdapter>> {
        let mut last_err = EngineError::internal("no connect attempt made");
        for attempt in 0..CONNECT_RETRIES {
            let mut adapter = (self.factory)(datasource)?;
            match adapter.connect().await {
                Ok(()) => return Ok(adapter),
                Err(e) if e.is_retryable() && attempt + 1 < CONNECT_RETRIES => {
                    let wait = connect_backoff(attempt);
                    tracing::warn!(
                        "Connect attempt {} for datasource {} failed ({}); retrying in {:?}",
                        attempt + 1,
                        datasource.id,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    last_err = e;
                },
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Drop every pooled connection for a datasource (deleted or
    /// reconfigured).
    pub fn invalidate(&self, datasource_id: &str) {
        if self.pools.remove(datasource_id).is_some() {
            tracing::info!("Invalidated connection pool for datasource {}", datasource_id);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut per_datasource = HashMap::new();
        for entry in self.pools.iter() {
            let pool = entry.value();
            let in_use = self.config.max_per_datasource - pool.permits.available_permits();
            let idle = pool.idle.lock().map(|q| q.len()).unwrap_or(0);
            per_datasource.insert(entry.key().clone(), PoolUsage { in_use, idle });
        }
        PoolStats {
            total_in_use: self.config.max_total - self.global_permits.available_permits(),
            max_total: self.config.max_total,
            per_datasource,
        }
    }

    /// Share of the process-wide cap currently checked out, 0.0..=1.0.
    pub fn occupancy(&self) -> f64 {
        let stats = self.stats();
        if stats.max_total == 0 {
            return 0.0;
        }
        stats.total_in_use as f64 / stats.max_total as f64
    }

    fn pool_entry(&self, datasource: &Datasource) -> Arc<DatasourcePool> {
        // A reconfigured datasource gets a fresh pool; stale connections
        // would point at the old endpoint.
        if let Some(existing) = self.pools.get(&datasource.id)
            && existing.datasource.updated_at != datasource.updated_at
        {
            drop(existing);
            self.pools.remove(&datasource.id);
        }

        self.pools
            .entry(datasource.id.clone())
            .or_insert_with(|| {
                Arc::new(DatasourcePool {
                    datasource: datasource.clone(),
                    permits: Arc::new(Semaphore::new(self.config.max_per_datasource)),
                    idle: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }
}

async fn acquire_permit(
    semaphore: &Arc<Semaphore>,
    deadline: Instant,
    what: &str,
) -> EngineResult<OwnedSemaphorePermit> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, Arc::clone(semaphore).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(EngineError::internal(format!("{} semaphore closed", what))),
        Err(_) => {
            Err(EngineError::pool_exhausted(format!("{} exhausted: acquisition deadline passed", what)))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionInfo, DatasourceStatus, DatasourceType};
    use crate::services::adapter::mock::MockEngine;
    use chrono::Utc;

    fn test_datasource(id: &str) -> Datasource {
        Datasource {
            id: id.to_string(),
            name: format!("ds-{}", id),
            ds_type: DatasourceType::Sqlite,
            connection: ConnectionInfo::default(),
            status: DatasourceStatus::Active,
            is_default: false,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pool_config(max_total: usize, max_per: usize, acquire_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_total,
            max_per_datasource: max_per,
            acquire_timeout_ms,
            health_interval_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn connections_are_reused_after_release() {
        let engine = MockEngine::new();
        let manager = PoolManager::with_factory(pool_config(50, 10, 1_000), engine.factory());
        let ds = test_datasource("reuse");

        for _ in 0..5 {
            let conn = manager.acquire(&ds).await.expect("acquire");
            drop(conn);
        }

        assert_eq!(engine.connect_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(engine.open_connections(), 1);
    }

    #[tokio::test]
    async fn per_datasource_cap_is_enforced() {
        let engine = MockEngine::new();
        let manager =
            Arc::new(PoolManager::with_factory(pool_config(50, 10, 100), engine.factory()));
        let ds = test_datasource("cap");

        // Seed scenario: 11 concurrent holders on a cap of 10.
        let mut handles = Vec::new();
        for _ in 0..11 {
            let manager = Arc::clone(&manager);
            let ds = ds.clone();
            handles.push(tokio::spawn(async move {
                match manager.acquire(&ds).await {
                    Ok(conn) => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        drop(conn);
                        Ok(())
                    },
                    Err(e) => Err(e),
                }
            }));
        }

        let mut ok = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(()) => ok += 1,
                Err(e) => {
                    assert_eq!(e.kind(), "POOL_EXHAUSTED");
                    exhausted += 1;
                },
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(exhausted, 1);
        assert!(
            engine.max_open_connections.load(std::sync::atomic::Ordering::SeqCst) <= 10,
            "live connections exceeded the per-datasource cap"
        );
    }

    #[tokio::test]
    async fn process_cap_spans_datasources() {
        let engine = MockEngine::new();
        let manager = PoolManager::with_factory(pool_config(3, 2, 50), engine.factory());

        let ds_a = test_datasource("a");
        let ds_b = test_datasource("b");

        let _c1 = manager.acquire(&ds_a).await.expect("a1");
        let _c2 = manager.acquire(&ds_a).await.expect("a2");
        let _c3 = manager.acquire(&ds_b).await.expect("b1");

        let err = manager.acquire(&ds_b).await.unwrap_err();
        assert_eq!(err.kind(), "POOL_EXHAUSTED");

        let stats = manager.stats();
        assert_eq!(stats.total_in_use, 3);
    }

    #[tokio::test]
    async fn stale_connections_are_probed_and_replaced() {
        let engine = MockEngine::new();
        let config = PoolConfig {
            max_total: 10,
            max_per_datasource: 5,
            acquire_timeout_ms: 1_000,
            // Every reuse is treated as stale.
            health_interval_ms: 0,
        };
        let manager = PoolManager::with_factory(config, engine.factory());
        let ds = test_datasource("probe");

        drop(manager.acquire(&ds).await.expect("first acquire"));

        // Probe fails: the stale connection is discarded and a new one is
        // opened.
        engine.fail_next_pings(1);
        drop(manager.acquire(&ds).await.expect("second acquire"));
        assert_eq!(engine.connect_count.load(std::sync::atomic::Ordering::SeqCst), 2);

        // Probe succeeds: no new connection.
        drop(manager.acquire(&ds).await.expect("third acquire"));
        assert_eq!(engine.connect_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_connect_failures_are_retried() {
        let engine = MockEngine::new();
        let manager = PoolManager::with_factory(pool_config(10, 5, 5_000), engine.factory());
        let ds = test_datasource("retry");

        engine.fail_next_connects(2);
        let conn = manager.acquire(&ds).await.expect("acquire despite transient failures");
        drop(conn);
        assert_eq!(engine.connect_count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn broken_connections_are_not_returned_to_idle() {
        let engine = MockEngine::new();
        let manager = PoolManager::with_factory(pool_config(10, 5, 1_000), engine.factory());
        let ds = test_datasource("broken");

        let mut conn = manager.acquire(&ds).await.expect("acquire");
        conn.mark_broken();
        drop(conn);

        drop(manager.acquire(&ds).await.expect("new connection"));
        assert_eq!(engine.connect_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
