//! PostgreSQL pool sizing for the job worker.
//!
//! Every dispatched job may pin a connection for its whole execution (the
//! engine transaction), and embedding sub-tasks borrow more on top. The pool
//! therefore has to be sized from the worker's queue ceilings, not just from
//! request load.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use hearth_core::{Error, Result};

/// Pool ceiling when nothing else is configured.
pub const POOL_MAX_CONNECTIONS: u32 = 20;

/// Connections kept for pollers, the scheduler and the rescue sweeper on top
/// of one per concurrent job.
pub const POOL_ENGINE_HEADROOM: u32 = 4;

const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const POOL_IDLE_TIMEOUT_SECS: u64 = 600;
const POOL_MAX_LIFETIME_SECS: u64 = 1_800;

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a job waits for a free connection before failing its attempt.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// `None` keeps connections until they fail.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: POOL_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(POOL_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment; unparsable values fall back.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DB_MAX_CONNECTIONS` | `20` | Pool ceiling |
    /// | `DB_MIN_CONNECTIONS` | `1` | Connections kept open while idle |
    /// | `DB_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |
    /// | `DB_MAX_LIFETIME_SECS` | `1800` | Recycle age (`0` disables) |
    pub fn from_env() -> Self {
        let base = Self::default();
        let max_lifetime = match env_u64("DB_MAX_LIFETIME_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => base.max_lifetime,
        };

        Self {
            max_connections: env_u64("DB_MAX_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(base.max_connections),
            min_connections: env_u64("DB_MIN_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(base.min_connections),
            acquire_timeout: env_u64("DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.acquire_timeout),
            max_lifetime,
            ..base
        }
        .normalized()
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self.normalized()
    }

    pub fn with_min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self.normalized()
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Grow the ceiling so `concurrent_jobs` executions plus the engine's own
    /// tasks never wait on each other for a connection. Never shrinks it.
    pub fn reserve_for_workers(mut self, concurrent_jobs: usize) -> Self {
        let jobs = u32::try_from(concurrent_jobs).unwrap_or(u32::MAX);
        let needed = jobs.saturating_add(POOL_ENGINE_HEADROOM);
        if needed > self.max_connections {
            debug!(
                subsystem = "db",
                component = "pool",
                configured = self.max_connections,
                needed,
                "Raising pool ceiling to cover worker concurrency"
            );
            self.max_connections = needed;
        }
        self
    }

    /// At least one connection, and the floor never above the ceiling.
    fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

/// Open a pool with [`PoolConfig::default`].
pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    connect_pool_with(database_url, &PoolConfig::default()).await
}

/// Open a pool and wait for the first `min_connections` to be established.
pub async fn connect_pool_with(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let started = Instant::now();

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(lifetime) = config.max_lifetime {
        options = options.max_lifetime(lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        open = pool.size(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Log pool occupancy. A pool with nothing idle means jobs are queueing for
/// connections.
pub fn log_pool_metrics(pool: &PgPool) {
    let open = pool.size();
    let idle = pool.num_idle() as u32;
    let busy = open.saturating_sub(idle);

    if open > 0 && idle == 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            open,
            busy,
            "No idle database connections; raise DB_MAX_CONNECTIONS or lower queue concurrency"
        );
    } else {
        debug!(subsystem = "db", component = "pool", open, idle, busy, "Pool occupancy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, POOL_MAX_CONNECTIONS);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(1_800)));
    }

    #[test]
    fn test_floor_clamped_to_ceiling() {
        let config = PoolConfig::new().with_min_connections(50).with_max_connections(8);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.min_connections, 8);

        assert_eq!(PoolConfig::new().with_max_connections(0).max_connections, 1);
    }

    #[test]
    fn test_reserve_for_workers_grows_only() {
        let grown = PoolConfig::new().with_max_connections(5).reserve_for_workers(9);
        assert_eq!(grown.max_connections, 9 + POOL_ENGINE_HEADROOM);

        let kept = PoolConfig::new().with_max_connections(40).reserve_for_workers(9);
        assert_eq!(kept.max_connections, 40);
    }
}
