//! # hearth-db
//!
//! PostgreSQL storage layer for hearth.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable job store, including enqueue inside a caller transaction
//!   and the `LISTEN/NOTIFY` wake signal
//! - The cache entry store with atomic upsert
//! - Embedding record storage with pgvector
//! - In-memory implementations of the same repository traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use hearth_db::{Database, JobRepository, NewJob, InsertOpts, SendEmailArgs};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/hearth").await?;
//!     db.migrate().await?;
//!
//!     let mut tx = db.pool.begin().await?;
//!     // ... business writes on `tx` ...
//!     let args = SendEmailArgs { to: "a@example.com".into(), subject: "Hi".into(), body: "".into() };
//!     db.jobs.insert_tx(&mut tx, NewJob::from_args(&args, InsertOpts::default())?).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
pub mod cache;
pub mod embeddings;
pub mod jobs;
pub mod memory;
pub mod pool;

// Test fixtures for integration tests
// Compiled outside cfg(test) so integration tests (in tests/) can use it
#[cfg(feature = "migrations")]
pub mod test_fixtures;

// Re-export core types
pub use hearth_core::*;

// Re-export repository implementations
pub use cache::PgCacheRepository;
pub use embeddings::PgEmbeddingRepository;
pub use jobs::PgJobRepository;
pub use memory::{MemoryCacheStore, MemoryEmbeddingRepository, MemoryJobRepository};
pub use pool::{connect_pool, connect_pool_with, log_pool_metrics, PoolConfig};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job repository for background processing.
    pub jobs: PgJobRepository,
    /// Domain-scoped key/value cache storage.
    pub cache: PgCacheRepository,
    /// Embedding record storage.
    pub embeddings: PgEmbeddingRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            cache: PgCacheRepository::new(pool.clone()),
            embeddings: PgEmbeddingRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = connect_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool_with(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
