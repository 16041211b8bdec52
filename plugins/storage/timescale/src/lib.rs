//! TimescaleDB store over a `sqlx` Postgres pool.
//!
//! Each [`Store::transaction`] call leases one pooled connection, runs its
//! statements inside `BEGIN`/`COMMIT` and hands the connection back. A
//! transaction dropped mid-flight is rolled back by `sqlx` when the
//! connection returns to the pool.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;

pub use sqlx::postgres::PgConnectOptions;

use tsbridge_api::{BindValue, Statement, Store, StoreError};

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long a transaction waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TimescaleStore {
    pool: PgPool,
}

impl TimescaleStore {
    /// Open the pool. Fails if the first connection cannot be established.
    pub async fn connect(options: PgConnectOptions, sizing: PoolSizing) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(sizing.min_connections)
            .max_connections(sizing.max_connections)
            .acquire_timeout(sizing.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| store_error(e).with_context("connect"))?;
        tracing::info!(
            min = sizing.min_connections,
            max = sizing.max_connections,
            "database pool ready"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Wait for leased connections to come back and close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run(&self, statements: Vec<Statement>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        for statement in &statements {
            let query = statement
                .params
                .iter()
                .fold(sqlx::query(statement.sql.as_ref()), bind);
            query.execute(&mut *tx).await.map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)
    }
}

impl Store for TimescaleStore {
    fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.run(statements))
    }
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &BindValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        BindValue::Text(s) => query.bind(s.clone()),
        BindValue::Int4(n) => query.bind(*n),
        BindValue::Float4(x) => query.bind(*x),
        BindValue::Timestamptz(t) => query.bind(*t),
    }
}

/// Classify a driver error: transport and pool problems mean the database
/// is unreachable, anything the server answered is a statement failure.
fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::connection(e.to_string()),
        other => StoreError::statement(other.to_string()),
    }
}
