//! Connection discipline shared by every component.
//!
//! A [`ConnectionManager`] owns at most one checked-out connection, spaces its
//! queries out when rate limiting is enabled, and retries transient failures
//! on a fresh connection. Managers are never shared between concurrent tasks;
//! `&mut self` on every operation enforces that.

mod engine;
mod factory;

pub use engine::{Engine, MySqlEngine, PostgresEngine};
pub use factory::ConnectionFactory;

use crate::Result;
use crate::config::{PoolSettings, SyncSettings};
use crate::sql::Statement;
use std::time::Duration;
use tokio::time::Instant;

/// Retry and pacing parameters for one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `retry_delay * n`
    pub retry_delay: Duration,
    /// Minimum spacing between queries when rate limiting is on
    pub rate_limit: Duration,
    /// Age after which the held connection is replaced
    pub recycle_after: Duration,
}

impl RetryPolicy {
    /// Builds the policy from pipeline and pool settings.
    pub fn from_settings(settings: &SyncSettings, pool: &PoolSettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            retry_delay: settings.retry_delay(),
            rate_limit: settings.rate_limit_interval(),
            recycle_after: pool.pool_recycle(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default(), &PoolSettings::default())
    }
}

struct HeldConnection<C> {
    conn: C,
    acquired_at: Instant,
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Fetch(&'a Statement),
    Execute(&'a Statement),
    Batch(&'a [Statement]),
}

enum Response<R> {
    Rows(Vec<R>),
    Affected(u64),
}

/// Owns one lazily created connection to a database role.
pub struct ConnectionManager<E: Engine> {
    label: String,
    pool: E::Pool,
    policy: RetryPolicy,
    rate_limited: bool,
    held: Option<HeldConnection<E::Connection>>,
    last_query: Option<Instant>,
}

impl<E: Engine> std::fmt::Debug for ConnectionManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("label", &self.label)
            .field("engine", &E::NAME)
            .field("policy", &self.policy)
            .field("rate_limited", &self.rate_limited)
            .field("connected", &self.held.is_some())
            .finish()
    }
}

impl<E: Engine> ConnectionManager<E> {
    /// Creates a manager over `pool`. No connection is opened yet.
    pub fn new(label: impl Into<String>, pool: E::Pool, policy: RetryPolicy) -> Self {
        Self {
            label: label.into(),
            pool,
            policy,
            rate_limited: false,
            held: None,
            last_query: None,
        }
    }

    /// Enables or disables query spacing.
    pub fn with_rate_limit(mut self, enabled: bool) -> Self {
        self.rate_limited = enabled;
        self
    }

    /// Role label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.held.is_some()
    }

    /// Returns the held connection, creating it on first use.
    ///
    /// A connection older than the recycle interval is closed and replaced.
    pub async fn get_connection(&mut self) -> Result<&mut E::Connection> {
        let expired = self
            .held
            .as_ref()
            .is_some_and(|held| held.acquired_at.elapsed() >= self.policy.recycle_after);
        if expired {
            tracing::debug!("Recycling {} connection for {}", E::NAME, self.label);
            self.discard_connection().await;
        }

        let held = match self.held.take() {
            Some(held) => held,
            None => {
                tracing::debug!("Opening {} connection for {}", E::NAME, self.label);
                HeldConnection {
                    conn: E::acquire(&self.pool).await?,
                    acquired_at: Instant::now(),
                }
            }
        };
        Ok(&mut self.held.insert(held).conn)
    }

    /// Runs a query with retry and returns all rows.
    pub async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<E::Row>> {
        match self.run(Request::Fetch(statement)).await? {
            Response::Rows(rows) => Ok(rows),
            Response::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Runs a query with retry and returns the first row, if any.
    pub async fn fetch_optional(&mut self, statement: &Statement) -> Result<Option<E::Row>> {
        Ok(self.fetch_all(statement).await?.into_iter().next())
    }

    /// Runs a statement with retry and returns the affected row count.
    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        match self.run(Request::Execute(statement)).await? {
            Response::Affected(count) => Ok(count),
            Response::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Runs statements in a single transaction, retrying the whole batch.
    pub async fn execute_batch(&mut self, statements: &[Statement]) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        match self.run(Request::Batch(statements)).await? {
            Response::Affected(count) => Ok(count),
            Response::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Returns the held connection to the pool.
    pub fn close_connection(&mut self) {
        if self.held.take().is_some() {
            tracing::debug!("Released {} connection for {}", E::NAME, self.label);
        }
    }

    async fn discard_connection(&mut self) {
        if let Some(held) = self.held.take() {
            E::discard(held.conn).await;
        }
    }

    async fn wait_for_rate_limit(&mut self) {
        if !self.rate_limited {
            return;
        }
        if let Some(last) = self.last_query {
            let ready_at = last + self.policy.rate_limit;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_query = Some(Instant::now());
    }

    async fn run(&mut self, request: Request<'_>) -> Result<Response<E::Row>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.wait_for_rate_limit().await;

            let outcome = match self.get_connection().await {
                Ok(conn) => match request {
                    Request::Fetch(statement) => {
                        E::fetch_all(conn, statement).await.map(Response::Rows)
                    }
                    Request::Execute(statement) => {
                        E::execute(conn, statement).await.map(Response::Affected)
                    }
                    Request::Batch(statements) => {
                        E::execute_batch(conn, statements).await.map(Response::Affected)
                    }
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.retry_delay * attempt;
                    tracing::warn!(
                        "{} attempt {}/{} on {} failed, retrying in {:?}: {}",
                        E::NAME,
                        attempt,
                        self.policy.max_retries,
                        self.label,
                        delay,
                        e
                    );
                    self.discard_connection().await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.discard_connection().await;
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine for exercising the retry and pacing logic.

    use super::*;
    use crate::error::ReplicationError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct FakeState {
        pub(crate) transient_failures: AtomicU32,
        pub(crate) fatal_failures: AtomicU32,
        pub(crate) acquired: AtomicU32,
        pub(crate) discarded: AtomicU32,
        pub(crate) queries: Mutex<Vec<Instant>>,
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakePool(pub(crate) Arc<FakeState>);

    pub(crate) struct FakeEngine;

    fn record(conn: &mut (FakePool, u32)) -> Result<()> {
        let state = &conn.0.0;
        if let Ok(mut queries) = state.queries.lock() {
            queries.push(Instant::now());
        }
        if state
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReplicationError::connectivity(
                "fake",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            ));
        }
        if state
            .fatal_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReplicationError::query_failed(
                "fake",
                std::io::Error::other("syntax error"),
            ));
        }
        Ok(())
    }

    #[async_trait]
    impl Engine for FakeEngine {
        type Pool = FakePool;
        type Connection = (FakePool, u32);
        type Row = u32;

        const NAME: &'static str = "fake";

        async fn acquire(pool: &Self::Pool) -> Result<Self::Connection> {
            let id = pool.0.acquired.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((pool.clone(), id))
        }

        async fn fetch_all(
            conn: &mut Self::Connection,
            _statement: &Statement,
        ) -> Result<Vec<Self::Row>> {
            record(conn)?;
            Ok(vec![conn.1])
        }

        async fn execute(conn: &mut Self::Connection, _statement: &Statement) -> Result<u64> {
            record(conn)?;
            Ok(1)
        }

        async fn execute_batch(
            conn: &mut Self::Connection,
            statements: &[Statement],
        ) -> Result<u64> {
            record(conn)?;
            Ok(statements.len() as u64)
        }

        async fn discard(conn: Self::Connection) {
            conn.0.0.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
