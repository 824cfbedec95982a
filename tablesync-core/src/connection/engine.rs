//! Engine bindings used by [`super::ConnectionManager`].

use crate::Result;
use crate::error::ReplicationError;
use crate::sql::Statement;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, MySqlPool, PgPool, Postgres};

/// Operations a [`super::ConnectionManager`] needs from a database engine.
///
/// Implementations are stateless markers; all state lives in the pool and
/// the connection handed in.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Pool the manager draws its connection from
    type Pool: Clone + Send + Sync + 'static;
    /// A connection checked out from the pool
    type Connection: Send + 'static;
    /// A fetched row
    type Row: Send + 'static;

    /// Engine name used in log and error messages.
    const NAME: &'static str;

    /// Checks a connection out of the pool.
    async fn acquire(pool: &Self::Pool) -> Result<Self::Connection>;

    /// Runs a query and returns all rows.
    async fn fetch_all(conn: &mut Self::Connection, statement: &Statement)
    -> Result<Vec<Self::Row>>;

    /// Runs a statement and returns the affected row count.
    async fn execute(conn: &mut Self::Connection, statement: &Statement) -> Result<u64>;

    /// Runs statements in one transaction and returns the total affected rows.
    async fn execute_batch(conn: &mut Self::Connection, statements: &[Statement]) -> Result<u64>;

    /// Closes a connection instead of returning it to the pool.
    async fn discard(conn: Self::Connection);
}

/// MySQL, used for the source database and the replication copy.
#[derive(Debug, Clone, Copy)]
pub struct MySqlEngine;

/// PostgreSQL, used for the analytics store.
#[derive(Debug, Clone, Copy)]
pub struct PostgresEngine;

fn mysql_query(statement: &Statement) -> sqlx::query::Query<'_, MySql, sqlx::mysql::MySqlArguments> {
    statement
        .params
        .iter()
        .cloned()
        .fold(sqlx::query(&statement.sql), |query, value| {
            value.bind_mysql(query)
        })
}

fn pg_query(statement: &Statement) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    statement
        .params
        .iter()
        .cloned()
        .fold(sqlx::query(&statement.sql), |query, value| value.bind_pg(query))
}

#[async_trait]
impl Engine for MySqlEngine {
    type Pool = MySqlPool;
    type Connection = PoolConnection<MySql>;
    type Row = sqlx::mysql::MySqlRow;

    const NAME: &'static str = "MySQL";

    async fn acquire(pool: &Self::Pool) -> Result<Self::Connection> {
        pool.acquire()
            .await
            .map_err(|e| ReplicationError::from_sqlx("Failed to acquire MySQL connection", e))
    }

    async fn fetch_all(
        conn: &mut Self::Connection,
        statement: &Statement,
    ) -> Result<Vec<Self::Row>> {
        mysql_query(statement)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| ReplicationError::from_sqlx(format!("Query failed: {}", statement), e))
    }

    async fn execute(conn: &mut Self::Connection, statement: &Statement) -> Result<u64> {
        mysql_query(statement)
            .execute(&mut **conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| ReplicationError::from_sqlx(format!("Statement failed: {}", statement), e))
    }

    async fn execute_batch(conn: &mut Self::Connection, statements: &[Statement]) -> Result<u64> {
        let mut tx = (**conn)
            .begin()
            .await
            .map_err(|e| ReplicationError::from_sqlx("Failed to begin MySQL transaction", e))?;

        let mut affected = 0;
        for statement in statements {
            affected += mysql_query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    ReplicationError::from_sqlx(format!("Statement failed: {}", statement), e)
                })?
                .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| ReplicationError::from_sqlx("Failed to commit MySQL transaction", e))?;
        Ok(affected)
    }

    async fn discard(conn: Self::Connection) {
        if let Err(e) = conn.detach().close().await {
            tracing::debug!("Error while closing MySQL connection: {}", e);
        }
    }
}

#[async_trait]
impl Engine for PostgresEngine {
    type Pool = PgPool;
    type Connection = PoolConnection<Postgres>;
    type Row = sqlx::postgres::PgRow;

    const NAME: &'static str = "PostgreSQL";

    async fn acquire(pool: &Self::Pool) -> Result<Self::Connection> {
        pool.acquire().await.map_err(|e| {
            ReplicationError::from_sqlx("Failed to acquire PostgreSQL connection", e)
        })
    }

    async fn fetch_all(
        conn: &mut Self::Connection,
        statement: &Statement,
    ) -> Result<Vec<Self::Row>> {
        pg_query(statement)
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| ReplicationError::from_sqlx(format!("Query failed: {}", statement), e))
    }

    async fn execute(conn: &mut Self::Connection, statement: &Statement) -> Result<u64> {
        pg_query(statement)
            .execute(&mut **conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| ReplicationError::from_sqlx(format!("Statement failed: {}", statement), e))
    }

    async fn execute_batch(conn: &mut Self::Connection, statements: &[Statement]) -> Result<u64> {
        let mut tx = (**conn).begin().await.map_err(|e| {
            ReplicationError::from_sqlx("Failed to begin PostgreSQL transaction", e)
        })?;

        let mut affected = 0;
        for statement in statements {
            affected += pg_query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    ReplicationError::from_sqlx(format!("Statement failed: {}", statement), e)
                })?
                .rows_affected();
        }

        tx.commit().await.map_err(|e| {
            ReplicationError::from_sqlx("Failed to commit PostgreSQL transaction", e)
        })?;
        Ok(affected)
    }

    async fn discard(conn: Self::Connection) {
        if let Err(e) = conn.detach().close().await {
            tracing::debug!("Error while closing PostgreSQL connection: {}", e);
        }
    }
}
