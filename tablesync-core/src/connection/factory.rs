//! Pool construction per database role.

use super::{ConnectionManager, MySqlEngine, PostgresEngine, RetryPolicy};
use crate::Result;
use crate::config::{DatabaseRole, DatabaseSettings, DatabasesConfig, SyncSettings};
use crate::error::{ReplicationError, redact_database_url};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, MySqlPool, PgPool};

/// Drops `NO_ZERO_DATE` and `NO_ZERO_IN_DATE` from the session `sql_mode` so
/// zero dates accepted by the source can be written to the replica.
const ALLOW_ZERO_DATES: &str = "SET SESSION sql_mode = TRIM(BOTH ',' FROM \
     REPLACE(REPLACE(REPLACE(REPLACE(@@SESSION.sql_mode, \
     'NO_ZERO_IN_DATE', ''), 'NO_ZERO_DATE', ''), ',,', ','), ',,', ','))";

/// Builds and owns the three connection pools.
///
/// Pools connect lazily, so constructing the factory never touches the
/// network. Each `*_manager` call returns an independent
/// [`ConnectionManager`] that checks out its own connection.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    source: MySqlPool,
    replication: MySqlPool,
    analytics: PgPool,
    databases: DatabasesConfig,
    settings: SyncSettings,
}

impl ConnectionFactory {
    /// Creates lazily connecting pools for every role.
    ///
    /// # Errors
    /// Returns a configuration error when a URL cannot be parsed.
    pub fn new(databases: &DatabasesConfig, settings: &SyncSettings) -> Result<Self> {
        databases.validate()?;
        Ok(Self {
            source: create_mysql_pool(DatabaseRole::Source, &databases.source)?,
            replication: create_mysql_pool(DatabaseRole::Replication, &databases.replication)?,
            analytics: create_pg_pool(&databases.analytics)?,
            databases: databases.clone(),
            settings: settings.clone(),
        })
    }

    fn policy(&self, role: DatabaseRole) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings, &self.databases.for_role(role).pool)
    }

    /// Manager for the source database. Queries are rate limited.
    pub fn source_manager(&self) -> ConnectionManager<MySqlEngine> {
        ConnectionManager::new(
            DatabaseRole::Source.to_string(),
            self.source.clone(),
            self.policy(DatabaseRole::Source),
        )
        .with_rate_limit(true)
    }

    /// Manager for the replication copy.
    pub fn replication_manager(&self) -> ConnectionManager<MySqlEngine> {
        ConnectionManager::new(
            DatabaseRole::Replication.to_string(),
            self.replication.clone(),
            self.policy(DatabaseRole::Replication),
        )
    }

    /// Manager for the analytics store.
    pub fn analytics_manager(&self) -> ConnectionManager<PostgresEngine> {
        ConnectionManager::new(
            DatabaseRole::Analytics.to_string(),
            self.analytics.clone(),
            self.policy(DatabaseRole::Analytics),
        )
    }

    /// Pipeline settings the factory was built with.
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Issues `SELECT 1` against every role.
    ///
    /// # Errors
    /// Returns the first connectivity failure, with the URL redacted.
    pub async fn test_connections(&self) -> Result<()> {
        let checks = [
            (DatabaseRole::Source, ping_mysql(&self.source).await),
            (DatabaseRole::Replication, ping_mysql(&self.replication).await),
            (DatabaseRole::Analytics, ping_pg(&self.analytics).await),
        ];

        for (role, outcome) in checks {
            match outcome {
                Ok(()) => tracing::info!("{} database connection OK", role),
                Err(e) => {
                    return Err(ReplicationError::from_sqlx(
                        format!(
                            "Connection test failed for {} database at {}",
                            role,
                            redact_database_url(&self.databases.for_role(role).url)
                        ),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Closes all pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.replication.close().await;
        self.analytics.close().await;
    }
}

async fn ping_mysql(pool: &MySqlPool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
}

async fn ping_pg(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
}

fn create_mysql_pool(role: DatabaseRole, settings: &DatabaseSettings) -> Result<MySqlPool> {
    let options: MySqlConnectOptions = settings.url.parse().map_err(|e| {
        ReplicationError::configuration(format!(
            "Invalid {} connection string {}: {}",
            role,
            redact_database_url(&settings.url),
            e
        ))
    })?;

    let query_timeout_ms = settings.pool.query_timeout().as_millis();
    // The replication copy is rebuilt table by table, so referential checks
    // are disabled for its sessions. Zero dates are written as read.
    let replica_session = role == DatabaseRole::Replication;

    let pool = MySqlPoolOptions::new()
        .max_connections(settings.pool.max_connections())
        .min_connections(0)
        .acquire_timeout(
            settings
                .pool
                .pool_timeout()
                .max(std::time::Duration::from_secs(settings.pool.connect_timeout_secs)),
        )
        .max_lifetime(Some(settings.pool.pool_recycle()))
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET SESSION max_execution_time = {}", query_timeout_ms).as_str())
                    .await?;
                conn.execute("SET time_zone = '+00:00'").await?;
                if replica_session {
                    conn.execute("SET SESSION foreign_key_checks = 0").await?;
                    conn.execute(ALLOW_ZERO_DATES).await?;
                }
                Ok(())
            })
        })
        .connect_lazy_with(options);

    tracing::debug!(
        "Created {} pool for {}",
        role,
        redact_database_url(&settings.url)
    );
    Ok(pool)
}

fn create_pg_pool(settings: &DatabaseSettings) -> Result<PgPool> {
    let options: PgConnectOptions = settings.url.parse().map_err(|e| {
        ReplicationError::configuration(format!(
            "Invalid analytics connection string {}: {}",
            redact_database_url(&settings.url),
            e
        ))
    })?;

    let query_timeout_ms = settings.pool.query_timeout().as_millis();

    let pool = PgPoolOptions::new()
        .max_connections(settings.pool.max_connections())
        .min_connections(0)
        .acquire_timeout(
            settings
                .pool
                .pool_timeout()
                .max(std::time::Duration::from_secs(settings.pool.connect_timeout_secs)),
        )
        .max_lifetime(Some(settings.pool.pool_recycle()))
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {}", query_timeout_ms).as_str())
                    .await?;
                conn.execute("SET TIME ZONE 'UTC'").await?;
                Ok(())
            })
        })
        .connect_lazy_with(options);

    tracing::debug!(
        "Created analytics pool for {}",
        redact_database_url(&settings.url)
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn databases() -> DatabasesConfig {
        DatabasesConfig {
            source: DatabaseSettings::new("mysql://reader:pw@127.0.0.1:3306/app"),
            replication: DatabaseSettings::new("mysql://writer:pw@127.0.0.1:3307/app"),
            analytics: DatabaseSettings::new("postgres://loader:pw@127.0.0.1:5432/app"),
        }
    }

    #[tokio::test]
    async fn test_factory_is_lazy() {
        let factory = ConnectionFactory::new(&databases(), &SyncSettings::default()).unwrap();
        let manager = factory.source_manager();
        assert_eq!(manager.label(), "source");
        assert!(!manager.is_connected());
        assert_eq!(factory.analytics_manager().label(), "analytics");
    }

    #[tokio::test]
    async fn test_factory_rejects_invalid_configuration() {
        let mut config = databases();
        config.analytics = DatabaseSettings::new("mysql://wrong-engine/app");
        let result = ConnectionFactory::new(&config, &SyncSettings::default());
        assert!(matches!(
            result,
            Err(ReplicationError::Configuration { .. })
        ));
    }
}
