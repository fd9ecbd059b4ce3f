//! PostgreSQL-backed [`Store`].
//!
//! A single `tokio_postgres::Client` is shared by every worker; the client pipelines
//! concurrent queries over its connection, so no external lock is needed.

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

use crate::statement::Statement;
use crate::store::{Store, StoreWriteError};

pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connects using a libpq-style connection string or `postgres://` URI.
    ///
    /// # Errors
    ///
    /// Returns [`StoreWriteError::Postgres`] if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreWriteError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection error");
            }
        });
        Ok(Self { client })
    }

    /// Creates the payload table if missing; with `reset`, drops it first.
    ///
    /// `table` must already have passed `SinkConfig::validate`.
    pub async fn prepare_table(&self, table: &str, reset: bool) -> Result<(), StoreWriteError> {
        if reset {
            self.client
                .batch_execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
                .await?;
        }
        self.client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id SERIAL PRIMARY KEY,
                    payload TEXT NOT NULL,
                    created_at TIMESTAMP DEFAULT NOW()
                )"
            ))
            .await?;
        tracing::info!(table = %table, reset, "payload table ready");
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreWriteError> {
        // `payload` is TEXT; non-UTF-8 bytes are replaced rather than rejected.
        let texts: Vec<String> = statement
            .params()
            .iter()
            .map(|m| m.to_text_lossy().into_owned())
            .collect();
        let params: Vec<&(dyn ToSql + Sync)> =
            texts.iter().map(|t| t as &(dyn ToSql + Sync)).collect();
        Ok(self.client.execute(statement.sql(), &params).await?)
    }
}
