//! PostgreSQL adapter for the persistence port.
//!
//! Subscriber and envelope rows are keyed by unique constraints and shared by
//! every worker. They are written and looked up as single autocommitted
//! statements on the pool, so no session transaction ever holds a unique-key
//! lock another worker can wait on.
//!
//! Per-message rows (associations, parts, edges) go through the session.
//! Each statement runs inside its own savepoint when the session holds an
//! open transaction, so a constraint violation only discards that statement
//! and the rest of the message can still be written and committed. In
//! autocommit mode the savepoint degenerates into a single-statement
//! transaction.

use crate::error::StoreError;
use crate::models::{Address, EnvelopeFields, PartFields, Role};
use crate::store::{MailStore, StoreSession, migration};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};

/// PostgreSQL cannot store NUL in text columns.
fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

fn strip_nul_opt(text: Option<&str>) -> Option<String> {
    text.map(strip_nul)
}

/// Commit the statement savepoint on success, roll it back otherwise.
async fn finish<T>(
    savepoint: Transaction<'_, Postgres>,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            savepoint.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = savepoint.rollback().await {
                log::warn!("failed to roll back statement savepoint: {}", rollback_err);
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgMailStore {
    pool: PgPool,
    autocommit: bool,
}

impl PgMailStore {
    pub fn new(pool: PgPool, autocommit: bool) -> Self {
        Self { pool, autocommit }
    }

    /// Open a pool of `pool_size` connections.
    pub async fn connect(url: &str, pool_size: u32, autocommit: bool) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await?;
        log::info!(
            "connected to database (pool size {}, autocommit {})",
            pool_size,
            autocommit
        );
        Ok(Self::new(pool, autocommit))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        migration::run_migrations(&self.pool)
            .await
            .map_err(|e| StoreError::uncoded(format!("migration failed: {}", e)))
    }

    /// Empty every mail table and reset the key sequences.
    pub async fn truncate_all(&self) -> Result<(), StoreError> {
        log::warn!("truncating mail tables");
        sqlx::query(
            "TRUNCATE TABLE envelope_part, envelope_subscriber, part, envelope, subscriber \
             RESTART IDENTITY CASCADE",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MailStore for PgMailStore {
    type Session = PgSession;

    async fn session(&self) -> Result<PgSession, StoreError> {
        let conn = if self.autocommit {
            SessionConnection::Auto(self.pool.acquire().await?)
        } else {
            SessionConnection::Transaction(Some(self.pool.begin().await?))
        };
        Ok(PgSession {
            pool: self.pool.clone(),
            conn,
        })
    }
}

enum SessionConnection {
    Auto(PoolConnection<Postgres>),
    Transaction(Option<Transaction<'static, Postgres>>),
}

/// A store session: one pooled connection for per-message rows, plus the
/// pool for shared identity rows.
pub struct PgSession {
    pool: PgPool,
    conn: SessionConnection,
}

impl PgSession {
    fn connection(&mut self) -> Result<&mut PgConnection, StoreError> {
        match &mut self.conn {
            SessionConnection::Auto(conn) => Ok(&mut **conn),
            SessionConnection::Transaction(tx) => tx
                .as_mut()
                .map(|tx| &mut **tx)
                .ok_or_else(|| StoreError::uncoded("session transaction is closed")),
        }
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn insert_subscriber(&mut self, address: &Address) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO subscriber (address, name) VALUES ($1, $2) RETURNING id",
        )
        .bind(strip_nul(&address.address))
        .bind(strip_nul(&address.display_name))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn lookup_subscriber(&mut self, address: &Address) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM subscriber WHERE address = $1 AND name = $2",
        )
        .bind(strip_nul(&address.address))
        .bind(strip_nul(&address.display_name))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_envelope(&mut self, fields: &EnvelopeFields) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO envelope (message_id, subject, send_date, x_mailer, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(strip_nul_opt(fields.message_id.as_deref()))
        .bind(strip_nul_opt(fields.subject.as_deref()))
        .bind(fields.send_date)
        .bind(strip_nul_opt(fields.x_mailer.as_deref()))
        .bind(strip_nul_opt(fields.user_agent.as_deref()))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn lookup_envelope_by_message_id(
        &mut self,
        message_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM envelope WHERE message_id = $1")
            .bind(strip_nul(message_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_envelope_subscriber(
        &mut self,
        envelope_id: i64,
        subscriber_id: i64,
        role: Role,
    ) -> Result<(), StoreError> {
        let mut savepoint = self.connection()?.begin().await?;
        let result = sqlx::query(
            "INSERT INTO envelope_subscriber (envelope_id, subscriber_id, role) VALUES ($1, $2, $3)",
        )
        .bind(envelope_id)
        .bind(subscriber_id)
        .bind(role.as_str())
        .execute(&mut *savepoint)
        .await
        .map(|_| ());
        finish(savepoint, result).await
    }

    async fn insert_part(&mut self, fields: &PartFields) -> Result<i64, StoreError> {
        let content_length = fields
            .raw_content
            .as_ref()
            .map(|raw| i32::try_from(raw.len()).unwrap_or(i32::MAX))
            .unwrap_or(0);

        let mut savepoint = self.connection()?.begin().await?;
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO part (
                file_name, content, content_type, content_length,
                decoded_content, referenced_envelope_id
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(strip_nul_opt(fields.file_name.as_deref()))
        .bind(fields.raw_content.as_deref())
        .bind(strip_nul_opt(fields.content_type.as_deref()))
        .bind(content_length)
        .bind(strip_nul_opt(fields.decoded_content.as_deref()))
        .bind(fields.referenced_envelope_id)
        .fetch_one(&mut *savepoint)
        .await;
        finish(savepoint, result).await
    }

    async fn insert_part_edge(
        &mut self,
        envelope_id: i64,
        part_id: i64,
        parent_id: i64,
    ) -> Result<(), StoreError> {
        let mut savepoint = self.connection()?.begin().await?;
        let result = sqlx::query(
            "INSERT INTO envelope_part (envelope_id, part_id, parent_id) VALUES ($1, $2, $3)",
        )
        .bind(envelope_id)
        .bind(part_id)
        .bind(parent_id)
        .execute(&mut *savepoint)
        .await
        .map(|_| ());
        finish(savepoint, result).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match &mut self.conn {
            SessionConnection::Auto(_) => Ok(()),
            SessionConnection::Transaction(tx) => {
                if let Some(open) = tx.take() {
                    open.commit().await?;
                }
                *tx = Some(self.pool.begin().await?);
                Ok(())
            }
        }
    }
}
