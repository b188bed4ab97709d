//! Mailbox archive importer.
//!
//! Reads mail folders, extracts each message's envelope, addresses and MIME
//! part tree, and persists them into a deduplicating relational store.

pub mod config;
pub mod error;
pub mod import;
pub mod mailbox;
pub mod models;
pub mod store;

use crate::config::ImportConfig;
use crate::error::SetupError;
use crate::import::{ImportOptions, Importer, RunSummary};
use crate::mailbox::MboxSource;
use crate::store::{MemoryStore, PgMailStore};

/// Connect, prepare the schema and import `names` from the configured mail root.
///
/// With `dry_run` nothing is written to the database; the pipeline runs
/// against an in-memory store instead.
pub async fn run_import(
    config: &ImportConfig,
    names: &[String],
    dry_run: bool,
) -> Result<RunSummary, SetupError> {
    let source = MboxSource::new(&config.mail_root);
    let options = ImportOptions::from(config);

    if dry_run {
        log::info!("dry run: importing into an in-memory store");
        let importer = Importer::new(source, MemoryStore::new(), options);
        return Ok(importer.run(names).await);
    }

    let url = config.database_url()?;
    let store = PgMailStore::connect(url, config.pool_size(), config.autocommit).await?;
    if config.run_migrations {
        store.run_migrations().await?;
    }
    if config.truncate_on_connect {
        store.truncate_all().await?;
    }

    let importer = Importer::new(source, store, options);
    Ok(importer.run(names).await)
}

pub mod test_support {
    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database {
        use crate::store::migration;
        use sqlx::PgPool;
        use sqlx::postgres::PgPoolOptions;
        use testcontainers::{
            ContainerAsync, ImageExt, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Disposable, migrated Postgres database for integration tests.
        pub struct TestDatabase {
            pool: PgPool,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            /// Launch a Postgres container and apply the mail schema.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().with_tag("16-alpine").start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&url)
                    .await?;
                migration::run_migrations(&pool).await?;

                Ok(Self {
                    pool,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                &self.pool
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool.clone()
            }
        }
    }
}
