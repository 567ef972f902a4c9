//! Throwaway Postgres databases for integration tests.

use crate::store::migration::MIGRATOR;
use log::LevelFilter;
use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
use testcontainers::{GenericImage, ImageExt, core::WaitFor};
use testcontainers_modules::testcontainers::{ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner};
use thiserror::Error;
use tokio::runtime::Handle;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TestDatabaseError {
    #[error("neither TEST_DATABASE_URL nor a docker daemon is available")]
    MissingUrl,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("container error: {0}")]
    Container(#[from] TestcontainersError),
}

/// A migrated database with a random name on `TEST_DATABASE_URL`'s server, or
/// on a disposable container when the variable is unset.
pub struct TestDatabase {
    pool: PgPool,
    server: PgConnectOptions,
    name: String,
    dropped: bool,
    _container: Option<ContainerAsync<GenericImage>>,
}

impl TestDatabase {
    pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::create(url.parse()?, None).await,
            _ if docker_available() => {
                let container = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ))
                    .with_env_var("POSTGRES_PASSWORD", "postgres")
                    .start()
                    .await?;
                let url = format!(
                    "postgres://postgres:postgres@{}:{}/postgres",
                    container.get_host().await?,
                    container.get_host_port_ipv4(5432).await?
                );
                Self::create(url.parse()?, Some(container)).await
            }
            _ => Err(TestDatabaseError::MissingUrl),
        }
    }

    async fn create(
        server: PgConnectOptions,
        container: Option<ContainerAsync<GenericImage>>,
    ) -> Result<Self, TestDatabaseError> {
        let server = server.log_statements(LevelFilter::Off).database("postgres");
        let name = format!("mail_test_{}", Uuid::new_v4().simple());

        let admin = PgPoolOptions::new().max_connections(1).connect_with(server.clone()).await?;
        sqlx::query(&format!("CREATE DATABASE \"{name}\" TEMPLATE template0"))
            .execute(&admin)
            .await?;
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(server.clone().database(&name))
            .await?;
        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            server,
            name,
            dropped: false,
            _container: container,
        })
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    /// Close the pool and drop the database.
    pub async fn close(mut self) -> Result<(), TestDatabaseError> {
        self.dropped = true;
        drop_database(self.pool.clone(), self.server.clone(), self.name.clone()).await?;
        Ok(())
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if self.dropped {
            return;
        }
        // A container takes its databases with it; a shared server needs cleanup.
        if let Ok(handle) = Handle::try_current() {
            let cleanup = drop_database(self.pool.clone(), self.server.clone(), self.name.clone());
            handle.spawn(async move {
                let _ = cleanup.await;
            });
        }
    }
}

async fn drop_database(pool: PgPool, server: PgConnectOptions, name: String) -> Result<(), sqlx::Error> {
    pool.close().await;
    let admin = PgPoolOptions::new().max_connections(1).connect_with(server).await?;
    sqlx::query(&format!("DROP DATABASE IF EXISTS \"{name}\" WITH (FORCE)"))
        .execute(&admin)
        .await?;
    admin.close().await;
    Ok(())
}

fn docker_available() -> bool {
    std::env::var_os("DOCKER_HOST").is_some() || std::path::Path::new("/var/run/docker.sock").exists()
}
