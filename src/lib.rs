#[macro_use]
extern crate rocket;

pub mod config;
pub mod context;
pub mod db;
pub mod ingest;
pub mod mailbox;
pub mod mirror;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod routes;
pub mod runtime;
pub mod storage;
pub mod store;

use crate::db::MailDb;
use crate::runtime::Workers;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::Once;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    rocket::build()
        .attach(MailDb::init())
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match MailDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match store::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Build the pipeline collaborators and manage them with the pool
        .attach(AdHoc::try_on_ignite(
            "Assemble Pipeline",
            |rocket| async move {
                match MailDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        let assembly = runtime::assemble(pool.clone()).await;
                        Ok(rocket
                            .manage(pool)
                            .manage(assembly.monitor)
                            .manage(assembly.mailbox)
                            .manage(assembly.workers))
                    }
                    None => {
                        log::error!("database pool not available for pipeline");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::on_liftoff("Spawn Pipeline Tasks", |rocket| {
            Box::pin(async move {
                match rocket.state::<Workers>() {
                    Some(workers) => workers.start(),
                    None => log::error!("failed to spawn pipeline tasks: workers not managed"),
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Drain Pipeline Tasks", |rocket| {
            Box::pin(async move {
                if let Some(workers) = rocket.state::<Workers>() {
                    workers.shutdown().await;
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                routes::health::live_health,
                routes::health::ready_health,
                routes::status::pipeline_status,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Mail Ingest API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::models::{Account, AccountId};
    use crate::store::partition;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::{self, PgPool};
    use std::any::Any;

    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database;
    pub mod memory;

    /// Helpers for seeding domains and accounts in Postgres-backed tests.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        /// Create a fixture helper bound to the provided pool.
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Insert a domain row, returning its id.
        pub async fn insert_domain(&self, name: &str) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar("INSERT INTO domains (name) VALUES ($1) RETURNING id")
                .bind(name)
                .fetch_one(self.pool)
                .await
        }

        /// Insert an account and provision its mailbox table.
        pub async fn insert_account(
            &self,
            domain_id: i32,
            address: &str,
            display_name: Option<&str>,
        ) -> Result<Account, sqlx::Error> {
            let mut tx = self.pool.begin().await?;
            let (id, domain_name): (i32, String) = sqlx::query_as(
                r#"INSERT INTO email_accounts (domain_id, email_address, display_name)
                   VALUES ($1, $2, $3)
                   RETURNING id, (SELECT name FROM domains WHERE id = $1)"#,
            )
            .bind(domain_id)
            .bind(address)
            .bind(display_name)
            .fetch_one(&mut *tx)
            .await?;

            let account = AccountId(id);
            partition::create_account_table(&mut *tx, account).await?;
            partition::create_account_indexes(&mut *tx, account).await?;
            tx.commit().await?;

            Ok(Account {
                id: account,
                domain_id,
                domain_name,
                address: address.to_string(),
            })
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        managed: Vec<Box<dyn FnOnce(Rocket<Build>) -> Rocket<Build> + Send>>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                managed: Vec::new(),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage a `PgPool` instance for tests that exercise database-backed routes.
        pub fn manage_pg_pool(self, pool: PgPool) -> Self {
            self.manage(pool)
        }

        /// Manage any other piece of state the mounted routes expect.
        pub fn manage<T: Any + Send + Sync>(mut self, state: T) -> Self {
            self.managed.push(Box::new(move |rocket| rocket.manage(state)));
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            for manage in self.managed {
                rocket = manage(rocket);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
