use rocket_db_pools::{Database, sqlx};

/// Pool shared by the HTTP surface and the background workers.
#[derive(Database)]
#[database("mail_db")]
pub struct MailDb(sqlx::PgPool);
