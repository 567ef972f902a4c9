use std::io::{self, Write};

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use mail_ingest::models::AccountId;
use mail_ingest::store::partition;

#[derive(Parser, Debug)]
#[command(
    name = "create_account",
    about = "Register a mailbox account and provision its message table"
)]
struct Args {
    /// Mail domain the account belongs to. Created if absent.
    #[arg(long)]
    domain: String,

    /// Part of the address before the `@`.
    #[arg(long)]
    local_part: String,

    /// Optional display name for the account.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let domain = args.domain.trim().to_lowercase();
    let local_part = args.local_part.trim().to_lowercase();

    if domain.is_empty() || local_part.is_empty() || local_part.contains('@') || domain.contains('@') {
        writeln!(io::stderr(), "error: expected a bare domain and a local part without '@'")?;
        std::process::exit(1);
    }
    let address = format!("{local_part}@{domain}");

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;

    let mut tx = pool.begin().await?;

    let domain_id: i32 = sqlx::query_scalar(
        r#"INSERT INTO domains (name) VALUES ($1)
           ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
           RETURNING id"#,
    )
    .bind(&domain)
    .fetch_one(&mut *tx)
    .await?;

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM email_accounts WHERE lower(email_address) = lower($1)",
    )
    .bind(&address)
    .fetch_one(&mut *tx)
    .await?;

    if existing > 0 {
        writeln!(io::stderr(), "error: account '{address}' already exists.")?;
        std::process::exit(1);
    }

    let account_id: i32 = sqlx::query_scalar(
        "INSERT INTO email_accounts (domain_id, email_address, display_name) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(domain_id)
    .bind(&address)
    .bind(args.name.as_ref())
    .fetch_one(&mut *tx)
    .await?;

    let account = AccountId(account_id);
    partition::create_account_table(&mut *tx, account).await?;
    partition::create_account_indexes(&mut *tx, account).await?;

    tx.commit().await?;

    println!(
        "Created account '{address}' with id {account_id} (table {})",
        partition::mailbox_table(account)
    );
    Ok(())
}
