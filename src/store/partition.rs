//! Per-account mailbox tables.
//!
//! Each account owns a physically separate table named `user_{id}_emails`.
//! The name is derived from the numeric [`AccountId`] only, so it is always a
//! valid identifier and never carries user input.

use crate::models::AccountId;
use rocket_db_pools::sqlx::{self, Executor, Postgres};

/// Table holding all messages for `account`.
pub fn mailbox_table(account: AccountId) -> String {
    format!("user_{}_emails", account.0)
}

/// Create the mailbox table for an account if it does not exist.
pub async fn create_account_table<'e, E>(executor: E, account: AccountId) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let table = mailbox_table(account);
    log::debug!("creating mailbox table {}", table);

    sqlx::query(&format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
               id SERIAL PRIMARY KEY,
               email_message_id VARCHAR(998) NOT NULL UNIQUE,
               file_name TEXT,
               domain_id INTEGER NOT NULL REFERENCES domains(id),
               domain_name VARCHAR(255) NOT NULL,
               email_hash CHAR(64) NOT NULL,
               email_account_id INTEGER NOT NULL REFERENCES email_accounts(id) ON DELETE CASCADE,
               email_address VARCHAR(320) NOT NULL,
               recipient_email TEXT NOT NULL DEFAULT '',
               s3_key TEXT NOT NULL DEFAULT '',
               sender_name TEXT NOT NULL DEFAULT '',
               sender_email TEXT NOT NULL DEFAULT '',
               cc TEXT NOT NULL DEFAULT '',
               bcc TEXT NOT NULL DEFAULT '',
               reply_email_id INTEGER,
               subject TEXT NOT NULL DEFAULT '',
               body_text TEXT NOT NULL DEFAULT '',
               body_html TEXT NOT NULL DEFAULT '',
               is_read BOOLEAN NOT NULL DEFAULT FALSE,
               email_type VARCHAR(16) NOT NULL DEFAULT 'inbox'
                   CHECK (email_type IN ('inbox', 'sent', 'trash', 'draft', 'deleted')),
               received_at TIMESTAMPTZ NOT NULL,
               attachment_info JSONB NOT NULL DEFAULT '[]'::jsonb,
               created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
               last_update_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
           )"#
    ))
    .execute(executor)
    .await?;

    Ok(())
}

/// Indexes backing hash dedup and category listings.
pub async fn create_account_indexes<'e, E>(executor: E, account: AccountId) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let table = mailbox_table(account);
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_hash ON {table} (email_hash)"
    ))
    .execute(executor)
    .await?;
    Ok(())
}

/// Drop an account's mailbox table. Permanently deletes its messages.
pub async fn drop_account_table<'e, E>(executor: E, account: AccountId) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let table = mailbox_table(account);
    log::debug!("dropping mailbox table {}", table);
    sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_derived_from_account_id() {
        assert_eq!(mailbox_table(AccountId(42)), "user_42_emails");
    }
}
