use super::partition::mailbox_table;
use super::{AccountDirectory, AttachmentStore, MailboxStore, StoreError, check_page};
use crate::models::{
    Account, AccountId, AccountRow, Attachment, EmailType, MailboxMessage, MailboxMessageRow,
    MessagePage, NewMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};

const MESSAGE_COLUMNS: &str = "id, email_message_id, file_name, domain_id, domain_name, email_hash, \
     email_account_id, email_address, recipient_email, s3_key, sender_name, sender_email, cc, bcc, \
     subject, body_text, body_html, is_read, email_type, received_at, attachment_info, created_at, \
     last_update_at";

const ATTACHMENT_COLUMNS: &str = "file_hash, file_name, file_type, file_size, source_key, short_code, \
     download_url, storage_path, expire_time";

/// Postgres-backed implementation of every storage trait.
#[derive(Clone)]
pub struct PgMailStore {
    pool: PgPool,
}

impl PgMailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_type(&self, account: AccountId, id: i32) -> Result<Option<EmailType>, StoreError> {
        let table = mailbox_table(account);
        let current: Option<String> =
            sqlx::query_scalar(&format!("SELECT email_type FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(current.map(|value| value.parse::<EmailType>()).transpose()?)
    }
}

fn into_messages(rows: Vec<MailboxMessageRow>) -> Result<Vec<MailboxMessage>, StoreError> {
    rows.into_iter()
        .map(|row| MailboxMessage::try_from(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl AccountDirectory for PgMailStore {
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"SELECT a.id, a.domain_id, d.name AS domain_name, a.email_address
               FROM email_accounts a
               JOIN domains d ON d.id = a.domain_id
               WHERE lower(a.email_address) = lower($1)"#,
        )
        .bind(address.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }
}

#[async_trait]
impl MailboxStore for PgMailStore {
    async fn exists(&self, account: AccountId, email_hash: &str) -> Result<bool, StoreError> {
        let table = mailbox_table(account);
        let found: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE email_hash = $1)"
        ))
        .bind(email_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn insert(&self, account: &Account, message: &NewMessage) -> Result<i32, StoreError> {
        let table = mailbox_table(account.id);
        let attachment_info = serde_json::to_value(&message.attachments)?;

        let mut tx = self.pool.begin().await?;

        // Foreign keys come from the live account row, not the caller's copy.
        let owner: Option<(i32, String)> = sqlx::query_as(
            r#"SELECT a.domain_id, d.name
               FROM email_accounts a
               JOIN domains d ON d.id = a.domain_id
               WHERE a.id = $1
               FOR SHARE OF a"#,
        )
        .bind(account.id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let (domain_id, domain_name) =
            owner.ok_or_else(|| StoreError::not_found("account", account.id))?;

        let id: i32 = sqlx::query_scalar(&format!(
            r#"INSERT INTO {table} (
                   email_message_id, domain_id, domain_name, email_hash, email_account_id,
                   email_address, recipient_email, s3_key, sender_name, sender_email, cc, bcc,
                   subject, body_text, body_html, is_read, email_type, received_at, attachment_info
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
               RETURNING id"#
        ))
        .bind(&message.message_id)
        .bind(domain_id)
        .bind(&domain_name)
        .bind(&message.email_hash)
        .bind(account.id.0)
        .bind(&account.address)
        .bind(&message.recipient_email)
        .bind(&message.s3_key)
        .bind(&message.sender_name)
        .bind(&message.sender_email)
        .bind(&message.cc)
        .bind(&message.bcc)
        .bind(&message.subject)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.is_read)
        .bind(message.email_type.as_str())
        .bind(message.received_at)
        .bind(attachment_info)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            let duplicate =
                matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
            if duplicate {
                StoreError::DuplicateMessage {
                    message_id: message.message_id.clone(),
                }
            } else {
                StoreError::Database(err)
            }
        })?;

        tx.commit().await?;

        log::debug!("stored message {} as {}#{}", message.message_id, table, id);
        Ok(id)
    }

    async fn list(
        &self,
        account: AccountId,
        email_type: EmailType,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, StoreError> {
        let table = mailbox_table(account);

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE email_type = $1"
        ))
        .bind(email_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        check_page(page, page_size, total)?;

        let offset = (page as i64 - 1) * page_size as i64;
        let rows: Vec<MailboxMessageRow> = sqlx::query_as(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM {table}
               WHERE email_type = $1
               ORDER BY received_at DESC, id DESC
               LIMIT $2 OFFSET $3"#
        ))
        .bind(email_type.as_str())
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(MessagePage {
            messages: into_messages(rows)?,
            total,
            page,
            page_size,
        })
    }

    async fn list_since(
        &self,
        account: AccountId,
        email_type: EmailType,
        after_id: i32,
        limit: u32,
    ) -> Result<Vec<MailboxMessage>, StoreError> {
        let table = mailbox_table(account);
        let rows: Vec<MailboxMessageRow> = sqlx::query_as(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM {table}
               WHERE email_type = $1 AND id > $2
               ORDER BY id ASC
               LIMIT $3"#
        ))
        .bind(email_type.as_str())
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn get(&self, account: AccountId, id: i32) -> Result<MailboxMessage, StoreError> {
        let table = mailbox_table(account);
        let row: Option<MailboxMessageRow> =
            sqlx::query_as(&format!("SELECT {MESSAGE_COLUMNS} FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let row = row.ok_or_else(|| StoreError::not_found("message", id))?;
        Ok(MailboxMessage::try_from(row)?)
    }

    async fn move_type(
        &self,
        account: AccountId,
        id: i32,
        from: EmailType,
        to: EmailType,
    ) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let updated = sqlx::query(&format!(
            r#"UPDATE {table}
               SET email_type = $1, last_update_at = NOW()
               WHERE id = $2 AND email_type = $3"#
        ))
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(());
        }

        match self.current_type(account, id).await? {
            None => Err(StoreError::not_found("message", id)),
            Some(actual) => Err(StoreError::PreconditionFailed {
                id,
                expected: from,
                actual,
            }),
        }
    }

    async fn set_read(&self, account: AccountId, id: i32, read: bool) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let updated = sqlx::query(&format!(
            "UPDATE {table} SET is_read = $1, last_update_at = NOW() WHERE id = $2"
        ))
        .bind(read)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("message", id));
        }
        Ok(())
    }

    async fn update_file_name(
        &self,
        account: AccountId,
        message_id: &str,
        file_name: &str,
    ) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let updated = sqlx::query(&format!(
            "UPDATE {table} SET file_name = $1, last_update_at = NOW() WHERE email_message_id = $2"
        ))
        .bind(file_name)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("message", message_id));
        }
        Ok(())
    }

    async fn delete_by_message_id(&self, account: AccountId, message_id: &str) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE email_message_id = $1"))
            .bind(message_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            log::debug!("delete of {} in {} matched no rows", message_id, table);
        }
        Ok(())
    }

    async fn move_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        to: EmailType,
    ) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let updated = sqlx::query(&format!(
            "UPDATE {table} SET email_type = $1, last_update_at = NOW() WHERE email_message_id = $2"
        ))
        .bind(to.as_str())
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("message", message_id));
        }
        Ok(())
    }

    async fn set_read_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        read: bool,
    ) -> Result<(), StoreError> {
        let table = mailbox_table(account);
        let updated = sqlx::query(&format!(
            "UPDATE {table} SET is_read = $1, last_update_at = NOW() WHERE email_message_id = $2"
        ))
        .bind(read)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("message", message_id));
        }
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for PgMailStore {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Attachment>, StoreError> {
        let row: Option<Attachment> = sqlx::query_as(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE file_hash = $1"
        ))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_short_code(&self, short_code: &str) -> Result<Option<Attachment>, StoreError> {
        let row: Option<Attachment> = sqlx::query_as(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE short_code = $1 LIMIT 1"
        ))
        .bind(short_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_batch(&self, attachments: &[Attachment]) -> Result<u64, StoreError> {
        if attachments.is_empty() {
            return Ok(0);
        }

        let mut hashes = Vec::with_capacity(attachments.len());
        let mut names = Vec::with_capacity(attachments.len());
        let mut types = Vec::with_capacity(attachments.len());
        let mut sizes = Vec::with_capacity(attachments.len());
        let mut source_keys = Vec::with_capacity(attachments.len());
        let mut short_codes = Vec::with_capacity(attachments.len());
        let mut urls = Vec::with_capacity(attachments.len());
        let mut paths = Vec::with_capacity(attachments.len());
        let mut expiries: Vec<DateTime<Utc>> = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            hashes.push(attachment.file_hash.clone());
            names.push(attachment.file_name.clone());
            types.push(attachment.file_type.clone());
            sizes.push(attachment.file_size);
            source_keys.push(attachment.source_key.clone());
            short_codes.push(attachment.short_code.clone());
            urls.push(attachment.download_url.clone());
            paths.push(attachment.storage_path.clone());
            expiries.push(attachment.expire_time);
        }

        let mut tx = self.pool.begin().await?;

        // Concurrent ingestions may race on the same content; the unique hash decides.
        let written = sqlx::query(&format!(
            r#"INSERT INTO attachments ({ATTACHMENT_COLUMNS})
               SELECT * FROM UNNEST(
                   $1::text[], $2::text[], $3::text[], $4::bigint[], $5::text[],
                   $6::text[], $7::text[], $8::text[], $9::timestamptz[]
               )
               ON CONFLICT (file_hash) DO NOTHING"#
        ))
        .bind(&hashes)
        .bind(&names)
        .bind(&types)
        .bind(&sizes)
        .bind(&source_keys)
        .bind(&short_codes)
        .bind(&urls)
        .bind(&paths)
        .bind(&expiries)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        log::debug!("attachment batch: {} of {} rows written", written, attachments.len());
        Ok(written)
    }

    async fn renew_url(
        &self,
        file_hash: &str,
        download_url: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE attachments SET download_url = $2, expire_time = $3 WHERE file_hash = $1",
        )
        .bind(file_hash)
        .bind(download_url)
        .bind(expire_time)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::not_found("attachment", file_hash));
        }
        Ok(())
    }
}
