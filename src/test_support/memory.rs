//! In-memory collaborators for pipeline, reconciler and mailbox tests.

use crate::mirror::{MailMirror, MirrorError};
use crate::models::{Account, AccountId, Attachment, EmailType, MailboxMessage, MessagePage, NewMessage};
use crate::queue::{EventSource, QueueError, QueuedEvent};
use crate::storage::{ObjectStore, ObjectStoreError};
use crate::store::{AccountDirectory, AttachmentStore, MailboxStore, StoreError, check_page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

// ===== Relational store =====

#[derive(Default)]
struct MailState {
    accounts: Vec<Account>,
    messages: HashMap<AccountId, Vec<MailboxMessage>>,
    next_message_id: i32,
    attachments: Vec<Attachment>,
}

/// Accounts, mailboxes and attachment rows behind one lock.
#[derive(Default)]
pub struct MemoryMailStore {
    state: Mutex<MailState>,
}

impl MemoryMailStore {
    /// Register an account; the domain is taken from the address.
    pub fn add_account(&self, address: &str) -> Account {
        let mut state = self.state.lock();
        let domain_name = address.rsplit('@').next().unwrap_or_default().to_string();
        let account = Account {
            id: AccountId(state.accounts.len() as i32 + 1),
            domain_id: 1,
            domain_name,
            address: address.to_string(),
        };
        state.accounts.push(account.clone());
        account
    }

    pub fn messages(&self, account: AccountId) -> Vec<MailboxMessage> {
        self.state.lock().messages.get(&account).cloned().unwrap_or_default()
    }

    pub fn message_by_id(&self, account: AccountId, message_id: &str) -> Option<MailboxMessage> {
        self.messages(account)
            .into_iter()
            .find(|message| message.message_id == message_id)
    }

    pub fn attachment_rows(&self) -> Vec<Attachment> {
        self.state.lock().attachments.clone()
    }

    fn with_message<T>(
        &self,
        account: AccountId,
        matches: impl Fn(&MailboxMessage) -> bool,
        key: impl ToString,
        update: impl FnOnce(&mut MailboxMessage) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(&account)
            .and_then(|messages| messages.iter_mut().find(|message| matches(message)))
            .ok_or_else(|| StoreError::not_found("message", key))?;
        let result = update(message)?;
        message.last_update_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl AccountDirectory for MemoryMailStore {
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError> {
        let address = address.to_lowercase();
        Ok(self
            .state
            .lock()
            .accounts
            .iter()
            .find(|account| account.address.to_lowercase() == address)
            .cloned())
    }
}

#[async_trait]
impl MailboxStore for MemoryMailStore {
    async fn exists(&self, account: AccountId, email_hash: &str) -> Result<bool, StoreError> {
        Ok(self
            .messages(account)
            .iter()
            .any(|message| message.email_hash == email_hash))
    }

    async fn insert(&self, account: &Account, message: &NewMessage) -> Result<i32, StoreError> {
        let mut state = self.state.lock();
        if !state.accounts.iter().any(|known| known.id == account.id) {
            return Err(StoreError::not_found("account", account.id));
        }
        let duplicate = state
            .messages
            .get(&account.id)
            .is_some_and(|messages| messages.iter().any(|m| m.message_id == message.message_id));
        if duplicate {
            return Err(StoreError::DuplicateMessage {
                message_id: message.message_id.clone(),
            });
        }

        state.next_message_id += 1;
        let id = state.next_message_id;
        let row = MailboxMessage::from_new(id, account, message, Utc::now());
        state.messages.entry(account.id).or_default().push(row);
        Ok(id)
    }

    async fn list(
        &self,
        account: AccountId,
        email_type: EmailType,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, StoreError> {
        let mut messages: Vec<MailboxMessage> = self
            .messages(account)
            .into_iter()
            .filter(|message| message.email_type == email_type)
            .collect();
        let total = messages.len() as i64;
        check_page(page, page_size, total)?;

        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));
        let start = ((page - 1) * page_size) as usize;
        let messages = messages.into_iter().skip(start).take(page_size as usize).collect();
        Ok(MessagePage {
            messages,
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
        let mut messages: Vec<MailboxMessage> = self
            .messages(account)
            .into_iter()
            .filter(|message| message.email_type == email_type && message.id > after_id)
            .collect();
        messages.sort_by_key(|message| message.id);
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn get(&self, account: AccountId, id: i32) -> Result<MailboxMessage, StoreError> {
        self.messages(account)
            .into_iter()
            .find(|message| message.id == id)
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    async fn move_type(
        &self,
        account: AccountId,
        id: i32,
        from: EmailType,
        to: EmailType,
    ) -> Result<(), StoreError> {
        self.with_message(account, |m| m.id == id, id, |message| {
            if message.email_type != from {
                return Err(StoreError::PreconditionFailed {
                    id,
                    expected: from,
                    actual: message.email_type,
                });
            }
            message.email_type = to;
            Ok(())
        })
    }

    async fn set_read(&self, account: AccountId, id: i32, read: bool) -> Result<(), StoreError> {
        self.with_message(account, |m| m.id == id, id, |message| {
            message.is_read = read;
            Ok(())
        })
    }

    async fn update_file_name(
        &self,
        account: AccountId,
        message_id: &str,
        file_name: &str,
    ) -> Result<(), StoreError> {
        self.with_message(account, |m| m.message_id == message_id, message_id, |message| {
            message.file_name = Some(file_name.to_string());
            Ok(())
        })
    }

    async fn delete_by_message_id(&self, account: AccountId, message_id: &str) -> Result<(), StoreError> {
        if let Some(messages) = self.state.lock().messages.get_mut(&account) {
            messages.retain(|message| message.message_id != message_id);
        }
        Ok(())
    }

    async fn move_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        to: EmailType,
    ) -> Result<(), StoreError> {
        self.with_message(account, |m| m.message_id == message_id, message_id, |message| {
            message.email_type = to;
            Ok(())
        })
    }

    async fn set_read_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        read: bool,
    ) -> Result<(), StoreError> {
        self.with_message(account, |m| m.message_id == message_id, message_id, |message| {
            message.is_read = read;
            Ok(())
        })
    }
}

#[async_trait]
impl AttachmentStore for MemoryMailStore {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Attachment>, StoreError> {
        Ok(self
            .state
            .lock()
            .attachments
            .iter()
            .find(|row| row.file_hash == file_hash)
            .cloned())
    }

    async fn find_by_short_code(&self, short_code: &str) -> Result<Option<Attachment>, StoreError> {
        Ok(self
            .state
            .lock()
            .attachments
            .iter()
            .find(|row| row.short_code == short_code)
            .cloned())
    }

    async fn insert_batch(&self, attachments: &[Attachment]) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let mut written = 0;
        for attachment in attachments {
            if state.attachments.iter().any(|row| row.file_hash == attachment.file_hash) {
                continue;
            }
            state.attachments.push(attachment.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn renew_url(
        &self,
        file_hash: &str,
        download_url: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let row = state
            .attachments
            .iter_mut()
            .find(|row| row.file_hash == file_hash)
            .ok_or_else(|| StoreError::not_found("attachment", file_hash))?;
        row.download_url = download_url.to_string();
        row.expire_time = expire_time;
        Ok(())
    }
}

// ===== Object storage =====

/// Bucket/key map. Can be switched offline to simulate transient failures.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
    offline: AtomicBool,
}

impl MemoryObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            (body.into(), "message/rfc822".to_string()),
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(body, _)| body.clone())
    }

    /// Keys in `bucket` starting with `prefix`, sorted.
    pub fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), ObjectStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Request("object store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.check_online()?;
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(body, _)| body.clone())
            .ok_or_else(|| ObjectStoreError::not_found(bucket, key))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.check_online()?;
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), (body, content_type.to_string()));
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        self.check_online()?;
        Ok(format!("https://{}.objects.test/{}?expires={}", bucket, key, ttl.as_secs()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.check_online()?;
        self.objects.lock().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

// ===== Event queue =====

/// FIFO of notifications. Unacknowledged events stay visible and are handed
/// out again with a higher receive count.
#[derive(Default)]
pub struct MemoryEventSource {
    pending: Mutex<VecDeque<QueuedEvent>>,
    acknowledged: Mutex<Vec<String>>,
    next_receipt: AtomicU32,
}

impl MemoryEventSource {
    /// Enqueue a body, returning its receipt handle.
    pub fn push(&self, body: impl Into<String>) -> String {
        let receipt = format!("receipt-{}", self.next_receipt.fetch_add(1, Ordering::SeqCst));
        self.pending.lock().push_back(QueuedEvent {
            body: body.into(),
            receipt: receipt.clone(),
            receive_count: 0,
        });
        receipt
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueuedEvent>, QueueError> {
        let batch: Vec<QueuedEvent> = {
            let mut pending = self.pending.lock();
            pending
                .iter_mut()
                .take(max.max(1) as usize)
                .map(|event| {
                    event.receive_count += 1;
                    event.clone()
                })
                .collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&self, event: &QueuedEvent) -> Result<(), QueueError> {
        self.pending.lock().retain(|queued| queued.receipt != event.receipt);
        self.acknowledged.lock().push(event.receipt.clone());
        Ok(())
    }
}

// ===== IMAP mirror =====

#[derive(Debug, Clone)]
struct MirroredMessage {
    uid: u32,
    message_id: String,
    seen: bool,
}

/// Mirror that keeps folders in memory and records what it was asked to do.
#[derive(Default)]
pub struct RecordingMirror {
    folders: Mutex<HashMap<(String, String), Vec<MirroredMessage>>>,
    next_uid: AtomicU32,
    offline: AtomicBool,
}

impl RecordingMirror {
    pub fn contains(&self, account: &str, mailbox: &str, message_id: &str) -> bool {
        self.find(account, mailbox, message_id).is_some()
    }

    pub fn is_seen(&self, account: &str, mailbox: &str, message_id: &str) -> bool {
        self.find(account, mailbox, message_id).is_some_and(|message| message.seen)
    }

    pub fn count(&self, account: &str, mailbox: &str) -> usize {
        self.folders
            .lock()
            .get(&(account.to_string(), mailbox.to_string()))
            .map_or(0, Vec::len)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn find(&self, account: &str, mailbox: &str, message_id: &str) -> Option<MirroredMessage> {
        self.folders
            .lock()
            .get(&(account.to_string(), mailbox.to_string()))
            .and_then(|messages| messages.iter().find(|m| m.message_id == message_id).cloned())
    }

    fn check_online(&self) -> Result<(), MirrorError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MirrorError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mirror offline",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MailMirror for RecordingMirror {
    async fn append_if_absent(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
        _raw: &[u8],
    ) -> Result<bool, MirrorError> {
        self.check_online()?;
        let mut folders = self.folders.lock();
        let folder = folders
            .entry((account.to_string(), mailbox.to_string()))
            .or_default();
        if folder.iter().any(|m| m.message_id == message_id) {
            return Ok(false);
        }
        folder.push(MirroredMessage {
            uid: self.next_uid.fetch_add(1, Ordering::SeqCst) + 1,
            message_id: message_id.to_string(),
            seen: false,
        });
        Ok(true)
    }

    async fn move_message(&self, account: &str, source: &str, target: &str, uid: u32) -> Result<(), MirrorError> {
        self.check_online()?;
        let mut folders = self.folders.lock();
        let moved = folders
            .get_mut(&(account.to_string(), source.to_string()))
            .and_then(|messages| {
                let index = messages.iter().position(|m| m.uid == uid)?;
                Some(messages.remove(index))
            });
        if let Some(message) = moved {
            folders
                .entry((account.to_string(), target.to_string()))
                .or_default()
                .push(message);
        }
        Ok(())
    }

    async fn set_seen(&self, account: &str, mailbox: &str, uid: u32, seen: bool) -> Result<(), MirrorError> {
        self.check_online()?;
        if let Some(message) = self
            .folders
            .lock()
            .get_mut(&(account.to_string(), mailbox.to_string()))
            .and_then(|messages| messages.iter_mut().find(|m| m.uid == uid))
        {
            message.seen = seen;
        }
        Ok(())
    }

    async fn find_by_message_id(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Vec<u32>, MirrorError> {
        self.check_online()?;
        Ok(self
            .folders
            .lock()
            .get(&(account.to_string(), mailbox.to_string()))
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.message_id == message_id)
                    .map(|m| m.uid)
                    .collect()
            })
            .unwrap_or_default())
    }
}
