//! Attachment extraction and content-addressed storage.
//!
//! A message's attachable parts are either all stored or, when their combined
//! size exceeds the budget, all skipped. Each stored part is keyed by the
//! SHA-256 of its bytes: content already known to the attachment store is
//! reused without another upload, and a reused row whose link has expired gets
//! a fresh one. Two ingestions racing on the same content may both upload; the
//! batched insert keeps the first row and the loser removes its own object.

use super::hasher::hash_bytes;
use super::mime::AttachablePart;
use super::shortcode::short_code;
use crate::config::IngestConfig;
use crate::models::Attachment;
use crate::storage::{ObjectStore, ObjectStoreError};
use crate::store::{AttachmentStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Hex digits of the content hash that go into the object key.
const KEY_HASH_PREFIX: usize = 16;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment upload failed: {0}")]
    Storage(#[from] ObjectStoreError),
    #[error("attachment metadata failed: {0}")]
    Store(#[from] StoreError),
}

pub struct AttachmentProcessor {
    objects: Arc<dyn ObjectStore>,
    attachments: Arc<dyn AttachmentStore>,
    bucket: String,
    key_prefix: String,
    max_total_bytes: u64,
    url_ttl: Duration,
    short_code_length: usize,
}

impl AttachmentProcessor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        attachments: Arc<dyn AttachmentStore>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            objects,
            attachments,
            bucket: config.inbox_bucket.clone(),
            key_prefix: config.object_key_prefix.clone(),
            max_total_bytes: config.max_attachment_bytes,
            url_ttl: config.attachment_ttl,
            short_code_length: config.short_code_length,
        }
    }

    /// Store the attachable parts of the message at `source_key`.
    pub async fn process(
        &self,
        source_key: &str,
        parts: &[AttachablePart],
    ) -> Result<Vec<Attachment>, AttachmentError> {
        let total: u64 = parts.iter().map(AttachablePart::size).sum();
        if total > self.max_total_bytes {
            log::warn!(
                "{}: attachments total {} bytes over the {} byte limit, skipping all",
                source_key,
                total,
                self.max_total_bytes
            );
            return Ok(Vec::new());
        }

        let mut result = Vec::with_capacity(parts.len());
        let mut fresh: Vec<Attachment> = Vec::new();
        let mut by_hash: HashMap<String, Attachment> = HashMap::new();

        for part in parts {
            let file_name = sanitize_file_name(&part.file_name);
            if file_name.is_empty() {
                log::debug!("{}: skipping unnamed {} part", source_key, part.content_type);
                continue;
            }

            let file_hash = hash_bytes(&part.data);
            if let Some(known) = by_hash.get(&file_hash) {
                result.push(known.clone());
                continue;
            }

            let attachment = match self.attachments.find_by_hash(&file_hash).await? {
                Some(existing) if existing.expire_time <= Utc::now() => self.renew(source_key, existing).await?,
                Some(existing) => {
                    log::debug!("{}: reusing stored attachment {}", source_key, existing.storage_path);
                    existing
                }
                None => {
                    let created = self.upload(source_key, &file_name, &file_hash, part).await?;
                    fresh.push(created.clone());
                    created
                }
            };

            by_hash.insert(file_hash, attachment.clone());
            result.push(attachment);
        }

        if !fresh.is_empty() {
            let written = self.attachments.insert_batch(&fresh).await?;
            if (written as usize) < fresh.len() {
                self.settle_lost_races(source_key, &fresh, &mut result).await?;
            }
            log::info!("{}: stored {} new attachments", source_key, written);
        }

        Ok(result)
    }

    /// Another ingestion inserted some of `fresh` first: point `result` at the
    /// rows that won and drop the objects this call uploaded for them.
    async fn settle_lost_races(
        &self,
        source_key: &str,
        fresh: &[Attachment],
        result: &mut [Attachment],
    ) -> Result<(), AttachmentError> {
        for ours in fresh {
            let Some(winner) = self.attachments.find_by_hash(&ours.file_hash).await? else {
                continue;
            };
            if winner.short_code == ours.short_code {
                continue;
            }

            log::info!(
                "{}: {} was stored concurrently as {}",
                source_key,
                ours.storage_path,
                winner.storage_path
            );
            if winner.storage_path != ours.storage_path {
                if let Err(e) = self.objects.delete(&self.bucket, &ours.storage_path).await {
                    log::warn!("{}: removing orphaned {} failed: {}", source_key, ours.storage_path, e);
                }
            }
            for attachment in result.iter_mut().filter(|a| a.file_hash == ours.file_hash) {
                *attachment = winner.clone();
            }
        }
        Ok(())
    }

    async fn renew(&self, source_key: &str, mut existing: Attachment) -> Result<Attachment, AttachmentError> {
        existing.download_url = self
            .objects
            .presign_get(&self.bucket, &existing.storage_path, self.url_ttl)
            .await?;
        existing.expire_time = Utc::now() + self.ttl();
        self.attachments
            .renew_url(&existing.file_hash, &existing.download_url, existing.expire_time)
            .await?;
        log::info!("{}: renewed expired link for {}", source_key, existing.storage_path);
        Ok(existing)
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.url_ttl).unwrap_or(chrono::Duration::zero())
    }

    async fn upload(
        &self,
        source_key: &str,
        file_name: &str,
        file_hash: &str,
        part: &AttachablePart,
    ) -> Result<Attachment, AttachmentError> {
        let storage_path = self.storage_path(source_key, file_hash, file_name);
        let content_type = if part.content_type.is_empty() {
            "application/octet-stream"
        } else {
            part.content_type.as_str()
        };

        self.objects
            .put(&self.bucket, &storage_path, part.data.clone(), content_type)
            .await?;
        let download_url = self
            .objects
            .presign_get(&self.bucket, &storage_path, self.url_ttl)
            .await?;

        Ok(Attachment {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            file_type: content_type.to_string(),
            file_size: part.data.len() as i64,
            source_key: source_key.to_string(),
            short_code: short_code(&storage_path, self.short_code_length),
            download_url,
            storage_path,
            expire_time: Utc::now() + self.ttl(),
        })
    }

    /// `attachment/{source key without its prefix}/{hash prefix}/{file name}`.
    ///
    /// Parts of one message may share a file name, so the content hash keeps
    /// their objects apart.
    fn storage_path(&self, source_key: &str, file_hash: &str, file_name: &str) -> String {
        let key = source_key
            .strip_prefix(self.key_prefix.as_str())
            .unwrap_or(source_key)
            .trim_matches('/');
        let hash = file_hash.get(..KEY_HASH_PREFIX).unwrap_or(file_hash);
        format!("attachment/{}/{}/{}", key, hash, file_name)
    }
}

/// File name safe to embed as one object key segment.
pub fn sanitize_file_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory::{MemoryMailStore, MemoryObjectStore};
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Barrier;

    const BUCKET: &str = "mail-inbox";

    fn config() -> IngestConfig {
        IngestConfig {
            inbox_bucket: BUCKET.to_string(),
            object_key_prefix: "incoming/".to_string(),
            max_attachment_bytes: 1 << 20,
            attachment_ttl: Duration::from_secs(3600),
            short_code_length: 8,
            ..IngestConfig::default()
        }
    }

    fn part(name: &str, data: &[u8]) -> AttachablePart {
        AttachablePart {
            file_name: name.to_string(),
            content_type: "application/pdf".to_string(),
            inline: false,
            data: data.to_vec(),
        }
    }

    /// Holds every batch insert until two callers have reached it, so both
    /// have already looked the hash up and missed.
    struct RacingAttachments {
        inner: Arc<MemoryMailStore>,
        gate: Barrier,
    }

    #[async_trait]
    impl AttachmentStore for RacingAttachments {
        async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Attachment>, StoreError> {
            self.inner.find_by_hash(file_hash).await
        }

        async fn find_by_short_code(&self, short_code: &str) -> Result<Option<Attachment>, StoreError> {
            self.inner.find_by_short_code(short_code).await
        }

        async fn insert_batch(&self, attachments: &[Attachment]) -> Result<u64, StoreError> {
            self.gate.wait().await;
            self.inner.insert_batch(attachments).await
        }

        async fn renew_url(
            &self,
            file_hash: &str,
            download_url: &str,
            expire_time: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.renew_url(file_hash, download_url, expire_time).await
        }
    }

    #[test]
    fn sanitizes_path_separators() {
        assert_eq!(sanitize_file_name(" ../etc/passwd "), "_etc_passwd");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("   "), "");
    }

    #[tokio::test]
    async fn same_name_different_content_gets_separate_objects() {
        let objects = Arc::new(MemoryObjectStore::default());
        let store = Arc::new(MemoryMailStore::default());
        let processor = AttachmentProcessor::new(objects.clone(), store.clone(), &config());

        let stored = processor
            .process(
                "incoming/abc",
                &[part("scan.pdf", b"first scan"), part("scan.pdf", b"second scan")],
            )
            .await
            .unwrap();

        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0].storage_path, stored[1].storage_path);
        assert_eq!(objects.keys(BUCKET, "attachment/").len(), 2);
        for row in store.attachment_rows() {
            assert!(row.storage_path.starts_with("attachment/abc/"));
            assert!(row.storage_path.ends_with("/scan.pdf"));
            let body = objects.object(BUCKET, &row.storage_path).expect("object stored");
            assert_eq!(hash_bytes(&body), row.file_hash);
        }
    }

    #[tokio::test]
    async fn concurrent_uploads_of_one_file_settle_on_the_first_row() {
        let objects = Arc::new(MemoryObjectStore::default());
        let store = Arc::new(MemoryMailStore::default());
        let racing = Arc::new(RacingAttachments {
            inner: store.clone(),
            gate: Barrier::new(2),
        });
        let processor = AttachmentProcessor::new(objects.clone(), racing, &config());

        let first_parts = [part("invoice.pdf", b"same bytes")];
        let second_parts = [part("invoice.pdf", b"same bytes")];
        let (first, second) = tokio::join!(
            processor.process("incoming/one", &first_parts),
            processor.process("incoming/two", &second_parts),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let rows = store.attachment_rows();
        assert_eq!(rows.len(), 1);
        let winner = &rows[0];
        for result in [&first, &second] {
            assert_eq!(result.len(), 1);
            assert_eq!(result[0].short_code, winner.short_code);
            assert_eq!(result[0].storage_path, winner.storage_path);
        }
        assert_eq!(objects.keys(BUCKET, "attachment/"), vec![winner.storage_path.clone()]);
    }

    #[tokio::test]
    async fn reused_row_with_expired_link_is_renewed() {
        let objects = Arc::new(MemoryObjectStore::default());
        let store = Arc::new(MemoryMailStore::default());
        let data = b"old report";
        let storage_path = "attachment/old/0123456789abcdef/report.pdf".to_string();
        objects.insert(BUCKET, &storage_path, data.to_vec());
        store
            .insert_batch(&[Attachment {
                file_hash: hash_bytes(data),
                file_name: "report.pdf".to_string(),
                file_type: "application/pdf".to_string(),
                file_size: data.len() as i64,
                source_key: "incoming/old".to_string(),
                short_code: "abcd1234".to_string(),
                download_url: "https://stale.example/report.pdf".to_string(),
                storage_path: storage_path.clone(),
                expire_time: Utc::now() - chrono::Duration::hours(1),
            }])
            .await
            .unwrap();

        let processor = AttachmentProcessor::new(objects.clone(), store.clone(), &config());
        let stored = processor
            .process("incoming/new", &[part("report.pdf", data)])
            .await
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].short_code, "abcd1234");
        assert!(stored[0].download_url.starts_with("https://mail-inbox.objects.test/attachment/old/"));
        assert!(stored[0].expire_time > Utc::now());

        let rows = store.attachment_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].download_url, stored[0].download_url);
        assert_eq!(rows[0].expire_time, stored[0].expire_time);
        assert_eq!(objects.keys(BUCKET, "attachment/"), vec![storage_path]);
    }
}
