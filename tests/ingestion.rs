use mail_ingest::config::IngestConfig;
use mail_ingest::context::PipelineContext;
use mail_ingest::ingest::hasher::hash_bytes;
use mail_ingest::ingest::{Disposition, IngestDispatcher, IngestError, IngestStats, IngestionPipeline, InboundEvent};
use mail_ingest::mailbox::MailboxService;
use mail_ingest::mirror::{MirrorOutcome, MirrorQueue};
use mail_ingest::models::EmailType;
use mail_ingest::queue::EventSource;
use mail_ingest::test_support::memory::{MemoryEventSource, MemoryMailStore, MemoryObjectStore, RecordingMirror};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "mail-inbox";

struct Harness {
    store: Arc<MemoryMailStore>,
    objects: Arc<MemoryObjectStore>,
    ctx: PipelineContext,
    config: IngestConfig,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut IngestConfig)) -> Self {
        Self::build(None, tweak)
    }

    fn with_mirror(queue: MirrorQueue) -> Self {
        Self::build(Some(queue), |_| {})
    }

    fn build(mirror: Option<MirrorQueue>, tweak: impl FnOnce(&mut IngestConfig)) -> Self {
        let store = Arc::new(MemoryMailStore::default());
        let objects = Arc::new(MemoryObjectStore::default());
        let ctx = PipelineContext {
            accounts: store.clone(),
            mailboxes: store.clone(),
            attachments: store.clone(),
            objects: objects.clone(),
            mirror,
            stats: Arc::new(IngestStats::default()),
        };
        let mut config = IngestConfig {
            inbox_bucket: BUCKET.to_string(),
            object_key_prefix: "email/".to_string(),
            mail_domain: "mail.example.com".to_string(),
            max_attachment_bytes: 33 * 1024 * 1024,
            recipient_concurrency: 4,
            decode_retry_limit: 3,
            ..IngestConfig::from_env()
        };
        tweak(&mut config);
        Self {
            store,
            objects,
            ctx,
            config,
        }
    }

    fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(self.ctx.clone(), self.config.clone())
    }

    fn stored(&self, key: &str, raw: &str) {
        self.objects.insert(BUCKET, key, raw.as_bytes().to_vec());
    }
}

fn notification(key: &str, to: &[&str], cc: &[&str], recipients: &[&str]) -> String {
    json!({
        "notificationType": "Received",
        "mail": {
            "commonHeaders": {
                "from": ["Carol <carol@example.org>"],
                "to": to,
                "cc": cc,
                "subject": "Quarterly numbers",
            }
        },
        "receipt": {
            "recipients": recipients,
            "action": {
                "type": "S3",
                "bucketName": BUCKET,
                "objectKeyPrefix": "email/",
                "objectKey": key,
            }
        }
    })
    .to_string()
}

fn event(key: &str, to: &[&str], cc: &[&str], recipients: &[&str]) -> InboundEvent {
    InboundEvent::parse(&notification(key, to, cc, recipients)).expect("valid notification")
}

fn plain_message(message_id: Option<&str>) -> String {
    let id_header = message_id
        .map(|id| format!("Message-ID: {}\r\n", id))
        .unwrap_or_default();
    format!(
        "From: Carol <carol@example.org>\r\n\
         To: alice@example.com\r\n\
         Cc: bob@example.com\r\n\
         Subject: Quarterly numbers\r\n\
         Date: Tue, 4 Mar 2025 10:00:00 +0000\r\n\
         {id_header}\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Numbers attached.\r\n"
    )
}

fn message_with_attachments(files: &[(&str, &str)]) -> String {
    let mut raw = String::from(
        "From: Carol <carol@example.org>\r\n\
         To: alice@example.com\r\n\
         Subject: Reports\r\n\
         Date: Tue, 4 Mar 2025 10:00:00 +0000\r\n\
         Message-ID: <reports@example.org>\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
         \r\n\
         --XYZ\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         See attached.\r\n",
    );
    for (name, body) in files {
        raw.push_str(&format!(
            "--XYZ\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"{name}\"\r\n\
             \r\n\
             {body}\r\n"
        ));
    }
    raw.push_str("--XYZ--\r\n");
    raw
}

#[tokio::test]
async fn blind_copies_are_delivered_without_revealing_them() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    let bob = harness.store.add_account("bob@example.com");
    let dave = harness.store.add_account("dave@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let report = harness
        .pipeline()
        .process(&event(
            "email/m1",
            &["alice@example.com"],
            &["bob@example.com"],
            &["alice@example.com", "bob@example.com", "dave@example.com"],
        ))
        .await
        .expect("event processed");

    assert_eq!(report.recipients.bcc, vec!["dave@example.com".to_string()]);
    assert_eq!(report.delivered.len(), 3);

    for account in [alice.id, bob.id, dave.id] {
        let row = harness
            .store
            .message_by_id(account, "<m1@example.org>")
            .expect("delivered");
        assert_eq!(row.recipient_email, "alice@example.com");
        assert_eq!(row.cc, "bob@example.com");
        assert_eq!(row.bcc, "");
        assert_eq!(row.email_type, EmailType::Inbox);
        assert!(!row.is_read);
        assert_eq!(row.s3_key, "email/m1");
        assert_eq!(row.sender_email, "carol@example.org");
    }
}

#[tokio::test]
async fn duplicates_are_skipped_per_account() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    let bob = harness.store.add_account("bob@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));
    let pipeline = harness.pipeline();

    let first = pipeline
        .process(&event("email/m1", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();
    assert_eq!(first.delivered.len(), 1);

    // Bob was added later; Alice already holds the message.
    let second = pipeline
        .process(&event(
            "email/m1",
            &["alice@example.com"],
            &["bob@example.com"],
            &["alice@example.com", "bob@example.com"],
        ))
        .await
        .unwrap();

    assert_eq!(second.duplicates, vec!["alice@example.com".to_string()]);
    assert_eq!(second.delivered.len(), 1);
    assert_eq!(second.delivered[0].account, bob.id);
    assert_eq!(harness.store.messages(alice.id).len(), 1);
    assert_eq!(harness.store.messages(bob.id).len(), 1);

    let stats = harness.ctx.stats.snapshot();
    assert_eq!(stats.messages_stored, 2);
    assert_eq!(stats.duplicates_skipped, 1);
}

#[tokio::test]
async fn unknown_recipients_are_dropped() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let report = harness
        .pipeline()
        .process(&event(
            "email/m1",
            &["alice@example.com", "stranger@example.com"],
            &[],
            &["alice@example.com", "stranger@example.com"],
        ))
        .await
        .unwrap();

    assert_eq!(report.unknown, vec!["stranger@example.com".to_string()]);
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(harness.store.messages(alice.id).len(), 1);
    assert_eq!(harness.ctx.stats.snapshot().unknown_recipients, 1);
}

#[tokio::test]
async fn headers_are_used_when_the_notification_lists_none() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    let bob = harness.store.add_account("bob@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let report = harness
        .pipeline()
        .process(&event(
            "email/m1",
            &[],
            &[],
            &["alice@example.com", "bob@example.com"],
        ))
        .await
        .unwrap();

    assert_eq!(report.recipients.to, vec!["alice@example.com".to_string()]);
    assert_eq!(report.recipients.cc, vec!["bob@example.com".to_string()]);
    assert!(report.recipients.bcc.is_empty());
    assert!(harness.store.message_by_id(alice.id, "<m1@example.org>").is_some());
    assert!(harness.store.message_by_id(bob.id, "<m1@example.org>").is_some());
}

#[tokio::test]
async fn missing_message_id_is_synthesized() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/anon", &plain_message(None));

    let report = harness
        .pipeline()
        .process(&event("email/anon", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();

    assert!(report.message_id.starts_with('<'));
    assert!(report.message_id.ends_with("@mail.example.com>"));
    let stored = harness.store.messages(alice.id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_id, report.message_id);
}

#[tokio::test]
async fn identical_attachments_are_stored_once() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored(
        "email/reports",
        &message_with_attachments(&[("q1.pdf", "same bytes"), ("copy.pdf", "same bytes")]),
    );

    let report = harness
        .pipeline()
        .process(&event("email/reports", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();

    assert_eq!(report.attachments, 2);
    let rows = harness.store.attachment_rows();
    assert_eq!(rows.len(), 1);
    let expected_key = format!("attachment/reports/{}/q1.pdf", &rows[0].file_hash[..16]);
    assert_eq!(harness.objects.keys(BUCKET, "attachment/"), vec![expected_key.clone()]);
    let body = harness.objects.object(BUCKET, &expected_key).unwrap();
    assert_eq!(hash_bytes(&body), rows[0].file_hash);
    assert_eq!(rows[0].source_key, "email/reports");
    assert_eq!(rows[0].short_code.len(), harness.config.short_code_length);
    assert!(rows[0].download_url.starts_with(&format!("https://mail-inbox.objects.test/{}", expected_key)));

    let stored = harness.store.message_by_id(alice.id, "<reports@example.org>").unwrap();
    assert_eq!(stored.attachment_info.len(), 2);
    assert_eq!(stored.attachment_info[0].file_hash, stored.attachment_info[1].file_hash);
}

#[tokio::test]
async fn attachments_over_the_budget_are_skipped_entirely() {
    let harness = Harness::with_config(|config| config.max_attachment_bytes = 16);
    let alice = harness.store.add_account("alice@example.com");
    harness.stored(
        "email/big",
        &message_with_attachments(&[("a.pdf", "0123456789"), ("b.pdf", "abcdefghij")]),
    );

    let report = harness
        .pipeline()
        .process(&event("email/big", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();

    assert_eq!(report.attachments, 0);
    assert_eq!(report.delivered.len(), 1);
    assert!(harness.objects.keys(BUCKET, "attachment/").is_empty());
    assert!(harness.store.attachment_rows().is_empty());
    let stored = harness.store.message_by_id(alice.id, "<reports@example.org>").unwrap();
    assert!(stored.attachment_info.is_empty());
}

#[tokio::test]
async fn foreign_buckets_are_rejected() {
    let harness = Harness::new();
    harness.store.add_account("alice@example.com");
    let body = notification("email/m1", &["alice@example.com"], &[], &["alice@example.com"])
        .replace(BUCKET, "someone-elses-bucket");

    let err = harness
        .pipeline()
        .process(&InboundEvent::parse(&body).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Rejected(_)));
    assert_eq!(err.disposition(1, 3), Disposition::Ack);
}

#[tokio::test]
async fn missing_objects_are_acknowledged() {
    let harness = Harness::new();
    harness.store.add_account("alice@example.com");

    let err = harness
        .pipeline()
        .process(&event("email/gone", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ObjectMissing { .. }));
}

#[tokio::test]
async fn dispatcher_acks_processed_and_invalid_events() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let source = Arc::new(MemoryEventSource::default());
    let good = source.push(notification("email/m1", &["alice@example.com"], &[], &["alice@example.com"]));
    let junk = source.push("not json");

    let dispatcher = IngestDispatcher::new(source.clone(), Arc::new(harness.pipeline()));
    let events = source.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(dispatcher.handle(event).await, Disposition::Ack);
    }

    assert_eq!(source.acknowledged(), vec![good, junk]);
    assert_eq!(source.pending_len(), 0);
    assert_eq!(harness.store.messages(alice.id).len(), 1);

    let stats = harness.ctx.stats.snapshot();
    assert_eq!(stats.events_received, 2);
    assert_eq!(stats.events_acked, 2);
    assert_eq!(stats.events_rejected, 1);
}

#[tokio::test]
async fn dispatcher_leaves_transient_failures_for_redelivery() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));
    harness.objects.set_offline(true);

    let source = Arc::new(MemoryEventSource::default());
    source.push(notification("email/m1", &["alice@example.com"], &[], &["alice@example.com"]));
    let dispatcher = IngestDispatcher::new(source.clone(), Arc::new(harness.pipeline()));

    let first = source.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(dispatcher.handle(&first[0]).await, Disposition::Retry);
    assert_eq!(source.pending_len(), 1);
    assert!(source.acknowledged().is_empty());

    harness.objects.set_offline(false);
    let second = source.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(second[0].receive_count, 2);
    assert_eq!(dispatcher.handle(&second[0]).await, Disposition::Ack);
    assert_eq!(source.pending_len(), 0);
    assert_eq!(harness.store.messages(alice.id).len(), 1);

    let stats = harness.ctx.stats.snapshot();
    assert_eq!(stats.events_retried, 1);
    assert_eq!(stats.events_acked, 1);
}

#[tokio::test]
async fn undecodable_messages_are_dead_lettered_after_the_limit() {
    let harness = Harness::with_config(|config| config.decode_retry_limit = 2);
    harness.store.add_account("alice@example.com");
    harness.stored("email/broken", "\r\n\r\nno header block at all");

    let source = Arc::new(MemoryEventSource::default());
    let receipt = source.push(notification("email/broken", &["alice@example.com"], &[], &["alice@example.com"]));
    let dispatcher = IngestDispatcher::new(source.clone(), Arc::new(harness.pipeline()));

    let first = source.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(dispatcher.handle(&first[0]).await, Disposition::Retry);

    let second = source.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(dispatcher.handle(&second[0]).await, Disposition::DeadLetter);
    assert_eq!(source.acknowledged(), vec![receipt]);

    let stats = harness.ctx.stats.snapshot();
    assert_eq!(stats.events_retried, 1);
    assert_eq!(stats.events_dead_lettered, 1);
    assert_eq!(stats.events_acked, 1);
}

#[tokio::test]
async fn dispatcher_run_stops_on_cancel() {
    let harness = Harness::new();
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let source = Arc::new(MemoryEventSource::default());
    let dispatcher = IngestDispatcher::new(source.clone(), Arc::new(harness.pipeline()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(cancel.clone()));

    source.push(notification("email/m1", &["alice@example.com"], &[], &["alice@example.com"]));
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.acknowledged().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event acknowledged");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("dispatcher stopped")
        .unwrap();
    assert_eq!(harness.store.messages(alice.id).len(), 1);
}

#[tokio::test]
async fn delivered_messages_are_appended_to_the_mirror() {
    let mirror = Arc::new(RecordingMirror::default());
    let (queue, worker) = MirrorQueue::new(mirror.clone(), 16);
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(worker.run(cancel.clone()));

    let harness = Harness::with_mirror(queue.clone());
    harness.store.add_account("alice@example.com");
    harness.store.add_account("bob@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    harness
        .pipeline()
        .process(&event(
            "email/m1",
            &["alice@example.com"],
            &["bob@example.com"],
            &["alice@example.com", "bob@example.com"],
        ))
        .await
        .unwrap();

    assert!(mirror.contains("alice@example.com", "INBOX", "<m1@example.org>"));
    assert!(mirror.contains("bob@example.com", "INBOX", "<m1@example.org>"));
    assert_eq!(queue.stats().snapshot().completed, 2);

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn mirror_failures_do_not_undo_delivery() {
    let mirror = Arc::new(RecordingMirror::default());
    mirror.set_offline(true);
    let (queue, worker) = MirrorQueue::new(mirror.clone(), 16);
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(worker.run(cancel.clone()));

    let harness = Harness::with_mirror(queue);
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));

    let report = harness
        .pipeline()
        .process(&event("email/m1", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert_eq!(harness.store.messages(alice.id).len(), 1);
    assert_eq!(harness.ctx.stats.snapshot().mirror_failures, 1);

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn mailbox_changes_follow_into_the_mirror() {
    let mirror = Arc::new(RecordingMirror::default());
    let (queue, worker) = MirrorQueue::new(mirror.clone(), 16);
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(worker.run(cancel.clone()));

    let harness = Harness::with_mirror(queue);
    let alice = harness.store.add_account("alice@example.com");
    harness.stored("email/m1", &plain_message(Some("<m1@example.org>")));
    let report = harness
        .pipeline()
        .process(&event("email/m1", &["alice@example.com"], &[], &["alice@example.com"]))
        .await
        .unwrap();
    let id = report.delivered[0].id;

    let mailbox = MailboxService::new(&harness.ctx, 20);

    let (opened, outcome) = mailbox.open_message(&alice, id).await.unwrap();
    assert!(opened.is_read);
    outcome.wait().await.unwrap();
    assert!(mirror.is_seen("alice@example.com", "INBOX", "<m1@example.org>"));

    // Already read: nothing more to mirror.
    let (_, again) = mailbox.open_message(&alice, id).await.unwrap();
    assert!(matches!(again, MirrorOutcome::Disabled));

    mailbox
        .move_message(&alice, id, EmailType::Inbox, EmailType::Deleted)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(!mirror.contains("alice@example.com", "INBOX", "<m1@example.org>"));
    assert!(mirror.contains("alice@example.com", "Trash", "<m1@example.org>"));

    let stale = mailbox
        .move_message(&alice, id, EmailType::Inbox, EmailType::Trash)
        .await;
    assert!(stale.is_err());

    let trash = mailbox.list(&alice, EmailType::Deleted, 1).await.unwrap();
    assert_eq!(trash.total, 1);
    assert!(mailbox.list_since(&alice, EmailType::Inbox, 0).await.unwrap().is_empty());

    cancel.cancel();
    worker.await.unwrap();
}
