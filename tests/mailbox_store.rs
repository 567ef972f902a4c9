use chrono::{Duration, TimeZone, Utc};
use mail_ingest::models::{Account, Attachment, EmailType, NewMessage};
use mail_ingest::store::{AccountDirectory, AttachmentStore, MailboxStore, PgMailStore, StoreError, partition};
use mail_ingest::test_support::{TestDatabase, TestDatabaseError, TestFixtures};

macro_rules! test_database {
    ($what:literal) => {
        match TestDatabase::new_from_env().await {
            Ok(db) => db,
            Err(TestDatabaseError::MissingUrl) => {
                eprintln!("skipping {}: no test database available", $what);
                return;
            }
            Err(err) => panic!("failed to provision test database: {err:?}"),
        }
    };
}

fn message(message_id: &str, hash: &str, minutes: i64) -> NewMessage {
    NewMessage {
        message_id: message_id.to_string(),
        email_hash: format!("{:0>64}", hash),
        recipient_email: "alice@example.com".to_string(),
        s3_key: format!("email/{}", hash),
        sender_name: "Carol".to_string(),
        sender_email: "carol@example.org".to_string(),
        cc: String::new(),
        bcc: String::new(),
        subject: format!("subject {}", hash),
        body_text: "hello".to_string(),
        body_html: String::new(),
        is_read: false,
        email_type: EmailType::Inbox,
        attachments: Vec::new(),
        received_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes),
    }
}

async fn seed(pool: &sqlx::PgPool) -> (Account, Account) {
    let fixtures = TestFixtures::new(pool);
    let domain = fixtures.insert_domain("example.com").await.expect("domain");
    let alice = fixtures
        .insert_account(domain, "alice@example.com", Some("Alice"))
        .await
        .expect("alice");
    let bob = fixtures
        .insert_account(domain, "bob@example.com", None)
        .await
        .expect("bob");
    (alice, bob)
}

#[tokio::test]
async fn accounts_resolve_case_insensitively() {
    let test_db = test_database!("account lookup test");
    let pool = test_db.pool_clone();
    let (alice, _) = seed(&pool).await;
    let store = PgMailStore::new(pool);

    let found = store.find_by_address("Alice@Example.COM").await.unwrap();
    assert_eq!(found, Some(alice));
    assert_eq!(store.find_by_address("nobody@example.com").await.unwrap(), None);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn inserts_are_isolated_per_account() {
    let test_db = test_database!("partition isolation test");
    let pool = test_db.pool_clone();
    let (alice, bob) = seed(&pool).await;
    let store = PgMailStore::new(pool);

    let first = message("<m1@x>", "a1", 0);
    store.insert(&alice, &first).await.unwrap();
    assert!(store.exists(alice.id, &first.email_hash).await.unwrap());
    assert!(!store.exists(bob.id, &first.email_hash).await.unwrap());

    // Same Message-ID in another mailbox is a separate row.
    store.insert(&bob, &first).await.unwrap();

    let again = store.insert(&alice, &first).await;
    assert!(matches!(again, Err(StoreError::DuplicateMessage { .. })));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn listing_pages_newest_first() {
    let test_db = test_database!("listing test");
    let pool = test_db.pool_clone();
    let (alice, _) = seed(&pool).await;
    let store = PgMailStore::new(pool);

    let mut ids = Vec::new();
    for n in 0..5 {
        let id = store
            .insert(&alice, &message(&format!("<m{n}@x>"), &format!("h{n}"), n))
            .await
            .unwrap();
        ids.push(id);
    }

    let page = store.list(alice.id, EmailType::Inbox, 1, 2).await.unwrap();
    assert_eq!(page.total, 5);
    let got: Vec<&str> = page.messages.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(got, vec!["<m4@x>", "<m3@x>"]);

    let last = store.list(alice.id, EmailType::Inbox, 3, 2).await.unwrap();
    assert_eq!(last.messages.len(), 1);
    assert!(matches!(
        store.list(alice.id, EmailType::Inbox, 4, 2).await,
        Err(StoreError::PageOutOfRange { page: 4, total: 5 })
    ));

    let empty = store.list(alice.id, EmailType::Sent, 1, 2).await.unwrap();
    assert_eq!(empty.total, 0);

    let since = store.list_since(alice.id, EmailType::Inbox, ids[2], 10).await.unwrap();
    let since_ids: Vec<i32> = since.iter().map(|m| m.id).collect();
    assert_eq!(since_ids, vec![ids[3], ids[4]]);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn moves_check_the_current_category() {
    let test_db = test_database!("move precondition test");
    let pool = test_db.pool_clone();
    let (alice, _) = seed(&pool).await;
    let store = PgMailStore::new(pool);

    let id = store.insert(&alice, &message("<m1@x>", "a1", 0)).await.unwrap();
    store
        .move_type(alice.id, id, EmailType::Inbox, EmailType::Trash)
        .await
        .unwrap();

    let stale = store
        .move_type(alice.id, id, EmailType::Inbox, EmailType::Deleted)
        .await;
    assert!(matches!(
        stale,
        Err(StoreError::PreconditionFailed {
            expected: EmailType::Inbox,
            actual: EmailType::Trash,
            ..
        })
    ));

    let missing = store
        .move_type(alice.id, id + 100, EmailType::Inbox, EmailType::Trash)
        .await;
    assert!(missing.unwrap_err().is_not_found());

    store.set_read(alice.id, id, true).await.unwrap();
    let row = store.get(alice.id, id).await.unwrap();
    assert!(row.is_read);
    assert_eq!(row.email_type, EmailType::Trash);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn message_id_updates_and_idempotent_delete() {
    let test_db = test_database!("message-id update test");
    let pool = test_db.pool_clone();
    let (alice, _) = seed(&pool).await;
    let store = PgMailStore::new(pool.clone());

    let id = store.insert(&alice, &message("<m1@x>", "a1", 0)).await.unwrap();

    store
        .move_by_message_id(alice.id, "<m1@x>", EmailType::Deleted)
        .await
        .unwrap();
    store
        .set_read_by_message_id(alice.id, "<m1@x>", true)
        .await
        .unwrap();
    store
        .update_file_name(alice.id, "<m1@x>", "1700000000.M1.mx")
        .await
        .unwrap();

    let row = store.get(alice.id, id).await.unwrap();
    assert_eq!(row.email_type, EmailType::Deleted);
    assert!(row.is_read);
    assert_eq!(row.file_name.as_deref(), Some("1700000000.M1.mx"));

    let unknown = store
        .set_read_by_message_id(alice.id, "<nope@x>", true)
        .await;
    assert!(unknown.unwrap_err().is_not_found());

    store.delete_by_message_id(alice.id, "<m1@x>").await.unwrap();
    store.delete_by_message_id(alice.id, "<m1@x>").await.unwrap();
    assert!(store.get(alice.id, id).await.unwrap_err().is_not_found());

    partition::drop_account_table(&pool, alice.id).await.unwrap();
    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn attachment_rows_are_deduplicated_by_hash() {
    let test_db = test_database!("attachment dedup test");
    let store = PgMailStore::new(test_db.pool_clone());

    let row = |hash: &str, code: &str| Attachment {
        file_hash: format!("{:0>64}", hash),
        file_name: "report.pdf".to_string(),
        file_type: "application/pdf".to_string(),
        file_size: 1024,
        source_key: "email/abc".to_string(),
        short_code: code.to_string(),
        download_url: format!("https://objects.test/{code}"),
        storage_path: format!("attachment/abc/{code}"),
        expire_time: Utc.with_ymd_and_hms(2025, 3, 7, 9, 0, 0).unwrap(),
    };

    let written = store
        .insert_batch(&[row("f1", "code1"), row("f2", "code2")])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let again = store
        .insert_batch(&[row("f1", "other"), row("f3", "code3")])
        .await
        .unwrap();
    assert_eq!(again, 1);

    let kept = store.find_by_hash(&format!("{:0>64}", "f1")).await.unwrap().unwrap();
    assert_eq!(kept.short_code, "code1");
    let by_code = store.find_by_short_code("code3").await.unwrap().unwrap();
    assert_eq!(by_code.file_hash, format!("{:0>64}", "f3"));
    assert!(store.find_by_short_code("other").await.unwrap().is_none());

    test_db.close().await.expect("failed to drop test database");
}
