use mail_import::error::ErrorPolicy;
use mail_import::import::{ImportOptions, Importer, MailboxState};
use mail_import::mailbox::MboxSource;
use mail_import::models::{Address, EnvelopeFields, PartFields, Role};
use mail_import::store::{EnvelopeInsert, MailStore, PgMailStore, StoreSession};
use mail_import::test_support::{TestDatabase, TestDatabaseError};

async fn test_database(test_name: &str) -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping {}: container runtime unavailable: {}", test_name, err);
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

async fn count(db: &TestDatabase, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(db.pool())
        .await
        .expect("count query")
}

#[tokio::test]
async fn conflicts_do_not_abort_the_session_transaction() {
    let Some(db) = test_database("conflicts_do_not_abort_the_session_transaction").await else {
        return;
    };
    let store = PgMailStore::new(db.pool_clone(), false);
    let policy = ErrorPolicy::new(["23505"]);
    let mut session = store.session().await.expect("session");

    let alice = Address::new("alice@example.com", "Alice");
    let first = session.insert_or_get_subscriber(&policy, &alice).await.unwrap();
    let second = session.insert_or_get_subscriber(&policy, &alice).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);

    let fields = EnvelopeFields {
        message_id: Some("<pg@example.com>".to_string()),
        subject: Some("nul\0byte".to_string()),
        ..Default::default()
    };
    let EnvelopeInsert::Inserted(envelope_id) = session
        .insert_or_get_envelope(&policy, &fields, false)
        .await
        .unwrap()
    else {
        panic!("expected a new envelope");
    };
    assert!(matches!(
        session.insert_or_get_envelope(&policy, &fields, false).await.unwrap(),
        EnvelopeInsert::Conflict(_)
    ));
    assert!(matches!(
        session.insert_or_get_envelope(&policy, &fields, true).await.unwrap(),
        EnvelopeInsert::Reused(id) if id == envelope_id
    ));

    session
        .insert_envelope_subscriber(envelope_id, first.unwrap(), Role::From)
        .await
        .unwrap();
    let part_id = session
        .insert_part(&PartFields {
            content_type: Some("text/plain".to_string()),
            decoded_content: Some("hello".to_string()),
            raw_content: Some(b"hello".to_vec()),
            ..Default::default()
        })
        .await
        .unwrap();
    session
        .insert_part_edge(envelope_id, part_id, envelope_id)
        .await
        .unwrap();
    session.commit().await.unwrap();
    drop(session);

    assert_eq!(count(&db, "subscriber").await, 1);
    assert_eq!(count(&db, "envelope").await, 1);
    assert_eq!(count(&db, "envelope_part").await, 1);

    let subject: Option<String> = sqlx::query_scalar("SELECT subject FROM envelope")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(subject.as_deref(), Some("nulbyte"));

    let length: i32 = sqlx::query_scalar("SELECT content_length FROM part")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(length, 5);

    let role: String = sqlx::query_scalar("SELECT role FROM envelope_subscriber")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(role, "From");

    store.truncate_all().await.unwrap();
    assert_eq!(count(&db, "envelope").await, 0);
}

#[tokio::test]
async fn uncommitted_writes_are_discarded() {
    let Some(db) = test_database("uncommitted_writes_are_discarded").await else {
        return;
    };
    let store = PgMailStore::new(db.pool_clone(), false);
    let mut session = store.session().await.expect("session");
    session
        .insert_part(&PartFields {
            content_type: Some("text/plain".to_string()),
            decoded_content: Some("ghost".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    drop(session);

    assert_eq!(count(&db, "part").await, 0);
}

#[tokio::test]
async fn identity_rows_are_shared_before_commit() {
    let Some(db) = test_database("identity_rows_are_shared_before_commit").await else {
        return;
    };
    let store = PgMailStore::new(db.pool_clone(), false);
    let policy = ErrorPolicy::new(["23505"]);
    let mut writer = store.session().await.expect("writer session");
    let mut reader = store.session().await.expect("reader session");

    let alice = Address::new("alice@example.com", "Alice");
    let alice_id = writer.insert_subscriber(&alice).await.unwrap();
    let fields = EnvelopeFields {
        message_id: Some("<shared@example.com>".to_string()),
        ..Default::default()
    };
    let envelope_id = writer.insert_envelope(&fields).await.unwrap();

    assert_eq!(reader.lookup_subscriber(&alice).await.unwrap(), Some(alice_id));
    assert_eq!(
        reader
            .lookup_envelope_by_message_id("<shared@example.com>")
            .await
            .unwrap(),
        Some(envelope_id)
    );
    let nobody = Address::new("nobody@example.com", "");
    assert_eq!(reader.lookup_subscriber(&nobody).await.unwrap(), None);

    // A failed identity insert leaves the writer's transaction usable.
    assert!(writer.insert_subscriber(&alice).await.is_err());
    assert!(matches!(
        writer.insert_or_get_envelope(&policy, &fields, true).await.unwrap(),
        EnvelopeInsert::Reused(id) if id == envelope_id
    ));
    writer
        .insert_envelope_subscriber(envelope_id, alice_id, Role::From)
        .await
        .unwrap();
    writer.commit().await.unwrap();
    drop(writer);
    drop(reader);

    assert_eq!(count(&db, "subscriber").await, 1);
    assert_eq!(count(&db, "envelope_subscriber").await, 1);
}

#[tokio::test]
async fn crossed_subscriber_inserts_from_two_sessions_both_succeed() {
    let Some(db) = test_database("crossed_subscriber_inserts_from_two_sessions_both_succeed").await
    else {
        return;
    };
    let store = PgMailStore::new(db.pool_clone(), false);
    let policy = ErrorPolicy::new(["23505"]);
    let mut first = store.session().await.expect("first session");
    let mut second = store.session().await.expect("second session");

    let alice = Address::new("alice@example.com", "Alice");
    let bob = Address::new("bob@example.com", "Bob");
    let alice_id = first.insert_or_get_subscriber(&policy, &alice).await.unwrap();
    let bob_id = second.insert_or_get_subscriber(&policy, &bob).await.unwrap();

    let (first_bob, second_alice) = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        tokio::join!(
            first.insert_or_get_subscriber(&policy, &bob),
            second.insert_or_get_subscriber(&policy, &alice),
        )
    })
    .await
    .expect("crossed inserts must not block each other");

    assert_eq!(first_bob.unwrap(), bob_id);
    assert_eq!(second_alice.unwrap(), alice_id);
    first.commit().await.unwrap();
    second.commit().await.unwrap();
    drop(first);
    drop(second);

    assert_eq!(count(&db, "subscriber").await, 2);
}

#[tokio::test]
async fn autocommit_writes_are_visible_immediately() {
    let Some(db) = test_database("autocommit_writes_are_visible_immediately").await else {
        return;
    };
    let store = PgMailStore::new(db.pool_clone(), true);
    let mut session = store.session().await.expect("session");
    session
        .insert_subscriber(&Address::new("auto@example.com", ""))
        .await
        .unwrap();

    assert_eq!(count(&db, "subscriber").await, 1);
}

#[tokio::test]
async fn imports_mbox_into_postgres() {
    let Some(db) = test_database("imports_mbox_into_postgres").await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let mbox = concat!(
        "From archive@example.com Mon Jan  1 00:00:00 2024\n",
        "From: Alice <alice@example.com>\n",
        "To: list@example.com\n",
        "Subject: first\n",
        "Message-ID: <first@example.com>\n",
        "Date: Mon, 1 Jan 2024 10:00:00 +0000\n",
        "\n",
        "hello\n",
        "\n",
        "From archive@example.com Mon Jan  1 00:00:01 2024\n",
        "From: Alice <alice@example.com>\n",
        "To: list@example.com\n",
        "Subject: second\n",
        "Message-ID: <second@example.com>\n",
        "\n",
        "again\n",
    );
    std::fs::write(dir.path().join("inbox"), mbox).unwrap();

    let options = ImportOptions {
        max_concurrent_mailboxes: 2,
        max_part_depth: 64,
        policy: ErrorPolicy::new(["23505"]),
    };
    let importer = Importer::new(
        MboxSource::new(dir.path()),
        PgMailStore::new(db.pool_clone(), false),
        options,
    );
    let summary = importer.run(&["inbox".to_string()]).await;

    let report = summary.report("inbox").unwrap();
    assert_eq!(report.state, MailboxState::Done);
    assert_eq!(report.stats.messages, 2);
    assert_eq!(count(&db, "envelope").await, 2);
    assert_eq!(count(&db, "subscriber").await, 2);
    assert_eq!(count(&db, "envelope_subscriber").await, 4);
    assert_eq!(count(&db, "part").await, 2);
}

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let Some(db) = test_database("migrations_apply_and_revert_cleanly").await else {
        return;
    };
    let migrator = sqlx::migrate!("./migrations");
    let pool = db.pool_clone();

    migrator.undo(&pool, 0).await.expect("migrations revert");
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'envelope'",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");
    assert_eq!(tables, 0, "envelope should be dropped after revert");

    migrator.run(&pool).await.expect("migrations rerun");
    assert_eq!(count(&db, "envelope").await, 0);
}
