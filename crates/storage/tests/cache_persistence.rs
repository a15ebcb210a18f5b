use chrono::Utc;
use shared::domain::{Message, MessageId, ReadState, UserId};
use storage::Storage;

#[tokio::test]
async fn cached_messages_and_credentials_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path()
            .join("cache.db")
            .to_string_lossy()
            .replace('\\', "/")
    );

    {
        let storage = Storage::new(&database_url).await.expect("open");
        storage
            .upsert_message(&Message {
                id: MessageId::from("m1"),
                sender_id: UserId::from("u1"),
                receiver_id: UserId::from("u2"),
                body: "persisted".into(),
                created_at: Utc::now(),
                read_state: ReadState::Sent,
            })
            .await
            .expect("message");
        storage
            .write_credential_entries(&[("refresh_token", Some("r1"))])
            .await
            .expect("credential");
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let messages = reopened
        .query_conversation(&UserId::from("u2"), &UserId::from("u1"))
        .await
        .expect("query");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "persisted");

    let entries = reopened.load_credential_entries().await.expect("entries");
    assert_eq!(entries.get("refresh_token").map(String::as_str), Some("r1"));
}

#[tokio::test]
async fn concurrent_writers_each_land_their_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut tasks = Vec::new();
    for i in 0..16_i64 {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            storage
                .upsert_message(&Message {
                    id: MessageId::new(format!("m{i}")),
                    sender_id: UserId::from(if i % 2 == 0 { "u1" } else { "u2" }),
                    receiver_id: UserId::from(if i % 2 == 0 { "u2" } else { "u1" }),
                    body: format!("body {i}"),
                    created_at: storage::datetime_from_millis(1_000 - i),
                    read_state: ReadState::Sent,
                })
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("upsert");
    }

    let messages = storage
        .query_conversation(&UserId::from("u1"), &UserId::from("u2"))
        .await
        .expect("query");
    assert_eq!(messages.len(), 16);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
}
