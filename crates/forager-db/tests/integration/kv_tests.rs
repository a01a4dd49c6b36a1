use std::time::Duration;

use forager_core::store::KvStore;
use forager_db::PgKvStore;

use crate::common::setup_test_db;

#[tokio::test]
async fn put_get_roundtrip() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    store.put("k", "v", None).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

    store.put("k", "v2", None).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
}

#[tokio::test]
async fn expired_entry_reads_as_absent() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    store
        .put("k", "v", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn put_if_absent_is_first_writer_wins() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    assert!(
        store
            .put_if_absent("lock:x", "a", Duration::from_secs(60))
            .await
            .unwrap()
    );
    assert!(
        !store
            .put_if_absent("lock:x", "b", Duration::from_secs(60))
            .await
            .unwrap()
    );
    assert_eq!(store.get("lock:x").await.unwrap(), Some("a".to_string()));
}

#[tokio::test]
async fn put_if_absent_overwrites_expired_entry() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    assert!(
        store
            .put_if_absent("lock:x", "a", Duration::from_millis(50))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        store
            .put_if_absent("lock:x", "b", Duration::from_secs(60))
            .await
            .unwrap()
    );
    assert_eq!(store.get("lock:x").await.unwrap(), Some("b".to_string()));
}

#[tokio::test]
async fn compare_and_delete_requires_matching_value() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    store.put("lock:x", "token-a", None).await.unwrap();
    assert!(!store.compare_and_delete("lock:x", "token-b").await.unwrap());
    assert!(store.compare_and_delete("lock:x", "token-a").await.unwrap());
    assert_eq!(store.get("lock:x").await.unwrap(), None);
}

#[tokio::test]
async fn incr_counts_up_and_respects_ttl() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    assert_eq!(store.incr("c", None).await.unwrap(), 1);
    assert_eq!(store.incr("c", None).await.unwrap(), 2);

    assert_eq!(
        store.incr("t", Some(Duration::from_millis(50))).await.unwrap(),
        1
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Counter restarts after its TTL lapses.
    assert_eq!(
        store.incr("t", Some(Duration::from_millis(50))).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn concurrent_incrs_never_lose_updates() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let store = store.clone();
        tasks.spawn(async move { store.incr("shared", None).await.unwrap() });
    }
    let mut seen = Vec::new();
    while let Some(v) = tasks.join_next().await {
        seen.push(v.unwrap());
    }

    seen.sort_unstable();
    let expected: Vec<i64> = (1..=20).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn concurrent_put_if_absent_has_single_winner() {
    let (pool, _container) = setup_test_db().await;
    let store = PgKvStore::new(pool);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let store = store.clone();
        tasks.spawn(async move {
            store
                .put_if_absent("lock:contested", &format!("owner-{i}"), Duration::from_secs(60))
                .await
                .unwrap()
        });
    }
    let mut winners = 0;
    while let Some(won) = tasks.join_next().await {
        if won.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
