//! PostgreSQL integration tests using testcontainers.
//!
//! They require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

use chunkdrive_core::AppError;
use chunkdrive_db::{MetadataStore, PgMetadataStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::task::JoinSet;

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

struct TestDb {
    store: Arc<PgMetadataStore>,
    _container: ContainerAsync<Postgres>,
}

/// Start a migrated database, or `None` when Docker is unavailable.
async fn postgres_or_skip(quota: u64) -> Option<TestDb> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    let container = match Postgres::default().with_tag("16-alpine").start().await {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping PostgreSQL test (Docker unavailable): {e}");
            return None;
        }
    };

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(TestDb {
        store: Arc::new(PgMetadataStore::new(pool, quota)),
        _container: container,
    })
}

async fn count(store: &PgMetadataStore, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(store.pool())
        .await
        .expect("count query failed")
}

#[tokio::test]
async fn test_concurrent_blob_inserts_record_one_row() {
    let Some(db) = postgres_or_skip(1024).await else {
        return;
    };

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let store = db.store.clone();
        tasks.spawn(async move { store.insert_blob_if_absent(HASH_A, 42).await });
    }
    let mut inserted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().unwrap() {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(db.store.find_blob(HASH_A).await.unwrap().unwrap().size, 42);
    assert_eq!(count(&db.store, "SELECT COUNT(*) FROM blobs").await, 1);
}

#[tokio::test]
async fn test_each_owner_charged_in_full_for_shared_blob() {
    let Some(db) = postgres_or_skip(1024).await else {
        return;
    };

    db.store.commit_file(1, HASH_A, 300, "a.bin").await.unwrap();
    db.store.commit_file(2, HASH_A, 300, "copy.bin").await.unwrap();

    assert_eq!(db.store.quota(1).await.unwrap().used_bytes, 300);
    assert_eq!(db.store.quota(2).await.unwrap().used_bytes, 300);
    assert!(db.store.owner_has_blob(2, HASH_A).await.unwrap());
    assert_eq!(count(&db.store, "SELECT COUNT(*) FROM blobs").await, 1);
    assert_eq!(count(&db.store, "SELECT COUNT(*) FROM files").await, 2);
}

#[tokio::test]
async fn test_over_quota_commit_leaves_nothing_behind() {
    let Some(db) = postgres_or_skip(100).await else {
        return;
    };

    db.store.commit_file(1, HASH_A, 60, "first.bin").await.unwrap();
    let err = db
        .store
        .commit_file(1, HASH_B, 50, "second.bin")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::QuotaExceeded {
            used: 60,
            requested: 50,
            limit: 100
        }
    ));

    assert!(db.store.find_blob(HASH_B).await.unwrap().is_none());
    assert_eq!(db.store.list_files(1).await.unwrap().len(), 1);
    assert_eq!(db.store.quota(1).await.unwrap().used_bytes, 60);
}

#[tokio::test]
async fn test_concurrent_commits_never_overdraw_quota() {
    let Some(db) = postgres_or_skip(100).await else {
        return;
    };

    let mut tasks = JoinSet::new();
    for i in 0..5 {
        let store = db.store.clone();
        tasks.spawn(async move {
            store
                .commit_file(9, HASH_A, 30, &format!("part-{i}.bin"))
                .await
        });
    }
    let mut committed = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => committed += 1,
            Err(AppError::QuotaExceeded { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(committed, 3);
    assert_eq!(rejected, 2);
    assert_eq!(db.store.quota(9).await.unwrap().used_bytes, 90);
}
