//! Runs against a live Postgres. Point `DATABASE_URL` at a scratch database and run
//! with `cargo test -p carlot-storage -- --ignored`.

use std::sync::Arc;

use carlot_core::ListingQuery;
use carlot_storage::{
    CursorQueryEngine, ListingStore, PgListingStore, QueryConfig, UpsertOutcome, UpsertRow,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

async fn store() -> PgListingStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgListingStore::connect(&url, 8)
        .await
        .expect("failed to connect to Postgres");
    store.migrate().await.expect("failed to migrate");
    store
}

fn seen_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().unwrap()
}

/// Rows tagged with a per-test brand so runs against a shared database stay apart.
fn row(brand: &str, n: u32, price: i64, seen_at: DateTime<Utc>) -> UpsertRow {
    let source_key = format!("https://www.carsensor.net/usedcar/detail/{brand}-{n}/index.html");
    UpsertRow {
        source_key: source_key.clone(),
        brand: brand.to_string(),
        model: "Note".into(),
        year: 2020,
        price,
        color: "Blue".into(),
        link: source_key,
        content_hash: format!("hash-{price}"),
        seen_at,
    }
}

fn unique_brand() -> String {
    format!("Nissan{}", Uuid::new_v4().simple())
}

fn by_brand(brand: &str) -> ListingQuery {
    ListingQuery {
        brand: Some(brand.to_string()),
        ..ListingQuery::all()
    }
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn insert_heartbeat_and_update_one_listing() {
    let store = store().await;
    let brand = unique_brand();
    let first = row(&brand, 1, 1_200_000, seen_at());

    let inserted = store.upsert(&first).await.unwrap();
    let UpsertOutcome::Inserted { id } = inserted else {
        panic!("expected an insert, got {inserted:?}");
    };

    let later = seen_at() + Duration::hours(1);
    let again = UpsertRow { seen_at: later, ..first.clone() };
    assert_eq!(store.upsert(&again).await.unwrap(), UpsertOutcome::Heartbeat { id });

    let stored = store.find_by_source_key(&first.source_key).await.unwrap().unwrap();
    assert_eq!(stored.first_seen_at, seen_at());
    assert_eq!(stored.last_seen_at, later);
    assert_eq!(stored.price, 1_200_000);

    let cheaper = row(&brand, 1, 1_100_000, later + Duration::hours(1));
    assert_eq!(store.upsert(&cheaper).await.unwrap(), UpsertOutcome::Updated { id });

    let stored = store.find_by_source_key(&first.source_key).await.unwrap().unwrap();
    assert_eq!(stored.id, id);
    assert_eq!(stored.price, 1_100_000);
    assert_eq!(stored.content_hash, cheaper.content_hash);
    assert_eq!(stored.first_seen_at, seen_at());
    assert_eq!(store.count(&by_brand(&brand)).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn stale_sighting_does_not_move_last_seen_backwards() {
    let store = store().await;
    let brand = unique_brand();
    let fresh = row(&brand, 1, 900_000, seen_at() + Duration::hours(2));
    store.upsert(&fresh).await.unwrap();

    let stale = UpsertRow { seen_at: seen_at(), ..fresh.clone() };
    store.upsert(&stale).await.unwrap();

    let stored = store.find_by_source_key(&fresh.source_key).await.unwrap().unwrap();
    assert_eq!(stored.last_seen_at, fresh.seen_at);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn concurrent_upserts_of_one_key_create_one_row() {
    let store = Arc::new(store().await);
    let brand = unique_brand();
    let shared = row(&brand, 1, 750_000, seen_at());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let row = shared.clone();
        handles.push(tokio::spawn(async move { store.upsert(&row).await }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let inserts = outcomes
        .iter()
        .filter(|o| matches!(o, UpsertOutcome::Inserted { .. }))
        .count();
    assert_eq!(inserts, 1);
    let id = outcomes[0].id();
    assert!(outcomes.iter().all(|o| o.id() == id));
    assert_eq!(store.count(&by_brand(&brand)).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn paging_twice_with_an_unchanged_reingest_in_between() {
    let store = Arc::new(store().await);
    let brand = unique_brand();
    let mut ids = Vec::new();
    for n in 1..=3 {
        let outcome = store.upsert(&row(&brand, n, 500_000, seen_at())).await.unwrap();
        ids.push(outcome.id());
    }
    let engine = CursorQueryEngine::new(store.clone(), QueryConfig::default());
    let query = by_brand(&brand);

    let first = engine.page(&query, None, Some(2)).await.unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(
        first.items.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ids[2], ids[1]]
    );
    let cursor = first.next_cursor.expect("full page carries a cursor");

    // Re-ingesting an already-served listing unchanged must not reshuffle the pages.
    let heartbeat = row(&brand, 2, 500_000, seen_at() + Duration::hours(1));
    assert_eq!(
        store.upsert(&heartbeat).await.unwrap(),
        UpsertOutcome::Heartbeat { id: ids[1] }
    );

    let second = engine.page(&query, Some(cursor), Some(2)).await.unwrap();
    assert_eq!(second.items.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[0]]);
    assert_eq!(second.next_cursor, None);
    assert_eq!(second.total, 3);
}
