//! Integration tests against a live MongoDB deployment.
//!
//! Ignored by default; run with a reachable deployment:
//!
//! ```sh
//! MONGO_URI=mongodb://localhost:27017 cargo test -- --ignored
//! ```

use rate_limit_mongo::{CounterStore, MongoDocumentStore, MongoStoreOptions};
use std::time::{Duration, SystemTime};

fn mongo_uri() -> String {
    std::env::var("MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

async fn live_store(collection: &str) -> CounterStore<MongoDocumentStore> {
    let mut options = MongoStoreOptions::new(mongo_uri());
    options.database_name = "rateLimitTest".to_string();
    options.collection_name = collection.to_string();
    let backend = MongoDocumentStore::new(options).await.expect("client");

    let store = CounterStore::builder(backend).local_keys(true).build();
    store.init(Duration::from_secs(30)).await.expect("init");
    store.reset_all().await.expect("clean slate");
    store
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn counter_protocol_round_trip() {
    let store = live_store("roundTrip").await;
    let key = format!(
        "it-{}",
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos()
    );

    assert!(store.get(&key).await.expect("get").is_none());

    let first = store.increment(&key).await.expect("increment");
    assert_eq!(first.total_hits, 1);
    let expected = SystemTime::now() + Duration::from_secs(30);
    let drift = match first.reset_time.duration_since(expected) {
        Ok(ahead) => ahead,
        Err(e) => e.duration(),
    };
    assert!(drift < Duration::from_secs(2), "reset_time drift {:?}", drift);

    let second = store.increment(&key).await.expect("increment");
    assert_eq!(second.total_hits, 2);
    assert!(second.reset_time >= first.reset_time);

    store.decrement(&key).await.expect("decrement");
    assert_eq!(store.get(&key).await.unwrap().unwrap().total_hits, 1);

    store.reset_key(&key).await.expect("reset");
    assert_eq!(store.get(&key).await.unwrap().unwrap().total_hits, 0);

    store.close(false).await.expect("close");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn concurrent_increments_commit_atomically() {
    let store = std::sync::Arc::new(live_store("contention").await);
    let key = "hot";

    let mut handles = vec![];
    for _ in 0..20 {
        let store = std::sync::Arc::clone(&store);
        handles.push(tokio::spawn(async move { store.increment(key).await }));
    }
    for result in futures::future::join_all(handles).await {
        result.expect("task").expect("increment");
    }

    assert_eq!(store.get(key).await.unwrap().unwrap().total_hits, 20);
    store.close(false).await.expect("close");
}
