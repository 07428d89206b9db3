//! MongoDB implementation of the [`DocumentStore`] seam.
//!
//! Counters are persisted as `{ key, totalHits, resetTime }` documents, the
//! same wire format other stores for this middleware family use, so an
//! existing collection can be pointed at directly. Increment and decrement
//! map to a single `findOneAndUpdate` with `$inc`/`$set`/`$setOnInsert`
//! under `upsert: true` — the server-side atomic read-modify-write the whole
//! counter protocol leans on.

use async_trait::async_trait;
use mongodb::bson::{doc, DateTime, Document, Regex};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::{CounterRecord, DocumentStore, KeyScope, Mutation, UpsertOptions};

/// Database selected when none is configured.
pub const DEFAULT_DATABASE: &str = "rateLimit";
/// Collection selected when none is configured.
pub const DEFAULT_COLLECTION: &str = "rateLimit";

/// Connection settings for [`MongoDocumentStore`].
#[derive(Debug, Clone)]
pub struct MongoStoreOptions {
    /// MongoDB connection string.
    pub uri: String,
    /// Pre-built client options; when set they are passed to the driver
    /// verbatim and the URI is not parsed again.
    pub client_options: Option<ClientOptions>,
    pub database_name: String,
    pub collection_name: String,
}

impl MongoStoreOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client_options: None,
            database_name: DEFAULT_DATABASE.to_string(),
            collection_name: DEFAULT_COLLECTION.to_string(),
        }
    }
}

/// On-disk shape of a counter. `reset_time` is a BSON datetime so the
/// server's TTL monitor can sweep expired records.
#[derive(Debug, Serialize, Deserialize)]
struct CounterDocument {
    key: String,
    #[serde(rename = "totalHits")]
    total_hits: i64,
    #[serde(rename = "resetTime")]
    reset_time: DateTime,
}

impl From<CounterDocument> for CounterRecord {
    fn from(doc: CounterDocument) -> Self {
        Self { key: doc.key, total_hits: doc.total_hits, reset_time: doc.reset_time.to_system_time() }
    }
}

/// [`DocumentStore`] backed by a MongoDB collection.
#[derive(Clone)]
pub struct MongoDocumentStore {
    client: Client,
    database: Database,
    collection: Collection<CounterDocument>,
}

impl std::fmt::Debug for MongoDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoDocumentStore")
            .field("database", &self.database.name())
            .field("collection", &self.collection.name())
            .finish()
    }
}

impl MongoDocumentStore {
    /// Build the driver client and select the target collection.
    ///
    /// The driver connects lazily; [`DocumentStore::connect`] performs the
    /// awaitable round-trip that proves the deployment is reachable.
    pub async fn new(options: MongoStoreOptions) -> Result<Self, mongodb::error::Error> {
        let client_options = match options.client_options {
            Some(client_options) => client_options,
            None => ClientOptions::parse(&options.uri).await?,
        };
        let client = Client::with_options(client_options)?;
        let database = client.database(&options.database_name);
        let collection = database.collection::<CounterDocument>(&options.collection_name);
        Ok(Self { client, database, collection })
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    type Error = mongodb::error::Error;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.database.run_command(doc! { "ping": 1 }).await?;
        tracing::debug!(
            database = self.database.name(),
            collection = self.collection.name(),
            "mongodb deployment reachable"
        );
        Ok(())
    }

    async fn close(&self, force: bool) -> Result<(), Self::Error> {
        let client = self.client.clone();
        if force {
            client.shutdown().immediate(true).await;
        } else {
            client.shutdown().await;
        }
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<CounterRecord>, Self::Error> {
        let found = self.collection.find_one(doc! { "key": key }).await?;
        Ok(found.map(CounterRecord::from))
    }

    async fn upsert_by_key(
        &self,
        key: &str,
        mutation: Mutation,
        options: UpsertOptions,
    ) -> Result<Option<CounterRecord>, Self::Error> {
        // Clear must never insert: an upserted clear would materialize a
        // record without a resetTime for the TTL monitor to sweep.
        let create = options.create_if_absent && !matches!(mutation, Mutation::Clear);
        let mut action = self
            .collection
            .find_one_and_update(doc! { "key": key }, mutation_update(key, mutation))
            .upsert(create);
        if options.return_post_image {
            action = action.return_document(ReturnDocument::After);
        }
        let updated = action.await?;
        Ok(updated.filter(|_| options.return_post_image).map(CounterRecord::from))
    }

    async fn update_all_matching(
        &self,
        scope: KeyScope,
        mutation: Mutation,
    ) -> Result<u64, Self::Error> {
        let result = self
            .collection
            .update_many(scope_filter(&scope), mutation_update_bulk(mutation))
            .await?;
        Ok(result.modified_count)
    }

    async fn ensure_expiry_index(&self, field: &str, after: Duration) -> Result<(), Self::Error> {
        let mut keys = Document::new();
        keys.insert(field, 1i32);
        let index = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().expire_after(after).build())
            .build();
        self.collection.create_index(index).await?;
        tracing::debug!(field, after_secs = after.as_secs(), "ttl index ensured");
        Ok(())
    }
}

/// Update document for a single-key upsert.
///
/// `$inc` works on both branches of `upsert: true`: on an existing record it
/// adds the delta, on insert it materializes `totalHits` at the delta itself,
/// which is exactly the create-at-1 / create-at-minus-1 semantics the engine
/// needs without a preceding existence check.
fn mutation_update(key: &str, mutation: Mutation) -> Document {
    match mutation {
        Mutation::Bump { delta, reset_time } => doc! {
            "$inc": { "totalHits": delta },
            "$set": { "resetTime": DateTime::from_system_time(reset_time) },
            "$setOnInsert": { "key": key },
        },
        Mutation::Clear => doc! { "$set": { "totalHits": 0i64 } },
    }
}

/// Update document for a bulk mutation (no insert branch, so no key to pin).
fn mutation_update_bulk(mutation: Mutation) -> Document {
    match mutation {
        Mutation::Bump { delta, reset_time } => doc! {
            "$inc": { "totalHits": delta },
            "$set": { "resetTime": DateTime::from_system_time(reset_time) },
        },
        Mutation::Clear => doc! { "$set": { "totalHits": 0i64 } },
    }
}

fn scope_filter(scope: &KeyScope) -> Document {
    match scope {
        KeyScope::All => Document::new(),
        KeyScope::Prefix(prefix) => doc! {
            "key": Regex { pattern: format!("^{}", regex_escape(prefix)), options: String::new() },
        },
    }
}

/// Escape regex metacharacters so a literal prefix anchors safely.
fn regex_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(
            c,
            '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' | '/'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
