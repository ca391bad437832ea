use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use site_order_core::{
    Collection, OrderError, OrderReport, OrderedRecord, RankAssignment, RecordId,
};
use site_order_store_sqlite::SqliteStore;
pub use site_order_store_sqlite::{IntegrityReport, SchemaStatus};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const IDS_REQUIRED_MESSAGE: &str = "ids array is required";
pub const BOTH_IDS_REQUIRED_MESSAGE: &str = "Both id1 and id2 are required";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReindexRequest {
    pub ids: Vec<RecordId>,
}

impl ReindexRequest {
    /// Shape-check a raw `{ "ids": [...] }` body.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] when `ids` is absent or not an array,
    /// or when any element is not a non-zero integer.
    pub fn from_json(body: &Value) -> Result<Self, OrderError> {
        let Some(raw_ids) = body.get("ids").and_then(Value::as_array) else {
            return Err(OrderError::InvalidRequest(IDS_REQUIRED_MESSAGE.to_string()));
        };

        let ids = raw_ids
            .iter()
            .map(|value| {
                RecordId::from_json(value).ok_or_else(|| {
                    OrderError::InvalidRequest(format!(
                        "ids MUST contain only non-zero integer ids; got {value}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { ids })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapRequest {
    pub id1: RecordId,
    pub id2: RecordId,
}

impl SwapRequest {
    /// Shape-check a raw `{ "id1": n, "id2": n }` body. `0`, `null`, absent and
    /// non-integer values all count as missing.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] when either id is missing.
    pub fn from_json(body: &Value) -> Result<Self, OrderError> {
        let id1 = body.get("id1").and_then(RecordId::from_json);
        let id2 = body.get("id2").and_then(RecordId::from_json);
        match (id1, id2) {
            (Some(id1), Some(id2)) => Ok(Self { id1, id2 }),
            _ => Err(OrderError::InvalidRequest(BOTH_IDS_REQUIRED_MESSAGE.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRecordRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorderOutcome {
    pub collection: Collection,
    pub changed: Vec<RankAssignment>,
}

/// Recover the domain error carried by an api error, if any.
#[must_use]
pub fn order_error(err: &anyhow::Error) -> Option<&OrderError> {
    err.downcast_ref::<OrderError>()
}

#[derive(Debug, Clone)]
pub struct SiteOrderApi {
    db_path: PathBuf,
}

impl SiteOrderApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Append a record to the end of `collection`.
    ///
    /// # Errors
    /// Returns an error when the title is invalid or persistence fails.
    pub fn create_record(
        &self,
        collection: Collection,
        input: &CreateRecordRequest,
    ) -> Result<OrderedRecord> {
        let mut store = self.open_migrated_store()?;
        store.create_record(collection, &input.title)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_records(&self, collection: Collection) -> Result<Vec<OrderedRecord>> {
        let store = self.open_migrated_store()?;
        store.list_records(collection)
    }

    /// Delete one record, leaving a rank gap behind. Returns `false` when no such
    /// record exists.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&self, collection: Collection, id: RecordId) -> Result<bool> {
        let mut store = self.open_migrated_store()?;
        store.delete_record(collection, id)
    }

    /// Renumber `collection` from the supplied full permutation of its ids.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] (inside the `anyhow` error) when the
    /// ids are not exactly the collection's membership; any other error is a
    /// persistence failure.
    pub fn reindex(&self, collection: Collection, input: &ReindexRequest) -> Result<ReorderOutcome> {
        let mut store = self.open_migrated_store()?;
        let changed = store.reindex(collection, &input.ids)?;
        Ok(ReorderOutcome { collection, changed })
    }

    /// Exchange the ranks of two records.
    ///
    /// # Errors
    /// Returns an error when either record is absent or persistence fails.
    pub fn swap(&self, collection: Collection, input: SwapRequest) -> Result<ReorderOutcome> {
        let mut store = self.open_migrated_store()?;
        let changed = store.swap_ranks(collection, input.id1, input.id2)?;
        Ok(ReorderOutcome { collection, changed })
    }

    /// # Errors
    /// Returns an error when reading or writing ranks fails.
    pub fn compact(&self, collection: Collection) -> Result<ReorderOutcome> {
        let mut store = self.open_migrated_store()?;
        let changed = store.compact(collection)?;
        Ok(ReorderOutcome { collection, changed })
    }

    /// # Errors
    /// Returns an error when ranks cannot be read.
    pub fn order_report(&self, collection: Collection) -> Result<OrderReport> {
        let store = self.open_migrated_store()?;
        store.order_report(collection)
    }

    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}
