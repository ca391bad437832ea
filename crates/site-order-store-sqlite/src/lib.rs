use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use site_order_core::{
    normalize_title, Collection, OrderError, OrderReport, OrderedRecord, Rank, RankAssignment,
    RankTable, RecordId,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS partners (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  display_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS missions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  display_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hero_slides (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  display_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  display_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS social_links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  display_order INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_partners_display_order ON partners(display_order);
CREATE INDEX IF NOT EXISTS idx_missions_display_order ON missions(display_order);
CREATE INDEX IF NOT EXISTS idx_hero_slides_display_order ON hero_slides(display_order);
CREATE INDEX IF NOT EXISTS idx_products_display_order ON products(display_order);
CREATE INDEX IF NOT EXISTS idx_social_links_display_order ON social_links(display_order);
";

// Run after every collection has been compacted; v1 allowed duplicate ranks.
const MIGRATION_002_UNIQUE_ORDER_SQL: &str = r"
DROP INDEX IF EXISTS idx_partners_display_order;
DROP INDEX IF EXISTS idx_missions_display_order;
DROP INDEX IF EXISTS idx_hero_slides_display_order;
DROP INDEX IF EXISTS idx_products_display_order;
DROP INDEX IF EXISTS idx_social_links_display_order;

CREATE UNIQUE INDEX IF NOT EXISTS uq_partners_display_order ON partners(display_order);
CREATE UNIQUE INDEX IF NOT EXISTS uq_missions_display_order ON missions(display_order);
CREATE UNIQUE INDEX IF NOT EXISTS uq_hero_slides_display_order ON hero_slides(display_order);
CREATE UNIQUE INDEX IF NOT EXISTS uq_products_display_order ON products(display_order);
CREATE UNIQUE INDEX IF NOT EXISTS uq_social_links_display_order ON social_links(display_order);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: Collection,
    pub order: OrderReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub collections: Vec<CollectionReport>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed order store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "partners")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if index_exists(&self.conn, "uq_partners_display_order")? {
            // Tables already carry unique order indexes but the migration rows are missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        for collection in Collection::ALL {
            let mut ranks = load_rank_table(&tx, collection)?;
            let changed = ranks.compact();
            if !changed.is_empty() {
                tracing::info!(
                    "Compacted {} {} ranks before enforcing unique display order",
                    changed.len(),
                    collection.label()
                );
            }
            write_assignments(&tx, collection, &changed)?;
        }

        tx.execute_batch(MIGRATION_002_UNIQUE_ORDER_SQL)
            .context("failed to create unique display order indexes")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Append a record to the end of `collection`.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] for a blank or oversized title, or an
    /// error when the insert fails.
    pub fn create_record(&mut self, collection: Collection, title: &str) -> Result<OrderedRecord> {
        let title = normalize_title(title)?;
        let created_at = OffsetDateTime::now_utc();
        let table = collection.table();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start create transaction")?;

        let next_rank: i64 = tx
            .query_row(
                &format!("SELECT COALESCE(MAX(display_order) + 1, 0) FROM {table}"),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to compute next display order for {table}"))?;
        let rank = decode_rank(next_rank)?;

        tx.execute(
            &format!("INSERT INTO {table}(title, display_order, created_at) VALUES (?1, ?2, ?3)"),
            params![title, next_rank, rfc3339(created_at)?],
        )
        .with_context(|| format!("failed to insert {table} record"))?;
        let id = decode_id(tx.last_insert_rowid())?;

        tx.commit().context("failed to commit create transaction")?;
        Ok(OrderedRecord { id, title, rank, created_at })
    }

    /// List records of `collection` in presentation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_records(&self, collection: Collection) -> Result<Vec<OrderedRecord>> {
        let table = collection.table();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, title, display_order, created_at
             FROM {table}
             ORDER BY display_order ASC, id ASC"
        ))?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_record(row)?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_record(&self, collection: Collection, id: RecordId) -> Result<Option<OrderedRecord>> {
        let table = collection.table();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, title, display_order, created_at FROM {table} WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.get()])?;
        let record = rows.next()?.map(decode_record).transpose()?;
        Ok(record)
    }

    /// Remove one record. Remaining ranks are left as they are; see [`Self::compact`].
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_record(&mut self, collection: Collection, id: RecordId) -> Result<bool> {
        let table = collection.table();
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id.get()])
            .with_context(|| format!("failed to delete {table} record {id}"))?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when ranks cannot be read or decoded.
    pub fn rank_table(&self, collection: Collection) -> Result<RankTable> {
        load_rank_table(&self.conn, collection)
    }

    /// Assign rank `i` to `ids[i]` in one immediate transaction.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] when `ids` is not exactly the
    /// collection's membership, or an error when any write fails. No rank is
    /// changed on error.
    pub fn reindex(
        &mut self,
        collection: Collection,
        ids: &[RecordId],
    ) -> Result<Vec<RankAssignment>> {
        self.mutate(collection, "reindex", |ranks| ranks.reindex(ids))
    }

    /// Exchange the ranks of two records in one immediate transaction.
    ///
    /// # Errors
    /// Returns [`OrderError::PersistenceFailure`] when either id is absent, or an
    /// error when the writes fail. Both ranks change or neither does.
    pub fn swap_ranks(
        &mut self,
        collection: Collection,
        a: RecordId,
        b: RecordId,
    ) -> Result<Vec<RankAssignment>> {
        self.mutate(collection, "swap", |ranks| ranks.swap(a, b))
    }

    /// Renumber `collection` densely, preserving its current order.
    ///
    /// # Errors
    /// Returns an error when reading or writing ranks fails.
    pub fn compact(&mut self, collection: Collection) -> Result<Vec<RankAssignment>> {
        self.mutate(collection, "compact", |ranks| Ok(ranks.compact()))
    }

    /// # Errors
    /// Returns an error when ranks cannot be read or decoded.
    pub fn order_report(&self, collection: Collection) -> Result<OrderReport> {
        Ok(load_rank_table(&self.conn, collection)?.report())
    }

    /// Run `SQLite` quick check and audit every collection's order.
    ///
    /// # Errors
    /// Returns an error when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut collections = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            if !table_exists(&self.conn, collection.table())? {
                continue;
            }
            collections.push(CollectionReport { collection, order: self.order_report(collection)? });
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            collections,
            schema_status,
        })
    }

    fn mutate<F>(
        &mut self,
        collection: Collection,
        operation: &str,
        plan: F,
    ) -> Result<Vec<RankAssignment>>
    where
        F: FnOnce(&mut RankTable) -> Result<Vec<RankAssignment>, OrderError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {operation} transaction"))?;

        let mut ranks = load_rank_table(&tx, collection)?;
        let changed = plan(&mut ranks)?;
        write_assignments(&tx, collection, &changed)?;

        tx.commit().with_context(|| format!("failed to commit {operation} transaction"))?;
        tracing::debug!(
            "Applied {operation} to {}: {} rank(s) changed",
            collection.label(),
            changed.len()
        );
        Ok(changed)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn load_rank_table(conn: &Connection, collection: Collection) -> Result<RankTable> {
    let table = collection.table();
    let mut stmt = conn
        .prepare(&format!("SELECT id, display_order FROM {table}"))
        .with_context(|| format!("failed to prepare rank query for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let id = decode_id(row.get(0)?)?;
        let rank = decode_rank(row.get(1)?)?;
        entries.push((id, rank));
    }
    Ok(entries.into_iter().collect())
}

/// Persist `assignments` in two passes: touched rows are first parked on
/// distinct negative ranks, then given their final rank, so the unique order
/// index never sees a transient collision.
fn write_assignments(
    conn: &Connection,
    collection: Collection,
    assignments: &[RankAssignment],
) -> Result<()> {
    if assignments.is_empty() {
        return Ok(());
    }
    let table = collection.table();

    let mut park = conn
        .prepare(&format!("UPDATE {table} SET display_order = -1 - display_order WHERE id = ?1"))
        .with_context(|| format!("failed to prepare park statement for {table}"))?;
    for assignment in assignments {
        park.execute(params![assignment.id.get()])
            .with_context(|| format!("failed to park rank of {table} record {}", assignment.id))?;
    }

    let mut assign = conn
        .prepare(&format!("UPDATE {table} SET display_order = ?1 WHERE id = ?2"))
        .with_context(|| format!("failed to prepare rank update for {table}"))?;
    for assignment in assignments {
        let updated = assign
            .execute(params![i64::from(assignment.rank.get()), assignment.id.get()])
            .with_context(|| format!("failed to update rank of {table} record {}", assignment.id))?;
        if updated != 1 {
            return Err(OrderError::PersistenceFailure(format!(
                "record {} does not exist",
                assignment.id
            ))
            .into());
        }
    }

    Ok(())
}

fn decode_record(row: &rusqlite::Row<'_>) -> Result<OrderedRecord> {
    let created_at_raw: String = row.get(3)?;
    Ok(OrderedRecord {
        id: decode_id(row.get(0)?)?,
        title: row.get(1)?,
        rank: decode_rank(row.get(2)?)?,
        created_at: parse_rfc3339(&created_at_raw)?,
    })
}

fn decode_id(raw: i64) -> Result<RecordId> {
    RecordId::new(raw).ok_or_else(|| anyhow!("stored record id MUST be non-zero"))
}

fn decode_rank(raw: i64) -> Result<Rank> {
    u32::try_from(raw).map(Rank).map_err(|_| anyhow!("display_order out of range: {raw}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    schema_object_exists(conn, "table", table_name)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    schema_object_exists(conn, "index", index_name)
}

fn schema_object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            params![kind, name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if {kind} exists: {name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "partners")? {
        return Ok((0, false));
    }

    if index_exists(conn, "uq_partners_display_order")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
