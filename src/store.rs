//! Snapshot store, journal and ledger.
//!
//! The three tracking tables live in a dedicated namespace
//! (`migrations` by default):
//!
//! - `_snapshots`: one immutable row per (plugin, idx) holding the declaration
//! - `_journal`: one row per plugin with the ordered list of applied steps
//! - `_migrations`: the ledger, one row per plugin with the latest hash
//!
//! All writes take a `&mut PgConnection` so the caller decides which
//! transaction they belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

use crate::ddl::quote_ident;
use crate::error::{MigrateError, Result};
use crate::schema::SchemaDeclaration;

/// Journal format version.
pub const JOURNAL_VERSION: &str = "1";

const DIALECT: &str = "postgresql";

/// PostgreSQL `undefined_table`
const UNDEFINED_TABLE: &str = "42P01";

/// A stored declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub plugin: String,
    pub idx: i32,
    pub schema: SchemaDeclaration,
    pub created_at: DateTime<Utc>,
}

/// One applied migration, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStep {
    pub idx: i32,
    pub snapshot_idx: i32,
    pub tag: String,
    pub hash: String,
    pub when: DateTime<Utc>,
    pub operations: usize,
    pub statements: Vec<String>,
    /// Statements were applied one by one rather than as a single script.
    #[serde(default = "default_breakpoints")]
    pub breakpoints: bool,
}

fn default_breakpoints() -> bool {
    true
}

/// Read-only migration status of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub has_run: bool,
    pub snapshots: i64,
    pub last_migration: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn not_run() -> Self {
        Self {
            has_run: false,
            snapshots: 0,
            last_migration: None,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    idx: i32,
    snapshot: serde_json::Value,
    created_at: DateTime<Utc>,
}

/// Access to the tracking tables in one namespace.
#[derive(Debug, Clone)]
pub struct MigrationStore {
    schema: String,
}

impl MigrationStore {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    /// Idempotent DDL for the namespace and its three tables.
    pub fn bootstrap_statements(&self) -> Vec<String> {
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
    id serial PRIMARY KEY,
    plugin_name text NOT NULL,
    idx integer NOT NULL,
    snapshot jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (plugin_name, idx)
)",
                self.table("_snapshots")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
    plugin_name text PRIMARY KEY,
    version text NOT NULL,
    dialect text NOT NULL,
    entries jsonb NOT NULL DEFAULT '[]'::jsonb,
    updated_at timestamptz NOT NULL DEFAULT now()
)",
                self.table("_journal")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
    id serial PRIMARY KEY,
    plugin_name text NOT NULL UNIQUE,
    hash text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
)",
                self.table("_migrations")
            ),
        ]
    }

    pub async fn create_tables(&self, conn: &mut PgConnection) -> Result<()> {
        for statement in self.bootstrap_statements() {
            execute(conn, &statement).await?;
        }
        Ok(())
    }

    /// Hash of the last applied declaration, if any.
    pub async fn ledger_hash(&self, conn: &mut PgConnection, plugin: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT hash FROM {} WHERE plugin_name = $1",
            self.table("_migrations")
        ))
        .bind(plugin)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|(hash,)| hash))
    }

    /// Latest snapshot for `plugin`; a stored declaration that no longer
    /// deserializes or validates is reported as corrupt.
    pub async fn latest_snapshot(&self, conn: &mut PgConnection, plugin: &str) -> Result<Option<Snapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT idx, snapshot, created_at FROM {} WHERE plugin_name = $1 ORDER BY idx DESC LIMIT 1",
            self.table("_snapshots")
        ))
        .bind(plugin)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let corrupt = |reason: String| MigrateError::SnapshotCorrupt {
            plugin: plugin.to_string(),
            idx: row.idx,
            reason,
        };
        let schema: SchemaDeclaration =
            serde_json::from_value(row.snapshot.clone()).map_err(|e| corrupt(e.to_string()))?;
        schema.validate().map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(Snapshot {
            plugin: plugin.to_string(),
            idx: row.idx,
            schema,
            created_at: row.created_at,
        }))
    }

    pub async fn insert_snapshot(
        &self,
        conn: &mut PgConnection,
        plugin: &str,
        idx: i32,
        schema: &SchemaDeclaration,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (plugin_name, idx, snapshot) VALUES ($1, $2, $3)",
            self.table("_snapshots")
        ))
        .bind(plugin)
        .bind(idx)
        .bind(Json(schema))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Append one step to the plugin's journal row, creating it on first use.
    pub async fn append_journal(&self, conn: &mut PgConnection, plugin: &str, step: &JournalStep) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} AS j (plugin_name, version, dialect, entries) VALUES ($1, $2, $3, $4)
             ON CONFLICT (plugin_name) DO UPDATE
             SET entries = j.entries || EXCLUDED.entries, updated_at = now()",
            self.table("_journal")
        ))
        .bind(plugin)
        .bind(JOURNAL_VERSION)
        .bind(DIALECT)
        .bind(Json(std::slice::from_ref(step)))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn upsert_ledger(&self, conn: &mut PgConnection, plugin: &str, hash: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (plugin_name, hash) VALUES ($1, $2)
             ON CONFLICT (plugin_name) DO UPDATE SET hash = EXCLUDED.hash, created_at = now()",
            self.table("_migrations")
        ))
        .bind(plugin)
        .bind(hash)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Journal steps in application order; empty for unknown plugins.
    pub async fn journal(&self, conn: &mut PgConnection, plugin: &str) -> Result<Vec<JournalStep>> {
        let row: Option<(Json<Vec<JournalStep>>,)> = sqlx::query_as(&format!(
            "SELECT entries FROM {} WHERE plugin_name = $1",
            self.table("_journal")
        ))
        .bind(plugin)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|(Json(entries),)| entries).unwrap_or_default())
    }

    /// Status for `plugin`. Unknown plugins, and a namespace that was never
    /// initialized, report the has-not-run shape.
    pub async fn status(&self, conn: &mut PgConnection, plugin: &str) -> Result<MigrationStatus> {
        let ledger = match sqlx::query_as::<_, (DateTime<Utc>,)>(&format!(
            "SELECT created_at FROM {} WHERE plugin_name = $1",
            self.table("_migrations")
        ))
        .bind(plugin)
        .fetch_optional(&mut *conn)
        .await
        {
            Ok(row) => row,
            Err(e) if is_undefined_table(&e) => return Ok(MigrationStatus::not_run()),
            Err(e) => return Err(e.into()),
        };

        let Some((last_migration,)) = ledger else {
            return Ok(MigrationStatus::not_run());
        };

        let (snapshots,): (i64,) = sqlx::query_as(&format!(
            "SELECT count(*) FROM {} WHERE plugin_name = $1",
            self.table("_snapshots")
        ))
        .bind(plugin)
        .fetch_one(&mut *conn)
        .await?;

        Ok(MigrationStatus {
            has_run: true,
            snapshots,
            last_migration: Some(last_migration),
        })
    }
}

/// Execute one generated statement, reporting failures with the statement text.
pub async fn execute(conn: &mut PgConnection, statement: &str) -> Result<()> {
    sqlx::raw_sql(statement)
        .execute(&mut *conn)
        .await
        .map_err(|source| MigrateError::StatementExecutionFailed {
            statement: statement.to_string(),
            source,
        })?;
    Ok(())
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_TABLE),
        _ => false,
    }
}
