//! Migration executor.
//!
//! [`Migrator::migrate`] is called once per plugin at boot. When the plugin's
//! declaration hash matches the ledger it returns without opening a
//! transaction. Otherwise it serializes on a per-plugin advisory lock,
//! diffs against the latest snapshot, executes the generated DDL, applies
//! tenant policies and records snapshot, journal step and ledger hash, all
//! inside one transaction.

use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

use crate::config::MigratorConfig;
use crate::ddl;
use crate::diff::{self, ChangeOperation, DiffOptions};
use crate::error::{MigrateError, Result};
use crate::registry::{order_plugins, PluginSchema};
use crate::schema::{QualifiedName, SchemaDeclaration};
use crate::store::{execute, JournalStep, MigrationStatus, MigrationStore};
use crate::tenant::{PolicyOutcome, TenantIsolationManager};

const INITIALIZE_LOCK: &str = "plugin-migrator/initialize";

/// Per-step diagnostics go to `info` when verbose, `debug` otherwise.
macro_rules! step {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Options for a single migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Log every step at `info`.
    pub verbose: bool,
    /// Permit table and column drops.
    pub allow_destructive: bool,
    /// Compute operations and statements without executing or recording them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied,
    UpToDate,
    DryRun,
}

/// Result of [`Migrator::migrate`].
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationResult {
    pub plugin: String,
    pub outcome: MigrationOutcome,
    /// Content hash of the declaration.
    pub hash: String,
    /// Index of the snapshot written (or that would be written on a dry run).
    pub snapshot_idx: Option<i32>,
    pub operations: Vec<ChangeOperation>,
    /// Every statement executed, tenant policies included.
    pub statements: Vec<String>,
    pub policies: Vec<(QualifiedName, PolicyOutcome)>,
}

impl MigrationResult {
    fn up_to_date(plugin: &str, hash: String) -> Self {
        Self {
            plugin: plugin.to_string(),
            outcome: MigrationOutcome::UpToDate,
            hash,
            snapshot_idx: None,
            operations: Vec::new(),
            statements: Vec::new(),
            policies: Vec::new(),
        }
    }
}

/// Offline migration plan between two declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub operations: Vec<ChangeOperation>,
    pub statements: Vec<String>,
}

/// Diff two declarations and generate DDL without touching a database.
pub fn plan(
    previous: Option<&SchemaDeclaration>,
    next: &SchemaDeclaration,
    options: &DiffOptions,
) -> Result<MigrationPlan> {
    if let Some(previous) = previous {
        previous.validate()?;
    }
    next.validate()?;
    let operations = diff::diff(previous, next, options)?;
    let statements = ddl::generate(&operations)?;
    Ok(MigrationPlan {
        operations,
        statements,
    })
}

/// Advisory lock key for `name`: the first 8 bytes of its SHA-256.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn plugin_lock_name(plugin: &str) -> String {
    format!("plugin-migrator/plugin:{}", plugin)
}

fn namespace_lock_name(namespace: &str) -> String {
    format!("plugin-migrator/schema:{}", namespace)
}

/// Runtime migrator for plugin schemas.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
    config: MigratorConfig,
    store: MigrationStore,
    tenant: TenantIsolationManager,
}

impl Migrator {
    /// Fails with [`MigrateError::Config`] when `config` does not validate.
    pub fn new(pool: PgPool, config: MigratorConfig) -> Result<Self> {
        config.validate()?;
        let store = MigrationStore::new(config.migrations_schema.clone());
        let tenant = TenantIsolationManager::new(config.tenant.clone());
        Ok(Self {
            pool,
            config,
            store,
            tenant,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn tenant(&self) -> &TenantIsolationManager {
        &self.tenant
    }

    /// Create the tracking namespace, its tables and the tenant accessor.
    /// Safe to call repeatedly and from concurrent processes.
    pub async fn initialize(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.acquire_lock(&mut tx, INITIALIZE_LOCK, "<initialize>").await?;
        self.store.create_tables(&mut tx).await?;
        self.tenant.install_accessor(&mut tx).await?;
        tx.commit().await?;
        debug!(schema = %self.store.schema(), "migration store initialized");
        Ok(())
    }

    /// Bring the database to `schema` for `plugin`.
    pub async fn migrate(
        &self,
        plugin: &str,
        schema: &SchemaDeclaration,
        options: &MigrateOptions,
    ) -> Result<MigrationResult> {
        schema.validate()?;
        for table in schema.tables.values() {
            self.tenant.validate_scope(table)?;
        }
        let hash = schema.content_hash()?;

        {
            let mut conn = self.pool.acquire().await?;
            if self.store.ledger_hash(&mut conn, plugin).await?.as_deref() == Some(hash.as_str()) {
                step!(options.verbose, plugin, "schema up to date");
                return Ok(MigrationResult::up_to_date(plugin, hash));
            }
        }

        let mut tx = self.pool.begin().await?;
        let result = self.migrate_in(&mut tx, plugin, schema, hash, options).await;
        match result {
            Ok(result) if result.outcome == MigrationOutcome::Applied => {
                tx.commit().await?;
                info!(
                    plugin,
                    snapshot = ?result.snapshot_idx,
                    operations = result.operations.len(),
                    statements = result.statements.len(),
                    "migration applied"
                );
                Ok(result)
            }
            Ok(result) => {
                tx.rollback().await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(plugin, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn migrate_in(
        &self,
        tx: &mut PgConnection,
        plugin: &str,
        schema: &SchemaDeclaration,
        hash: String,
        options: &MigrateOptions,
    ) -> Result<MigrationResult> {
        if !options.dry_run {
            self.acquire_lock(tx, &plugin_lock_name(plugin), plugin).await?;
            step!(options.verbose, plugin, "migration lock acquired");

            // Another process may have finished the same migration while we waited.
            if self.store.ledger_hash(tx, plugin).await?.as_deref() == Some(hash.as_str()) {
                step!(options.verbose, plugin, "schema migrated concurrently");
                return Ok(MigrationResult::up_to_date(plugin, hash));
            }
        }

        let previous = self.store.latest_snapshot(tx, plugin).await?;
        let snapshot_idx = previous.as_ref().map_or(0, |s| s.idx + 1);
        step!(
            options.verbose,
            plugin,
            previous = ?previous.as_ref().map(|s| s.idx),
            "loaded latest snapshot"
        );

        let previous_schema = previous.as_ref().map(|s| &s.schema);
        let diff_options = DiffOptions {
            allow_destructive: options.allow_destructive,
            widening: self.config.widening_rules(),
            tenant_column: Some(self.config.tenant.default_column.clone()),
        };
        let operations = diff::diff(previous_schema, schema, &diff_options)?;
        let mut statements = ddl::generate(&operations)?;
        for op in &operations {
            step!(options.verbose, plugin, operation = %op.describe(), "planned");
        }

        let scoped = self.policy_targets(previous_schema, schema, &operations);

        if options.dry_run {
            let mut policies = Vec::with_capacity(scoped.len());
            for (table, column) in scoped {
                let (outcome, policy_statements) =
                    self.tenant.plan_policy(tx, &table, &column).await?;
                statements.extend(policy_statements);
                policies.push((table, outcome));
            }
            return Ok(MigrationResult {
                plugin: plugin.to_string(),
                outcome: MigrationOutcome::DryRun,
                hash,
                snapshot_idx: Some(snapshot_idx),
                operations,
                statements,
                policies,
            });
        }

        // CREATE SCHEMA IF NOT EXISTS races between plugins sharing a new
        // namespace. Locks are taken in name order.
        for namespace in ddl::created_namespaces(&operations) {
            self.acquire_lock(tx, &namespace_lock_name(&namespace), plugin).await?;
            step!(options.verbose, plugin, namespace = %namespace, "namespace lock acquired");
        }

        for statement in &statements {
            step!(options.verbose, plugin, statement = %statement, "executing");
            execute(tx, statement).await?;
        }

        let mut policies = Vec::with_capacity(scoped.len());
        for (table, column) in scoped {
            let (outcome, policy_statements) =
                self.tenant.apply_policy(tx, &table, &column).await?;
            step!(options.verbose, plugin, table = %table, ?outcome, "tenant policy");
            statements.extend(policy_statements);
            policies.push((table, outcome));
        }

        self.record(tx, plugin, snapshot_idx, schema, &hash, &operations, &statements)
            .await?;

        Ok(MigrationResult {
            plugin: plugin.to_string(),
            outcome: MigrationOutcome::Applied,
            hash,
            snapshot_idx: Some(snapshot_idx),
            operations,
            statements,
            policies,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        conn: &mut PgConnection,
        plugin: &str,
        snapshot_idx: i32,
        schema: &SchemaDeclaration,
        hash: &str,
        operations: &[ChangeOperation],
        statements: &[String],
    ) -> Result<()> {
        self.store.insert_snapshot(conn, plugin, snapshot_idx, schema).await?;
        let step = JournalStep {
            idx: snapshot_idx,
            snapshot_idx,
            tag: format!("{:04}_{}", snapshot_idx, plugin),
            hash: hash.to_string(),
            when: chrono::Utc::now(),
            operations: operations.len(),
            statements: statements.to_vec(),
            breakpoints: true,
        };
        self.store.append_journal(conn, plugin, &step).await?;
        self.store.upsert_ledger(conn, plugin, hash).await?;
        Ok(())
    }

    /// Tenant-scoped tables that were created, altered or newly scoped.
    fn policy_targets(
        &self,
        previous: Option<&SchemaDeclaration>,
        next: &SchemaDeclaration,
        operations: &[ChangeOperation],
    ) -> Vec<(QualifiedName, String)> {
        let touched = diff::touched_tables(operations);
        next.tables
            .values()
            .filter_map(|table| {
                let column = self.tenant.scoping_column(table)?;
                let name = table.qualified_name();
                let before = previous
                    .and_then(|p| p.find(&name))
                    .and_then(|t| self.tenant.scoping_column(t));
                let rescoped = before.as_deref() != Some(column.as_str());
                (touched.contains(&name) || rescoped).then_some((name, column))
            })
            .collect()
    }

    /// Poll for a transaction-scoped advisory lock until the configured
    /// timeout elapses.
    async fn acquire_lock(&self, conn: &mut PgConnection, lock: &str, owner: &str) -> Result<()> {
        let key = lock_key(lock);
        let timeout = self.config.lock_timeout();
        let poll = self.config.lock_poll_interval();
        let start = Instant::now();
        loop {
            let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;
            if acquired {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(MigrateError::LockTimeout {
                    plugin: owner.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll.min(timeout - waited)).await;
        }
    }

    /// Plan a migration against the recorded state without applying it.
    pub async fn plan(
        &self,
        plugin: &str,
        schema: &SchemaDeclaration,
        allow_destructive: bool,
    ) -> Result<MigrationResult> {
        let options = MigrateOptions {
            allow_destructive,
            dry_run: true,
            ..MigrateOptions::default()
        };
        self.migrate(plugin, schema, &options).await
    }

    /// Read-only status; never takes the migration lock.
    pub async fn status(&self, plugin: &str) -> Result<MigrationStatus> {
        let mut conn = self.pool.acquire().await?;
        self.store.status(&mut conn, plugin).await
    }

    /// Applied journal steps in order.
    pub async fn history(&self, plugin: &str) -> Result<Vec<JournalStep>> {
        let mut conn = self.pool.acquire().await?;
        self.store.journal(&mut conn, plugin).await
    }

    /// Migrate a batch of plugins in dependency order, stopping at the first
    /// failure. Plugins migrated before the failure stay committed.
    pub async fn migrate_all(
        &self,
        plugins: &[PluginSchema],
        options: &MigrateOptions,
    ) -> Result<Vec<MigrationResult>> {
        let ordered = order_plugins(plugins)?;
        let mut results = Vec::with_capacity(ordered.len());
        for plugin in ordered {
            results.push(self.migrate(&plugin.name, &plugin.schema, options).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableDef};
    use pretty_assertions::assert_eq;

    fn widgets() -> SchemaDeclaration {
        SchemaDeclaration::new().table(
            TableDef::new("widgets")
                .column(ColumnDef::new("id", "uuid").primary_key())
                .column(ColumnDef::new("name", "text").not_null()),
        )
    }

    #[test]
    fn test_lock_keys_are_stable_and_distinct() {
        let a = lock_key(&plugin_lock_name("alpha"));
        assert_eq!(a, lock_key(&plugin_lock_name("alpha")));
        assert_ne!(a, lock_key(&plugin_lock_name("beta")));
        assert_ne!(a, lock_key(INITIALIZE_LOCK));
        assert_ne!(a, lock_key(&namespace_lock_name("alpha")));
    }

    #[test]
    fn test_plan_first_run() {
        let plan = plan(None, &widgets(), &DiffOptions::default()).unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.statements.len(), 1);
        assert!(plan.statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"widgets\""));
    }

    #[test]
    fn test_plan_identical_is_empty() {
        let schema = widgets();
        let plan = plan(Some(&schema), &schema, &DiffOptions::default()).unwrap();
        assert!(plan.operations.is_empty());
        assert!(plan.statements.is_empty());
    }

    #[test]
    fn test_plan_rejects_invalid_declaration() {
        let broken = SchemaDeclaration::new().table(TableDef::new("empty"));
        assert!(matches!(
            plan(None, &broken, &DiffOptions::default()),
            Err(MigrateError::InvalidDeclaration(_))
        ));
    }

    #[tokio::test]
    async fn test_new_validates_config() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/plugin_migrator")
            .unwrap();
        assert!(Migrator::new(pool.clone(), MigratorConfig::default()).is_ok());

        let mut config = MigratorConfig::default();
        config.tenant.policy_name.clear();
        assert!(matches!(
            Migrator::new(pool, config),
            Err(MigrateError::Config(ref msg)) if msg.contains("policy_name")
        ));
    }

    #[test]
    fn test_up_to_date_result_shape() {
        let result = MigrationResult::up_to_date("alpha", "abc".into());
        assert_eq!(result.outcome, MigrationOutcome::UpToDate);
        assert_eq!(result.snapshot_idx, None);
        assert!(result.statements.is_empty());
    }
}
