//! PostgreSQL integration tests for the migrator.
//!
//! Every test works in its own namespaces (tracking tables, plugin tables
//! and accessor function) so tests can run in parallel against one database.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test -- --ignored`

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use plugin_migrator::migrator::lock_key;
use plugin_migrator::prelude::*;
use plugin_migrator::MigrateError;

// ============================================================================
// Test Helpers
// ============================================================================

async fn connect_db() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

/// Unique namespace prefix for one test.
fn namespace() -> String {
    format!("pm_{}", Uuid::new_v4().simple())
}

fn test_config(ns: &str) -> MigratorConfig {
    let mut config = MigratorConfig::default();
    config.migrations_schema = format!("{}_migrations", ns);
    config.tenant.accessor_schema = ns.to_string();
    config.lock_timeout_ms = 5_000;
    config.lock_poll_interval_ms = 20;
    config
}

async fn setup() -> Option<(PgPool, Migrator, String)> {
    let pool = connect_db().await?;
    let ns = namespace();
    let migrator = Migrator::new(pool.clone(), test_config(&ns)).unwrap();
    migrator.initialize().await.unwrap();
    Some((pool, migrator, ns))
}

fn widgets(ns: &str) -> TableDef {
    TableDef::new("widgets")
        .in_schema(ns)
        .column(ColumnDef::new("id", "uuid").primary_key())
        .column(ColumnDef::new("name", "text").not_null())
}

fn declaration(tables: Vec<TableDef>) -> SchemaDeclaration {
    let mut schema = SchemaDeclaration::new();
    for table in tables {
        schema.add_table(table);
    }
    schema
}

async fn table_exists(pool: &PgPool, ns: &str, table: &str) -> bool {
    sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(format!("\"{}\".\"{}\"", ns, table))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn column_exists(pool: &PgPool, ns: &str, table: &str, column: &str) -> bool {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
    )
    .bind(ns)
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .unwrap();
    count == 1
}

// ============================================================================
// Migration lifecycle
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_first_run_then_added_column() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-alpha", ns);
    let options = MigrateOptions::default();

    let v1 = declaration(vec![widgets(&ns)]);
    let first = migrator.migrate(&plugin, &v1, &options).await.unwrap();
    assert_eq!(first.outcome, MigrationOutcome::Applied);
    assert_eq!(first.snapshot_idx, Some(0));
    assert!(table_exists(&pool, &ns, "widgets").await);

    let v2 = declaration(vec![widgets(&ns).column(
        ColumnDef::new("qty", "integer")
            .not_null()
            .default(DefaultValue::Int(0)),
    )]);
    let second = migrator.migrate(&plugin, &v2, &options).await.unwrap();
    assert_eq!(second.outcome, MigrationOutcome::Applied);
    assert_eq!(second.snapshot_idx, Some(1));
    assert_eq!(second.operations.len(), 1);
    assert!(matches!(second.operations[0], ChangeOperation::AddColumn { .. }));
    assert!(column_exists(&pool, &ns, "widgets", "qty").await);

    let status = migrator.status(&plugin).await.unwrap();
    assert!(status.has_run);
    assert_eq!(status.snapshots, 2);
    assert!(status.last_migration.is_some());

    let history = migrator.history(&plugin).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].tag, format!("0000_{}", plugin));
    assert_eq!(history[1].snapshot_idx, 1);
    assert_eq!(history[1].hash, v2.content_hash().unwrap());
}

#[tokio::test]
#[ignore]
async fn test_unchanged_declaration_is_up_to_date() {
    let Some((_pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-idem", ns);
    let schema = declaration(vec![widgets(&ns)]);
    let options = MigrateOptions::default();

    migrator.migrate(&plugin, &schema, &options).await.unwrap();
    let again = migrator.migrate(&plugin, &schema, &options).await.unwrap();
    assert_eq!(again.outcome, MigrationOutcome::UpToDate);
    assert!(again.statements.is_empty());

    let status = migrator.status(&plugin).await.unwrap();
    assert_eq!(status.snapshots, 1);
}

#[tokio::test]
#[ignore]
async fn test_initialize_is_repeatable() {
    let Some((_pool, migrator, _ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    migrator.initialize().await.unwrap();
    let other = migrator.clone();
    let (a, b) = tokio::join!(migrator.initialize(), other.initialize());
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_status_of_unknown_plugin() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    // Tracking namespace never initialized.
    let migrator = Migrator::new(pool, test_config(&namespace())).unwrap();
    let status = migrator.status("nobody").await.unwrap();
    assert!(!status.has_run);
    assert_eq!(status.snapshots, 0);
    assert_eq!(status.last_migration, None);
}

#[tokio::test]
#[ignore]
async fn test_failed_statement_leaves_state_unchanged() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-fail", ns);
    let options = MigrateOptions::default();

    let v1 = declaration(vec![widgets(&ns)]);
    migrator.migrate(&plugin, &v1, &options).await.unwrap();

    let broken = declaration(vec![widgets(&ns)
        .column(ColumnDef::new("qty", "integer"))
        .check("qty_positive", "no_such_column > 0")]);
    let err = migrator.migrate(&plugin, &broken, &options).await.unwrap_err();
    match err {
        MigrateError::StatementExecutionFailed { statement, .. } => {
            assert!(statement.contains("qty_positive"));
        }
        other => panic!("expected StatementExecutionFailed, got {}", other),
    }

    assert!(!column_exists(&pool, &ns, "widgets", "qty").await);
    let status = migrator.status(&plugin).await.unwrap();
    assert_eq!(status.snapshots, 1);
    let again = migrator.migrate(&plugin, &v1, &options).await.unwrap();
    assert_eq!(again.outcome, MigrationOutcome::UpToDate);
}

#[tokio::test]
#[ignore]
async fn test_destructive_change_requires_opt_in() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-drop", ns);
    let gadgets = TableDef::new("gadgets")
        .in_schema(&ns)
        .column(ColumnDef::new("id", "bigserial").primary_key());

    let v1 = declaration(vec![widgets(&ns), gadgets]);
    migrator
        .migrate(&plugin, &v1, &MigrateOptions::default())
        .await
        .unwrap();

    let v2 = declaration(vec![widgets(&ns)]);
    let err = migrator
        .migrate(&plugin, &v2, &MigrateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::DestructiveChangeRejected { .. }));
    assert!(table_exists(&pool, &ns, "gadgets").await);

    let allowed = MigrateOptions {
        allow_destructive: true,
        ..MigrateOptions::default()
    };
    let result = migrator.migrate(&plugin, &v2, &allowed).await.unwrap();
    assert_eq!(result.outcome, MigrationOutcome::Applied);
    assert!(!table_exists(&pool, &ns, "gadgets").await);
}

#[tokio::test]
#[ignore]
async fn test_dry_run_records_nothing() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-dry", ns);
    let schema = declaration(vec![widgets(&ns).tenant_scoped()]);

    let result = migrator.plan(&plugin, &schema, false).await.unwrap();
    assert_eq!(result.outcome, MigrationOutcome::DryRun);
    assert_eq!(result.snapshot_idx, Some(0));
    assert!(result.statements.iter().any(|s| s.starts_with("CREATE TABLE")));
    assert!(result.statements.iter().any(|s| s.starts_with("CREATE POLICY")));
    assert_eq!(result.policies.len(), 1);

    assert!(!table_exists(&pool, &ns, "widgets").await);
    assert!(!migrator.status(&plugin).await.unwrap().has_run);
}

// ============================================================================
// Tenant isolation
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_tenant_rows_are_isolated() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-orders", ns);
    let orders = TableDef::new("orders")
        .in_schema(&ns)
        .column(ColumnDef::new("id", "uuid").primary_key())
        .column(ColumnDef::new("total", "numeric(12,2)").not_null())
        .tenant_scoped();

    let result = migrator
        .migrate(&plugin, &declaration(vec![orders.clone()]), &MigrateOptions::default())
        .await
        .unwrap();
    assert_eq!(result.policies.len(), 1);
    assert_eq!(result.policies[0].1, PolicyOutcome::Created);
    assert!(column_exists(&pool, &ns, "orders", "tenant_id").await);

    let forced: bool = sqlx::query_scalar(
        "SELECT c.relforcerowsecurity FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = 'orders'",
    )
    .bind(&ns)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(forced);

    // Superusers bypass row level security; run as a plain role inside a
    // transaction that is rolled back at the end.
    let role = format!("{}_app", ns);
    let tenant = migrator.tenant();
    let (tenant_a, tenant_b) = (Uuid::new_v4(), Uuid::new_v4());

    let mut tx = pool.begin().await.unwrap();
    for statement in [
        format!("CREATE ROLE \"{}\" NOLOGIN", role),
        format!("GRANT USAGE ON SCHEMA \"{}\" TO \"{}\"", ns, role),
        format!("GRANT SELECT, INSERT ON \"{}\".\"orders\" TO \"{}\"", ns, role),
        format!("SET LOCAL ROLE \"{}\"", role),
    ] {
        sqlx::raw_sql(&statement).execute(&mut *tx).await.unwrap();
    }

    let insert = format!("INSERT INTO \"{}\".\"orders\" (id, total) VALUES ($1, 10)", ns);
    for t in [tenant_a, tenant_b] {
        tenant
            .set_tenant_context(&mut tx, &t.to_string(), ContextScope::Transaction)
            .await
            .unwrap();
        sqlx::query(&insert)
            .bind(Uuid::new_v4())
            .execute(&mut *tx)
            .await
            .unwrap();
    }

    let select = format!("SELECT tenant_id FROM \"{}\".\"orders\"", ns);
    for t in [tenant_a, tenant_b] {
        tenant
            .set_tenant_context(&mut tx, &t.to_string(), ContextScope::Transaction)
            .await
            .unwrap();
        let visible: Vec<Uuid> = sqlx::query_scalar(&select)
            .fetch_all(&mut *tx)
            .await
            .unwrap();
        assert_eq!(visible, vec![t]);
    }

    // WITH CHECK rejects rows for another tenant.
    tenant
        .set_tenant_context(&mut tx, &tenant_a.to_string(), ContextScope::Transaction)
        .await
        .unwrap();
    let foreign = sqlx::query(&format!(
        "INSERT INTO \"{}\".\"orders\" (id, total, tenant_id) VALUES ($1, 5, $2)",
        ns
    ))
    .bind(Uuid::new_v4())
    .bind(tenant_b)
    .execute(&mut *tx)
    .await;
    assert!(foreign.is_err());
    tx.rollback().await.unwrap();

    // A later structural change keeps the existing policy.
    let v2 = orders.column(ColumnDef::new("note", "text"));
    let result = migrator
        .migrate(&plugin, &declaration(vec![v2]), &MigrateOptions::default())
        .await
        .unwrap();
    assert_eq!(result.policies.len(), 1);
    assert_eq!(result.policies[0].1, PolicyOutcome::Unchanged);
}

#[tokio::test]
#[ignore]
async fn test_tenant_scope_cannot_be_removed() {
    let Some((_pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-unscope", ns);
    let scoped = declaration(vec![widgets(&ns).tenant_scoped()]);
    migrator
        .migrate(&plugin, &scoped, &MigrateOptions::default())
        .await
        .unwrap();

    let err = migrator
        .migrate(&plugin, &declaration(vec![widgets(&ns)]), &MigrateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::TenantScopeRemoved { .. }));
}

#[tokio::test]
#[ignore]
async fn test_corrupt_snapshot_is_reported() {
    let Some((_pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-corrupt", ns);
    let options = MigrateOptions::default();
    migrator
        .migrate(&plugin, &declaration(vec![widgets(&ns)]), &options)
        .await
        .unwrap();

    sqlx::query(&format!(
        "UPDATE \"{}_migrations\".\"_snapshots\" SET snapshot = '5'::jsonb WHERE plugin_name = $1",
        ns
    ))
    .bind(&plugin)
    .execute(migrator.pool())
    .await
    .unwrap();

    let v2 = declaration(vec![widgets(&ns).column(ColumnDef::new("qty", "integer"))]);
    let err = migrator.migrate(&plugin, &v2, &options).await.unwrap_err();
    match err {
        MigrateError::SnapshotCorrupt { plugin: p, idx, .. } => {
            assert_eq!(p, plugin);
            assert_eq!(idx, 0);
        }
        other => panic!("expected SnapshotCorrupt, got {}", other),
    }
    assert_eq!(migrator.status(&plugin).await.unwrap().snapshots, 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_plugins_migrate_concurrently() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let alpha = declaration(vec![widgets(&ns)]);
    let beta = declaration(vec![TableDef::new("gizmos")
        .in_schema(&ns)
        .column(ColumnDef::new("id", "uuid").primary_key())]);
    let options = MigrateOptions::default();

    let (alpha_name, beta_name) = (format!("{}-alpha", ns), format!("{}-beta", ns));
    let (a, b) = tokio::join!(
        migrator.migrate(&alpha_name, &alpha, &options),
        migrator.migrate(&beta_name, &beta, &options),
    );
    assert_eq!(a.unwrap().outcome, MigrationOutcome::Applied);
    assert_eq!(b.unwrap().outcome, MigrationOutcome::Applied);
    assert!(table_exists(&pool, &ns, "widgets").await);
    assert!(table_exists(&pool, &ns, "gizmos").await);
}

#[tokio::test]
#[ignore]
async fn test_plugins_share_new_namespace() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let options = MigrateOptions::default();

    for round in 0..5 {
        let shared = format!("{}_shared_{}", ns, round);
        let alpha = declaration(vec![TableDef::new("a")
            .in_schema(&shared)
            .column(ColumnDef::new("id", "uuid").primary_key())]);
        let beta = declaration(vec![TableDef::new("b")
            .in_schema(&shared)
            .column(ColumnDef::new("id", "uuid").primary_key())]);
        let (alpha_name, beta_name) = (
            format!("{}-alpha-{}", ns, round),
            format!("{}-beta-{}", ns, round),
        );

        let other = migrator.clone();
        let (a, b) = tokio::join!(
            migrator.migrate(&alpha_name, &alpha, &options),
            other.migrate(&beta_name, &beta, &options),
        );
        assert_eq!(a.unwrap().outcome, MigrationOutcome::Applied);
        assert_eq!(b.unwrap().outcome, MigrationOutcome::Applied);
        assert!(table_exists(&pool, &shared, "a").await);
        assert!(table_exists(&pool, &shared, "b").await);
    }
}

#[tokio::test]
#[ignore]
async fn test_same_plugin_migrates_once() {
    let Some((_pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let plugin = format!("{}-race", ns);
    let schema = declaration(vec![widgets(&ns)]);
    let options = MigrateOptions::default();

    let other = migrator.clone();
    let (a, b) = tokio::join!(
        migrator.migrate(&plugin, &schema, &options),
        other.migrate(&plugin, &schema, &options),
    );
    let mut outcomes = vec![a.unwrap().outcome, b.unwrap().outcome];
    outcomes.sort_by_key(|o| *o == MigrationOutcome::UpToDate);
    assert_eq!(
        outcomes,
        vec![MigrationOutcome::Applied, MigrationOutcome::UpToDate]
    );
    assert_eq!(migrator.status(&plugin).await.unwrap().snapshots, 1);
}

#[tokio::test]
#[ignore]
async fn test_lock_timeout() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let ns = namespace();
    let mut config = test_config(&ns);
    config.lock_timeout_ms = 200;
    let migrator = Migrator::new(pool.clone(), config).unwrap();
    migrator.initialize().await.unwrap();

    let plugin = format!("{}-locked", ns);
    let mut holder = pool.begin().await.unwrap();
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_key(&format!("plugin-migrator/plugin:{}", plugin)))
        .execute(&mut *holder)
        .await
        .unwrap();

    let err = migrator
        .migrate(&plugin, &declaration(vec![widgets(&ns)]), &MigrateOptions::default())
        .await
        .unwrap_err();
    match err {
        MigrateError::LockTimeout { plugin: p, waited_ms } => {
            assert_eq!(p, plugin);
            assert!(waited_ms >= 200);
        }
        other => panic!("expected LockTimeout, got {}", other),
    }
    holder.rollback().await.unwrap();

    let status = migrator.status(&plugin).await.unwrap();
    assert!(!status.has_run);
}

#[tokio::test]
#[ignore]
async fn test_migrate_all_follows_foreign_keys() {
    let Some((pool, migrator, ns)) = setup().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let users = TableDef::new("users")
        .in_schema(&ns)
        .column(ColumnDef::new("id", "uuid").primary_key());
    let invoices = TableDef::new("invoices")
        .in_schema(&ns)
        .column(ColumnDef::new("id", "uuid").primary_key())
        .column(ColumnDef::new("user_id", "uuid").not_null())
        .foreign_key(
            ForeignKeyDef::new(&["user_id"], "users", &["id"])
                .in_schema(&ns)
                .on_delete(ReferentialAction::Cascade),
        );

    // Registered in reverse dependency order.
    let plugins = vec![
        PluginSchema::new(format!("{}-billing", ns), declaration(vec![invoices])),
        PluginSchema::new(format!("{}-accounts", ns), declaration(vec![users])),
    ];
    let results = migrator
        .migrate_all(&plugins, &MigrateOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].plugin, format!("{}-accounts", ns));
    assert!(table_exists(&pool, &ns, "invoices").await);
}
