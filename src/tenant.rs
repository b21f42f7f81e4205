//! Tenant isolation via row level security.
//!
//! Every tenant-scoped table gets a scoping column defaulting to the session
//! accessor function, an index on that column, forced row level security
//! and one policy whose predicate compares the column with the accessor:
//!
//! ```sql
//! CREATE POLICY "tenant_isolation_policy" ON "public"."orders" FOR ALL
//!     USING ("tenant_id" = "public"."current_tenant_id"())
//!     WITH CHECK ("tenant_id" = "public"."current_tenant_id"())
//! ```
//!
//! The policy's catalog comment holds a fingerprint of its definition, so
//! reapplying an identical policy is a no-op and a changed one is replaced.

use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::debug;

use crate::config::TenantConfig;
use crate::ddl::{qualified, quote_ident, quote_literal};
use crate::error::{MigrateError, Result};
use crate::schema::{QualifiedName, TableDef};
use crate::store::execute;

/// A row isolation policy for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPolicy {
    pub table: QualifiedName,
    pub column: String,
    pub name: String,
    /// `USING` / `WITH CHECK` expression.
    pub predicate: String,
    /// Default expression of the scoping column.
    pub default_expr: String,
}

impl TenantPolicy {
    /// Stable digest of the policy definition, stored as the policy comment.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.column.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.predicate.as_bytes());
        let digest = hasher.finalize();
        format!("tenant-policy:{:x}", digest)
    }
}

/// What [`TenantIsolationManager::apply_policy`] did to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Created,
    Replaced,
    Unchanged,
}

/// Lifetime of a tenant context set with
/// [`TenantIsolationManager::set_tenant_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextScope {
    /// Until the current transaction ends.
    #[default]
    Transaction,
    /// Until the connection is closed or the setting is reset.
    Session,
}

/// Installs and maintains tenant isolation policies.
#[derive(Debug, Clone)]
pub struct TenantIsolationManager {
    config: TenantConfig,
}

impl TenantIsolationManager {
    pub fn new(config: TenantConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    /// Call expression of the accessor function.
    pub fn accessor(&self) -> String {
        format!(
            "{}.{}()",
            quote_ident(&self.config.accessor_schema),
            quote_ident(&self.config.accessor_name)
        )
    }

    fn tenant_type(&self) -> Result<String> {
        self.config.column_type.native_type().ok_or_else(|| {
            MigrateError::Config(format!(
                "tenant.column_type '{}' is not a known type",
                self.config.column_type
            ))
        })
    }

    /// DDL that creates or replaces the accessor function.
    pub fn accessor_statements(&self) -> Result<Vec<String>> {
        let ty = self.tenant_type()?;
        let mut statements = Vec::with_capacity(2);
        if self.config.accessor_schema != crate::schema::DEFAULT_NAMESPACE {
            statements.push(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&self.config.accessor_schema)
            ));
        }
        statements.push(format!(
            "CREATE OR REPLACE FUNCTION {accessor} RETURNS {ty} LANGUAGE sql STABLE AS $accessor$ \
             SELECT NULLIF(current_setting({setting}, true), '')::{ty} $accessor$",
            accessor = self.accessor(),
            ty = ty,
            setting = quote_literal(&self.config.setting),
        ));
        Ok(statements)
    }

    pub async fn install_accessor(&self, conn: &mut PgConnection) -> Result<()> {
        for statement in self.accessor_statements()? {
            execute(conn, &statement).await?;
        }
        Ok(())
    }

    /// Scoping column of a tenant-scoped table, `None` for unscoped tables.
    pub fn scoping_column(&self, table: &TableDef) -> Option<String> {
        table
            .tenant_scope
            .as_ref()
            .map(|scope| scope.column_or(&self.config.default_column).to_string())
    }

    /// A declared scoping column must have the configured tenant type.
    pub fn validate_scope(&self, table: &TableDef) -> Result<()> {
        let Some(column) = self.scoping_column(table) else {
            return Ok(());
        };
        let Some(col) = table.get_column(&column) else {
            return Ok(());
        };
        if col.column_type.storage_type() != self.config.column_type.storage_type() {
            return Err(MigrateError::InvalidDeclaration(format!(
                "tenant column {}.{} is {} but tenant ids are {}",
                table.qualified_name(),
                column,
                col.column_type,
                self.config.column_type
            )));
        }
        Ok(())
    }

    pub fn policy(&self, table: &QualifiedName, column: &str) -> TenantPolicy {
        let accessor = self.accessor();
        TenantPolicy {
            table: table.clone(),
            column: column.to_string(),
            name: self.config.policy_name.clone(),
            predicate: format!("{} = {}", quote_ident(column), accessor),
            default_expr: accessor,
        }
    }

    /// Scoping column, its default and index, and forced row level security.
    pub fn column_statements(&self, policy: &TenantPolicy) -> Result<Vec<String>> {
        let table = qualified(&policy.table);
        let column = quote_ident(&policy.column);
        Ok(vec![
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {} DEFAULT {}",
                table,
                column,
                self.tenant_type()?,
                policy.default_expr
            ),
            format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table, column, policy.default_expr
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("{}_{}_tenant_idx", policy.table.name, policy.column)),
                table,
                column
            ),
            format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", table),
            format!("ALTER TABLE {} FORCE ROW LEVEL SECURITY", table),
        ])
    }

    /// Policy statements given the comment of the existing policy:
    /// `None` when no policy exists, `Some(None)` when it has no comment.
    pub fn policy_statements(
        &self,
        policy: &TenantPolicy,
        existing: Option<Option<String>>,
    ) -> (PolicyOutcome, Vec<String>) {
        let fingerprint = policy.fingerprint();
        let outcome = match existing {
            None => PolicyOutcome::Created,
            Some(Some(comment)) if comment == fingerprint => PolicyOutcome::Unchanged,
            Some(_) => PolicyOutcome::Replaced,
        };

        let table = qualified(&policy.table);
        let name = quote_ident(&policy.name);
        let mut statements = Vec::with_capacity(3);
        if outcome == PolicyOutcome::Replaced {
            statements.push(format!("DROP POLICY IF EXISTS {} ON {}", name, table));
        }
        if outcome != PolicyOutcome::Unchanged {
            statements.push(format!(
                "CREATE POLICY {name} ON {table} FOR ALL USING ({p}) WITH CHECK ({p})",
                name = name,
                table = table,
                p = policy.predicate
            ));
            statements.push(format!(
                "COMMENT ON POLICY {} ON {} IS {}",
                name,
                table,
                quote_literal(&fingerprint)
            ));
        }
        (outcome, statements)
    }

    /// Comment of the policy on `table`, looked up in the system catalog.
    async fn existing_policy(
        &self,
        conn: &mut PgConnection,
        policy: &TenantPolicy,
    ) -> Result<Option<Option<String>>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT obj_description(p.oid, 'pg_policy')
            FROM pg_policy p
            JOIN pg_class c ON c.oid = p.polrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND p.polname = $3
            "#,
        )
        .bind(&policy.table.schema)
        .bind(&policy.table.name)
        .bind(&policy.name)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|(comment,)| comment))
    }

    /// Everything [`TenantIsolationManager::apply_policy`] would execute,
    /// without executing it.
    pub async fn plan_policy(
        &self,
        conn: &mut PgConnection,
        table: &QualifiedName,
        column: &str,
    ) -> Result<(PolicyOutcome, Vec<String>)> {
        let policy = self.policy(table, column);
        let mut statements = self.column_statements(&policy)?;
        let existing = self.existing_policy(conn, &policy).await?;
        let (outcome, policy_statements) = self.policy_statements(&policy, existing);
        statements.extend(policy_statements);
        Ok((outcome, statements))
    }

    /// Ensure `table` is isolated on `column`. Returns the policy outcome and
    /// the statements that were executed.
    pub async fn apply_policy(
        &self,
        conn: &mut PgConnection,
        table: &QualifiedName,
        column: &str,
    ) -> Result<(PolicyOutcome, Vec<String>)> {
        let (outcome, statements) = self.plan_policy(conn, table, column).await?;
        for statement in &statements {
            execute(conn, statement).await?;
        }
        debug!(table = %table, column, ?outcome, "tenant policy applied");
        Ok((outcome, statements))
    }

    /// Set the tenant the accessor function reports on this connection.
    pub async fn set_tenant_context(
        &self,
        conn: &mut PgConnection,
        tenant: &str,
        scope: ContextScope,
    ) -> Result<()> {
        sqlx::query("SELECT set_config($1, $2, $3)")
            .bind(&self.config.setting)
            .bind(tenant)
            .bind(scope == ContextScope::Transaction)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
