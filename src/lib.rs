//! Runtime schema migrations and tenant row isolation for plugin-owned
//! PostgreSQL tables.
//!
//! Each plugin declares the tables it needs as a [`SchemaDeclaration`]. At
//! boot the [`Migrator`] compares that declaration with the plugin's last
//! recorded snapshot, generates the DDL that bridges the two, and applies it
//! together with the bookkeeping writes in a single transaction. There are
//! no migration files.
//!
//! # Example
//! ```no_run
//! use plugin_migrator::prelude::*;
//! use sqlx::PgPool;
//!
//! async fn boot(pool: PgPool) -> plugin_migrator::Result<()> {
//!     let migrator = Migrator::new(pool, MigratorConfig::default())?;
//!     migrator.initialize().await?;
//!
//!     let schema = SchemaDeclaration::new().table(
//!         TableDef::new("orders")
//!             .column(ColumnDef::new("id", "uuid").primary_key())
//!             .column(ColumnDef::new("total", "numeric(12,2)").not_null())
//!             .tenant_scoped(),
//!     );
//!     let result = migrator
//!         .migrate("billing", &schema, &MigrateOptions::default())
//!         .await?;
//!     println!("{:?}: {} statements", result.outcome, result.statements.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ddl;
pub mod diff;
pub mod error;
pub mod migrator;
pub mod registry;
pub mod schema;
pub mod store;
pub mod tenant;
pub mod types;

pub use config::MigratorConfig;
pub use diff::{diff, ChangeOperation, DiffOptions};
pub use error::{MigrateError, Result};
pub use migrator::{MigrateOptions, MigrationOutcome, MigrationResult, Migrator};
pub use registry::PluginSchema;
pub use schema::{ColumnDef, SchemaDeclaration, TableDef};
pub use store::MigrationStatus;
pub use tenant::{ContextScope, TenantIsolationManager};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{MigratorConfig, TenantConfig};
    pub use crate::diff::{ChangeOperation, DiffOptions};
    pub use crate::migrator::{MigrateOptions, MigrationOutcome, MigrationResult, Migrator};
    pub use crate::registry::PluginSchema;
    pub use crate::schema::{
        CheckDef, ColumnDef, DefaultValue, ForeignKeyDef, IndexDef, ReferentialAction,
        SchemaDeclaration, TableDef,
    };
    pub use crate::tenant::{ContextScope, PolicyOutcome, TenantIsolationManager};
    pub use crate::types::ColumnType;
}
