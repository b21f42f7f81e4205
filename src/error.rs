//! Error types for plugin migrations.

use thiserror::Error;

/// Errors that can occur while planning or applying a plugin migration.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// The diff drops a table or column and `allow_destructive` was not set.
    #[error("destructive change rejected: {operation} (set allow_destructive to permit)")]
    DestructiveChangeRejected { operation: String },

    /// A column type change is not an information-preserving widening.
    #[error("incompatible type change for {table}.{column}: {from} -> {to}")]
    IncompatibleTypeChange {
        table: String,
        column: String,
        from: String,
        to: String,
    },

    /// A generated statement failed; the enclosing transaction was rolled back.
    #[error("statement failed: {statement}: {source}")]
    StatementExecutionFailed {
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    /// A stored snapshot does not deserialize into a valid declaration.
    #[error("snapshot {idx} for plugin '{plugin}' is corrupt: {reason}")]
    SnapshotCorrupt {
        plugin: String,
        idx: i32,
        reason: String,
    },

    /// The per-plugin migration lock was not acquired in time.
    #[error("timed out after {waited_ms}ms waiting for migration lock of plugin '{plugin}'")]
    LockTimeout { plugin: String, waited_ms: u64 },

    /// A previously tenant-scoped table lost its tenant scope.
    #[error("table {table} is tenant-scoped and cannot drop its tenant scope")]
    TenantScopeRemoved { table: String },

    /// The declaration is structurally inconsistent.
    #[error("invalid schema declaration: {0}")]
    InvalidDeclaration(String),

    /// No native type is known for a semantic column type.
    #[error("unknown column type '{type_name}' for {table}.{column}")]
    UnknownColumnType {
        table: String,
        column: String,
        type_name: String,
    },

    /// Declared plugin dependencies form a cycle.
    #[error("plugin dependency cycle involving: {}", plugins.join(", "))]
    DependencyCycle { plugins: Vec<String> },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error outside of a generated statement
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
