//! Schema declarations.
//!
//! A plugin describes the tables it needs as a [`SchemaDeclaration`] and
//! hands it to the migrator at registration. Declarations are plain data:
//! they serialize to JSON for snapshots, and the content hash of that
//! serialization is what the ledger compares on boot.
//!
//! ```
//! use plugin_migrator::schema::{ColumnDef, SchemaDeclaration, TableDef};
//!
//! let mut schema = SchemaDeclaration::new();
//! schema.add_table(
//!     TableDef::new("widgets")
//!         .column(ColumnDef::new("id", "uuid").primary_key())
//!         .column(ColumnDef::new("name", "text").not_null()),
//! );
//! assert!(schema.validate().is_ok());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};
use crate::types::ColumnType;

/// Namespace used when a table does not name one.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Conventional scoping column for tenant-scoped tables.
pub const DEFAULT_TENANT_COLUMN: &str = "tenant_id";

/// A plugin's complete structural description of its tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDeclaration {
    /// Tables keyed by [`TableDef::key`].
    #[serde(default)]
    pub tables: BTreeMap<String, TableDef>,
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_constraints: Vec<UniqueDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckDef>,
    /// Marks the table as tenant-scoped (opt-in row isolation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_scope: Option<TenantScope>,
    /// Free-form metadata; never compared by the differ.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Builder flag consumed by [`TableDef::column`].
    #[serde(skip)]
    in_primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

/// Column default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Null,
    Bool(bool),
    Int(i64),
    /// A string literal, quoted on output.
    Text(String),
    /// A raw SQL expression such as `now()` or `gen_random_uuid()`.
    Expr(String),
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Access method (`btree`, `gin`, `hnsw`...); `btree` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Partial index predicate.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub references: TableReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ReferentialAction>,
}

/// The referenced side of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

/// A multi-column unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// A CHECK constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDef {
    pub name: String,
    pub expression: String,
}

/// Tenant scoping metadata for a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    /// Scoping column; the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

impl TenantScope {
    /// The declared column, or `default` when none was declared.
    pub fn column_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.column.as_deref().unwrap_or(default)
    }
}

impl SchemaDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a table under its qualified key, replacing any previous definition.
    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.key(), table);
    }

    /// Builder form of [`SchemaDeclaration::add_table`].
    pub fn table(mut self, table: TableDef) -> Self {
        self.add_table(table);
        self
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Lowercase hex SHA-256 of the canonical JSON form.
    ///
    /// Maps serialize in key order, so equal declarations hash equally
    /// regardless of how they were built.
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Check that the declaration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        for (key, table) in &self.tables {
            if *key != table.key() {
                return Err(MigrateError::InvalidDeclaration(format!(
                    "table key '{}' does not match table {}",
                    key,
                    table.qualified_name()
                )));
            }
            table.validate()?;
        }

        // Tables, indexes and the indexes behind primary keys and unique
        // constraints share one name space per schema.
        let mut relations: BTreeSet<(String, String)> = self
            .tables
            .values()
            .map(|t| (t.qualified_name().schema, t.name.clone()))
            .collect();
        for table in self.tables.values() {
            let schema = table.qualified_name().schema;
            for name in table.relation_names() {
                if !relations.insert((schema.clone(), name.clone())) {
                    return Err(MigrateError::InvalidDeclaration(format!(
                        "relation name '{}' on {} is already used in schema {}",
                        name,
                        table.qualified_name(),
                        schema
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find a table by qualified name.
    pub fn find(&self, name: &QualifiedName) -> Option<&TableDef> {
        self.tables.get(&name.key())
    }
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Map key: bare name in the default namespace, `schema.name` otherwise.
    pub fn key(&self) -> String {
        if self.schema == DEFAULT_NAMESPACE {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            checks: Vec::new(),
            tenant_scope: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a column. A column marked with [`ColumnDef::primary_key`] joins
    /// the table's primary key.
    pub fn column(mut self, mut col: ColumnDef) -> Self {
        if col.in_primary_key {
            col.in_primary_key = false;
            self.primary_key.push(col.name.clone());
        }
        self.columns.push(col);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.unique_constraints.push(UniqueDef {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn check(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.checks.push(CheckDef {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }

    /// Mark the table tenant-scoped on the conventional column.
    pub fn tenant_scoped(mut self) -> Self {
        self.tenant_scope = Some(TenantScope::default());
        self
    }

    /// Mark the table tenant-scoped on a specific column.
    pub fn tenant_scoped_on(mut self, column: impl Into<String>) -> Self {
        self.tenant_scope = Some(TenantScope {
            column: Some(column.into()),
        });
        self
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(
            self.schema.as_deref().unwrap_or(DEFAULT_NAMESPACE),
            self.name.clone(),
        )
    }

    pub fn key(&self) -> String {
        self.qualified_name().key()
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_name(&self) -> String {
        format!("{}_pkey", self.name)
    }

    fn validate(&self) -> Result<()> {
        let table = self.qualified_name();
        if self.name.is_empty() {
            return Err(MigrateError::InvalidDeclaration("empty table name".into()));
        }
        if self.columns.is_empty() {
            return Err(MigrateError::InvalidDeclaration(format!(
                "table {} has no columns",
                table
            )));
        }

        let mut seen = BTreeSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(MigrateError::InvalidDeclaration(format!(
                    "duplicate column {}.{}",
                    table, col.name
                )));
            }
        }

        let check_columns = |what: &str, columns: &[String]| -> Result<()> {
            if columns.is_empty() {
                return Err(MigrateError::InvalidDeclaration(format!(
                    "{} on {} lists no columns",
                    what, table
                )));
            }
            for c in columns {
                if !seen.contains(c.as_str()) {
                    return Err(MigrateError::InvalidDeclaration(format!(
                        "{} on {} references unknown column '{}'",
                        what, table, c
                    )));
                }
            }
            Ok(())
        };

        if !self.primary_key.is_empty() {
            check_columns("primary key", &self.primary_key)?;
        }
        for idx in &self.indexes {
            check_columns("index", &idx.columns)?;
        }
        for uq in &self.unique_constraints {
            check_columns("unique constraint", &uq.columns)?;
        }
        for fk in &self.foreign_keys {
            check_columns("foreign key", &fk.columns)?;
            if fk.columns.len() != fk.references.columns.len() {
                return Err(MigrateError::InvalidDeclaration(format!(
                    "foreign key on {} maps {} columns onto {}",
                    table,
                    fk.columns.len(),
                    fk.references.columns.len()
                )));
            }
        }

        let mut names = BTreeSet::new();
        for name in self.constraint_names().chain(self.index_names()) {
            if !names.insert(name.clone()) {
                return Err(MigrateError::InvalidDeclaration(format!(
                    "duplicate constraint or index name '{}' on {}",
                    name, table
                )));
            }
        }
        Ok(())
    }

    fn constraint_names(&self) -> impl Iterator<Item = String> + '_ {
        self.unique_constraints
            .iter()
            .map(|u| u.effective_name(&self.name))
            .chain(self.foreign_keys.iter().map(|f| f.effective_name(&self.name)))
            .chain(self.checks.iter().map(|c| c.name.clone()))
    }

    fn index_names(&self) -> impl Iterator<Item = String> + '_ {
        self.indexes.iter().map(|i| i.effective_name(&self.name))
    }

    /// Names of the indexes this table creates in its schema.
    fn relation_names(&self) -> impl Iterator<Item = String> + '_ {
        let pkey = (!self.primary_key.is_empty()).then(|| self.primary_key_name());
        pkey.into_iter()
            .chain(self.unique_constraints.iter().map(|u| u.effective_name(&self.name)))
            .chain(self.index_names())
    }
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<ColumnType>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            default: None,
            metadata: BTreeMap::new(),
            in_primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as (part of) the primary key when added through [`TableDef::column`].
    pub fn primary_key(mut self) -> Self {
        self.nullable = false;
        self.in_primary_key = true;
        self
    }

    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn default_expr(self, expr: impl Into<String>) -> Self {
        self.default(DefaultValue::Expr(expr.into()))
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Structural equality, ignoring metadata.
    pub fn same_shape(&self, other: &ColumnDef) -> bool {
        self.name == other.name
            && self.column_type == other.column_type
            && self.nullable == other.nullable
            && self.default == other.default
    }
}

impl IndexDef {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            method: None,
            predicate: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn using(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn effective_name(&self, table: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}_idx", table, self.columns.join("_")))
    }
}

impl ForeignKeyDef {
    pub fn new(columns: &[&str], table: impl Into<String>, ref_columns: &[&str]) -> Self {
        Self {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references: TableReference {
                schema: None,
                table: table.into(),
                columns: ref_columns.iter().map(|c| c.to_string()).collect(),
            },
            on_delete: None,
            on_update: None,
        }
    }

    /// Namespace of the referenced table.
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.references.schema = Some(schema.into());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = Some(action);
        self
    }

    pub fn effective_name(&self, table: &str) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!(
                "{}_{}_{}_fk",
                table,
                self.columns.join("_"),
                self.references.table
            )
        })
    }

    pub fn referenced_table(&self) -> QualifiedName {
        QualifiedName::new(
            self.references.schema.as_deref().unwrap_or(DEFAULT_NAMESPACE),
            self.references.table.clone(),
        )
    }
}

impl UniqueDef {
    pub fn effective_name(&self, table: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}_unique", table, self.columns.join("_")))
    }
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widgets() -> TableDef {
        TableDef::new("widgets")
            .column(ColumnDef::new("id", "uuid").primary_key())
            .column(ColumnDef::new("name", "text").not_null())
    }

    #[test]
    fn test_table_builder() {
        let table = widgets().index(IndexDef::new(&["name"]));
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert!(!table.columns[0].nullable);
        assert_eq!(table.indexes[0].effective_name("widgets"), "widgets_name_idx");
    }

    #[test]
    fn test_schema_from_json() {
        let json = r#"{
            "tables": {
                "widgets": {
                    "name": "widgets",
                    "columns": [
                        { "name": "id", "type": "uuid", "nullable": false },
                        { "name": "weight", "type": "numeric(8,2)", "default": { "int": 0 } }
                    ],
                    "primary_key": ["id"],
                    "tenant_scope": {}
                }
            }
        }"#;

        let schema = SchemaDeclaration::from_json(json).unwrap();
        let table = &schema.tables["widgets"];
        assert_eq!(table.columns[1].column_type, ColumnType::Numeric(Some((8, 2))));
        assert!(table.columns[1].nullable);
        assert_eq!(table.columns[1].default, Some(DefaultValue::Int(0)));
        let scope = table.tenant_scope.as_ref().unwrap();
        assert_eq!(scope.column, None);
        assert_eq!(scope.column_or("org_id"), "org_id");
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_qualified_keys() {
        let mut schema = SchemaDeclaration::new();
        schema.add_table(widgets().in_schema("inventory"));
        schema.add_table(widgets());
        assert!(schema.tables.contains_key("inventory.widgets"));
        assert!(schema.tables.contains_key("widgets"));
        assert!(
            schema
                .find(&QualifiedName::new("inventory", "widgets"))
                .is_some()
        );
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = SchemaDeclaration::new()
            .table(widgets())
            .table(TableDef::new("gadgets").column(ColumnDef::new("id", "int")));
        let b = SchemaDeclaration::new()
            .table(TableDef::new("gadgets").column(ColumnDef::new("id", "int")))
            .table(widgets());
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_eq!(a.content_hash().unwrap().len(), 64);

        let c = b.table(widgets().column(ColumnDef::new("weight", "real")));
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_validate_rejects_unknown_columns() {
        let schema = SchemaDeclaration::new().table(widgets().index(IndexDef::new(&["missing"])));
        assert!(matches!(
            schema.validate(),
            Err(MigrateError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let table = widgets().column(ColumnDef::new("name", "varchar"));
        let schema = SchemaDeclaration::new().table(table);
        assert!(schema.validate().is_err());

        let table = widgets()
            .index(IndexDef::new(&["name"]))
            .index(IndexDef::new(&["name"]).unique());
        assert!(SchemaDeclaration::new().table(table).validate().is_err());
    }

    #[test]
    fn test_index_names_are_unique_per_schema() {
        let gizmos = || {
            TableDef::new("gizmos")
                .column(ColumnDef::new("id", "uuid").primary_key())
                .column(ColumnDef::new("name", "text"))
        };
        let clash = SchemaDeclaration::new()
            .table(widgets().index(IndexDef::new(&["name"]).named("by_name")))
            .table(gizmos().index(IndexDef::new(&["name"]).named("by_name")));
        assert!(matches!(
            clash.validate(),
            Err(MigrateError::InvalidDeclaration(ref msg)) if msg.contains("by_name")
        ));

        let split = SchemaDeclaration::new()
            .table(widgets().index(IndexDef::new(&["name"]).named("by_name")))
            .table(
                gizmos()
                    .in_schema("inventory")
                    .index(IndexDef::new(&["name"]).named("by_name")),
            );
        assert!(split.validate().is_ok());

        let unique_vs_table = SchemaDeclaration::new()
            .table(widgets().unique(&["name"]))
            .table(TableDef::new("widgets_name_unique").column(ColumnDef::new("id", "uuid")));
        assert!(unique_vs_table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_key() {
        let mut schema = SchemaDeclaration::new();
        schema.tables.insert("gizmos".into(), widgets());
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_metadata_does_not_change_shape() {
        let a = ColumnDef::new("name", "text");
        let b = a.clone().meta("label", serde_json::json!("Name"));
        assert!(a.same_shape(&b));
        assert_ne!(a, b);
    }
}
