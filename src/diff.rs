//! Schema differ.
//!
//! Compares two declarations and produces the ordered list of structural
//! changes that turns the first into the second. The differ is pure: it
//! never looks at the live database, only at the previous snapshot.
//!
//! Operations are grouped into phases so that every statement only depends
//! on structures created earlier in the list:
//!
//! 1. drop foreign keys, other constraints, then indexes
//! 2. drop columns, then tables (referencing tables first)
//! 3. create tables (referenced tables first)
//! 4. add columns, alter columns
//! 5. add primary/unique/check constraints, then foreign keys, then indexes

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::schema::{
    CheckDef, ColumnDef, DefaultValue, ForeignKeyDef, IndexDef, QualifiedName, SchemaDeclaration,
    TableDef, UniqueDef, DEFAULT_TENANT_COLUMN,
};
use crate::types::{ColumnType, WideningRules};

/// One atomic structural difference between two schema states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    /// Columns and primary key only; secondary structures follow as
    /// separate operations.
    CreateTable { table: TableDef },
    DropTable { table: QualifiedName },
    AddColumn {
        table: QualifiedName,
        column: ColumnDef,
    },
    DropColumn {
        table: QualifiedName,
        column: String,
    },
    AlterColumnType {
        table: QualifiedName,
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    AlterColumnNullability {
        table: QualifiedName,
        column: String,
        nullable: bool,
    },
    AlterColumnDefault {
        table: QualifiedName,
        column: String,
        default: Option<DefaultValue>,
    },
    AddIndex {
        table: QualifiedName,
        index: IndexDef,
    },
    DropIndex { table: QualifiedName, name: String },
    AddConstraint {
        table: QualifiedName,
        constraint: Constraint,
    },
    DropConstraint { table: QualifiedName, name: String },
}

/// A table constraint with its name resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    PrimaryKey { name: String, columns: Vec<String> },
    Unique(UniqueDef),
    ForeignKey(ForeignKeyDef),
    Check(CheckDef),
}

impl Constraint {
    pub fn name(&self) -> &str {
        match self {
            Constraint::PrimaryKey { name, .. } => name,
            Constraint::Unique(u) => u.name.as_deref().unwrap_or_default(),
            Constraint::ForeignKey(f) => f.name.as_deref().unwrap_or_default(),
            Constraint::Check(c) => &c.name,
        }
    }
}

impl ChangeOperation {
    /// The table this operation applies to.
    pub fn table(&self) -> QualifiedName {
        match self {
            ChangeOperation::CreateTable { table } => table.qualified_name(),
            ChangeOperation::DropTable { table }
            | ChangeOperation::AddColumn { table, .. }
            | ChangeOperation::DropColumn { table, .. }
            | ChangeOperation::AlterColumnType { table, .. }
            | ChangeOperation::AlterColumnNullability { table, .. }
            | ChangeOperation::AlterColumnDefault { table, .. }
            | ChangeOperation::AddIndex { table, .. }
            | ChangeOperation::DropIndex { table, .. }
            | ChangeOperation::AddConstraint { table, .. }
            | ChangeOperation::DropConstraint { table, .. } => table.clone(),
        }
    }

    /// Whether applying the operation loses stored data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ChangeOperation::DropTable { .. } | ChangeOperation::DropColumn { .. }
        )
    }

    /// Short human-readable description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            ChangeOperation::CreateTable { table } => {
                format!("create table {}", table.qualified_name())
            }
            ChangeOperation::DropTable { table } => format!("drop table {}", table),
            ChangeOperation::AddColumn { table, column } => {
                format!("add column {}.{}", table, column.name)
            }
            ChangeOperation::DropColumn { table, column } => {
                format!("drop column {}.{}", table, column)
            }
            ChangeOperation::AlterColumnType {
                table,
                column,
                from,
                to,
            } => format!("alter column {}.{} type {} -> {}", table, column, from, to),
            ChangeOperation::AlterColumnNullability {
                table,
                column,
                nullable,
            } => format!(
                "alter column {}.{} {}",
                table,
                column,
                if *nullable { "drop not null" } else { "set not null" }
            ),
            ChangeOperation::AlterColumnDefault { table, column, .. } => {
                format!("alter column {}.{} default", table, column)
            }
            ChangeOperation::AddIndex { table, index } => {
                format!("add index {} on {}", index.effective_name(&table.name), table)
            }
            ChangeOperation::DropIndex { table, name } => {
                format!("drop index {} on {}", name, table)
            }
            ChangeOperation::AddConstraint { table, constraint } => {
                format!("add constraint {} on {}", constraint.name(), table)
            }
            ChangeOperation::DropConstraint { table, name } => {
                format!("drop constraint {} on {}", name, table)
            }
        }
    }
}

/// Differ settings.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Permit table and column drops.
    pub allow_destructive: bool,
    pub widening: WideningRules,
    /// Scoping column of tables that do not name one; [`DEFAULT_TENANT_COLUMN`]
    /// when unset.
    pub tenant_column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    DropForeignKeys,
    DropConstraints,
    DropIndexes,
    DropColumns,
    DropTables,
    CreateTables,
    AddColumns,
    AlterColumns,
    AddConstraints,
    AddForeignKeys,
    AddIndexes,
}

#[derive(Default)]
struct Plan {
    phases: BTreeMap<Phase, Vec<ChangeOperation>>,
}

impl Plan {
    fn push(&mut self, phase: Phase, op: ChangeOperation) {
        self.phases.entry(phase).or_default().push(op);
    }

    fn into_ops(self) -> Vec<ChangeOperation> {
        self.phases.into_values().flatten().collect()
    }
}

/// Compute the ordered change operations from `previous` (absent on a
/// plugin's first run) to `next`.
pub fn diff(
    previous: Option<&SchemaDeclaration>,
    next: &SchemaDeclaration,
    options: &DiffOptions,
) -> Result<Vec<ChangeOperation>> {
    let empty = SchemaDeclaration::default();
    let previous = previous.unwrap_or(&empty);
    let mut plan = Plan::default();

    let dropped: Vec<&TableDef> = previous
        .tables
        .iter()
        .filter(|(key, _)| !next.tables.contains_key(*key))
        .map(|(_, table)| table)
        .collect();
    for table in topo_order(&dropped).into_iter().rev() {
        plan.push(
            Phase::DropTables,
            ChangeOperation::DropTable {
                table: table.qualified_name(),
            },
        );
    }

    let created: Vec<&TableDef> = next
        .tables
        .iter()
        .filter(|(key, _)| !previous.tables.contains_key(*key))
        .map(|(_, table)| table)
        .collect();
    for table in topo_order(&created) {
        create_table(table, &mut plan);
    }

    for (key, new) in &next.tables {
        if let Some(old) = previous.tables.get(key) {
            diff_table(old, new, options, &mut plan)?;
        }
    }

    let ops = plan.into_ops();
    if !options.allow_destructive
        && let Some(op) = ops.iter().find(|op| op.is_destructive())
    {
        return Err(MigrateError::DestructiveChangeRejected {
            operation: op.describe(),
        });
    }
    Ok(ops)
}

/// Tables that an operation list creates or alters (drops excluded).
pub fn touched_tables(ops: &[ChangeOperation]) -> BTreeSet<QualifiedName> {
    ops.iter()
        .filter(|op| !matches!(op, ChangeOperation::DropTable { .. }))
        .map(|op| op.table())
        .collect()
}

fn create_table(table: &TableDef, plan: &mut Plan) {
    let name = table.qualified_name();
    let mut bare = table.clone();
    bare.indexes.clear();
    bare.foreign_keys.clear();
    bare.unique_constraints.clear();
    bare.checks.clear();
    plan.push(Phase::CreateTables, ChangeOperation::CreateTable { table: bare });

    for uq in &table.unique_constraints {
        plan.push(
            Phase::AddConstraints,
            add_constraint(&name, Constraint::Unique(named_unique(uq, &table.name))),
        );
    }
    for check in &table.checks {
        plan.push(
            Phase::AddConstraints,
            add_constraint(&name, Constraint::Check(check.clone())),
        );
    }
    for fk in &table.foreign_keys {
        plan.push(
            Phase::AddForeignKeys,
            add_constraint(&name, Constraint::ForeignKey(named_fk(fk, &table.name))),
        );
    }
    for index in &table.indexes {
        plan.push(Phase::AddIndexes, add_index(&name, index, &table.name));
    }
}

fn diff_table(old: &TableDef, new: &TableDef, options: &DiffOptions, plan: &mut Plan) -> Result<()> {
    let name = new.qualified_name();

    if old.tenant_scope.is_some() && new.tenant_scope.is_none() {
        return Err(MigrateError::TenantScopeRemoved {
            table: name.to_string(),
        });
    }

    // Scoping columns belong to the tenant manager and outlive their declaration.
    let default_column = options.tenant_column.as_deref().unwrap_or(DEFAULT_TENANT_COLUMN);
    let managed: Vec<&str> = [&old.tenant_scope, &new.tenant_scope]
        .into_iter()
        .flatten()
        .map(|scope| scope.column_or(default_column))
        .collect();

    for col in &old.columns {
        if new.get_column(&col.name).is_none() && !managed.contains(&col.name.as_str()) {
            plan.push(
                Phase::DropColumns,
                ChangeOperation::DropColumn {
                    table: name.clone(),
                    column: col.name.clone(),
                },
            );
        }
    }

    for col in &new.columns {
        let Some(prev) = old.get_column(&col.name) else {
            plan.push(
                Phase::AddColumns,
                ChangeOperation::AddColumn {
                    table: name.clone(),
                    column: col.clone(),
                },
            );
            continue;
        };

        if prev.column_type != col.column_type {
            if !options.widening.is_safe(&prev.column_type, &col.column_type) {
                return Err(MigrateError::IncompatibleTypeChange {
                    table: name.to_string(),
                    column: col.name.clone(),
                    from: prev.column_type.to_string(),
                    to: col.column_type.to_string(),
                });
            }
            plan.push(
                Phase::AlterColumns,
                ChangeOperation::AlterColumnType {
                    table: name.clone(),
                    column: col.name.clone(),
                    from: prev.column_type.clone(),
                    to: col.column_type.clone(),
                },
            );
        }
        if prev.nullable != col.nullable {
            plan.push(
                Phase::AlterColumns,
                ChangeOperation::AlterColumnNullability {
                    table: name.clone(),
                    column: col.name.clone(),
                    nullable: col.nullable,
                },
            );
        }
        if prev.default != col.default {
            plan.push(
                Phase::AlterColumns,
                ChangeOperation::AlterColumnDefault {
                    table: name.clone(),
                    column: col.name.clone(),
                    default: col.default.clone(),
                },
            );
        }
    }

    if old.primary_key != new.primary_key {
        if !old.primary_key.is_empty() {
            plan.push(
                Phase::DropConstraints,
                ChangeOperation::DropConstraint {
                    table: name.clone(),
                    name: old.primary_key_name(),
                },
            );
        }
        if !new.primary_key.is_empty() {
            plan.push(
                Phase::AddConstraints,
                add_constraint(
                    &name,
                    Constraint::PrimaryKey {
                        name: new.primary_key_name(),
                        columns: new.primary_key.clone(),
                    },
                ),
            );
        }
    }

    let old_uniques = keyed(&old.unique_constraints, |u| u.effective_name(&old.name));
    let new_uniques = keyed(&new.unique_constraints, |u| u.effective_name(&new.name));
    let (removed, added) = changed(&old_uniques, &new_uniques, |a, b| a.columns == b.columns);
    for key in removed {
        plan.push(Phase::DropConstraints, drop_constraint(&name, key));
    }
    for uq in added {
        plan.push(
            Phase::AddConstraints,
            add_constraint(&name, Constraint::Unique(named_unique(uq, &new.name))),
        );
    }

    let old_checks = keyed(&old.checks, |c| c.name.clone());
    let new_checks = keyed(&new.checks, |c| c.name.clone());
    let (removed, added) = changed(&old_checks, &new_checks, |a, b| a == b);
    for key in removed {
        plan.push(Phase::DropConstraints, drop_constraint(&name, key));
    }
    for check in added {
        plan.push(
            Phase::AddConstraints,
            add_constraint(&name, Constraint::Check(check.clone())),
        );
    }

    let old_fks = keyed(&old.foreign_keys, |f| f.effective_name(&old.name));
    let new_fks = keyed(&new.foreign_keys, |f| f.effective_name(&new.name));
    let (removed, added) = changed(&old_fks, &new_fks, |a, b| {
        named_fk(a, &old.name) == named_fk(b, &new.name)
    });
    for key in removed {
        plan.push(Phase::DropForeignKeys, drop_constraint(&name, key));
    }
    for fk in added {
        plan.push(
            Phase::AddForeignKeys,
            add_constraint(&name, Constraint::ForeignKey(named_fk(fk, &new.name))),
        );
    }

    let old_indexes = keyed(&old.indexes, |i| i.effective_name(&old.name));
    let new_indexes = keyed(&new.indexes, |i| i.effective_name(&new.name));
    let (removed, added) = changed(&old_indexes, &new_indexes, |a, b| {
        a.columns == b.columns
            && a.unique == b.unique
            && a.method == b.method
            && a.predicate == b.predicate
    });
    for key in removed {
        plan.push(
            Phase::DropIndexes,
            ChangeOperation::DropIndex {
                table: name.clone(),
                name: key.to_string(),
            },
        );
    }
    for index in added {
        plan.push(Phase::AddIndexes, add_index(&name, index, &new.name));
    }

    Ok(())
}

fn keyed<T>(items: &[T], key: impl Fn(&T) -> String) -> BTreeMap<String, &T> {
    items.iter().map(|item| (key(item), item)).collect()
}

/// Names to drop and definitions to add, where a changed definition under
/// the same name counts as both.
fn changed<'a, T>(
    old: &'a BTreeMap<String, &'a T>,
    new: &'a BTreeMap<String, &'a T>,
    same: impl Fn(&T, &T) -> bool,
) -> (Vec<&'a str>, Vec<&'a T>) {
    let mut removed = Vec::new();
    for (key, prev) in old {
        match new.get(key) {
            Some(next) if same(prev, next) => {}
            _ => removed.push(key.as_str()),
        }
    }
    let mut added = Vec::new();
    for (key, next) in new {
        match old.get(key) {
            Some(prev) if same(prev, next) => {}
            _ => added.push(*next),
        }
    }
    (removed, added)
}

fn named_unique(uq: &UniqueDef, table: &str) -> UniqueDef {
    UniqueDef {
        name: Some(uq.effective_name(table)),
        columns: uq.columns.clone(),
    }
}

fn named_fk(fk: &ForeignKeyDef, table: &str) -> ForeignKeyDef {
    let mut fk = fk.clone();
    fk.name = Some(fk.effective_name(table));
    fk
}

fn add_constraint(table: &QualifiedName, constraint: Constraint) -> ChangeOperation {
    ChangeOperation::AddConstraint {
        table: table.clone(),
        constraint,
    }
}

fn drop_constraint(table: &QualifiedName, name: &str) -> ChangeOperation {
    ChangeOperation::DropConstraint {
        table: table.clone(),
        name: name.to_string(),
    }
}

fn add_index(table: &QualifiedName, index: &IndexDef, table_name: &str) -> ChangeOperation {
    let mut index = index.clone();
    index.name = Some(index.effective_name(table_name));
    ChangeOperation::AddIndex {
        table: table.clone(),
        index,
    }
}

/// Order tables so that foreign-key targets come before the tables that
/// reference them. Only references inside `tables` count; ties break on
/// key order, and any cycle is appended in key order.
fn topo_order<'a>(tables: &[&'a TableDef]) -> Vec<&'a TableDef> {
    let by_key: BTreeMap<String, &TableDef> = tables.iter().map(|t| (t.key(), *t)).collect();
    let mut pending: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (key, table) in &by_key {
        let deps = table
            .foreign_keys
            .iter()
            .map(|fk| fk.referenced_table().key())
            .filter(|dep| dep != key && by_key.contains_key(dep))
            .collect();
        pending.insert(key.clone(), deps);
    }

    let mut ordered = Vec::with_capacity(by_key.len());
    loop {
        let ready = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(key, _)| key.clone());
        let Some(key) = ready else { break };
        pending.remove(&key);
        for deps in pending.values_mut() {
            deps.remove(&key);
        }
        ordered.push(by_key[&key]);
    }
    ordered.extend(pending.keys().map(|key| by_key[key]));
    ordered
}
