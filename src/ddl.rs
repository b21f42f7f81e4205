//! DDL generation for PostgreSQL.
//!
//! Maps each [`ChangeOperation`] to one or more statements, preserving the
//! differ's order. Statements are guarded (`IF NOT EXISTS`, `IF EXISTS`, or a
//! catalog check for constraints) so that re-running them after a partial
//! history does not fail.

use std::collections::BTreeSet;

use crate::diff::{ChangeOperation, Constraint};
use crate::error::{MigrateError, Result};
use crate::schema::{ColumnDef, DefaultValue, IndexDef, QualifiedName, DEFAULT_NAMESPACE};
use crate::types::ColumnType;

/// Generate the statements for an ordered operation list.
pub fn generate(ops: &[ChangeOperation]) -> Result<Vec<String>> {
    let mut statements = Vec::with_capacity(ops.len());
    let mut namespaces = BTreeSet::new();
    for op in ops {
        generate_one(op, &mut namespaces, &mut statements)?;
    }
    Ok(statements)
}

/// Non-default namespaces that the statements for `ops` create.
pub fn created_namespaces(ops: &[ChangeOperation]) -> BTreeSet<String> {
    ops.iter()
        .filter_map(|op| match op {
            ChangeOperation::CreateTable { table } => Some(table.qualified_name().schema),
            _ => None,
        })
        .filter(|schema| schema != DEFAULT_NAMESPACE)
        .collect()
}

fn generate_one(
    op: &ChangeOperation,
    namespaces: &mut BTreeSet<String>,
    out: &mut Vec<String>,
) -> Result<()> {
    match op {
        ChangeOperation::CreateTable { table } => {
            let name = table.qualified_name();
            if name.schema != DEFAULT_NAMESPACE && namespaces.insert(name.schema.clone()) {
                out.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&name.schema)));
            }
            let mut parts = Vec::with_capacity(table.columns.len() + 1);
            for col in &table.columns {
                parts.push(column_sql(&name, col)?);
            }
            if !table.primary_key.is_empty() {
                parts.push(format!(
                    "CONSTRAINT {} PRIMARY KEY ({})",
                    quote_ident(&table.primary_key_name()),
                    column_list(&table.primary_key)
                ));
            }
            out.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
                qualified(&name),
                parts.join(",\n    ")
            ));
        }
        ChangeOperation::DropTable { table } => {
            out.push(format!("DROP TABLE IF EXISTS {}", qualified(table)));
        }
        ChangeOperation::AddColumn { table, column } => {
            out.push(format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                qualified(table),
                column_sql(table, column)?
            ));
        }
        ChangeOperation::DropColumn { table, column } => {
            out.push(format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                qualified(table),
                quote_ident(column)
            ));
        }
        ChangeOperation::AlterColumnType { table, column, to, .. } => {
            let native = storage_type(table, column, to)?;
            out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {col} SET DATA TYPE {ty} USING {col}::{ty}",
                qualified(table),
                col = quote_ident(column),
                ty = native
            ));
        }
        ChangeOperation::AlterColumnNullability {
            table,
            column,
            nullable,
        } => {
            out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} {}",
                qualified(table),
                quote_ident(column),
                if *nullable { "DROP NOT NULL" } else { "SET NOT NULL" }
            ));
        }
        ChangeOperation::AlterColumnDefault {
            table,
            column,
            default,
        } => {
            let action = match default {
                Some(value) => format!("SET DEFAULT {}", render_default(value)),
                None => "DROP DEFAULT".to_string(),
            };
            out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} {}",
                qualified(table),
                quote_ident(column),
                action
            ));
        }
        ChangeOperation::AddIndex { table, index } => {
            out.push(index_sql(table, index)?);
        }
        ChangeOperation::DropIndex { table, name } => {
            out.push(format!(
                "DROP INDEX IF EXISTS {}.{}",
                quote_ident(&table.schema),
                quote_ident(name)
            ));
        }
        ChangeOperation::AddConstraint { table, constraint } => {
            out.push(add_constraint_sql(table, constraint));
        }
        ChangeOperation::DropConstraint { table, name } => {
            out.push(format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                qualified(table),
                quote_ident(name)
            ));
        }
    }
    Ok(())
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"schema"."table"`
pub fn qualified(name: &QualifiedName) -> String {
    format!("{}.{}", quote_ident(&name.schema), quote_ident(&name.name))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn native_type(table: &QualifiedName, column: &str, ty: &ColumnType) -> Result<String> {
    ty.native_type().ok_or_else(|| unknown_type(table, column, ty))
}

fn storage_type(table: &QualifiedName, column: &str, ty: &ColumnType) -> Result<String> {
    ty.storage_type().ok_or_else(|| unknown_type(table, column, ty))
}

fn unknown_type(table: &QualifiedName, column: &str, ty: &ColumnType) -> MigrateError {
    MigrateError::UnknownColumnType {
        table: table.to_string(),
        column: column.to_string(),
        type_name: ty.to_string(),
    }
}

fn column_sql(table: &QualifiedName, col: &ColumnDef) -> Result<String> {
    let mut sql = format!(
        "{} {}",
        quote_ident(&col.name),
        native_type(table, &col.name, &col.column_type)?
    );
    if !col.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&render_default(default));
    }
    Ok(sql)
}

fn render_default(value: &DefaultValue) -> String {
    match value {
        DefaultValue::Null => "NULL".to_string(),
        DefaultValue::Bool(b) => b.to_string(),
        DefaultValue::Int(n) => n.to_string(),
        DefaultValue::Text(s) => quote_literal(s),
        DefaultValue::Expr(expr) => expr.clone(),
    }
}

fn index_sql(table: &QualifiedName, index: &IndexDef) -> Result<String> {
    let method = index.method.as_deref().unwrap_or("btree");
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MigrateError::InvalidDeclaration(format!(
            "invalid index method '{}' on {}",
            method, table
        )));
    }
    let mut sql = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} USING {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.effective_name(&table.name)),
        qualified(table),
        method,
        column_list(&index.columns)
    );
    if let Some(predicate) = &index.predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    Ok(sql)
}

fn constraint_body(constraint: &Constraint) -> String {
    match constraint {
        Constraint::PrimaryKey { columns, .. } => format!("PRIMARY KEY ({})", column_list(columns)),
        Constraint::Unique(uq) => format!("UNIQUE ({})", column_list(&uq.columns)),
        Constraint::ForeignKey(fk) => {
            let mut sql = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                column_list(&fk.columns),
                qualified(&fk.referenced_table()),
                column_list(&fk.references.columns)
            );
            if let Some(action) = fk.on_delete {
                sql.push_str(" ON DELETE ");
                sql.push_str(action.as_sql());
            }
            if let Some(action) = fk.on_update {
                sql.push_str(" ON UPDATE ");
                sql.push_str(action.as_sql());
            }
            sql
        }
        Constraint::Check(check) => format!("CHECK ({})", check.expression),
    }
}

/// PostgreSQL has no `ADD CONSTRAINT IF NOT EXISTS`; guard on the catalog.
fn add_constraint_sql(table: &QualifiedName, constraint: &Constraint) -> String {
    format!(
        "DO $migrate$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = {name_lit} AND conrelid = to_regclass({table_lit})) THEN ALTER TABLE {table} ADD CONSTRAINT {name} {body}; END IF; END $migrate$",
        name_lit = quote_literal(constraint.name()),
        table_lit = quote_literal(&qualified(table)),
        table = qualified(table),
        name = quote_ident(constraint.name()),
        body = constraint_body(constraint)
    )
}
