//! Cross-plugin ordering.
//!
//! Plugins may reference each other's tables through foreign keys, so a
//! batch of registrations is migrated in dependency order: explicit
//! `depends_on` names plus the owners of referenced tables. Independent
//! plugins keep their registration order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::schema::SchemaDeclaration;

/// A plugin's registration: its name, declaration and explicit dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSchema {
    pub name: String,
    pub schema: SchemaDeclaration,
    pub depends_on: Vec<String>,
}

impl PluginSchema {
    pub fn new(name: impl Into<String>, schema: SchemaDeclaration) -> Self {
        Self {
            name: name.into(),
            schema,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, plugin: impl Into<String>) -> Self {
        self.depends_on.push(plugin.into());
        self
    }
}

/// Order plugins so that every plugin follows the plugins it depends on.
pub fn order_plugins(plugins: &[PluginSchema]) -> Result<Vec<&PluginSchema>> {
    let position: BTreeMap<&str, usize> = plugins
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    // table key -> owning plugin index
    let mut owners = BTreeMap::new();
    for (i, plugin) in plugins.iter().enumerate() {
        for key in plugin.schema.tables.keys() {
            owners.insert(key.clone(), i);
        }
    }

    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); plugins.len()];
    for (i, plugin) in plugins.iter().enumerate() {
        for name in &plugin.depends_on {
            match position.get(name.as_str()) {
                Some(&j) if j != i => {
                    deps[i].insert(j);
                }
                Some(_) => {}
                None => warn!(plugin = %plugin.name, dependency = %name, "ignoring unknown plugin dependency"),
            }
        }
        for table in plugin.schema.tables.values() {
            for fk in &table.foreign_keys {
                if let Some(&j) = owners.get(&fk.referenced_table().key())
                    && j != i
                {
                    deps[i].insert(j);
                }
            }
        }
    }

    let mut done = vec![false; plugins.len()];
    let mut ordered = Vec::with_capacity(plugins.len());
    while ordered.len() < plugins.len() {
        let next = (0..plugins.len())
            .find(|&i| !done[i] && deps[i].iter().all(|&j| done[j]));
        match next {
            Some(i) => {
                done[i] = true;
                ordered.push(&plugins[i]);
            }
            None => {
                let plugins = plugins
                    .iter()
                    .zip(&done)
                    .filter(|(_, done)| !**done)
                    .map(|(p, _)| p.name.clone())
                    .collect();
                return Err(MigrateError::DependencyCycle { plugins });
            }
        }
    }
    Ok(ordered)
}
