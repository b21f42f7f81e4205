//! Migrator configuration.
//!
//! Loaded from `plugin-migrator.toml` in the working directory, or from
//! `<config dir>/plugin-migrator/config.toml`; every key has a default.
//!
//! ```toml
//! migrations_schema = "migrations"
//! lock_timeout_ms = 30000
//!
//! [tenant]
//! setting = "app.tenant_id"
//! accessor_name = "current_tenant_id"
//!
//! [widening]
//! allow = [["json", "jsonb"]]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::schema::DEFAULT_TENANT_COLUMN;
use crate::types::{ColumnType, WideningRules};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Namespace holding the snapshot, journal and ledger tables.
    pub migrations_schema: String,
    /// Upper bound on waiting for a plugin's migration lock.
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub tenant: TenantConfig,
    pub widening: WideningConfig,
}

/// Tenant isolation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Namespace of the accessor function.
    pub accessor_schema: String,
    /// Name of the session-scoped "current tenant" function.
    pub accessor_name: String,
    /// Run-time setting the accessor reads (`current_setting(...)`).
    pub setting: String,
    /// Scoping column used when a table does not name one.
    pub default_column: String,
    /// Type of scoping columns and of the accessor's return value.
    pub column_type: ColumnType,
    pub policy_name: String,
}

/// Extra type widenings beyond the built-in table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WideningConfig {
    /// `[from_family, to_family]` pairs.
    pub allow: Vec<(String, String)>,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            migrations_schema: "migrations".to_string(),
            lock_timeout_ms: 30_000,
            lock_poll_interval_ms: 100,
            tenant: TenantConfig::default(),
            widening: WideningConfig::default(),
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            accessor_schema: "public".to_string(),
            accessor_name: "current_tenant_id".to_string(),
            setting: "app.tenant_id".to_string(),
            default_column: DEFAULT_TENANT_COLUMN.to_string(),
            column_type: ColumnType::Uuid,
            policy_name: "tenant_isolation_policy".to_string(),
        }
    }
}

impl MigratorConfig {
    /// Project-local config file name.
    pub const FILE_NAME: &'static str = "plugin-migrator.toml";

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MigrateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load the first config file found, or the defaults.
    pub fn discover() -> Result<Self> {
        match Self::search_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(Self::FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("plugin-migrator").join("config.toml"));
        }
        paths
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }

    pub fn widening_rules(&self) -> WideningRules {
        self.widening
            .allow
            .iter()
            .fold(WideningRules::new(), |rules, (from, to)| rules.allow(from.clone(), to.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            ("migrations_schema", &self.migrations_schema),
            ("tenant.accessor_schema", &self.tenant.accessor_schema),
            ("tenant.accessor_name", &self.tenant.accessor_name),
            ("tenant.default_column", &self.tenant.default_column),
            ("tenant.policy_name", &self.tenant.policy_name),
        ];
        for (key, value) in names {
            if value.is_empty() {
                return Err(MigrateError::Config(format!("{} must not be empty", key)));
            }
        }
        // Custom settings must be namespaced ("app.tenant_id").
        if !self.tenant.setting.contains('.') {
            return Err(MigrateError::Config(format!(
                "tenant.setting '{}' must contain a '.'",
                self.tenant.setting
            )));
        }
        if self.tenant.column_type.native_type().is_none() {
            return Err(MigrateError::Config(format!(
                "tenant.column_type '{}' is not a known type",
                self.tenant.column_type
            )));
        }
        Ok(())
    }
}
