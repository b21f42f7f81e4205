//! plugin-migrator command-line tool.
//!
//! Applies, previews and inspects plugin schema migrations from declaration
//! files (JSON-serialized [`SchemaDeclaration`]s).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use plugin_migrator::migrator::{self, MigrationPlan};
use plugin_migrator::{
    DiffOptions, MigrateOptions, MigrationOutcome, Migrator, MigratorConfig, SchemaDeclaration,
};

#[derive(Parser)]
#[command(name = "plugin-migrator")]
#[command(version, about = "Runtime schema migrations for plugin-owned PostgreSQL tables")]
struct Cli {
    /// Database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    url: Option<String>,

    /// Config file (defaults to plugin-migrator.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tracking tables and the tenant accessor function
    Init,
    /// Migrate a plugin to the declaration in a JSON file
    Migrate {
        plugin: String,
        schema: PathBuf,
        /// Permit table and column drops
        #[arg(long)]
        allow_destructive: bool,
        /// Show the statements without applying them
        #[arg(long)]
        dry_run: bool,
        /// Log every step
        #[arg(long, short)]
        verbose: bool,
    },
    /// Show whether a plugin has been migrated
    Status { plugin: String },
    /// List the applied migrations of a plugin
    History { plugin: String },
    /// Diff two declaration files offline and print the DDL
    Plan {
        old: PathBuf,
        new: PathBuf,
        #[arg(long)]
        allow_destructive: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MigratorConfig::load(path)?,
        None => MigratorConfig::discover()?,
    };

    match cli.command {
        Commands::Plan {
            old,
            new,
            allow_destructive,
        } => {
            let previous = read_schema(&old)?;
            let next = read_schema(&new)?;
            let options = DiffOptions {
                allow_destructive,
                widening: config.widening_rules(),
                tenant_column: Some(config.tenant.default_column.clone()),
            };
            let plan = migrator::plan(Some(&previous), &next, &options)?;
            print_plan(&old, &new, &plan);
        }
        command => {
            let url = cli
                .url
                .context("no database URL: pass --url or set DATABASE_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&url)
                .await
                .context("failed to connect to database")?;
            let migrator = Migrator::new(pool, config)?;
            run(&migrator, command).await?;
        }
    }
    Ok(())
}

async fn run(migrator: &Migrator, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            migrator.initialize().await?;
            println!(
                "{} Tracking tables ready in schema {}",
                "✓".green(),
                migrator.config().migrations_schema.cyan()
            );
        }
        Commands::Migrate {
            plugin,
            schema,
            allow_destructive,
            dry_run,
            verbose,
        } => {
            let declaration = read_schema(&schema)?;
            let options = MigrateOptions {
                verbose,
                allow_destructive,
                dry_run,
            };
            migrator.initialize().await?;
            let result = migrator.migrate(&plugin, &declaration, &options).await?;
            match result.outcome {
                MigrationOutcome::UpToDate => {
                    println!("{} {} is up to date", "✓".green(), plugin.cyan());
                }
                MigrationOutcome::DryRun | MigrationOutcome::Applied => {
                    let header = if result.outcome == MigrationOutcome::DryRun {
                        "Planned".yellow()
                    } else {
                        "Applied".green()
                    };
                    println!(
                        "{} {} operations for {} (snapshot {})",
                        header.bold(),
                        result.operations.len(),
                        plugin.cyan(),
                        result.snapshot_idx.unwrap_or_default()
                    );
                    for op in &result.operations {
                        println!("  {} {}", "→".cyan(), op.describe());
                    }
                    for (table, outcome) in &result.policies {
                        println!("  {} policy on {}: {:?}", "→".cyan(), table, outcome);
                    }
                    if verbose || dry_run {
                        println!();
                        for statement in &result.statements {
                            println!("{};", statement);
                        }
                    }
                }
            }
        }
        Commands::Status { plugin } => {
            let status = migrator.status(&plugin).await?;
            if status.has_run {
                println!(
                    "{} {}: {} snapshots, last migrated {}",
                    "✓".green(),
                    plugin.cyan(),
                    status.snapshots,
                    status
                        .last_migration
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                        .yellow()
                );
            } else {
                println!("{} {} has not been migrated", "○".dimmed(), plugin.cyan());
            }
        }
        Commands::History { plugin } => {
            let steps = migrator.history(&plugin).await?;
            if steps.is_empty() {
                println!("{} No migrations recorded for {}", "○".dimmed(), plugin.cyan());
            }
            for step in steps {
                println!(
                    "  {} {}  {}  {} operations, {} statements",
                    step.tag.cyan(),
                    step.when.to_rfc3339().yellow(),
                    &step.hash[..step.hash.len().min(12)],
                    step.operations,
                    step.statements.len()
                );
            }
        }
        Commands::Plan { .. } => anyhow::bail!("plan does not use a database connection"),
    }
    Ok(())
}

fn read_schema(path: &Path) -> Result<SchemaDeclaration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    SchemaDeclaration::from_json(&content)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn print_plan(old: &Path, new: &Path, plan: &MigrationPlan) {
    println!("{}", "Migration plan (dry-run)".cyan().bold());
    println!(
        "  {} → {}",
        old.display().to_string().yellow(),
        new.display().to_string().yellow()
    );
    println!();

    if plan.operations.is_empty() {
        println!("{}", "✓ No changes - declarations are identical".green());
        return;
    }
    for (i, op) in plan.operations.iter().enumerate() {
        println!("  {}. {}", i + 1, op.describe());
    }
    println!();
    for statement in &plan.statements {
        println!("{};", statement.cyan());
    }
}
