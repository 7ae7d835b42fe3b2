//! Command-line runner for quillbase change logs.
//!
//! ```text
//! quillbase --database app.db --changelog db/changelog.yaml update
//! quillbase --database app.db --changelog db/changelog.yaml rollback --count 1
//! quillbase --database app.db diff --baseline schema.yaml --output db/generated.yaml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use quillbase::{
    ChangeLog, ChangeRegistry, ChangeSetFailure, Migrator, MigratorConfig, PartialApplyWarning,
    SchemaSnapshot,
};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quillbase")]
#[command(about = "Apply, roll back and inspect SQLite change logs")]
#[command(version)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "QUILLBASE_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Root change-log document (YAML or JSON)
    #[arg(long, env = "QUILLBASE_CHANGELOG", global = true)]
    changelog: Option<PathBuf>,

    /// Migrator settings file (YAML or JSON)
    #[arg(long, env = "QUILLBASE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the change sets an update would apply
    Status,

    /// Apply pending change sets
    Update {
        /// Apply at most this many change sets
        #[arg(long)]
        count: Option<usize>,
    },

    /// Reverse applied change sets, newest first
    #[command(group(ArgGroup::new("target").required(true).args(["count", "tag"])))]
    Rollback {
        /// Number of change sets to reverse
        #[arg(long)]
        count: Option<usize>,

        /// Reverse everything applied after the change set carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show what a rollback would reverse without running it
    PreviewRollback {
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Show applied change sets
    History {
        /// Show every tracking row, including failures and rollbacks
        #[arg(long)]
        all: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Check recorded checksums against the change log
    Validate,

    /// Record every pending change set as ran without executing it
    ChangelogSync,

    /// Clear a lock left behind by a crashed run
    ReleaseLocks,

    /// Write the live schema to a snapshot file
    Snapshot {
        #[arg(long)]
        output: PathBuf,
    },

    /// Compare the live schema against a snapshot
    Diff {
        /// Snapshot file to compare against
        #[arg(long)]
        baseline: PathBuf,

        /// Write a change log turning the baseline into the live schema
        #[arg(long)]
        output: Option<PathBuf>,

        /// Author of the generated change sets
        #[arg(long, default_value = "quillbase")]
        author: String,

        /// Id prefix of the generated change sets
        #[arg(long, default_value = "diff")]
        prefix: String,
    },

    /// Drop every table and view, including the tracking tables
    DropAll {
        #[arg(long, default_value = "main")]
        schema: String,

        /// Required; there is no undo
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => MigratorConfig::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => MigratorConfig::default(),
    };

    match &cli.command {
        Command::Status => {
            let migrator = load_migrator(&cli, config)?;
            let conn = open_database(&cli)?;
            let pending = migrator.status(&conn)?;
            if pending.is_empty() {
                println!("Database is up to date.");
            } else {
                println!("Pending change sets ({}):", pending.len());
                for planned in pending {
                    println!("  {} ({:?})", planned.change_set.key, planned.action);
                }
            }
        }
        Command::Update { count } => {
            let migrator = load_migrator(&cli, config)?;
            let mut conn = open_database(&cli)?;
            let report = match count {
                Some(count) => migrator.update_count(&mut conn, *count)?,
                None => migrator.update(&mut conn)?,
            };
            for key in &report.executed {
                println!("  applied     {}", key);
            }
            for key in &report.marked_ran {
                println!("  marked ran  {}", key);
            }
            for key in &report.skipped {
                println!("  skipped     {}", key);
            }
            for failure in &report.failed {
                println!("  failed      {}: {}", failure.key, failure.error);
            }
            println!(
                "Applied {} change set(s).",
                report.executed.len() + report.marked_ran.len()
            );
            return Ok(finish(
                report.failing_change_set.as_ref(),
                &report.warnings,
                report.cancelled,
            ));
        }
        Command::Rollback { count, tag } => {
            let migrator = load_migrator(&cli, config)?;
            let mut conn = open_database(&cli)?;
            let report = match (count, tag) {
                (_, Some(tag)) => migrator.rollback_to_tag(&mut conn, tag)?,
                (Some(count), None) => migrator.rollback(&mut conn, *count)?,
                (None, None) => bail!("either --count or --tag is required"),
            };
            for key in &report.rolled_back {
                println!("  rolled back {}", key);
            }
            println!("Rolled back {} change set(s).", report.rolled_back.len());
            return Ok(finish(
                report.failing_change_set.as_ref(),
                &report.warnings,
                report.cancelled,
            ));
        }
        Command::PreviewRollback { count } => {
            let migrator = load_migrator(&cli, config)?;
            let conn = open_database(&cli)?;
            let plan = migrator.preview_rollback(&conn, *count)?;
            if plan.is_empty() {
                println!("Nothing to roll back.");
            }
            for planned in plan {
                if planned.mark_only {
                    println!("  {} (marker only)", planned.record.key);
                    continue;
                }
                println!("  {}", planned.record.key);
                for change in &planned.changes {
                    println!("      {}", migrator.registry().describe(change));
                }
            }
        }
        Command::History { all, format } => {
            let migrator = load_migrator(&cli, config)?;
            let conn = open_database(&cli)?;
            let records = if *all {
                migrator.history(&conn)?
            } else {
                migrator.list_executed(&conn)?
            };
            let rows = quillbase::project(&records);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&rows)?),
                OutputFormat::Text => {
                    if rows.is_empty() {
                        println!("No change sets recorded.");
                    }
                    for row in rows {
                        println!(
                            "  {}  {:<11}  {}::{}::{}{}",
                            row.date_executed.format("%Y-%m-%d %H:%M:%S"),
                            row.exec_type,
                            row.change_log,
                            row.id,
                            row.author,
                            row.tag.map(|t| format!("  [{}]", t)).unwrap_or_default()
                        );
                    }
                }
            }
        }
        Command::Validate => {
            let migrator = load_migrator(&cli, config)?;
            let conn = open_database(&cli)?;
            migrator.validate(&conn)?;
            println!("Change log is consistent with the database.");
        }
        Command::ChangelogSync => {
            let migrator = load_migrator(&cli, config)?;
            let mut conn = open_database(&cli)?;
            let synced = migrator.changelog_sync(&mut conn)?;
            println!("Marked {} change set(s) as ran.", synced.len());
        }
        Command::ReleaseLocks => {
            let conn = open_database(&cli)?;
            if schema_only_migrator(config).release_locks(&conn)? {
                println!("Released the change log lock.");
            } else {
                println!("The change log lock was not held.");
            }
        }
        Command::Snapshot { output } => {
            let conn = open_database(&cli)?;
            let snapshot = schema_only_migrator(config).snapshot(&conn)?;
            snapshot.save(output)?;
            println!(
                "Wrote {} table(s) to {}.",
                snapshot.tables.len(),
                output.display()
            );
        }
        Command::Diff {
            baseline,
            output,
            author,
            prefix,
        } => {
            let conn = open_database(&cli)?;
            let baseline = SchemaSnapshot::load(baseline)?;
            let diff = schema_only_migrator(config).diff(&conn, &baseline)?;
            if diff.is_empty() {
                println!("No differences.");
                return Ok(ExitCode::SUCCESS);
            }
            for object in &diff.added {
                println!("  + {}", object);
            }
            for object in &diff.removed {
                println!("  - {}", object);
            }
            for object in &diff.changed {
                println!("  ~ {}", object);
            }
            if let Some(output) = output {
                let generated = diff.write_change_log(output, author, prefix)?;
                println!(
                    "Wrote {} change set(s) to {}.",
                    generated.change_sets.len(),
                    output.display()
                );
            }
        }
        Command::DropAll { schema, force } => {
            if !force {
                bail!("drop-all deletes every table and view; pass --force to confirm");
            }
            let mut conn = open_database(&cli)?;
            let dropped = schema_only_migrator(config).drop_all(&mut conn, schema)?;
            println!("Dropped {} object(s).", dropped.len());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_migrator(cli: &Cli, config: MigratorConfig) -> anyhow::Result<Migrator> {
    let Some(path) = &cli.changelog else {
        bail!("no change log given; pass --changelog or set QUILLBASE_CHANGELOG");
    };
    let migrator = Migrator::from_file(path)
        .with_context(|| format!("Failed to parse change log {}", path.display()))?;
    Ok(migrator.with_config(config))
}

/// A migrator for commands that never plan change sets.
fn schema_only_migrator(config: MigratorConfig) -> Migrator {
    Migrator::new(ChangeLog::default(), ChangeRegistry::builtin()).with_config(config)
}

fn open_database(cli: &Cli) -> anyhow::Result<Connection> {
    let Some(path) = &cli.database else {
        bail!("no database given; pass --database or set QUILLBASE_DATABASE");
    };
    open_at(path)
}

fn open_at(path: &Path) -> anyhow::Result<Connection> {
    tracing::debug!(database = %path.display(), "Opening database");
    Connection::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Report how a run ended and pick the exit code.
fn finish(
    failure: Option<&ChangeSetFailure>,
    warnings: &[PartialApplyWarning],
    cancelled: bool,
) -> ExitCode {
    for warning in warnings {
        eprintln!("Warning: {}", warning);
    }
    if cancelled {
        eprintln!("Run cancelled before completion.");
    }
    match failure {
        Some(failure) => {
            eprintln!("Change set {} failed: {}", failure.key, failure.error);
            ExitCode::FAILURE
        }
        None if !warnings.is_empty() => ExitCode::FAILURE,
        None => ExitCode::SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rollback_requires_a_target() {
        assert!(Cli::try_parse_from(["quillbase", "rollback"]).is_err());
        let cli = Cli::try_parse_from(["quillbase", "rollback", "--tag", "v1", "--database", "a.db"]).unwrap();
        assert!(matches!(cli.command, Command::Rollback { tag: Some(_), .. }));
    }

    #[test]
    fn drop_all_needs_force() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = dir.path().join("app.db");
        let cli = Cli::try_parse_from([
            "quillbase",
            "--database",
            database.to_str().unwrap(),
            "drop-all",
        ])
        .unwrap();
        assert!(run(cli).is_err());
    }

    #[test]
    fn update_then_status_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let changelog = dir.path().join("changelog.yaml");
        std::fs::write(
            &changelog,
            "databaseChangeLog:\n  - changeSet: { id: 1, author: a, changes: [ { sql: { sql: \"CREATE TABLE t (id INTEGER)\" } } ] }\n",
        )
        .unwrap();
        let database = dir.path().join("app.db");
        let args = |command: &str| {
            Cli::try_parse_from([
                "quillbase",
                "--database",
                database.to_str().unwrap(),
                "--changelog",
                changelog.to_str().unwrap(),
                command,
            ])
            .unwrap()
        };

        run(args("update")).unwrap();
        run(args("validate")).unwrap();

        let conn = open_at(&database).unwrap();
        let migrator = Migrator::from_file(&changelog).unwrap();
        assert!(migrator.status(&conn).unwrap().is_empty());
    }
}
