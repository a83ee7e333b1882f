//! Operator commands, meant to be mounted as a subcommand of an application
//! binary:
//!
//! ```ignore
//! #[derive(Parser)]
//! struct Cli {
//!     #[command(subcommand)]
//!     migrate: MigrateCommand,
//! }
//!
//! let output = Cli::parse().migrate.run(&view_schema).await?;
//! println!("{output}");
//! ```

use clap::{Args, Subcommand};

use crate::{error::Result, view_schema::ViewSchema};

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum MigrateCommand {
    /// Migrates the projectors while the app is running. Run `offline` after
    /// this successfully completed.
    Online,
    /// Migrates the events inserted while `online` was running. No events may
    /// be written while it runs.
    Offline,
    /// Shows the current status of the migrations
    Status,
    /// Prints the current version in the database
    CurrentVersion,
    /// Returns whether a migration is currently running
    CheckRunning,
    /// Returns whether a migration is pending
    CheckPending,
    /// Replays a slice of the events through matching projectors without
    /// writing anything
    Dryrun(DryrunArgs),
    /// Creates the view schema metadata tables if they do not exist
    CreateViewSchema,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct DryrunArgs {
    /// Glob matched against projector names
    #[arg(long)]
    pub pattern: Option<String>,
    /// Defaults to the schema's `dryrun_group_exponent`
    #[arg(long)]
    pub group_exponent: Option<u32>,
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub offset: Option<usize>,
}

impl MigrateCommand {
    /// Runs the command and returns what to print to the operator.
    pub async fn run(&self, schema: &ViewSchema) -> Result<String> {
        match self {
            MigrateCommand::Online => {
                schema.migrate_online().await?;

                Ok(format!(
                    "Online migration to version {} done",
                    schema.migrations().target()
                ))
            }
            MigrateCommand::Offline => {
                schema.migrate_offline().await?;

                Ok(format!(
                    "Current version in the database is: {}",
                    schema.current_version().await?
                ))
            }
            MigrateCommand::Status => {
                schema.create_view_schema_if_not_exists().await?;

                Ok(schema.status().await?.to_string())
            }
            MigrateCommand::CurrentVersion => {
                schema.create_view_schema_if_not_exists().await?;

                Ok(format!(
                    "Current version in the database is: {}",
                    schema.current_version().await?
                ))
            }
            MigrateCommand::CheckRunning => {
                schema.create_view_schema_if_not_exists().await?;

                match schema.ledger().version_currently_migrating().await? {
                    Some(target) => Ok(format!(
                        "Migration is running, current version: {},\ntarget version {target}",
                        schema.current_version().await?
                    )),
                    _ => Ok("No running migrations".to_owned()),
                }
            }
            MigrateCommand::CheckPending => {
                schema.create_view_schema_if_not_exists().await?;

                let current = schema.current_version().await?;
                let pending = schema.migrations().target();

                if pending != current {
                    Ok(format!(
                        "Migration is pending, current version: {current},\npending version: {pending}"
                    ))
                } else {
                    Ok("No pending migrations".to_owned())
                }
            }
            MigrateCommand::Dryrun(args) => {
                let dryrun = schema
                    .migrate_dryrun(
                        args.pattern.as_deref(),
                        args.group_exponent
                            .unwrap_or(schema.config().dryrun_group_exponent),
                        args.limit,
                        args.offset,
                    )
                    .await?;

                Ok(format!(
                    "Dry run of [{}]: {} events, {} records in {:.2} s",
                    dryrun.projectors.join(", "),
                    dryrun.events,
                    dryrun.records,
                    dryrun.elapsed.as_secs_f64()
                ))
            }
            MigrateCommand::CreateViewSchema => {
                schema.create_view_schema_if_not_exists().await?;

                Ok("View schema created".to_owned())
            }
        }
    }
}
