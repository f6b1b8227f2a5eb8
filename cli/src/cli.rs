//! CLI argument parsing with clap derive

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_common::Verdict;
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppFlags, BehaviourFlags, OutputFlags};
use crate::commands;

/// Lock-guarded infrastructure convergence and container rollout
#[derive(Parser)]
#[command(
    name = "keel",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output (any non-empty `NO_COLOR` also disables it)
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    /// Log progress details to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the infrastructure changes a deploy would make
    Plan(commands::plan::PlanArgs),

    /// Converge infrastructure and roll out the workload
    Deploy(commands::deploy::DeployArgs),

    /// Tear down the resources recorded for a target
    Destroy(commands::deploy::DestroyArgs),

    /// Approve a run waiting for approval
    Approve(commands::approve::DecisionArgs),

    /// Reject a run waiting for approval
    Reject(commands::approve::DecisionArgs),

    /// Show stored state, lock and recent runs of a target
    Status(commands::status::StatusArgs),

    /// Remove a target lock
    Unlock(commands::unlock::UnlockArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails before producing a result.
    pub async fn run(self, cancel: CancellationToken) -> Result<ExitCode> {
        let Cli {
            json,
            quiet,
            no_color,
            verbose: _,
            command,
        } = self;
        let yes = match &command {
            Command::Destroy(args) => args.yes,
            Command::Unlock(args) => args.yes,
            _ => false,
        };
        let app = AppContext::new(
            &AppFlags {
                output: OutputFlags {
                    no_color,
                    quiet,
                    json,
                },
                behaviour: BehaviourFlags { yes },
            },
            cancel,
        )?;

        match command {
            Command::Plan(args) => commands::plan::run(&app, args).await,
            Command::Deploy(args) => commands::deploy::deploy(&app, args).await,
            Command::Destroy(args) => commands::deploy::destroy(&app, args).await,
            Command::Approve(args) => commands::approve::run(&app, args, Verdict::Approved).await,
            Command::Reject(args) => commands::approve::run(&app, args, Verdict::Rejected).await,
            Command::Status(args) => commands::status::run(&app, args).await,
            Command::Unlock(args) => commands::unlock::run(&app, args).await,
            Command::Config(cmd) => commands::config::run(&app, cmd),
            Command::Version => commands::version::run(&app),
        }
    }
}
