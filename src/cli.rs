use clap::{Args, Parser, Subcommand};
use reconcile::ManagerKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Apply and roll back software templates on running workstations", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/strata/config.toml)
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Capture the current state of an instance
    Inspect {
        /// Instance id from the config
        instance: String,
    },

    /// Show what applying a template would change
    Diff(DiffArgs),

    /// Apply a template to one or more instances
    Apply(ApplyArgs),

    /// Restore an instance to a checkpoint
    Rollback(RollbackArgs),

    /// Show the layer history of an instance
    Layers {
        /// Instance id from the config
        instance: String,

        /// Include checkpoints
        #[arg(long)]
        checkpoints: bool,
    },
}

#[derive(Args)]
pub struct DiffArgs {
    /// Instance id from the config
    pub instance: String,

    /// Template file (.toml or .json)
    #[arg(short, long)]
    pub template: PathBuf,

    /// Treat downgrades as planned work instead of conflicts
    #[arg(long)]
    pub force: bool,

    /// Manager for `system` packages
    #[arg(long, value_name = "MANAGER")]
    pub package_manager: Option<ManagerKind>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Instance ids from the config
    #[arg(required = true)]
    pub instances: Vec<String>,

    /// Template file (.toml or .json)
    #[arg(short, long)]
    pub template: PathBuf,

    /// Only inspect and diff
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Apply despite blocking conflicts
    #[arg(long)]
    pub force: bool,

    /// Keep going after a failed step instead of rolling back
    #[arg(long)]
    pub continue_on_error: bool,

    /// Manager for `system` packages
    #[arg(long, value_name = "MANAGER")]
    pub package_manager: Option<ManagerKind>,

    /// Delete home directories if a rollback removes users
    #[arg(long)]
    pub delete_home_on_rollback: bool,

    /// Parallel instances (default: `workers` from the config)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Instance id from the config
    pub instance: String,

    /// Checkpoint id (see `strata layers --checkpoints`)
    pub checkpoint: String,

    /// Delete home directories of removed users
    #[arg(long)]
    pub delete_home: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::parse_from([
            "strata",
            "-vv",
            "apply",
            "ws-1",
            "ws-2",
            "--template",
            "cuda-ml.toml",
            "--package-manager",
            "dnf",
            "--jobs",
            "2",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.instances, vec!["ws-1", "ws-2"]);
        assert_eq!(args.package_manager, Some(ManagerKind::Dnf));
        assert_eq!(args.jobs, Some(2));
        assert!(!args.dry_run);
    }

    #[test]
    fn test_apply_needs_an_instance() {
        assert!(Cli::try_parse_from(["strata", "apply", "--template", "t.toml"]).is_err());
    }
}
