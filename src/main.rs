use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pcc::config::PccConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "pcc")]
#[command(version, about = "Project control center for autonomous coding agents")]
pub struct Cli {
    /// Path to pcc.toml (defaults to .pcc/pcc.toml)
    #[arg(long, global = true, env = "PCC_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path, overriding [store] db_path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the config file, database and artifact directories
    Init,
    /// Run the HTTP control plane
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Register or list projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Import work orders from a markdown file or a directory of them
    Import {
        path: PathBuf,
        #[arg(short, long)]
        project: String,
    },
    /// Start a run for a ready work order and wait for it to finish
    Enqueue {
        work_item_id: String,
        /// Print the enqueue outcome without waiting
        #[arg(long)]
        no_wait: bool,
    },
    /// Print the portfolio summary as JSON
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    Add {
        name: String,
        path: String,
        #[arg(long)]
        id: Option<String>,
        /// 1 is the highest priority
        #[arg(long, default_value = "3")]
        priority: u8,
        #[arg(long)]
        test_command: Option<String>,
        #[arg(long)]
        requires_vm: bool,
    },
    List,
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigCommands {
    Show,
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config =
        PccConfig::load(cli.config.as_deref())?.with_cli_args(cli.db_path.clone(), cli.verbose);
    let _log_guard = pcc::logging::init(&config)?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Serve { host, port } => cmd::cmd_serve(config, host, port).await?,
        Commands::Project { command } => cmd::cmd_project(&config, command).await?,
        Commands::Import { path, project } => cmd::cmd_import(&config, &path, &project).await?,
        Commands::Enqueue {
            work_item_id,
            no_wait,
        } => cmd::cmd_enqueue(&config, &work_item_id, !no_wait).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }
    Ok(())
}
