use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::storage;

pub mod commands;

use self::commands::{DraftCommand, ListArgs, QueueCommand, SetArgs, ShowArgs};

#[derive(Parser, Debug)]
#[command(
    name = "triagesync",
    version,
    about = "Correct email classifications with conflict-safe saves"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over TRIAGESYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over TRIAGESYNC_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List records with their current classification (default)
    List(ListArgs),
    /// Show one record and the values each field accepts
    Show(ShowArgs),
    /// Change one field of a record with a version-checked save
    Set(SetArgs),
    /// Inspect or drain the offline queue
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Inspect or discard the recovered draft
    #[command(subcommand)]
    Draft(DraftCommand),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?.with_editor(&config.editor);

    let config = Arc::new(config);
    let command = cli
        .command
        .unwrap_or(Commands::List(ListArgs::default()));
    match command {
        Commands::List(args) => commands::list_records(&storage, args),
        Commands::Show(args) => commands::show_record(&storage, args),
        Commands::Set(args) => commands::set_field(config, storage, args).await,
        Commands::Queue(cmd) => commands::handle_queue_command(config, storage, cmd).await,
        Commands::Draft(cmd) => commands::handle_draft_command(config, storage, cmd),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
