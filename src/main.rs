use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use revsync::app::App;
use revsync::commands::{self, Command};
use revsync::config::Config;
use revsync::logging;

#[derive(Parser, Debug)]
#[command(name = "revsync")]
#[command(about = "Cached command-line client for a code-review server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/revsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = match logging::default_log_dir().and_then(|dir| logging::init(&dir)) {
    Ok(guard) => Some(guard),
    Err(_) => {
      logging::init_stderr()?;
      None
    }
  };

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let mut app = App::new(config)?;
  commands::run(&mut app, args.command).await?;

  Ok(())
}
