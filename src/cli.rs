use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use crate::browser::MemoryEngine;
use crate::commands;
use crate::config::Config;
use crate::error::Result;
use crate::manager::PageManager;

/// pagewright - Accessibility snapshots, stable element refs and live screencasts for browser agents
#[derive(Parser)]
#[command(name = "pagewright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Browser executable path (overrides auto-discovery)
    #[arg(long, env = "PAGEWRIGHT_BROWSER_PATH", global = true)]
    pub browser_path: Option<String>,

    /// CDP port or WebSocket URL of a running browser
    #[arg(long, env = "PAGEWRIGHT_CDP", global = true)]
    pub cdp: Option<String>,

    /// Run in headless mode
    #[arg(long, env = "PAGEWRIGHT_HEADLESS", global = true)]
    pub headless: bool,

    /// Browser engine to drive
    #[arg(long, value_enum, env = "PAGEWRIGHT_ENGINE", default_value = "cdp", global = true)]
    pub engine: EngineKind,

    /// JSON pages served by the memory engine
    #[arg(long, env = "PAGEWRIGHT_FIXTURES", global = true)]
    pub fixtures: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Chromium over the DevTools protocol
    Cdp,
    /// In-process simulated browser
    Memory,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a URL and print its accessibility snapshot
    Snapshot {
        /// URL to open
        url: String,

        /// Only interactive elements and their context
        #[arg(short, long)]
        interactive: bool,

        /// Hoist unnamed wrappers
        #[arg(short, long)]
        compact: bool,

        /// Maximum tree depth
        #[arg(short = 'd', long)]
        max_depth: Option<usize>,

        /// Scope to the subtree of a CSS selector
        #[arg(short, long)]
        selector: Option<String>,
    },

    /// Run a JSON-lines command script (reads stdin when SCRIPT is omitted or "-")
    Run {
        /// Script file
        script: Option<PathBuf>,

        /// Continue after a failed command
        #[arg(long)]
        keep_going: bool,

        /// Directory that receives screencast frames as image files
        #[arg(long)]
        frames_dir: Option<PathBuf>,
    },

    /// Show detected browsers and connection settings
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key (e.g. browser.cdp_port)
        key: String,
        /// Configuration value
        value: String,
    },

    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Edit configuration file
    Edit,

    /// Show configuration file path
    Path,
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Snapshot {
                url,
                interactive,
                compact,
                max_depth,
                selector,
            } => {
                commands::snapshot::run(
                    self,
                    url,
                    *interactive,
                    *compact,
                    *max_depth,
                    selector.clone(),
                )
                .await
            }
            Commands::Run {
                script,
                keep_going,
                frames_dir,
            } => {
                commands::run::run(self, script.as_deref(), *keep_going, frames_dir.clone()).await
            }
            Commands::Status => commands::status::run(self).await,
            Commands::Config { command } => commands::config::run(self, command).await,
        }
    }

    /// Stored configuration with command-line overrides applied.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        if let Some(path) = &self.browser_path {
            config.browser.executable = Some(path.clone());
        }
        if let Some(cdp) = &self.cdp {
            config.browser.cdp = Some(cdp.clone());
        }
        if self.headless {
            config.browser.headless = true;
        }
        Ok(config)
    }

    pub fn manager(&self) -> Result<PageManager> {
        let config = self.load_config()?;
        match self.engine {
            EngineKind::Cdp => Ok(PageManager::new(config)),
            EngineKind::Memory => {
                let engine = MemoryEngine::new();
                if let Some(path) = &self.fixtures {
                    let pages = engine.load_fixtures(path)?;
                    tracing::debug!("Loaded {} fixture page(s) from {}", pages, path.display());
                }
                Ok(PageManager::with_engine(Arc::new(engine), config))
            }
        }
    }
}
