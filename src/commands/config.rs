use std::path::Path;

use colored::Colorize;

use crate::cli::{Cli, ConfigCommands};
use crate::config::Config;
use crate::error::{PagewrightError, Result};

pub async fn run(cli: &Cli, command: &ConfigCommands) -> Result<()> {
    let path = Config::config_path();
    match command {
        ConfigCommands::Show => show(cli, &path),
        ConfigCommands::Set { key, value } => set(cli, &path, key, value),
        ConfigCommands::Get { key } => get(cli, &path, key),
        ConfigCommands::Edit => edit(&path),
        ConfigCommands::Path => show_path(cli, &path),
    }
}

fn show(cli: &Cli, path: &Path) -> Result<()> {
    let config = Config::load_from(path)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if !path.exists() {
        eprintln!(
            "{} {} does not exist, showing built-in defaults",
            "!".yellow(),
            path.display()
        );
    }
    let rendered =
        toml::to_string_pretty(&config).map_err(|e| PagewrightError::ConfigError(e.to_string()))?;
    println!("{}", rendered.trim_end());
    Ok(())
}

fn set(cli: &Cli, path: &Path, key: &str, value: &str) -> Result<()> {
    let mut config = Config::load_from(path)?;
    let previous = config.get_key(key)?;
    config.set_key(key, value)?;
    config.save_to(path)?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "key": key, "value": value, "previous": previous })
        );
    } else {
        match previous {
            Some(old) if old != value => {
                println!("{} {} = {} {}", "✓".green(), key, value, format!("(was {})", old).dimmed())
            }
            _ => println!("{} {} = {}", "✓".green(), key, value),
        }
    }
    Ok(())
}

fn get(cli: &Cli, path: &Path, key: &str) -> Result<()> {
    let value = Config::load_from(path)?.get_key(key)?;

    if cli.json {
        println!("{}", serde_json::json!({ "key": key, "value": value }));
    } else {
        println!(
            "{}",
            value.unwrap_or_else(|| "(not set)".dimmed().to_string())
        );
    }
    Ok(())
}

fn edit(path: &Path) -> Result<()> {
    if !path.exists() {
        Config::default().save_to(path)?;
    }

    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    tracing::debug!("editing {} with {}", path.display(), editor);

    let status = std::process::Command::new(&editor)
        .arg(path)
        .status()
        .map_err(|e| PagewrightError::Other(format!("Failed to start {}: {}", editor, e)))?;
    if !status.success() {
        return Err(PagewrightError::Other(format!("{} exited with {}", editor, status)));
    }

    // Reject edits that no longer parse.
    Config::load_from(path)?;
    println!("{} Saved {}", "✓".green(), path.display());
    Ok(())
}

fn show_path(cli: &Cli, path: &Path) -> Result<()> {
    let exists = path.exists();

    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "exists": exists })
        );
    } else if exists {
        println!("{}", path.display());
    } else {
        println!("{} {}", path.display(), "(not created yet)".dimmed());
    }
    Ok(())
}
