use std::path::{Path, PathBuf};

use colored::Colorize;
use tokio::io::AsyncReadExt;

use crate::cli::Cli;
use crate::error::{PagewrightError, Result};
use crate::script::ScriptRunner;

pub async fn run(
    cli: &Cli,
    script: Option<&Path>,
    keep_going: bool,
    frames_dir: Option<PathBuf>,
) -> Result<()> {
    let source = read_script(script).await?;
    let manager = cli.manager()?;

    let summary = ScriptRunner::new(&manager)
        .keep_going(keep_going)
        .frames_dir(frames_dir)
        .run(&source, |outcome| match serde_json::to_string(outcome) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode result of line {}: {}", outcome.line, e),
        })
        .await;

    if let Err(e) = manager.close_all().await {
        tracing::warn!("Failed to close browser: {}", e);
    }

    if !cli.json {
        let mark = if summary.failures == 0 {
            "✓".green()
        } else {
            "✗".red()
        };
        eprintln!(
            "{} {} command(s), {} failed",
            mark, summary.commands, summary.failures
        );
    }

    if summary.failures > 0 {
        return Err(PagewrightError::Other(format!(
            "{} of {} command(s) failed",
            summary.failures, summary.commands
        )));
    }
    Ok(())
}

async fn read_script(script: Option<&Path>) -> Result<String> {
    match script {
        Some(path) if path != Path::new("-") => Ok(tokio::fs::read_to_string(path).await?),
        _ => {
            let mut source = String::new();
            tokio::io::stdin().read_to_string(&mut source).await?;
            Ok(source)
        }
    }
}
