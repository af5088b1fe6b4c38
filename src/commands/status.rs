use colored::Colorize;

use crate::browser::discover_all_browsers;
use crate::cli::{Cli, EngineKind};
use crate::config::Config;
use crate::error::Result;

pub async fn run(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    let browsers: Vec<_> = discover_all_browsers()
        .into_iter()
        .map(|b| b.with_version())
        .collect();
    let engine = match cli.engine {
        EngineKind::Cdp => "cdp",
        EngineKind::Memory => "memory",
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "config_path": Config::config_path().display().to_string(),
                "engine": engine,
                "cdp": config.browser.cdp,
                "cdp_port": config.browser.cdp_port,
                "headless": config.browser.headless,
                "browsers": browsers,
            }))?
        );
        return Ok(());
    }

    println!("{}", "Connection:".bold());
    println!("  {} Engine: {}", "●".cyan(), engine);
    match &config.browser.cdp {
        Some(endpoint) => println!("  {} CDP endpoint: {}", "✓".green(), endpoint),
        None => println!(
            "  {} Launches a browser on port {}{}",
            "○".dimmed(),
            config.browser.cdp_port,
            if config.browser.headless {
                " (headless)"
            } else {
                ""
            }
        ),
    }
    println!(
        "  {} Config: {}",
        "●".cyan(),
        Config::config_path().display().to_string().dimmed()
    );
    println!();

    println!("{}", "Detected Browsers:".bold());
    if browsers.is_empty() {
        println!("  {} No browsers found", "!".yellow());
    } else {
        for browser in browsers {
            println!(
                "  {} {} {}",
                "✓".green(),
                browser.browser_type.name(),
                browser
                    .version
                    .map(|v| format!("(v{})", v))
                    .unwrap_or_default()
                    .dimmed()
            );
            println!("    {}", browser.path.display().to_string().dimmed());
        }
    }

    Ok(())
}
