use colored::Colorize;

use crate::cli::Cli;
use crate::error::Result;
use crate::manager::PageManager;
use crate::snapshot::SnapshotOptions;

pub async fn run(
    cli: &Cli,
    url: &str,
    interactive: bool,
    compact: bool,
    max_depth: Option<usize>,
    selector: Option<String>,
) -> Result<()> {
    let manager = cli.manager()?;
    let options = SnapshotOptions {
        interactive,
        max_depth,
        compact,
        selector,
    };

    let result = snapshot(cli, &manager, url, &options).await;
    if let Err(e) = manager.close_all().await {
        tracing::warn!("Failed to close browser: {}", e);
    }
    result
}

async fn snapshot(
    cli: &Cli,
    manager: &PageManager,
    url: &str,
    options: &SnapshotOptions,
) -> Result<()> {
    let page = manager.open(url).await?;
    let view = manager.snapshot(&page, options).await?;
    let current_url = manager.url(&page).await?;
    let title = manager.title(&page).await?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "page": page,
                "url": current_url,
                "title": title,
                "generation": view.generation,
                "ref_count": view.ref_count,
                "tree": view.tree,
            })
        );
    } else {
        let title = if title.is_empty() {
            "(untitled)".to_string()
        } else {
            title
        };
        println!("{} {}", "✓".green(), title.bold());
        println!("  {}", current_url.dimmed());
        println!(
            "  {}",
            format!("{} ref(s), generation {}", view.ref_count, view.generation).dimmed()
        );
        println!();
        println!("{}", view.tree);
    }

    Ok(())
}
