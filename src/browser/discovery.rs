use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::error::{PagewrightError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrowserType {
    Chrome,
    Brave,
    Edge,
    Chromium,
}

impl BrowserType {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserType::Chrome => "Google Chrome",
            BrowserType::Brave => "Brave",
            BrowserType::Edge => "Microsoft Edge",
            BrowserType::Chromium => "Chromium",
        }
    }

    /// Executable names looked up on `PATH` when no well-known location exists.
    fn path_names(&self) -> &'static [&'static str] {
        match self {
            BrowserType::Chrome => &["google-chrome", "google-chrome-stable", "chrome"],
            BrowserType::Brave => &["brave-browser", "brave"],
            BrowserType::Edge => &["microsoft-edge", "msedge"],
            BrowserType::Chromium => &["chromium", "chromium-browser"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserInfo {
    pub browser_type: BrowserType,
    pub path: PathBuf,
    pub version: Option<String>,
}

impl BrowserInfo {
    pub fn new(browser_type: BrowserType, path: PathBuf) -> Self {
        Self {
            browser_type,
            path,
            version: None,
        }
    }

    pub fn with_version(mut self) -> Self {
        self.version = detect_version(&self.path);
        self
    }
}

/// The highest-priority Chromium-family browser installed.
pub fn discover_browser() -> Result<BrowserInfo> {
    discover_all_browsers()
        .into_iter()
        .next()
        .ok_or(PagewrightError::BrowserNotFound)
}

/// Every installed Chromium-family browser, one per type, in priority order.
pub fn discover_all_browsers() -> Vec<BrowserInfo> {
    let mut found = Vec::new();

    for (browser_type, paths) in browser_candidates() {
        let installed = paths
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists())
            .or_else(|| {
                browser_type
                    .path_names()
                    .iter()
                    .find_map(|name| which::which(name).ok())
            });

        if let Some(path) = installed {
            found.push(BrowserInfo::new(browser_type, path).with_version());
        }
    }

    found
}

fn browser_candidates() -> Vec<(BrowserType, Vec<&'static str>)> {
    #[cfg(target_os = "macos")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                ],
            ),
            (
                BrowserType::Brave,
                vec!["/Applications/Brave Browser.app/Contents/MacOS/Brave Browser"],
            ),
            (
                BrowserType::Edge,
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"],
            ),
            (
                BrowserType::Chromium,
                vec!["/Applications/Chromium.app/Contents/MacOS/Chromium"],
            ),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    "/usr/bin/google-chrome",
                    "/usr/bin/google-chrome-stable",
                    "/opt/google/chrome/chrome",
                ],
            ),
            (
                BrowserType::Brave,
                vec!["/usr/bin/brave-browser", "/usr/bin/brave"],
            ),
            (
                BrowserType::Edge,
                vec!["/usr/bin/microsoft-edge", "/usr/bin/microsoft-edge-stable"],
            ),
            (
                BrowserType::Chromium,
                vec![
                    "/usr/bin/chromium",
                    "/usr/bin/chromium-browser",
                    "/snap/bin/chromium",
                ],
            ),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ],
            ),
            (
                BrowserType::Brave,
                vec![r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe"],
            ),
            (
                BrowserType::Edge,
                vec![
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                ],
            ),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        vec![]
    }
}

/// Version from `<browser> --version`, e.g. "Google Chrome 120.0.6099.109" -> "120.0.6099.109".
fn detect_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_version(&String::from_utf8_lossy(&output.stdout))
}

fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|word| word.chars().next().is_some_and(|c| c.is_ascii_digit()) && word.contains('.'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_picks_dotted_number() {
        assert_eq!(
            parse_version("Google Chrome 120.0.6099.109 \n").as_deref(),
            Some("120.0.6099.109")
        );
        assert_eq!(
            parse_version("Chromium 119.0.6045.105 built on Debian").as_deref(),
            Some("119.0.6045.105")
        );
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn discovery_is_ordered_by_priority() {
        let order: Vec<BrowserType> = browser_candidates().into_iter().map(|(t, _)| t).collect();
        if let Some(first) = order.first() {
            assert_eq!(*first, BrowserType::Chrome);
        }
    }
}
