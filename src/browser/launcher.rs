use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;

use super::discovery::{discover_browser, BrowserInfo, BrowserType};
use crate::config::BrowserConfig;
use crate::error::{PagewrightError, Result};

/// Starts a Chromium-family browser with remote debugging enabled.
pub struct BrowserLauncher {
    browser_info: BrowserInfo,
    cdp_port: u16,
    headless: bool,
    user_data_dir: PathBuf,
    window_size: (u32, u32),
    extra_args: Vec<String>,
}

impl BrowserLauncher {
    pub fn from_config(config: &BrowserConfig) -> Result<Self> {
        let browser_info = match &config.executable {
            Some(path) => {
                let path = PathBuf::from(shellexpand::tilde(path).as_ref());
                if !path.exists() {
                    return Err(PagewrightError::BrowserLaunchFailed(format!(
                        "Browser not found at: {}",
                        path.display()
                    )));
                }
                // Any Chromium-family executable speaks the same protocol.
                BrowserInfo::new(BrowserType::Chrome, path)
            }
            None => discover_browser()?,
        };

        let user_data_dir = match &config.user_data_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pagewright")
                .join("profile"),
        };

        Ok(Self {
            browser_info,
            cdp_port: config.cdp_port,
            headless: config.headless,
            user_data_dir,
            window_size: (config.viewport_width, config.viewport_height),
            extra_args: config.extra_args.clone(),
        })
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={}", self.cdp_port),
            format!("--user-data-dir={}", self.user_data_dir.display()),
            format!("--window-size={},{}", self.window_size.0, self.window_size.1),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-infobars".to_string(),
            "--disable-save-password-bubble".to_string(),
            "--disable-translate".to_string(),
        ];

        if self.headless {
            args.push("--headless=new".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }

    pub fn launch(&self) -> Result<Child> {
        std::fs::create_dir_all(&self.user_data_dir)?;
        let args = self.build_args();

        tracing::debug!(
            "Launching browser: {:?} with args: {:?}",
            self.browser_info.path,
            args
        );

        Command::new(&self.browser_info.path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PagewrightError::BrowserLaunchFailed(format!(
                    "Failed to launch {}: {}",
                    self.browser_info.browser_type.name(),
                    e
                ))
            })
    }

    /// Launch and wait until the DevTools endpoint answers; returns the browser WS URL.
    pub async fn launch_and_wait(&self) -> Result<(Child, String)> {
        let mut child = self.launch()?;
        let endpoint = format!("http://127.0.0.1:{}", self.cdp_port);

        for attempt in 1..=20 {
            sleep(Duration::from_millis(500)).await;

            if let Ok(Some(status)) = child.try_wait() {
                return Err(PagewrightError::BrowserLaunchFailed(format!(
                    "{} exited during startup ({})",
                    self.browser_info.browser_type.name(),
                    status
                )));
            }

            match fetch_ws_url(&endpoint).await {
                Ok(ws_url) => {
                    tracing::info!("CDP ready at: {}", ws_url);
                    return Ok((child, ws_url));
                }
                Err(e) => tracing::debug!("CDP not ready yet (attempt {}): {}", attempt, e),
            }
        }

        Err(PagewrightError::CdpConnectionFailed(
            "Timeout waiting for CDP to be ready".to_string(),
        ))
    }

    pub fn browser_info(&self) -> &BrowserInfo {
        &self.browser_info
    }
}

fn http_client() -> reqwest::Client {
    // Local DevTools endpoints must never go through a proxy.
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// `webSocketDebuggerUrl` advertised at `<endpoint>/json/version`.
async fn fetch_ws_url(endpoint: &str) -> Result<String> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let response = http_client().get(&url).send().await.map_err(|e| {
        PagewrightError::CdpConnectionFailed(format!("Failed to connect to {}: {}", url, e))
    })?;

    if !response.status().is_success() {
        return Err(PagewrightError::CdpConnectionFailed(format!(
            "{} answered {}",
            url,
            response.status()
        )));
    }

    let json: serde_json::Value = response.json().await?;
    json.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            PagewrightError::CdpConnectionFailed("No WebSocket URL in CDP response".to_string())
        })
}

/// Turn a user-supplied endpoint (`9222`, `localhost:9222`, `http://...`, `ws://...`)
/// into a browser WebSocket URL.
pub async fn resolve_cdp_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    fetch_ws_url(&http_endpoint(endpoint)?).await
}

fn http_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    if let Ok(port) = endpoint.parse::<u16>() {
        return Ok(format!("http://127.0.0.1:{}", port));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(format!("http://{}", endpoint))
        }
        _ => Err(PagewrightError::ConfigError(format!(
            "Invalid CDP endpoint '{}': expected a port, host:port, http:// or ws:// URL",
            endpoint
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_endpoint_accepts_common_forms() {
        assert_eq!(http_endpoint("9222").unwrap(), "http://127.0.0.1:9222");
        assert_eq!(http_endpoint("localhost:9333").unwrap(), "http://localhost:9333");
        assert_eq!(
            http_endpoint("http://10.0.0.5:9222").unwrap(),
            "http://10.0.0.5:9222"
        );
        assert!(http_endpoint("not an endpoint").is_err());
    }

    #[tokio::test]
    async fn ws_endpoint_passes_through() {
        let url = "ws://127.0.0.1:9222/devtools/browser/abc";
        assert_eq!(resolve_cdp_endpoint(url).await.unwrap(), url);
    }

    #[test]
    fn headless_flag_and_extra_args_are_forwarded() {
        let launcher = BrowserLauncher {
            browser_info: BrowserInfo::new(BrowserType::Chromium, PathBuf::from("/bin/true")),
            cdp_port: 9333,
            headless: true,
            user_data_dir: PathBuf::from("/tmp/pw"),
            window_size: (800, 600),
            extra_args: vec!["--mute-audio".to_string()],
        };
        let args = launcher.build_args();
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--mute-audio".to_string()));
    }
}
