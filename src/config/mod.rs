use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{PagewrightError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Browser connection / launch settings
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Action timing
    #[serde(default)]
    pub actions: ActionsConfig,

    /// Console capture
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Screencast defaults
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Browser executable path (overrides auto-discovery)
    pub executable: Option<String>,

    /// CDP endpoint of an already running browser (port or ws:// URL)
    pub cdp: Option<String>,

    /// Remote debugging port used when launching a browser
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,

    /// Headless mode
    #[serde(default)]
    pub headless: bool,

    /// User data directory for launched browsers
    pub user_data_dir: Option<String>,

    /// Extra browser arguments
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,

    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,

    /// User-Agent override applied to every page
    pub user_agent: Option<String>,

    /// ICU locale override, e.g. `de-DE`
    pub locale: Option<String>,

    /// IANA timezone override, e.g. `Europe/Berlin`
    pub timezone: Option<String>,
}

fn default_cdp_port() -> u16 {
    9222
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    720
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            cdp: None,
            cdp_port: default_cdp_port(),
            headless: false,
            user_data_dir: None,
            extra_args: Vec::new(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            user_agent: None,
            locale: None,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Upper bound for a single engine round trip or page load (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long a click waits for a popup / new tab to appear (ms)
    #[serde(default = "default_popup_wait_ms")]
    pub popup_wait_ms: u64,

    /// Quiet period after an action before the resulting URL is read (ms)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_popup_wait_ms() -> u64 {
    1_500
}

fn default_settle_ms() -> u64 {
    150
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            popup_wait_ms: default_popup_wait_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Number of console entries kept per page
    #[serde(default = "default_console_buffer")]
    pub buffer_size: usize,

    #[serde(default = "default_stream_host")]
    pub stream_host: String,

    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
}

fn default_console_buffer() -> usize {
    1_000
}

fn default_stream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_stream_port() -> u16 {
    9224
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_console_buffer(),
            stream_host: default_stream_host(),
            stream_port: default_stream_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// "jpeg" or "png"
    #[serde(default = "default_image_format")]
    pub image_format: String,

    #[serde(default = "default_quality")]
    pub quality: u8,

    pub max_width: Option<u32>,

    pub max_height: Option<u32>,

    pub every_nth_frame: Option<u32>,

    /// Capacity of the per-page event channel between producer and consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long stop waits for the consumer to take the final status event (ms)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_image_format() -> String {
    "jpeg".to_string()
}

fn default_quality() -> u8 {
    80
}

fn default_channel_capacity() -> usize {
    2
}

fn default_stop_timeout_ms() -> u64 {
    1_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            image_format: default_image_format(),
            quality: default_quality(),
            max_width: None,
            max_height: None,
            every_nth_frame: None,
            channel_capacity: default_channel_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from all sources (file, env, defaults)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration layering defaults, the given TOML file and `PAGEWRIGHT_*` env vars
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            // Nested keys use a double underscore: PAGEWRIGHT_BROWSER__CDP_PORT=9333
            .merge(Env::prefixed("PAGEWRIGHT_").split("__"))
            .extract()
            .map_err(|e| PagewrightError::ConfigError(e.to_string()))?;

        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PAGEWRIGHT_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagewright")
            .join("config.toml")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PagewrightError::ConfigError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read a dotted key as a display string (`None` when unset)
    pub fn get_key(&self, key: &str) -> Result<Option<String>> {
        let value = match key {
            "browser.executable" => self.browser.executable.clone(),
            "browser.cdp" => self.browser.cdp.clone(),
            "browser.cdp_port" => Some(self.browser.cdp_port.to_string()),
            "browser.headless" => Some(self.browser.headless.to_string()),
            "browser.user_data_dir" => self.browser.user_data_dir.clone(),
            "browser.user_agent" => self.browser.user_agent.clone(),
            "browser.locale" => self.browser.locale.clone(),
            "browser.timezone" => self.browser.timezone.clone(),
            "actions.timeout_ms" => Some(self.actions.timeout_ms.to_string()),
            "actions.popup_wait_ms" => Some(self.actions.popup_wait_ms.to_string()),
            "console.buffer_size" => Some(self.console.buffer_size.to_string()),
            "stream.image_format" => Some(self.stream.image_format.clone()),
            "stream.quality" => Some(self.stream.quality.to_string()),
            _ => return Err(unknown_key(key)),
        };
        Ok(value)
    }

    /// Set a dotted key from its string form
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "browser.executable" => self.browser.executable = Some(value.to_string()),
            "browser.cdp" => self.browser.cdp = Some(value.to_string()),
            "browser.cdp_port" => self.browser.cdp_port = parse_value(key, value)?,
            "browser.headless" => self.browser.headless = parse_value(key, value)?,
            "browser.user_data_dir" => self.browser.user_data_dir = Some(value.to_string()),
            "browser.user_agent" => self.browser.user_agent = Some(value.to_string()),
            "browser.locale" => self.browser.locale = Some(value.to_string()),
            "browser.timezone" => self.browser.timezone = Some(value.to_string()),
            "actions.timeout_ms" => self.actions.timeout_ms = parse_value(key, value)?,
            "actions.popup_wait_ms" => self.actions.popup_wait_ms = parse_value(key, value)?,
            "console.buffer_size" => self.console.buffer_size = parse_value(key, value)?,
            "stream.image_format" => {
                if value != "jpeg" && value != "png" {
                    return Err(PagewrightError::ConfigError(
                        "image_format must be jpeg or png".to_string(),
                    ));
                }
                self.stream.image_format = value.to_string();
            }
            "stream.quality" => {
                let quality: u8 = parse_value(key, value)?;
                if quality > 100 {
                    return Err(PagewrightError::ConfigError(
                        "quality must be between 0 and 100".to_string(),
                    ));
                }
                self.stream.quality = quality;
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> PagewrightError {
    PagewrightError::ConfigError(format!("Unknown config key: {}", key))
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PagewrightError::ConfigError(format!("Invalid value for {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();

        assert_eq!(config.browser.cdp_port, 9222);
        assert_eq!(config.actions.popup_wait_ms, 1_500);
        assert_eq!(config.console.buffer_size, 1_000);
        assert_eq!(config.stream.image_format, "jpeg");
        assert_eq!(config.stream.quality, 80);
    }

    #[test]
    fn load_from_merges_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[browser]\nheadless = true\ncdp = \"9333\"\n\n[stream]\nquality = 55\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.browser.headless);
        assert_eq!(config.browser.cdp.as_deref(), Some("9333"));
        assert_eq!(config.stream.quality, 55);
        assert_eq!(config.stream.image_format, "jpeg");
    }

    #[test]
    fn context_overrides_are_settable_keys() {
        let mut config = Config::default();
        assert_eq!(config.get_key("browser.timezone").unwrap(), None);

        config.set_key("browser.user_agent", "pagewright-test/1.0").unwrap();
        config.set_key("browser.locale", "de-DE").unwrap();
        config.set_key("browser.timezone", "Europe/Berlin").unwrap();

        assert_eq!(config.browser.user_agent.as_deref(), Some("pagewright-test/1.0"));
        assert_eq!(
            config.get_key("browser.locale").unwrap().as_deref(),
            Some("de-DE")
        );
        assert_eq!(config.browser.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.actions.timeout_ms, 30_000);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set_key("browser.executable", "/usr/bin/chromium").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(
            loaded.browser.executable.as_deref(),
            Some("/usr/bin/chromium")
        );
    }

    #[test]
    fn set_key_rejects_bad_quality() {
        let mut config = Config::default();
        let result = config.set_key("stream.quality", "101");
        assert!(matches!(result, Err(PagewrightError::ConfigError(_))));
    }

    #[test]
    fn unknown_key_is_config_error() {
        let config = Config::default();
        assert!(matches!(
            config.get_key("api.base_url"),
            Err(PagewrightError::ConfigError(_))
        ));
    }
}
