//! JSON-lines command scripts.
//!
//! Every non-empty line is one command object tagged by `cmd`, e.g.
//! `{"cmd":"open","url":"example.com"}` or `{"cmd":"click","target":"@e2"}`.
//! Commands without a `page` field run against the current page, which is the
//! page opened last (or the one picked with `use`). Each command yields one
//! JSON result line.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::browser::{ImageFormat, KeyboardInput, MouseInput, StorageKind, TouchInput};
use crate::error::{PagewrightError, Result};
use crate::find::FindParams;
use crate::manager::PageManager;
use crate::page::PageId;
use crate::snapshot::SnapshotOptions;
use crate::stream::{StreamEvent, StreamHandle};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Open {
        url: String,
    },
    Use {
        page: PageId,
    },
    Close {
        #[serde(default)]
        page: Option<PageId>,
    },
    Pages,
    Url {
        #[serde(default)]
        page: Option<PageId>,
    },
    Title {
        #[serde(default)]
        page: Option<PageId>,
    },
    History {
        #[serde(default)]
        page: Option<PageId>,
    },
    Snapshot {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default)]
        interactive: bool,
        #[serde(default)]
        compact: bool,
        #[serde(default)]
        max_depth: Option<usize>,
        #[serde(default)]
        selector: Option<String>,
    },
    Click {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Fill {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
        value: String,
    },
    Press {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default)]
        target: Option<String>,
        key: String,
    },
    Select {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
        value: String,
    },
    Check {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Uncheck {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Upload {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
        files: Vec<String>,
    },
    InnerHtml {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Hover {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Text {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Value {
        #[serde(default)]
        page: Option<PageId>,
        target: String,
    },
    Back {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default = "one")]
        steps: usize,
    },
    Find {
        #[serde(default)]
        page: Option<PageId>,
        strategy: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        nth: Option<i64>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        action_value: Option<String>,
        #[serde(default)]
        files: Option<Vec<String>>,
    },
    CookiesGet {
        #[serde(default)]
        page: Option<PageId>,
    },
    CookiesSet {
        #[serde(default)]
        page: Option<PageId>,
        cookies: Vec<Value>,
    },
    CookiesClear {
        #[serde(default)]
        page: Option<PageId>,
    },
    StorageGet {
        #[serde(default)]
        page: Option<PageId>,
        kind: StorageKind,
        #[serde(default)]
        keys: Option<Vec<String>>,
    },
    StorageSet {
        #[serde(default)]
        page: Option<PageId>,
        kind: StorageKind,
        items: BTreeMap<String, String>,
    },
    StorageClear {
        #[serde(default)]
        page: Option<PageId>,
        kind: StorageKind,
        #[serde(default)]
        keys: Option<Vec<String>>,
    },
    Console {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default)]
        since: Option<f64>,
        #[serde(default = "default_console_limit")]
        limit: usize,
    },
    ConsoleStreamStart {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    ConsoleStreamStop {
        #[serde(default)]
        page: Option<PageId>,
    },
    StreamStart {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default)]
        format: Option<ImageFormat>,
        #[serde(default)]
        quality: Option<u8>,
        #[serde(default)]
        max_width: Option<u32>,
        #[serde(default)]
        max_height: Option<u32>,
        #[serde(default)]
        every_nth_frame: Option<u32>,
    },
    StreamFrames {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(default = "one")]
        count: usize,
        #[serde(default = "default_frames_timeout_ms")]
        timeout_ms: u64,
    },
    StreamStop {
        #[serde(default)]
        page: Option<PageId>,
    },
    StreamState {
        #[serde(default)]
        page: Option<PageId>,
    },
    Mouse {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(flatten)]
        input: MouseInput,
    },
    Keyboard {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(flatten)]
        input: KeyboardInput,
    },
    Touch {
        #[serde(default)]
        page: Option<PageId>,
        #[serde(flatten)]
        input: TouchInput,
    },
    Sleep {
        ms: u64,
    },
}

fn one() -> usize {
    1
}

fn default_console_limit() -> usize {
    200
}

fn default_frames_timeout_ms() -> u64 {
    5_000
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| {
            PagewrightError::InvalidActionParameters(format!("invalid command: {}", e))
        })
    }
}

/// One line of script output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub line: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Outcome {
    fn success(line: usize, result: Value) -> Self {
        Self {
            line,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(line: usize, error: &PagewrightError) -> Self {
        Self {
            line,
            ok: false,
            result: None,
            error: Some(json!({
                "kind": error.kind_name(),
                "message": error.to_string(),
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScriptSummary {
    pub commands: usize,
    pub failures: usize,
}

struct OpenStream {
    handle: StreamHandle,
    format: ImageFormat,
    frames: usize,
}

pub struct ScriptRunner<'a> {
    manager: &'a PageManager,
    current: Option<PageId>,
    streams: HashMap<PageId, OpenStream>,
    frames_dir: Option<PathBuf>,
    keep_going: bool,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(manager: &'a PageManager) -> Self {
        Self {
            manager,
            current: None,
            streams: HashMap::new(),
            frames_dir: None,
            keep_going: false,
        }
    }

    /// Keep executing after a failed command.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Write received screencast frames as image files into `dir`.
    pub fn frames_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.frames_dir = dir;
        self
    }

    pub fn current_page(&self) -> Option<&PageId> {
        self.current.as_ref()
    }

    /// Run every command of `script`, handing each outcome to `emit` as it completes.
    /// Blank lines and lines starting with `#` are skipped.
    pub async fn run(&mut self, script: &str, mut emit: impl FnMut(&Outcome)) -> ScriptSummary {
        let mut summary = ScriptSummary::default();

        for (index, raw) in script.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let outcome = match Command::parse(line) {
                Ok(command) => match self.execute(command).await {
                    Ok(result) => Outcome::success(index + 1, result),
                    Err(e) => Outcome::failure(index + 1, &e),
                },
                Err(e) => Outcome::failure(index + 1, &e),
            };

            summary.commands += 1;
            let failed = !outcome.ok;
            if failed {
                summary.failures += 1;
                debug!(line = index + 1, "script command failed");
            }
            emit(&outcome);

            if failed && !self.keep_going {
                break;
            }
        }

        self.streams.clear();
        summary
    }

    fn page(&self, page: Option<PageId>) -> Result<PageId> {
        page.or_else(|| self.current.clone())
            .ok_or_else(|| PagewrightError::SessionClosed("no page is open".to_string()))
    }

    pub async fn execute(&mut self, command: Command) -> Result<Value> {
        let manager = self.manager;

        match command {
            Command::Open { url } => {
                let id = manager.open(&url).await?;
                let url = manager.url(&id).await?;
                info!(page = %id, "opened {}", url);
                self.current = Some(id.clone());
                Ok(json!({ "page": id, "url": url }))
            }
            Command::Use { page } => {
                if !manager.pages().contains(&page) {
                    return Err(PagewrightError::SessionClosed(format!(
                        "page {} is not open",
                        page
                    )));
                }
                self.current = Some(page.clone());
                Ok(json!({ "page": page }))
            }
            Command::Close { page } => {
                let id = self.page(page)?;
                self.streams.remove(&id);
                manager.close(&id).await?;
                if self.current.as_ref() == Some(&id) {
                    self.current = manager.pages().last().cloned();
                }
                Ok(json!({ "closed": id }))
            }
            Command::Pages => Ok(serde_json::to_value(manager.page_infos().await?)?),
            Command::Url { page } => {
                let id = self.page(page)?;
                Ok(json!({ "url": manager.url(&id).await? }))
            }
            Command::Title { page } => {
                let id = self.page(page)?;
                Ok(json!({ "title": manager.title(&id).await? }))
            }
            Command::History { page } => {
                let id = self.page(page)?;
                let history = manager.history(&id).await?;
                Ok(json!({ "entries": history.entries, "current": history.current }))
            }
            Command::Snapshot {
                page,
                interactive,
                compact,
                max_depth,
                selector,
            } => {
                let id = self.page(page)?;
                let options = SnapshotOptions {
                    interactive,
                    max_depth,
                    compact,
                    selector,
                };
                Ok(serde_json::to_value(manager.snapshot(&id, &options).await?)?)
            }
            Command::Click { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.click(&id, target).await?)?)
            }
            Command::Fill {
                page,
                target,
                value,
            } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.fill(&id, target, &value).await?)?)
            }
            Command::Press { page, target, key } => {
                let id = self.page(page)?;
                let target = target.map(Into::into);
                Ok(serde_json::to_value(manager.press(&id, target, &key).await?)?)
            }
            Command::Select {
                page,
                target,
                value,
            } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.select(&id, target, &value).await?)?)
            }
            Command::Check { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.check(&id, target).await?)?)
            }
            Command::Uncheck { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.uncheck(&id, target).await?)?)
            }
            Command::Upload {
                page,
                target,
                files,
            } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.upload(&id, target, files).await?)?)
            }
            Command::InnerHtml { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.inner_html(&id, target).await?)?)
            }
            Command::Hover { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.hover(&id, target).await?)?)
            }
            Command::Text { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.text(&id, target).await?)?)
            }
            Command::Value { page, target } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.value(&id, target).await?)?)
            }
            Command::Back { page, steps } => {
                let id = self.page(page)?;
                Ok(serde_json::to_value(manager.back(&id, steps).await?)?)
            }
            Command::Find {
                page,
                strategy,
                value,
                name,
                selector,
                nth,
                action,
                action_value,
                files,
            } => {
                let id = self.page(page)?;
                let params = FindParams {
                    strategy,
                    value,
                    name,
                    selector,
                    nth,
                    action: action.unwrap_or_else(|| "click".to_string()),
                    action_value,
                    files,
                };
                let outcome = manager.find(&id, params.into_request()?).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::CookiesGet { page } => {
                let id = self.page(page)?;
                Ok(json!({ "cookies": manager.cookies_get(&id).await? }))
            }
            Command::CookiesSet { page, cookies } => {
                let id = self.page(page)?;
                manager.cookies_set(&id, &cookies).await?;
                Ok(json!({ "set": cookies.len() }))
            }
            Command::CookiesClear { page } => {
                let id = self.page(page)?;
                manager.cookies_clear(&id).await?;
                Ok(json!({ "cleared": true }))
            }
            Command::StorageGet { page, kind, keys } => {
                let id = self.page(page)?;
                let items = manager.storage_get(&id, kind, keys.as_deref()).await?;
                Ok(json!({ "items": items }))
            }
            Command::StorageSet { page, kind, items } => {
                let id = self.page(page)?;
                manager.storage_set(&id, kind, &items).await?;
                Ok(json!({ "set": items.len() }))
            }
            Command::StorageClear { page, kind, keys } => {
                let id = self.page(page)?;
                manager.storage_clear(&id, kind, keys.as_deref()).await?;
                Ok(json!({ "cleared": true }))
            }
            Command::Console { page, since, limit } => {
                let id = self.page(page)?;
                Ok(json!({ "entries": manager.console_get(&id, since, limit)? }))
            }
            Command::ConsoleStreamStart { page, host, port } => {
                let id = self.page(page)?;
                let console = &manager.config().console;
                let host = host.unwrap_or_else(|| console.stream_host.clone());
                let port = port.unwrap_or(console.stream_port);
                let bound = manager.console_stream_start(&id, &host, port).await?;
                Ok(json!({ "url": format!("ws://{}:{}", host, bound), "port": bound }))
            }
            Command::ConsoleStreamStop { page } => {
                let id = self.page(page)?;
                manager.console_stream_stop(&id).await?;
                Ok(json!({ "stopped": true }))
            }
            Command::StreamStart {
                page,
                format,
                quality,
                max_width,
                max_height,
                every_nth_frame,
            } => {
                let id = self.page(page)?;
                let mut options = manager.default_stream_options()?;
                if let Some(format) = format {
                    options.image_format = format;
                }
                if let Some(quality) = quality {
                    options.quality = quality;
                }
                options.max_width = max_width.or(options.max_width);
                options.max_height = max_height.or(options.max_height);
                options.every_nth_frame = every_nth_frame.or(options.every_nth_frame);

                let handle = manager.stream_start(&id, &options).await?;
                self.streams.insert(
                    id.clone(),
                    OpenStream {
                        handle,
                        format: options.image_format,
                        frames: 0,
                    },
                );
                Ok(json!({ "page": id, "state": manager.stream_state(&id)? }))
            }
            Command::StreamFrames {
                page,
                count,
                timeout_ms,
            } => {
                let id = self.page(page)?;
                self.stream_frames(&id, count, Duration::from_millis(timeout_ms))
                    .await
            }
            Command::StreamStop { page } => {
                let id = self.page(page)?;
                manager.stream_stop(&id).await?;
                self.streams.remove(&id);
                Ok(json!({ "state": manager.stream_state(&id)? }))
            }
            Command::StreamState { page } => {
                let id = self.page(page)?;
                Ok(json!({ "state": manager.stream_state(&id)? }))
            }
            Command::Mouse { page, input } => {
                let id = self.page(page)?;
                manager.stream_inject_mouse(&id, &input).await?;
                Ok(json!({ "dispatched": true }))
            }
            Command::Keyboard { page, input } => {
                let id = self.page(page)?;
                manager.stream_inject_keyboard(&id, &input).await?;
                Ok(json!({ "dispatched": true }))
            }
            Command::Touch { page, input } => {
                let id = self.page(page)?;
                manager.stream_inject_touch(&id, &input).await?;
                Ok(json!({ "dispatched": true }))
            }
            Command::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
        }
    }

    /// Drain up to `count` frames, stopping early on timeout or when the stream ends.
    async fn stream_frames(&mut self, id: &PageId, count: usize, wait: Duration) -> Result<Value> {
        let frames_dir = self.frames_dir.clone();
        let stream = self.streams.get_mut(id).ok_or_else(|| {
            PagewrightError::InvalidActionParameters(format!("page {} is not streaming", id))
        })?;

        let mut frames = Vec::new();
        let mut statuses = Vec::new();
        let mut ended = false;

        while frames.len() < count {
            let event = match tokio::time::timeout(wait, stream.handle.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(_) => break,
            };

            match event {
                StreamEvent::Status(status) => statuses.push(serde_json::to_value(status)?),
                StreamEvent::Frame(frame) => {
                    stream.frames += 1;
                    let mut entry = json!({ "metadata": frame.metadata, "bytes": frame.data.len() });
                    if let Some(dir) = &frames_dir {
                        let image = base64::engine::general_purpose::STANDARD
                            .decode(frame.data.as_bytes())
                            .map_err(|e| PagewrightError::Other(format!("bad frame data: {}", e)))?;
                        std::fs::create_dir_all(dir)?;
                        let extension = match stream.format {
                            ImageFormat::Jpeg => "jpg",
                            ImageFormat::Png => "png",
                        };
                        let path = dir.join(format!("{}-{:05}.{}", id, stream.frames, extension));
                        std::fs::write(&path, image)?;
                        entry["file"] = json!(path.display().to_string());
                    }
                    frames.push(entry);
                }
            }
        }

        if ended {
            self.streams.remove(id);
        }
        Ok(json!({ "frames": frames, "statuses": statuses, "ended": ended }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_by_tag() {
        let command = Command::parse(r#"{"cmd":"click","target":"@e2"}"#).unwrap();
        assert!(matches!(command, Command::Click { page: None, ref target } if target == "@e2"));

        let command = Command::parse(r#"{"cmd":"back"}"#).unwrap();
        assert!(matches!(command, Command::Back { steps: 1, .. }));

        let command = Command::parse(r#"{"cmd":"storage_get","kind":"session"}"#).unwrap();
        assert!(matches!(
            command,
            Command::StorageGet {
                kind: StorageKind::Session,
                ..
            }
        ));
    }

    #[test]
    fn unknown_commands_are_invalid_parameters() {
        let err = Command::parse(r#"{"cmd":"teleport"}"#).unwrap_err();
        assert_eq!(err.kind_name(), "invalid_action_parameters");

        let err = Command::parse("not json").unwrap_err();
        assert!(err.to_string().contains("invalid command"));
    }

    #[test]
    fn failures_carry_kind_and_message() {
        let outcome = Outcome::failure(
            3,
            &PagewrightError::RefNotFound("@e9".to_string()),
        );
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["line"], 3);
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "ref_not_found");
        assert!(value.get("result").is_none());
    }
}
