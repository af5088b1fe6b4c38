//! The top-level session object: open pages and the engine behind them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionExecutor, ActionResult};
use crate::browser::{
    BrowserEngine, CdpEngine, ConsoleEntry, KeyboardInput, MouseInput, NavigationHistory,
    StorageKind, TargetId, TouchInput,
};
use crate::config::Config;
use crate::console::{ConsoleBuffer, ConsoleServer};
use crate::error::{PagewrightError, Result};
use crate::find::{FindDispatcher, FindOutcome, FindRequest};
use crate::page::{Page, PageId};
use crate::resolver::ElementTarget;
use crate::snapshot::{Snapshot, SnapshotEngine, SnapshotOptions, SnapshotView};
use crate::stream::{self, StreamHandle, StreamOptions, StreamState};

enum EngineSource {
    /// Engine supplied by the caller; reused after `close_all`.
    Fixed(Arc<dyn BrowserEngine>),
    /// Connect to or launch a Chromium on first `open`.
    Cdp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub id: PageId,
    pub url: String,
    pub title: String,
}

pub struct PageManager {
    config: Config,
    source: EngineSource,
    engine: tokio::sync::Mutex<Option<Arc<dyn BrowserEngine>>>,
    pages: RwLock<Vec<Arc<Page>>>,
    next_page: AtomicU64,
}

impl PageManager {
    /// Manager that talks to a real browser, connected lazily on first `open`.
    pub fn new(config: Config) -> Self {
        Self::with_source(EngineSource::Cdp, config)
    }

    pub fn with_engine(engine: Arc<dyn BrowserEngine>, config: Config) -> Self {
        Self::with_source(EngineSource::Fixed(engine), config)
    }

    fn with_source(source: EngineSource, config: Config) -> Self {
        Self {
            config,
            source,
            engine: tokio::sync::Mutex::new(None),
            pages: RwLock::new(Vec::new()),
            next_page: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn engine(&self) -> Result<Arc<dyn BrowserEngine>> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }

        let engine: Arc<dyn BrowserEngine> = match &self.source {
            EngineSource::Fixed(engine) => engine.clone(),
            EngineSource::Cdp => Arc::new(CdpEngine::start(&self.config.browser).await?),
        };
        info!("Using {} engine", engine.name());
        *slot = Some(engine.clone());
        Ok(engine)
    }

    fn page(&self, id: &PageId) -> Result<Arc<Page>> {
        self.pages
            .read()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| PagewrightError::SessionClosed(format!("page {} is not open", id)))
    }

    async fn page_and_engine(&self, id: &PageId) -> Result<(Arc<Page>, Arc<dyn BrowserEngine>)> {
        let page = self.page(id)?;
        let engine = self.engine().await?;
        Ok((page, engine))
    }

    async fn register(&self, engine: &Arc<dyn BrowserEngine>, target: TargetId) -> Result<PageId> {
        let id = PageId::from_index(self.next_page.fetch_add(1, Ordering::SeqCst));
        let console = Arc::new(ConsoleBuffer::new(self.config.console.buffer_size));
        let page = Arc::new(Page::new(id.clone(), target.clone(), console.clone()));

        match engine.subscribe_console(&target).await {
            Ok(mut entries) => {
                page.set_console_task(tokio::spawn(async move {
                    while let Some(entry) = entries.recv().await {
                        console.push(entry);
                    }
                }));
            }
            Err(e) => warn!(page = %id, "console capture unavailable: {}", e),
        }

        debug!(page = %id, target = %target, "page registered");
        self.pages.write().push(page);
        Ok(id)
    }

    /// Open `url` in a new page. Bare hosts get a scheme.
    pub async fn open(&self, url: &str) -> Result<PageId> {
        let url = normalize_url(url)?;
        let engine = self.engine().await?;
        let target = engine.new_page(&url).await?;
        self.register(&engine, target).await
    }

    pub async fn close(&self, id: &PageId) -> Result<()> {
        let page = {
            let mut pages = self.pages.write();
            let index = pages
                .iter()
                .position(|p| p.id() == id)
                .ok_or_else(|| PagewrightError::SessionClosed(format!("page {} is not open", id)))?;
            pages.remove(index)
        };
        let engine = self.engine().await?;
        self.release(&engine, &page).await
    }

    /// Close every page and shut the engine down.
    pub async fn close_all(&self) -> Result<()> {
        let pages: Vec<Arc<Page>> = std::mem::take(&mut *self.pages.write());
        let engine = self.engine.lock().await.take();

        let Some(engine) = engine else {
            return Ok(());
        };

        let mut first_error = None;
        for page in pages {
            if let Err(e) = self.release(&engine, &page).await {
                warn!(page = %page.id(), "close failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = engine.shutdown().await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down one page: stream first, then console, then the engine target.
    ///
    /// Every step runs even when an earlier one fails; the first error is returned.
    async fn release(&self, engine: &Arc<dyn BrowserEngine>, page: &Page) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = page.stream().stop(engine.as_ref(), page.target()).await {
            warn!(page = %page.id(), "stream stop failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Some(server) = page.console_server.lock().await.take() {
            server.stop().await;
        }
        page.abort_console_task();
        if let Err(e) = engine.close_page(page.target()).await {
            first_error.get_or_insert(e);
        }

        debug!(page = %page.id(), "page closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Engine target backing a page.
    pub fn target(&self, id: &PageId) -> Result<TargetId> {
        Ok(self.page(id)?.target().clone())
    }

    pub fn pages(&self) -> Vec<PageId> {
        self.pages.read().iter().map(|p| p.id().clone()).collect()
    }

    pub async fn page_infos(&self) -> Result<Vec<PageInfo>> {
        let pages: Vec<Arc<Page>> = self.pages.read().clone();
        let mut infos = Vec::with_capacity(pages.len());
        for page in pages {
            infos.push(PageInfo {
                id: page.id().clone(),
                url: self.url(page.id()).await?,
                title: self.title(page.id()).await?,
            });
        }
        Ok(infos)
    }

    pub async fn url(&self, id: &PageId) -> Result<String> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.current_url(page.target()).await
    }

    pub async fn title(&self, id: &PageId) -> Result<String> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.title(page.target()).await
    }

    pub async fn history(&self, id: &PageId) -> Result<NavigationHistory> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.navigation_history(page.target()).await
    }

    pub async fn snapshot(&self, id: &PageId, options: &SnapshotOptions) -> Result<SnapshotView> {
        Ok(self.snapshot_tree(id, options).await?.view())
    }

    /// Like [`snapshot`](Self::snapshot) but returns the node tree with typed refs.
    pub async fn snapshot_tree(
        &self,
        id: &PageId,
        options: &SnapshotOptions,
    ) -> Result<Arc<Snapshot>> {
        let (page, engine) = self.page_and_engine(id).await?;
        let _guard = page.lock().acquire().await;
        SnapshotEngine::new(engine.as_ref())
            .snapshot(&page, options)
            .await
    }

    /// The page's active snapshot, if one was taken.
    pub fn active_snapshot(&self, id: &PageId) -> Result<Option<Arc<Snapshot>>> {
        Ok(self.page(id)?.snapshot())
    }

    /// Run one action against an element named by selector, ref or strategy.
    pub async fn act(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
        action: Action,
    ) -> Result<ActionResult> {
        let target = target.into();
        let (page, engine) = self.page_and_engine(id).await?;
        let result = {
            let _guard = page.lock().acquire().await;
            ActionExecutor::new(engine.as_ref(), &page, &self.config.actions)
                .run(&target, &action)
                .await?
        };
        self.adopt_new_pages(&engine, result).await
    }

    async fn adopt_new_pages(
        &self,
        engine: &Arc<dyn BrowserEngine>,
        mut result: ActionResult,
    ) -> Result<ActionResult> {
        for target in std::mem::take(&mut result.new_targets) {
            let id = self.register(engine, target).await?;
            result.new_page_ids.push(id);
        }
        result.opened_new_page = !result.new_page_ids.is_empty();
        Ok(result)
    }

    pub async fn click(&self, id: &PageId, target: impl Into<ElementTarget>) -> Result<ActionResult> {
        self.act(id, target, Action::Click).await
    }

    pub async fn fill(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
        value: &str,
    ) -> Result<ActionResult> {
        self.act(
            id,
            target,
            Action::Fill {
                value: value.to_string(),
            },
        )
        .await
    }

    /// Press `key` on `target`, or on the focused element when `target` is `None`.
    pub async fn press(
        &self,
        id: &PageId,
        target: Option<ElementTarget>,
        key: &str,
    ) -> Result<ActionResult> {
        let action = Action::Press {
            key: key.to_string(),
        };
        match target {
            Some(target) => self.act(id, target, action).await,
            None => {
                let (page, engine) = self.page_and_engine(id).await?;
                let result = {
                    let _guard = page.lock().acquire().await;
                    ActionExecutor::new(engine.as_ref(), &page, &self.config.actions)
                        .press_focused(key)
                        .await?
                };
                self.adopt_new_pages(&engine, result).await
            }
        }
    }

    pub async fn select(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
        value: &str,
    ) -> Result<ActionResult> {
        self.act(
            id,
            target,
            Action::Select {
                value: value.to_string(),
            },
        )
        .await
    }

    pub async fn check(&self, id: &PageId, target: impl Into<ElementTarget>) -> Result<ActionResult> {
        self.act(id, target, Action::Check).await
    }

    pub async fn uncheck(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
    ) -> Result<ActionResult> {
        self.act(id, target, Action::Uncheck).await
    }

    pub async fn upload(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
        files: Vec<String>,
    ) -> Result<ActionResult> {
        self.act(id, target, Action::Upload { files }).await
    }

    pub async fn inner_html(
        &self,
        id: &PageId,
        target: impl Into<ElementTarget>,
    ) -> Result<ActionResult> {
        self.act(id, target, Action::InnerHtml).await
    }

    pub async fn hover(&self, id: &PageId, target: impl Into<ElementTarget>) -> Result<ActionResult> {
        self.act(id, target, Action::Hover).await
    }

    pub async fn text(&self, id: &PageId, target: impl Into<ElementTarget>) -> Result<ActionResult> {
        self.act(id, target, Action::Text).await
    }

    pub async fn value(&self, id: &PageId, target: impl Into<ElementTarget>) -> Result<ActionResult> {
        self.act(id, target, Action::Value).await
    }

    pub async fn back(&self, id: &PageId, steps: usize) -> Result<ActionResult> {
        let (page, engine) = self.page_and_engine(id).await?;
        let _guard = page.lock().acquire().await;
        ActionExecutor::new(engine.as_ref(), &page, &self.config.actions)
            .back(steps)
            .await
    }

    pub async fn find(&self, id: &PageId, request: FindRequest) -> Result<FindOutcome> {
        let (page, engine) = self.page_and_engine(id).await?;
        let outcome = {
            let _guard = page.lock().acquire().await;
            FindDispatcher::new(engine.as_ref(), &page, &self.config.actions)
                .find(request)
                .await?
        };
        match outcome {
            FindOutcome::Action(result) => Ok(FindOutcome::Action(
                self.adopt_new_pages(&engine, result).await?,
            )),
            count => Ok(count),
        }
    }

    pub async fn cookies_get(&self, id: &PageId) -> Result<Vec<Value>> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.cookies_get(page.target()).await
    }

    pub async fn cookies_set(&self, id: &PageId, cookies: &[Value]) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.cookies_set(page.target(), cookies).await
    }

    pub async fn cookies_clear(&self, id: &PageId) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.cookies_clear(page.target()).await
    }

    pub async fn storage_get(
        &self,
        id: &PageId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.storage_get(page.target(), kind, keys).await
    }

    pub async fn storage_set(
        &self,
        id: &PageId,
        kind: StorageKind,
        items: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.storage_set(page.target(), kind, items).await
    }

    pub async fn storage_clear(
        &self,
        id: &PageId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        engine.storage_clear(page.target(), kind, keys).await
    }

    /// Newest `limit` console entries. Timestamps and `since` are milliseconds
    /// since the Unix epoch; `since` is inclusive.
    pub fn console_get(
        &self,
        id: &PageId,
        since: Option<f64>,
        limit: usize,
    ) -> Result<Vec<ConsoleEntry>> {
        Ok(self.page(id)?.console().get(since, limit))
    }

    /// Serve the page's console over WebSocket; returns the bound port.
    /// A second call returns the port of the server already running.
    pub async fn console_stream_start(&self, id: &PageId, host: &str, port: u16) -> Result<u16> {
        let page = self.page(id)?;
        let mut server = page.console_server.lock().await;
        if let Some(running) = server.as_ref() {
            return Ok(running.local_addr().port());
        }
        let started = ConsoleServer::start(page.console().clone(), host, port).await?;
        let bound = started.local_addr().port();
        info!(page = %id, "console stream on ws://{}", started.local_addr());
        *server = Some(started);
        Ok(bound)
    }

    pub async fn console_stream_stop(&self, id: &PageId) -> Result<()> {
        let page = self.page(id)?;
        if let Some(server) = page.console_server.lock().await.take() {
            server.stop().await;
        }
        Ok(())
    }

    pub async fn stream_start(&self, id: &PageId, options: &StreamOptions) -> Result<StreamHandle> {
        let (page, engine) = self.page_and_engine(id).await?;
        page.stream()
            .start(engine, page.target().clone(), options)
            .await
    }

    /// Stream options from the `[stream]` config section.
    pub fn default_stream_options(&self) -> Result<StreamOptions> {
        StreamOptions::from_config(&self.config.stream)
    }

    pub async fn stream_stop(&self, id: &PageId) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        page.stream().stop(engine.as_ref(), page.target()).await
    }

    pub fn stream_state(&self, id: &PageId) -> Result<StreamState> {
        Ok(self.page(id)?.stream().state())
    }

    pub async fn stream_inject_mouse(&self, id: &PageId, input: &MouseInput) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        stream::inject_mouse(engine.as_ref(), page.target(), input).await
    }

    pub async fn stream_inject_keyboard(&self, id: &PageId, input: &KeyboardInput) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        stream::inject_keyboard(engine.as_ref(), page.target(), input).await
    }

    pub async fn stream_inject_touch(&self, id: &PageId, input: &TouchInput) -> Result<()> {
        let (page, engine) = self.page_and_engine(id).await?;
        stream::inject_touch(engine.as_ref(), page.target(), input).await
    }
}

/// Infer a scheme for bare hosts: `https://` in general, `http://` for local hosts.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(PagewrightError::InvalidActionParameters(
            "Invalid URL: empty input".to_string(),
        ));
    }

    if let Some(rest) = trimmed.strip_prefix("//") {
        return Ok(format!("https://{}", rest));
    }

    if trimmed.contains("://") {
        return Ok(trimmed.to_string());
    }

    if is_host_port_with_optional_path(trimmed) {
        let scheme = if is_local_host(trimmed) { "http" } else { "https" };
        return Ok(format!("{}://{}", scheme, trimmed));
    }

    if has_explicit_scheme(trimmed) {
        return Ok(trimmed.to_string());
    }

    let scheme = if is_local_host(trimmed) { "http" } else { "https" };
    Ok(format!("{}://{}", scheme, trimmed))
}

fn is_local_host(input: &str) -> bool {
    let boundary = input.find([':', '/', '?', '#']).unwrap_or(input.len());
    matches!(&input[..boundary], "localhost" | "127.0.0.1" | "0.0.0.0")
}

fn is_host_port_with_optional_path(input: &str) -> bool {
    let boundary = input.find(['/', '?', '#']).unwrap_or(input.len());
    let authority = &input[..boundary];

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn has_explicit_scheme(input: &str) -> bool {
    let mut chars = input.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }

    for c in chars {
        if c == ':' {
            return true;
        }
        if c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.' {
            continue;
        }
        return false;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_adds_https_to_bare_hosts() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("  google.com/search?q=a ").unwrap(),
            "https://google.com/search?q=a"
        );
        assert_eq!(
            normalize_url("//example.com/path").unwrap(),
            "https://example.com/path"
        );
    }

    #[test]
    fn normalize_url_uses_http_for_local_hosts() {
        assert_eq!(
            normalize_url("localhost:3000").unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_url("127.0.0.1:8080/app").unwrap(),
            "http://127.0.0.1:8080/app"
        );
        assert_eq!(normalize_url("localhost").unwrap(), "http://localhost");
    }

    #[test]
    fn normalize_url_keeps_explicit_schemes() {
        assert_eq!(
            normalize_url("http://example.com").unwrap(),
            "http://example.com"
        );
        assert_eq!(normalize_url("about:blank").unwrap(), "about:blank");
        assert_eq!(
            normalize_url("mailto:test@example.com").unwrap(),
            "mailto:test@example.com"
        );
    }

    #[test]
    fn normalize_url_rejects_empty_input() {
        assert!(normalize_url("").is_err());
        assert!(normalize_url("   ").is_err());
    }
}
