//! [`BrowserEngine`] backed by a Chromium-family browser over CDP.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cdp::CdpClient;
use super::engine::{
    AxNode, BrowserEngine, ConsoleEntry, ConsoleLocation, DownloadInfo, ElementHandle, ElementOp,
    EngineLocator, FrameMetadata, KeyboardInput, MouseEventType, MouseInput, NavigationHistory,
    ScreencastFrame, ScreencastParams, StorageKind, TargetId, TouchInput,
};
use super::keys::key_definition;
use super::launcher::{resolve_cdp_endpoint, BrowserLauncher};
use crate::config::BrowserConfig;
use crate::error::{PagewrightError, Result};
use crate::storage;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Scroll into view and return the click point. Throws when the element
/// cannot receive a pointer event.
const CLICK_POINT_JS: &str = r#"function() {
    if (!this.isConnected) throw new Error('No node with given id found');
    this.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' });
    const r = this.getBoundingClientRect();
    const s = getComputedStyle(this);
    if (r.width === 0 || r.height === 0 || s.visibility === 'hidden' || s.display === 'none') {
        throw new Error('Element is not visible');
    }
    if (this.disabled) throw new Error('Element <' + this.tagName.toLowerCase() + '> is disabled');
    const x = r.left + r.width / 2;
    const y = r.top + r.height / 2;
    const hit = document.elementFromPoint(x, y);
    if (hit && hit !== this && !this.contains(hit) && !hit.contains(this)) {
        throw new Error('<' + hit.tagName.toLowerCase() + '> intercepts pointer events');
    }
    return { x, y };
}"#;

const FILL_JS: &str = r#"function(value) {
    const tag = this.tagName;
    const editable = this.isContentEditable;
    const textual = tag === 'TEXTAREA' || (tag === 'INPUT' &&
        !['checkbox', 'radio', 'file', 'button', 'submit', 'reset', 'hidden', 'image'].includes(this.type));
    if (!textual && !editable) {
        throw new Error('Element <' + tag.toLowerCase() + '> is not an <input>, <textarea> or [contenteditable] element');
    }
    this.focus();
    if (editable) {
        this.textContent = value;
    } else {
        const proto = tag === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
        Object.getOwnPropertyDescriptor(proto, 'value').set.call(this, value);
    }
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const SELECT_JS: &str = r#"function(wanted) {
    if (this.tagName !== 'SELECT') throw new Error('Element is not a <select> element');
    const option = Array.from(this.options)
        .find(o => o.value === wanted || o.label === wanted || o.text.trim() === wanted);
    if (!option) throw new Error('No option "' + wanted + '" to select');
    this.value = option.value;
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const SET_CHECKED_JS: &str = r#"function(checked) {
    const native = this.tagName === 'INPUT' && (this.type === 'checkbox' || this.type === 'radio');
    const role = this.getAttribute('role');
    if (!native && !['checkbox', 'switch', 'radio'].includes(role)) {
        throw new Error('Not a checkbox or radio button');
    }
    const state = () => native ? this.checked : this.getAttribute('aria-checked') === 'true';
    if (state() !== checked) this.click();
    return state();
}"#;

const IS_VISIBLE_JS: &str = r#"function() {
    const r = this.getBoundingClientRect();
    const s = getComputedStyle(this);
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
}"#;

const IS_ENABLED_JS: &str =
    "function() { return !this.disabled && this.getAttribute('aria-disabled') !== 'true'; }";

const IS_CHECKED_JS: &str =
    "function() { return ('checked' in this) ? !!this.checked : this.getAttribute('aria-checked') === 'true'; }";

const TEXT_JS: &str = "function() { return this.innerText ?? this.textContent ?? ''; }";

const VALUE_JS: &str =
    "function() { return this.isContentEditable ? this.textContent : (this.value ?? ''); }";

const INNER_HTML_JS: &str = "function() { return this.innerHTML; }";

/// Returns an array of matching elements for the non-role locators.
const LOCATE_JS: &str = r#"(mode, wanted) => {
    const needle = wanted.toLowerCase();
    const has = v => v != null && v.toLowerCase().includes(needle);
    const all = Array.from(document.querySelectorAll('*'));
    switch (mode) {
        case 'text':
            return all.filter(el => Array.from(el.childNodes)
                .some(n => n.nodeType === Node.TEXT_NODE && has(n.textContent)));
        case 'label':
            return all.filter(el => has(el.getAttribute('aria-label')) ||
                (el.labels && Array.from(el.labels).some(l => has(l.textContent))));
        case 'placeholder':
            return all.filter(el => has(el.getAttribute('placeholder')));
        case 'alt':
            return all.filter(el => has(el.getAttribute('alt')));
        case 'title':
            return all.filter(el => has(el.getAttribute('title')));
        case 'testid':
            return all.filter(el => el.getAttribute('data-testid') === wanted);
        default:
            return [];
    }
}"#;

pub struct CdpEngine {
    client: CdpClient,
    browser: tokio::sync::Mutex<Option<Child>>,
    sessions: tokio::sync::Mutex<HashMap<TargetId, String>>,
    downloads: Arc<Mutex<HashMap<String, Vec<DownloadInfo>>>>,
    screencasts: Mutex<HashMap<TargetId, JoinHandle<()>>>,
    download_watch: JoinHandle<()>,
    /// `Emulation.*` commands sent to every page on attach.
    emulation: Vec<(&'static str, Value)>,
}

impl CdpEngine {
    /// Attach to `config.cdp` when set, otherwise launch a browser.
    pub async fn start(config: &BrowserConfig) -> Result<Self> {
        let (child, ws_url) = match &config.cdp {
            Some(endpoint) => {
                info!("Connecting to existing browser at {}", endpoint);
                (None, resolve_cdp_endpoint(endpoint).await?)
            }
            None => {
                let launcher = BrowserLauncher::from_config(config)?;
                info!(
                    "Launching {} ({})",
                    launcher.browser_info().browser_type.name(),
                    launcher.browser_info().path.display()
                );
                let (child, ws_url) = launcher.launch_and_wait().await?;
                (Some(child), ws_url)
            }
        };
        let emulation = emulation_commands(config, child.is_some());

        let client = CdpClient::connect(&ws_url, COMMAND_TIMEOUT).await?;
        client
            .call("Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;

        let download_dir = dirs::download_dir().unwrap_or_else(std::env::temp_dir);
        if let Err(e) = client
            .call(
                "Browser.setDownloadBehavior",
                json!({
                    "behavior": "allow",
                    "downloadPath": download_dir,
                    "eventsEnabled": true,
                }),
            )
            .await
        {
            warn!("Download events unavailable: {}", e);
        }

        let downloads = Arc::new(Mutex::new(HashMap::new()));
        let download_watch = tokio::spawn(watch_downloads(
            client.subscribe(None, "Browser.downloadWillBegin"),
            downloads.clone(),
        ));

        Ok(Self {
            client,
            browser: tokio::sync::Mutex::new(child),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            downloads,
            screencasts: Mutex::new(HashMap::new()),
            download_watch,
            emulation,
        })
    }

    /// Flattened session for `target`, attaching on first use.
    async fn session(&self, target: &TargetId) -> Result<String> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(target) {
            return Ok(session.clone());
        }

        let attached = self
            .client
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target, "flatten": true }),
            )
            .await
            .map_err(|e| match e {
                PagewrightError::Protocol(m) if m.contains("No target") => {
                    PagewrightError::SessionClosed(format!("target {} is gone", target))
                }
                other => other,
            })?;
        let session = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PagewrightError::Protocol("attachToTarget returned no sessionId".into()))?
            .to_string();

        for domain in ["Page", "Runtime", "DOM", "Network"] {
            self.client
                .call_session(Some(&session), &format!("{}.enable", domain), json!({}))
                .await?;
        }
        for (method, params) in &self.emulation {
            self.client
                .call_session(Some(&session), method, params.clone())
                .await?;
        }

        debug!(target = %target, session = %session, "attached");
        sessions.insert(target.clone(), session.clone());
        Ok(session)
    }

    async fn send(&self, target: &TargetId, method: &str, params: Value) -> Result<Value> {
        let session = self.session(target).await?;
        self.client.call_session(Some(&session), method, params).await
    }

    async fn evaluate(&self, target: &TargetId, expression: &str) -> Result<Value> {
        let result = self
            .send(
                target,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(message) = exception_message(&result) {
            return Err(PagewrightError::Protocol(message));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<()> {
        let session = self.session(target).await?;
        let mut loaded = self.client.subscribe(Some(&session), "Page.loadEventFired");

        let result = self
            .client
            .call_session(Some(&session), "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(PagewrightError::NavigationFailed {
                message: format!("{}: {}", url, error),
                steps_completed: 0,
            });
        }

        if tokio::time::timeout(LOAD_TIMEOUT, loaded.recv()).await.is_err() {
            return Err(PagewrightError::Timeout(format!(
                "{} did not fire load within {:?}",
                url, LOAD_TIMEOUT
            )));
        }
        Ok(())
    }

    async fn object_id(&self, target: &TargetId, handle: ElementHandle) -> Result<String> {
        let resolved = self
            .send(target, "DOM.resolveNode", json!({ "backendNodeId": handle.0 }))
            .await?;
        resolved
            .pointer("/object/objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PagewrightError::ElementDetached(handle.to_string()))
    }

    async fn call_on(
        &self,
        target: &TargetId,
        handle: ElementHandle,
        function: &str,
        args: &[Value],
    ) -> Result<Value> {
        let object_id = self.object_id(target, handle).await?;
        let arguments: Vec<Value> = args.iter().map(|v| json!({ "value": v })).collect();
        let result = self
            .send(
                target,
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(message) = exception_message(&result) {
            return Err(PagewrightError::Protocol(message));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Backend node ids of the elements in a remote array object.
    async fn array_handles(&self, target: &TargetId, array_id: &str) -> Result<Vec<ElementHandle>> {
        let properties = self
            .send(
                target,
                "Runtime.getProperties",
                json!({ "objectId": array_id, "ownProperties": true }),
            )
            .await?;

        let mut indexed: Vec<(usize, String)> = properties
            .get("result")
            .and_then(Value::as_array)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| {
                        let index = p.get("name")?.as_str()?.parse::<usize>().ok()?;
                        let object = p.pointer("/value/objectId")?.as_str()?;
                        Some((index, object.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        indexed.sort_by_key(|(i, _)| *i);

        let mut handles = Vec::with_capacity(indexed.len());
        for (_, object_id) in indexed {
            let described = self
                .send(target, "DOM.describeNode", json!({ "objectId": object_id }))
                .await?;
            if let Some(id) = described.pointer("/node/backendNodeId").and_then(Value::as_i64) {
                handles.push(ElementHandle(id));
            }
        }

        let _ = self
            .send(target, "Runtime.releaseObject", json!({ "objectId": array_id }))
            .await;
        Ok(handles)
    }

    async fn elements_from(&self, target: &TargetId, expression: &str) -> Result<Vec<ElementHandle>> {
        let result = self
            .send(
                target,
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": false }),
            )
            .await?;
        if let Some(message) = exception_message(&result) {
            return Err(PagewrightError::Protocol(message));
        }
        match result.pointer("/result/objectId").and_then(Value::as_str) {
            Some(array_id) => self.array_handles(target, array_id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn click_point(&self, target: &TargetId, handle: ElementHandle) -> Result<(f64, f64)> {
        let point = self.call_on(target, handle, CLICK_POINT_JS, &[]).await?;
        let x = point.get("x").and_then(Value::as_f64);
        let y = point.get("y").and_then(Value::as_f64);
        x.zip(y)
            .ok_or_else(|| PagewrightError::Protocol("Invalid element coordinates".to_string()))
    }

    async fn mouse(&self, target: &TargetId, kind: &str, x: f64, y: f64, button: &str) -> Result<()> {
        self.send(
            target,
            "Input.dispatchMouseEvent",
            json!({ "type": kind, "x": x, "y": y, "button": button, "clickCount": 1 }),
        )
        .await?;
        Ok(())
    }

    async fn full_ax_tree(&self, target: &TargetId) -> Result<Vec<Value>> {
        let tree = self
            .send(target, "Accessibility.getFullAXTree", json!({}))
            .await?;
        Ok(tree
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

async fn watch_downloads(
    mut events: mpsc::UnboundedReceiver<Value>,
    downloads: Arc<Mutex<HashMap<String, Vec<DownloadInfo>>>>,
) {
    while let Some(event) = events.recv().await {
        let frame = event.get("frameId").and_then(Value::as_str).unwrap_or_default();
        let info = DownloadInfo {
            url: event.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
            suggested_filename: event
                .get("suggestedFilename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        debug!(frame, url = %info.url, "download started");
        // A page's main frame id equals its target id.
        downloads.lock().entry(frame.to_string()).or_default().push(info);
    }
}

fn exception_message(result: &Value) -> Option<String> {
    let details = result.get("exceptionDetails")?;
    Some(
        details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("script threw an exception")
            .to_string(),
    )
}

fn property<'a>(node: &'a Value, name: &str) -> Option<&'a Value> {
    node.get("properties")?
        .as_array()?
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some(name))?
        .pointer("/value/value")
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build an [`AxNode`] tree from `Accessibility.getFullAXTree` nodes.
///
/// Ignored nodes are replaced by their children, inline text boxes are
/// dropped and a static text child repeating its parent's name is elided.
fn ax_tree(nodes: &[Value], scope: Option<ElementHandle>) -> Option<AxNode> {
    let by_id: HashMap<&str, &Value> = nodes
        .iter()
        .filter_map(|n| Some((n.get("nodeId")?.as_str()?, n)))
        .collect();

    let root = match scope {
        None => nodes.iter().find(|n| n.get("parentId").is_none())?,
        Some(handle) => nodes
            .iter()
            .find(|n| n.get("backendDOMNodeId").and_then(Value::as_i64) == Some(handle.0))?,
    };

    let mut out = Vec::new();
    convert(root, &by_id, &mut out);
    match out.len() {
        1 => out.pop(),
        _ => Some(AxNode::new("document").with_children(out)),
    }
}

fn convert(node: &Value, by_id: &HashMap<&str, &Value>, out: &mut Vec<AxNode>) {
    let raw_role = node
        .pointer("/role/value")
        .and_then(Value::as_str)
        .unwrap_or("");
    if matches!(raw_role, "InlineTextBox" | "LineBreak") {
        return;
    }

    let name = node
        .pointer("/name/value")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    if raw_role == "StaticText" {
        if let Some(name) = name {
            out.push(AxNode::named("text", name));
        }
        return;
    }

    let mut children = Vec::new();
    if let Some(ids) = node.get("childIds").and_then(Value::as_array) {
        for id in ids.iter().filter_map(Value::as_str) {
            if let Some(child) = by_id.get(id) {
                convert(child, by_id, &mut children);
            }
        }
    }

    if node.get("ignored").and_then(Value::as_bool) == Some(true) || raw_role.is_empty() {
        out.extend(children);
        return;
    }

    if name.is_some() {
        children.retain(|c| !(c.role == "text" && c.name == name));
    }

    let role = match raw_role {
        "RootWebArea" | "WebArea" => "document".to_string(),
        other => other.to_string(),
    };

    let mut ax = AxNode::new(role).with_children(children);
    ax.name = name;
    ax.handle = node
        .get("backendDOMNodeId")
        .and_then(Value::as_i64)
        .map(ElementHandle);
    ax.level = property(node, "level")
        .and_then(Value::as_u64)
        .map(|l| l as u32);
    ax.checked = property(node, "checked").and_then(|v| match v.as_str() {
        Some("true") | Some("mixed") => Some(true),
        Some("false") => Some(false),
        _ => v.as_bool(),
    });
    ax.disabled = property(node, "disabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    ax.url = property(node, "url").and_then(value_text);
    ax.value = node.pointer("/value/value").and_then(value_text);
    out.push(ax);
}

fn screencast_frame(params: &Value) -> Option<ScreencastFrame> {
    Some(ScreencastFrame {
        data: params.get("data")?.as_str()?.to_string(),
        metadata: params
            .get("metadata")
            .cloned()
            .and_then(|m| serde_json::from_value::<FrameMetadata>(m).ok())
            .unwrap_or_default(),
        session_id: params.get("sessionId")?.as_i64()?,
    })
}

fn remote_object_text(object: &Value) -> String {
    match object.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => object
            .get("description")
            .or_else(|| object.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn console_entry(params: &Value) -> ConsoleEntry {
    let args = params
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text = args
        .iter()
        .map(remote_object_text)
        .collect::<Vec<_>>()
        .join(" ");

    let location = params
        .pointer("/stackTrace/callFrames/0")
        .map(|frame| ConsoleLocation {
            url: frame.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
            line_number: frame.get("lineNumber").and_then(Value::as_i64).unwrap_or(0),
            column_number: frame.get("columnNumber").and_then(Value::as_i64).unwrap_or(0),
        });

    ConsoleEntry {
        timestamp: params
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64),
        kind: params
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("log")
            .to_string(),
        text,
        location,
        args: args
            .iter()
            .map(|a| a.get("value").cloned().unwrap_or_else(|| json!(remote_object_text(a))))
            .collect(),
    }
}

#[async_trait]
impl BrowserEngine for CdpEngine {
    fn name(&self) -> &'static str {
        "cdp"
    }

    async fn new_page(&self, url: &str) -> Result<TargetId> {
        let created = self
            .client
            .call("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| PagewrightError::Protocol("createTarget returned no targetId".into()))?
            .to_string();

        if url != "about:blank" {
            self.navigate(&target, url).await?;
        } else {
            self.session(&target).await?;
        }
        Ok(target)
    }

    async fn close_page(&self, target: &TargetId) -> Result<()> {
        self.sessions.lock().await.remove(target);
        if let Some(task) = self.screencasts.lock().remove(target) {
            task.abort();
        }
        self.client
            .call("Target.closeTarget", json!({ "targetId": target }))
            .await?;
        Ok(())
    }

    async fn targets(&self) -> Result<Vec<TargetId>> {
        let result = self.client.call("Target.getTargets", json!({})).await?;
        Ok(result
            .get("targetInfos")
            .and_then(Value::as_array)
            .map(|infos| {
                infos
                    .iter()
                    .filter(|i| i.get("type").and_then(Value::as_str) == Some("page"))
                    .filter_map(|i| i.get("targetId").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn new_targets_since(&self, known: &[TargetId], wait: Duration) -> Result<Vec<TargetId>> {
        let deadline = Instant::now() + wait;
        loop {
            let fresh: Vec<TargetId> = self
                .targets()
                .await?
                .into_iter()
                .filter(|t| !known.contains(t))
                .collect();
            if !fresh.is_empty() || Instant::now() >= deadline {
                return Ok(fresh);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn current_url(&self, target: &TargetId) -> Result<String> {
        Ok(self
            .evaluate(target, "window.location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn title(&self, target: &TargetId) -> Result<String> {
        Ok(self
            .evaluate(target, "document.title")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn navigation_history(&self, target: &TargetId) -> Result<NavigationHistory> {
        let history = self
            .send(target, "Page.getNavigationHistory", json!({}))
            .await?;
        let entries = history
            .get("entries")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| e.get("url").and_then(Value::as_str).unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let current = history
            .get("currentIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Ok(NavigationHistory { entries, current })
    }

    async fn go_back(&self, target: &TargetId) -> Result<bool> {
        let history = self
            .send(target, "Page.getNavigationHistory", json!({}))
            .await?;
        let current = history
            .get("currentIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if current == 0 {
            return Ok(false);
        }
        let entry_id = history
            .pointer(&format!("/entries/{}/id", current - 1))
            .and_then(Value::as_i64)
            .ok_or_else(|| PagewrightError::Protocol("history entry without id".into()))?;

        // Subscribe before navigating so the commit cannot be missed.
        let session = self.session(target).await?;
        let mut committed = self.client.subscribe(Some(&session), "Page.frameNavigated");
        let mut in_document = self
            .client
            .subscribe(Some(&session), "Page.navigatedWithinDocument");

        self.client
            .call_session(
                Some(&session),
                "Page.navigateToHistoryEntry",
                json!({ "entryId": entry_id }),
            )
            .await?;

        let commit = async {
            loop {
                tokio::select! {
                    event = committed.recv() => match event {
                        Some(params) if is_main_frame_navigation(&params) => return true,
                        Some(_) => {}
                        None => return false,
                    },
                    event = in_document.recv() => match event {
                        Some(_) => return true,
                        None => return false,
                    },
                }
            }
        };
        match tokio::time::timeout(LOAD_TIMEOUT, commit).await {
            Ok(true) => Ok(true),
            Ok(false) => Err(PagewrightError::SessionClosed(format!(
                "target {} went away during history navigation",
                target
            ))),
            Err(_) => Err(PagewrightError::Timeout(format!(
                "history navigation did not commit within {:?}",
                LOAD_TIMEOUT
            ))),
        }
    }

    async fn settle(&self, target: &TargetId, quiet: Duration) -> Result<()> {
        let deadline = Instant::now() + LOAD_TIMEOUT;
        loop {
            match self.evaluate(target, "document.readyState").await {
                Ok(Value::String(state)) if state == "complete" => break,
                Ok(_) => {}
                // The execution context is torn down while a navigation commits.
                Err(PagewrightError::Protocol(m)) if m.contains("context") => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(PagewrightError::Timeout(format!(
                    "page still loading after {:?}",
                    LOAD_TIMEOUT
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tokio::time::sleep(quiet).await;
        Ok(())
    }

    async fn accessibility_tree(
        &self,
        target: &TargetId,
        scope: Option<ElementHandle>,
    ) -> Result<AxNode> {
        let nodes = self.full_ax_tree(target).await?;
        ax_tree(&nodes, scope).ok_or_else(|| match scope {
            Some(handle) => {
                PagewrightError::ElementNotFound(format!("{} has no accessibility node", handle))
            }
            None => PagewrightError::Protocol("empty accessibility tree".to_string()),
        })
    }

    async fn query_selector_all(
        &self,
        target: &TargetId,
        selector: &str,
    ) -> Result<Vec<ElementHandle>> {
        let expression = format!(
            "Array.from(document.querySelectorAll({}))",
            serde_json::to_string(selector)?
        );
        self.elements_from(target, &expression).await
    }

    async fn locate(
        &self,
        target: &TargetId,
        locator: &EngineLocator,
    ) -> Result<Vec<ElementHandle>> {
        let (mode, wanted) = match locator {
            EngineLocator::Role { role, name } => {
                let nodes = self.full_ax_tree(target).await?;
                let wanted = name.as_deref().map(str::to_lowercase);
                return Ok(nodes
                    .iter()
                    .filter(|n| n.get("ignored").and_then(Value::as_bool) != Some(true))
                    .filter(|n| n.pointer("/role/value").and_then(Value::as_str) == Some(role.as_str()))
                    .filter(|n| {
                        wanted.as_deref().map_or(true, |wanted| {
                            n.pointer("/name/value")
                                .and_then(Value::as_str)
                                .is_some_and(|name| name.to_lowercase().contains(wanted))
                        })
                    })
                    .filter_map(|n| n.get("backendDOMNodeId").and_then(Value::as_i64))
                    .map(ElementHandle)
                    .collect());
            }
            EngineLocator::Text(v) => ("text", v),
            EngineLocator::Label(v) => ("label", v),
            EngineLocator::Placeholder(v) => ("placeholder", v),
            EngineLocator::Alt(v) => ("alt", v),
            EngineLocator::Title(v) => ("title", v),
            EngineLocator::TestId(v) => ("testid", v),
        };

        let expression = format!(
            "({})({}, {})",
            LOCATE_JS,
            serde_json::to_string(mode)?,
            serde_json::to_string(wanted)?
        );
        self.elements_from(target, &expression).await
    }

    async fn perform(
        &self,
        target: &TargetId,
        handle: ElementHandle,
        op: &ElementOp,
    ) -> Result<Value> {
        match op {
            ElementOp::Click => {
                let (x, y) = self.click_point(target, handle).await?;
                // Move first so the browser updates its hit-test target.
                self.mouse(target, "mouseMoved", x, y, "none").await?;
                self.mouse(target, "mousePressed", x, y, "left").await?;
                self.mouse(target, "mouseReleased", x, y, "left").await?;
                Ok(Value::Null)
            }
            ElementOp::Hover => {
                let (x, y) = self.click_point(target, handle).await?;
                self.mouse(target, "mouseMoved", x, y, "none").await?;
                Ok(Value::Null)
            }
            ElementOp::Focus => {
                self.send(target, "DOM.focus", json!({ "backendNodeId": handle.0 }))
                    .await?;
                Ok(Value::Null)
            }
            ElementOp::Fill(value) => self.call_on(target, handle, FILL_JS, &[json!(value)]).await,
            ElementOp::SelectOption(value) => {
                self.call_on(target, handle, SELECT_JS, &[json!(value)]).await
            }
            ElementOp::SetChecked(checked) => {
                self.call_on(target, handle, SET_CHECKED_JS, &[json!(checked)])
                    .await
            }
            ElementOp::SetFiles(files) => {
                let mut absolute = Vec::with_capacity(files.len());
                for file in files {
                    let expanded = shellexpand::tilde(file);
                    let path = std::fs::canonicalize(expanded.as_ref()).map_err(|e| {
                        PagewrightError::InvalidActionParameters(format!(
                            "cannot upload {}: {}",
                            file, e
                        ))
                    })?;
                    absolute.push(path.display().to_string());
                }
                self.send(
                    target,
                    "DOM.setFileInputFiles",
                    json!({ "files": absolute, "backendNodeId": handle.0 }),
                )
                .await?;
                Ok(Value::Null)
            }
            ElementOp::InnerHtml => self.call_on(target, handle, INNER_HTML_JS, &[]).await,
            ElementOp::Text => self.call_on(target, handle, TEXT_JS, &[]).await,
            ElementOp::Value => self.call_on(target, handle, VALUE_JS, &[]).await,
            ElementOp::IsVisible => self.call_on(target, handle, IS_VISIBLE_JS, &[]).await,
            ElementOp::IsEnabled => self.call_on(target, handle, IS_ENABLED_JS, &[]).await,
            ElementOp::IsChecked => self.call_on(target, handle, IS_CHECKED_JS, &[]).await,
        }
    }

    async fn press_key(&self, target: &TargetId, key: &str) -> Result<()> {
        let def = key_definition(key);
        let mut down = json!({
            "type": if def.text.is_empty() { "rawKeyDown" } else { "keyDown" },
            "key": def.key,
            "code": def.code,
            "windowsVirtualKeyCode": def.virtual_key,
        });
        if !def.text.is_empty() {
            down["text"] = json!(def.text);
        }
        self.send(target, "Input.dispatchKeyEvent", down).await?;
        self.send(
            target,
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": def.key,
                "code": def.code,
                "windowsVirtualKeyCode": def.virtual_key,
            }),
        )
        .await?;
        Ok(())
    }

    async fn take_downloads(&self, target: &TargetId) -> Result<Vec<DownloadInfo>> {
        Ok(self.downloads.lock().remove(target).unwrap_or_default())
    }

    async fn start_screencast(
        &self,
        target: &TargetId,
        params: &ScreencastParams,
    ) -> Result<mpsc::Receiver<ScreencastFrame>> {
        let session = self.session(target).await?;
        let mut events = self.client.subscribe(Some(&session), "Page.screencastFrame");
        let (tx, rx) = mpsc::channel(1);

        let forward = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(frame) = screencast_frame(&event) else {
                    debug!("malformed screencast frame");
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut request = json!({
            "format": params.format.as_str(),
            "quality": params.quality,
        });
        if let Some(w) = params.max_width {
            request["maxWidth"] = json!(w);
        }
        if let Some(h) = params.max_height {
            request["maxHeight"] = json!(h);
        }
        if let Some(n) = params.every_nth_frame {
            request["everyNthFrame"] = json!(n);
        }

        if let Err(e) = self
            .client
            .call_session(Some(&session), "Page.startScreencast", request)
            .await
        {
            forward.abort();
            return Err(e);
        }

        if let Some(previous) = self.screencasts.lock().insert(target.clone(), forward) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn ack_frame(&self, target: &TargetId, session_id: i64) -> Result<()> {
        self.send(
            target,
            "Page.screencastFrameAck",
            json!({ "sessionId": session_id }),
        )
        .await?;
        Ok(())
    }

    async fn stop_screencast(&self, target: &TargetId) -> Result<()> {
        if let Some(task) = self.screencasts.lock().remove(target) {
            task.abort();
        }
        self.send(target, "Page.stopScreencast", json!({})).await?;
        Ok(())
    }

    async fn viewport(&self, target: &TargetId) -> Result<(u32, u32)> {
        let size = self
            .evaluate(
                target,
                "({ width: window.innerWidth, height: window.innerHeight })",
            )
            .await?;
        let dim = |key: &str| size.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
        Ok((dim("width"), dim("height")))
    }

    async fn dispatch_mouse(&self, target: &TargetId, input: &MouseInput) -> Result<()> {
        let mut params = json!({
            "type": input.event_type.as_cdp(),
            "x": input.x,
            "y": input.y,
            "button": input.button.as_cdp(),
            "clickCount": input.click_count,
            "modifiers": input.modifiers,
        });
        if input.event_type == MouseEventType::Wheel {
            params["deltaX"] = json!(input.delta_x);
            params["deltaY"] = json!(input.delta_y);
        }
        self.send(target, "Input.dispatchMouseEvent", params).await?;
        Ok(())
    }

    async fn dispatch_key(&self, target: &TargetId, input: &KeyboardInput) -> Result<()> {
        let key = input.key.as_deref().unwrap_or_default();
        let def = key_definition(key);
        let mut params = json!({
            "type": input.event_type.as_cdp(),
            "key": def.key,
            "code": input.code.as_deref().unwrap_or(def.code),
            "windowsVirtualKeyCode": def.virtual_key,
            "modifiers": input.modifiers,
        });
        if let Some(text) = input.text.as_deref().or(Some(def.text).filter(|t| !t.is_empty())) {
            params["text"] = json!(text);
        }
        self.send(target, "Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    async fn dispatch_touch(&self, target: &TargetId, input: &TouchInput) -> Result<()> {
        self.send(
            target,
            "Input.dispatchTouchEvent",
            json!({
                "type": input.event_type.as_cdp(),
                "touchPoints": input.touch_points,
                "modifiers": input.modifiers,
            }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe_console(
        &self,
        target: &TargetId,
    ) -> Result<mpsc::UnboundedReceiver<ConsoleEntry>> {
        let session = self.session(target).await?;
        let mut events = self.client.subscribe(Some(&session), "Runtime.consoleAPICalled");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(console_entry(&event)).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn cookies_get(&self, target: &TargetId) -> Result<Vec<Value>> {
        let result = self.send(target, "Network.getCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn cookies_set(&self, target: &TargetId, cookies: &[Value]) -> Result<()> {
        let url = self.current_url(target).await?;
        let cookies: Vec<Value> = cookies
            .iter()
            .cloned()
            .map(|mut cookie| {
                // CDP needs either a url or a domain to scope the cookie.
                if cookie.get("url").is_none() && cookie.get("domain").is_none() {
                    cookie["url"] = json!(url);
                }
                cookie
            })
            .collect();
        self.send(target, "Network.setCookies", json!({ "cookies": cookies }))
            .await?;
        Ok(())
    }

    async fn cookies_clear(&self, target: &TargetId) -> Result<()> {
        self.send(target, "Network.clearBrowserCookies", json!({}))
            .await?;
        Ok(())
    }

    async fn storage_get(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>> {
        let value = self
            .evaluate(target, &storage::get_expression(kind, keys)?)
            .await?;
        storage::items_from_json(&value)
    }

    async fn storage_set(
        &self,
        target: &TargetId,
        kind: StorageKind,
        items: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.evaluate(target, &storage::set_expression(kind, items)?)
            .await?;
        Ok(())
    }

    async fn storage_clear(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<()> {
        self.evaluate(target, &storage::clear_expression(kind, keys)?)
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        for (_, task) in self.screencasts.lock().drain() {
            task.abort();
        }
        self.sessions.lock().await.clear();
        self.download_watch.abort();

        if let Some(mut child) = self.browser.lock().await.take() {
            if let Err(e) = self.client.call("Browser.close", json!({})).await {
                debug!("Browser.close failed: {}", e);
            }
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("browser did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        self.client.close();
        Ok(())
    }
}

/// Per-page overrides from `[browser]`. Device metrics only apply to a
/// browser we launched; an attached browser keeps its own window size.
fn emulation_commands(config: &BrowserConfig, launched: bool) -> Vec<(&'static str, Value)> {
    let mut commands = Vec::new();
    if launched {
        commands.push((
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": config.viewport_width,
                "height": config.viewport_height,
                "deviceScaleFactor": 0,
                "mobile": false,
            }),
        ));
    }
    if let Some(user_agent) = &config.user_agent {
        let mut params = json!({ "userAgent": user_agent });
        if let Some(locale) = &config.locale {
            params["acceptLanguage"] = json!(locale);
        }
        commands.push(("Emulation.setUserAgentOverride", params));
    }
    if let Some(locale) = &config.locale {
        commands.push(("Emulation.setLocaleOverride", json!({ "locale": locale })));
    }
    if let Some(timezone) = &config.timezone {
        commands.push((
            "Emulation.setTimezoneOverride",
            json!({ "timezoneId": timezone }),
        ));
    }
    commands
}

/// Main-frame commit, as reported by `Page.frameNavigated`.
fn is_main_frame_navigation(params: &Value) -> bool {
    params
        .get("frame")
        .is_some_and(|frame| frame.get("parentId").is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ax(id: &str, role: &str, name: &str, children: &[&str], backend: Option<i64>) -> Value {
        let mut node = json!({
            "nodeId": id,
            "ignored": false,
            "role": { "type": "role", "value": role },
            "name": { "type": "computedString", "value": name },
            "childIds": children,
        });
        if let Some(b) = backend {
            node["backendDOMNodeId"] = json!(b);
        }
        node
    }

    fn sample() -> Vec<Value> {
        let mut ignored = ax("2", "generic", "", &["3", "5"], Some(11));
        ignored["ignored"] = json!(true);
        ignored["parentId"] = json!("1");

        let mut heading = ax("3", "heading", "Example Domain", &["4"], Some(12));
        heading["properties"] = json!([{ "name": "level", "value": { "type": "integer", "value": 1 } }]);

        let mut link = ax("5", "link", "More", &["6"], Some(14));
        link["properties"] = json!([{ "name": "url", "value": { "type": "string", "value": "https://iana.org/" } }]);

        vec![
            ax("1", "RootWebArea", "Example", &["2"], Some(10)),
            ignored,
            heading,
            ax("4", "StaticText", "Example Domain", &["7"], None),
            link,
            ax("6", "StaticText", "More", &[], None),
            ax("7", "InlineTextBox", "Example Domain", &[], None),
        ]
    }

    #[test]
    fn ax_tree_normalizes_chrome_roles() {
        let root = ax_tree(&sample(), None).unwrap();
        assert_eq!(root.role, "document");
        assert_eq!(root.name.as_deref(), Some("Example"));

        // The ignored generic is hoisted away.
        assert_eq!(root.children.len(), 2);
        let heading = &root.children[0];
        assert_eq!(heading.level, Some(1));
        // Static text duplicating the heading name is elided.
        assert!(heading.children.is_empty());

        let link = &root.children[1];
        assert_eq!(link.handle, Some(ElementHandle(14)));
        assert_eq!(link.url.as_deref(), Some("https://iana.org/"));
    }

    #[test]
    fn ax_tree_can_be_scoped_to_a_node() {
        let scoped = ax_tree(&sample(), Some(ElementHandle(14))).unwrap();
        assert_eq!(scoped.role, "link");
        assert!(ax_tree(&sample(), Some(ElementHandle(99))).is_none());
    }

    #[test]
    fn console_entry_joins_arguments() {
        let entry = console_entry(&json!({
            "type": "warning",
            "timestamp": 1700000000000.0,
            "args": [
                { "type": "string", "value": "count" },
                { "type": "number", "value": 3 },
                { "type": "object", "description": "Object" }
            ],
            "stackTrace": { "callFrames": [{ "url": "https://a.test/app.js", "lineNumber": 4, "columnNumber": 2 }] }
        }));

        assert_eq!(entry.kind, "warning");
        assert_eq!(entry.text, "count 3 Object");
        assert_eq!(entry.timestamp, 1700000000000.0);
        assert_eq!(entry.location.unwrap().line_number, 4);
        assert_eq!(entry.args[1], json!(3));
    }

    #[test]
    fn screencast_frame_reads_metadata() {
        let frame = screencast_frame(&json!({
            "data": "aGk=",
            "sessionId": 3,
            "metadata": {
                "offsetTop": 0, "pageScaleFactor": 1, "deviceWidth": 800,
                "deviceHeight": 600, "scrollOffsetX": 0, "scrollOffsetY": 10
            }
        }))
        .unwrap();
        assert_eq!(frame.session_id, 3);
        assert_eq!(frame.metadata.device_width, 800.0);
        assert_eq!(frame.metadata.scroll_offset_y, 10.0);
    }

    #[test]
    fn exception_message_prefers_description() {
        let result = json!({
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": { "description": "Error: Element is not visible\n    at <anonymous>" }
            }
        });
        assert!(exception_message(&result).unwrap().contains("not visible"));
        assert!(exception_message(&json!({ "result": {} })).is_none());
    }

    #[test]
    fn emulation_follows_browser_config() {
        let mut config = BrowserConfig::default();
        assert!(emulation_commands(&config, false).is_empty());

        let launched = emulation_commands(&config, true);
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0, "Emulation.setDeviceMetricsOverride");
        assert_eq!(launched[0].1["width"], 1280);

        config.user_agent = Some("pagewright-test/1.0".into());
        config.locale = Some("de-DE".into());
        config.timezone = Some("Europe/Berlin".into());
        let attached = emulation_commands(&config, false);
        let methods: Vec<_> = attached.iter().map(|(m, _)| *m).collect();
        assert_eq!(
            methods,
            vec![
                "Emulation.setUserAgentOverride",
                "Emulation.setLocaleOverride",
                "Emulation.setTimezoneOverride",
            ]
        );
        assert_eq!(attached[0].1["userAgent"], "pagewright-test/1.0");
        assert_eq!(attached[0].1["acceptLanguage"], "de-DE");
        assert_eq!(attached[1].1["locale"], "de-DE");
        assert_eq!(attached[2].1["timezoneId"], "Europe/Berlin");
    }

    #[test]
    fn only_top_frame_commits_count_as_navigation() {
        assert!(is_main_frame_navigation(&json!({ "frame": { "id": "F1", "url": "https://a.test/" } })));
        assert!(!is_main_frame_navigation(&json!({ "frame": { "id": "F2", "parentId": "F1" } })));
        assert!(!is_main_frame_navigation(&json!({})));
    }
}
