//! Deterministic in-memory browser.
//!
//! Pages are built from [`MemElement`] trees registered per URL. Navigation,
//! history, popups (`target="_blank"`), downloads (`download` attribute),
//! form fields, console output (`data-log` attribute), screencast frames and
//! input events are modelled closely enough to exercise everything above
//! the [`BrowserEngine`] seam without a real browser.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::engine::{
    AxNode, BrowserEngine, ConsoleEntry, DownloadInfo, ElementHandle, ElementOp, EngineLocator,
    FrameMetadata, KeyboardInput, MouseInput, NavigationHistory, ScreencastFrame,
    ScreencastParams, StorageKind, TargetId, TouchInput,
};
use crate::error::{PagewrightError, Result};

/// Static description of an element, used to build pages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemElement {
    tag: String,
    #[serde(default)]
    attrs: BTreeMap<String, String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    children: Vec<MemElement>,
}

/// One page of a fixture file: `{"<url>": {"title": "...", "body": [...]}}`.
#[derive(Debug, Clone, Deserialize)]
struct SiteFixture {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Vec<MemElement>,
}

impl MemElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: MemElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = MemElement>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn link(text: &str, href: &str) -> Self {
        Self::new("a").attr("href", href).text(text)
    }

    pub fn button(text: &str) -> Self {
        Self::new("button").text(text)
    }

    pub fn heading(level: u32, text: &str) -> Self {
        Self::new(format!("h{}", level.clamp(1, 6))).text(text)
    }

    pub fn paragraph(text: &str) -> Self {
        Self::new("p").text(text)
    }

    pub fn input(kind: &str) -> Self {
        Self::new("input").attr("type", kind)
    }
}

/// An input event the engine received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedInput {
    Mouse(MouseInput),
    Keyboard(KeyboardInput),
    Touch(TouchInput),
    /// Named key sent through `press_key`.
    Key(String),
}

#[derive(Debug, Clone)]
struct DomNode {
    id: i64,
    tag: String,
    attrs: BTreeMap<String, String>,
    text: Option<String>,
    value: String,
    checked: bool,
    children: Vec<DomNode>,
}

impl DomNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    fn input_type(&self) -> &str {
        self.attr("type").unwrap_or("text")
    }

    fn role(&self) -> Option<String> {
        if let Some(role) = self.attr("role") {
            return Some(role.to_string());
        }
        let role = match self.tag.as_str() {
            "a" if self.has_attr("href") => "link",
            "a" | "div" | "span" | "label" => "generic",
            "button" => "button",
            "input" => match self.input_type() {
                "checkbox" => "checkbox",
                "radio" => "radio",
                "search" => "searchbox",
                "button" | "submit" | "reset" | "file" => "button",
                "number" => "spinbutton",
                "range" => "slider",
                "hidden" => return None,
                _ => "textbox",
            },
            "textarea" => "textbox",
            "select" => "combobox",
            "option" => "option",
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
            "p" => "paragraph",
            "ul" | "ol" => "list",
            "li" => "listitem",
            "nav" => "navigation",
            "main" => "main",
            "header" => "banner",
            "footer" => "contentinfo",
            "form" => "form",
            "img" => "img",
            "table" => "table",
            "tr" => "row",
            "td" => "cell",
            "th" => "columnheader",
            "section" => "region",
            "article" => "article",
            _ => "generic",
        };
        Some(role.to_string())
    }

    fn text_content(&self) -> String {
        let mut parts = Vec::new();
        if let Some(text) = &self.text {
            parts.push(text.clone());
        }
        for child in &self.children {
            let t = child.text_content();
            if !t.is_empty() {
                parts.push(t);
            }
        }
        parts.join(" ")
    }

    fn is_text_entry(&self) -> bool {
        matches!(self.tag.as_str(), "textarea")
            || (self.tag == "input"
                && !matches!(
                    self.input_type(),
                    "checkbox" | "radio" | "file" | "button" | "submit" | "reset" | "hidden"
                ))
    }

    fn is_checkable(&self) -> bool {
        self.tag == "input" && matches!(self.input_type(), "checkbox" | "radio")
    }

    fn inner_html(&self) -> String {
        let mut out = String::new();
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.children {
            out.push_str(&child.outer_html());
        }
        out
    }

    fn outer_html(&self) -> String {
        let attrs: String = self
            .attrs
            .iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, v))
            .collect();
        format!("<{}{}>{}</{}>", self.tag, attrs, self.inner_html(), self.tag)
    }
}

struct Document {
    title: String,
    body: Vec<DomNode>,
}

impl Document {
    /// Elements in document order with their ancestor chains.
    fn walk(&self) -> Vec<(&DomNode, Vec<&DomNode>)> {
        fn visit<'a>(
            node: &'a DomNode,
            ancestors: &mut Vec<&'a DomNode>,
            out: &mut Vec<(&'a DomNode, Vec<&'a DomNode>)>,
        ) {
            out.push((node, ancestors.clone()));
            ancestors.push(node);
            for child in &node.children {
                visit(child, ancestors, out);
            }
            ancestors.pop();
        }

        let mut out = Vec::new();
        for node in &self.body {
            visit(node, &mut Vec::new(), &mut out);
        }
        out
    }

    fn find(&self, id: i64) -> Option<(&DomNode, Vec<&DomNode>)> {
        self.walk().into_iter().find(|(n, _)| n.id == id)
    }

    fn find_mut(&mut self, id: i64) -> Option<&mut DomNode> {
        fn search(nodes: &mut [DomNode], id: i64) -> Option<&mut DomNode> {
            for node in nodes {
                if node.id == id {
                    return Some(node);
                }
                if let Some(found) = search(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&mut self.body, id)
    }

    fn is_hidden(&self, id: i64) -> bool {
        match self.find(id) {
            Some((node, ancestors)) => {
                node.has_attr("hidden") || ancestors.iter().any(|a| a.has_attr("hidden"))
            }
            None => true,
        }
    }

    fn accessible_name(&self, node: &DomNode) -> Option<String> {
        if let Some(label) = node.attr("aria-label") {
            return Some(label.to_string());
        }
        if node.tag == "img" {
            return node.attr("alt").map(str::to_string);
        }
        if node.is_text_entry() || node.is_checkable() || node.tag == "select" {
            if let Some(label) = self.label_for(node) {
                return Some(label);
            }
            return node
                .attr("placeholder")
                .or_else(|| node.attr("title"))
                .map(str::to_string);
        }
        match node.role().as_deref() {
            Some("link" | "button" | "heading" | "option" | "listitem" | "cell" | "columnheader") => {
                let text = node.text_content();
                if text.is_empty() {
                    node.attr("title").map(str::to_string)
                } else {
                    Some(text)
                }
            }
            _ => node.attr("title").map(str::to_string),
        }
    }

    fn label_for(&self, node: &DomNode) -> Option<String> {
        let id = node.attr("id")?;
        self.walk()
            .into_iter()
            .find(|(n, _)| n.tag == "label" && n.attr("for") == Some(id))
            .map(|(n, _)| n.text_content())
    }

    fn ax(&self, node: &DomNode, base_url: &str) -> Option<AxNode> {
        if node.has_attr("hidden") {
            return None;
        }
        let role = node.role()?;
        let mut ax = AxNode::new(role.clone());
        ax.name = self.accessible_name(node);
        ax.handle = Some(ElementHandle(node.id));
        ax.disabled = node.has_attr("disabled");

        if let Some(level) = node.tag.strip_prefix('h').and_then(|l| l.parse().ok()) {
            ax.level = Some(level);
        }
        if node.is_checkable() {
            ax.checked = Some(node.checked);
        }
        if node.is_text_entry() || node.tag == "select" {
            ax.value = Some(node.value.clone());
        }
        if role == "link" {
            ax.url = node.attr("href").map(|h| resolve_url(base_url, h));
        }

        // Interactive nodes take their text as name; others expose it as a text child.
        let named_by_text = matches!(
            role.as_str(),
            "link" | "button" | "heading" | "option" | "listitem" | "cell" | "columnheader"
        );
        if let Some(text) = node.text.as_ref().filter(|_| !named_by_text) {
            ax.children.push(AxNode::named("text", text.clone()));
        }
        for child in &node.children {
            if let Some(child_ax) = self.ax(child, base_url) {
                ax.children.push(child_ax);
            }
        }
        Some(ax)
    }

    fn root_ax(&self, base_url: &str) -> AxNode {
        let mut root = AxNode::named("document", self.title.clone());
        for node in &self.body {
            if let Some(ax) = self.ax(node, base_url) {
                root.children.push(ax);
            }
        }
        root
    }
}

/// `scheme://host` of a URL, if it has one.
fn origin(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")? + 3;
    let host_end = url[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(url.len());
    Some(&url[..host_end])
}

/// Browsers report `https://example.com` as `https://example.com/`.
fn canonical_url(url: &str) -> String {
    match origin(url) {
        Some(o) if o.len() == url.len() => format!("{}/", url),
        _ => url.to_string(),
    }
}

fn resolve_url(base: &str, href: &str) -> String {
    if href.contains("://") || href.starts_with("about:") || href.starts_with("data:") {
        return canonical_url(href);
    }
    let origin = origin(base).unwrap_or("");
    if href.starts_with('/') {
        format!("{}{}", origin, href)
    } else if href.starts_with('#') || href.starts_with('?') {
        let base = base.split(['#', '?']).next().unwrap_or(base);
        format!("{}{}", base, href)
    } else {
        let dir = base.rsplit_once('/').map(|(d, _)| d).unwrap_or(origin);
        let dir = if dir.len() < origin.len() { origin } else { dir };
        format!("{}/{}", dir, href)
    }
}

/// One compound selector: `tag#id.class[attr=value]`.
#[derive(Debug, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Compound {
    fn parse(input: &str) -> Result<Self> {
        let unsupported =
            || PagewrightError::Protocol(format!("unsupported selector syntax: {}", input));
        let mut compound = Compound::default();
        let mut rest = input;

        let tag_end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
        let tag = &rest[..tag_end];
        if !tag.is_empty() && tag != "*" {
            if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(unsupported());
            }
            compound.tag = Some(tag.to_ascii_lowercase());
        }
        rest = &rest[tag_end..];

        while let Some(first) = rest.chars().next() {
            match first {
                '#' | '.' => {
                    let end = rest[1..].find(['#', '.', '[']).map(|i| i + 1).unwrap_or(rest.len());
                    let name = rest[1..end].to_string();
                    if name.is_empty() {
                        return Err(unsupported());
                    }
                    if first == '#' {
                        compound.id = Some(name);
                    } else {
                        compound.classes.push(name);
                    }
                    rest = &rest[end..];
                }
                '[' => {
                    let end = rest.find(']').ok_or_else(unsupported)?;
                    let body = &rest[1..end];
                    let attr = match body.split_once('=') {
                        Some((name, value)) => (
                            name.trim().to_string(),
                            Some(value.trim().trim_matches(['"', '\'']).to_string()),
                        ),
                        None => (body.trim().to_string(), None),
                    };
                    compound.attrs.push(attr);
                    rest = &rest[end + 1..];
                }
                _ => return Err(unsupported()),
            }
        }
        Ok(compound)
    }

    fn matches(&self, node: &DomNode) -> bool {
        if self.tag.as_deref().is_some_and(|t| t != node.tag) {
            return false;
        }
        if self.id.as_deref().is_some_and(|id| node.attr("id") != Some(id)) {
            return false;
        }
        let classes: Vec<&str> = node
            .attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();
        if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
        self.attrs.iter().all(|(name, value)| match value {
            Some(v) => node.attr(name) == Some(v.as_str()),
            None => node.has_attr(name),
        })
    }
}

/// Descendant-combinator chain of compounds; comma-separated alternatives.
fn select<'a>(doc: &'a Document, selector: &str) -> Result<Vec<&'a DomNode>> {
    let alternatives: Vec<Vec<Compound>> = selector
        .split(',')
        .map(|alt| {
            let parts: Vec<&str> = alt.split_whitespace().collect();
            if parts.is_empty() {
                return Err(PagewrightError::Protocol(format!(
                    "empty selector: '{}'",
                    selector
                )));
            }
            parts.into_iter().map(Compound::parse).collect()
        })
        .collect::<Result<_>>()?;

    Ok(doc
        .walk()
        .into_iter()
        .filter(|(node, ancestors)| {
            alternatives.iter().any(|chain| {
                let Some((last, rest)) = chain.split_last() else {
                    return false;
                };
                if !last.matches(node) {
                    return false;
                }
                // Match remaining compounds right-to-left against the ancestor chain.
                let mut pending = rest.iter().rev().peekable();
                for ancestor in ancestors.iter().rev() {
                    if let Some(c) = pending.peek() {
                        if c.matches(ancestor) {
                            pending.next();
                        }
                    }
                }
                pending.peek().is_none()
            })
        })
        .map(|(node, _)| node)
        .collect())
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

struct MemPage {
    target: TargetId,
    history: Vec<String>,
    index: usize,
    doc: Document,
    focused: Option<i64>,
    hovered: Option<i64>,
    downloads: Vec<DownloadInfo>,
    screencast: Option<mpsc::Sender<ScreencastFrame>>,
    next_frame: i64,
    acked: Vec<i64>,
    console: Vec<mpsc::UnboundedSender<ConsoleEntry>>,
    local: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
    inputs: Vec<RecordedInput>,
    detach_next: usize,
    perform_calls: usize,
}

impl MemPage {
    fn url(&self) -> &str {
        &self.history[self.index]
    }

    fn emit_console(&mut self, kind: &str, text: &str) {
        let entry = ConsoleEntry {
            timestamp: chrono::Utc::now().timestamp_millis() as f64,
            kind: kind.to_string(),
            text: text.to_string(),
            location: None,
            args: vec![Value::String(text.to_string())],
        };
        self.console.retain(|tx| tx.send(entry.clone()).is_ok());
    }
}

#[derive(Default)]
struct State {
    sites: HashMap<String, (String, Vec<MemElement>)>,
    pages: Vec<MemPage>,
    next_target: u64,
    next_node: i64,
    cookies: Vec<Value>,
    screencast_delay: Duration,
    settle_delay: Duration,
}

impl State {
    fn build_doc(&mut self, url: &str) -> Document {
        let (title, elements) = self
            .sites
            .get(url)
            .cloned()
            .unwrap_or_else(|| (String::new(), Vec::new()));
        let body = elements.iter().map(|e| self.build_node(e)).collect();
        Document { title, body }
    }

    fn build_node(&mut self, element: &MemElement) -> DomNode {
        self.next_node += 1;
        let id = self.next_node;
        let children: Vec<DomNode> = element.children.iter().map(|c| self.build_node(c)).collect();

        let value = if element.tag == "select" {
            children
                .iter()
                .find(|o| o.has_attr("selected"))
                .or_else(|| children.first())
                .map(|o| o.attr("value").map(str::to_string).unwrap_or_else(|| o.text_content()))
                .unwrap_or_default()
        } else {
            element.attrs.get("value").cloned().unwrap_or_default()
        };

        DomNode {
            id,
            tag: element.tag.clone(),
            attrs: element.attrs.clone(),
            text: element.text.clone(),
            value,
            checked: element.attrs.contains_key("checked"),
            children,
        }
    }

    fn open(&mut self, url: &str) -> TargetId {
        self.next_target += 1;
        let target = format!("T{}", self.next_target);
        let url = canonical_url(url);
        let doc = self.build_doc(&url);
        self.pages.push(MemPage {
            target: target.clone(),
            history: vec![url],
            index: 0,
            doc,
            focused: None,
            hovered: None,
            downloads: Vec::new(),
            screencast: None,
            next_frame: 0,
            acked: Vec::new(),
            console: Vec::new(),
            local: BTreeMap::new(),
            session: BTreeMap::new(),
            inputs: Vec::new(),
            detach_next: 0,
            perform_calls: 0,
        });
        target
    }

    fn page_index(&self, target: &TargetId) -> Result<usize> {
        self.pages
            .iter()
            .position(|p| &p.target == target)
            .ok_or_else(|| PagewrightError::SessionClosed(format!("no target {}", target)))
    }

    fn page(&self, target: &TargetId) -> Result<&MemPage> {
        let i = self.page_index(target)?;
        Ok(&self.pages[i])
    }

    fn page_mut(&mut self, target: &TargetId) -> Result<&mut MemPage> {
        let i = self.page_index(target)?;
        Ok(&mut self.pages[i])
    }

    fn navigate(&mut self, target: &TargetId, url: &str) -> Result<()> {
        let url = canonical_url(url);
        let doc = self.build_doc(&url);
        let page = self.page_mut(target)?;
        page.history.truncate(page.index + 1);
        page.history.push(url);
        page.index += 1;
        page.doc = doc;
        page.focused = None;
        Ok(())
    }

    fn load_history_entry(&mut self, target: &TargetId, index: usize) -> Result<()> {
        let url = self.page(target)?.history[index].clone();
        let doc = self.build_doc(&url);
        let page = self.page_mut(target)?;
        page.index = index;
        page.doc = doc;
        page.focused = None;
        Ok(())
    }

    fn click(&mut self, target: &TargetId, id: i64) -> Result<()> {
        let page = self.page_mut(target)?;
        let base = page.url().to_string();
        let (node, ancestors) = page
            .doc
            .find(id)
            .ok_or_else(|| PagewrightError::ElementDetached(ElementHandle(id).to_string()))?;

        let log = node.attr("data-log").map(str::to_string);
        let href = node.attr("href").map(|h| resolve_url(&base, h));
        let opens_tab = node.attr("target") == Some("_blank");
        let download = node.attr("download").map(str::to_string);
        let toggles = node.is_checkable();
        let is_radio = node.input_type() == "radio";
        let submits = (node.tag == "button" && node.attr("type").unwrap_or("submit") == "submit")
            || (node.tag == "input" && node.input_type() == "submit");
        let form_action = ancestors
            .iter()
            .rev()
            .find(|a| a.tag == "form")
            .and_then(|f| f.attr("action"))
            .map(|a| resolve_url(&base, a));

        if let Some(text) = log {
            page.emit_console("log", &text);
        }

        if toggles {
            if let Some(node) = page.doc.find_mut(id) {
                node.checked = if is_radio { true } else { !node.checked };
            }
            return Ok(());
        }

        match (href, download) {
            (Some(url), Some(name)) => {
                let suggested_filename = if name.is_empty() {
                    url.rsplit('/').next().unwrap_or("download").to_string()
                } else {
                    name
                };
                page.downloads.push(DownloadInfo {
                    url,
                    suggested_filename,
                });
                Ok(())
            }
            (Some(url), None) if opens_tab => {
                self.open(&url);
                Ok(())
            }
            (Some(url), None) => self.navigate(target, &url),
            (None, _) => match form_action.filter(|_| submits) {
                Some(action) => self.navigate(target, &action),
                None => Ok(()),
            },
        }
    }

    fn perform(&mut self, target: &TargetId, id: i64, op: &ElementOp) -> Result<Value> {
        {
            let page = self.page_mut(target)?;
            page.perform_calls += 1;
            if page.detach_next > 0 {
                page.detach_next -= 1;
                return Err(PagewrightError::Protocol(
                    "No node with given id found".to_string(),
                ));
            }
        }

        let detached = || PagewrightError::ElementDetached(ElementHandle(id).to_string());
        let page = self.page_mut(target)?;
        let hidden = page.doc.is_hidden(id);
        let node = page.doc.find(id).map(|(n, _)| n.clone()).ok_or_else(detached)?;

        let value = match op {
            ElementOp::Click => {
                if hidden {
                    return Err(PagewrightError::Protocol(
                        "Element is not visible".to_string(),
                    ));
                }
                if node.has_attr("disabled") {
                    return Err(PagewrightError::Protocol(format!(
                        "Element <{}> is disabled",
                        node.tag
                    )));
                }
                page.focused = Some(id);
                self.click(target, id)?;
                Value::Null
            }
            ElementOp::Hover => {
                page.hovered = Some(id);
                Value::Null
            }
            ElementOp::Focus => {
                page.focused = Some(id);
                Value::Null
            }
            ElementOp::Fill(value) => {
                if !node.is_text_entry() {
                    return Err(PagewrightError::Protocol(format!(
                        "Element <{}> is not an <input>, <textarea> or [contenteditable] element",
                        node.tag
                    )));
                }
                let limit = node.attr("maxlength").and_then(|m| m.parse::<usize>().ok());
                let stored: String = match limit {
                    Some(n) => value.chars().take(n).collect(),
                    None => value.clone(),
                };
                if let Some(n) = page.doc.find_mut(id) {
                    n.value = stored;
                }
                page.focused = Some(id);
                Value::Null
            }
            ElementOp::SelectOption(wanted) => {
                if node.tag != "select" {
                    return Err(PagewrightError::Protocol(
                        "Element is not a <select> element".to_string(),
                    ));
                }
                let chosen = node
                    .children
                    .iter()
                    .map(|o| o.attr("value").map(str::to_string).unwrap_or_else(|| o.text_content()))
                    .zip(node.children.iter().map(|o| o.text_content()))
                    .find(|(value, label)| value == wanted || label == wanted)
                    .map(|(value, _)| value)
                    .ok_or_else(|| {
                        PagewrightError::Protocol(format!("No option \"{}\" to select", wanted))
                    })?;
                if let Some(n) = page.doc.find_mut(id) {
                    n.value = chosen;
                }
                Value::Null
            }
            ElementOp::SetChecked(checked) => {
                if !node.is_checkable() {
                    return Err(PagewrightError::Protocol(
                        "Not a checkbox or radio button".to_string(),
                    ));
                }
                if let Some(n) = page.doc.find_mut(id) {
                    n.checked = *checked;
                }
                Value::Bool(*checked)
            }
            ElementOp::SetFiles(files) => {
                if node.tag != "input" || node.input_type() != "file" {
                    return Err(PagewrightError::Protocol(
                        "Node is not a file input element".to_string(),
                    ));
                }
                if let Some(n) = page.doc.find_mut(id) {
                    n.value = files.join(",");
                }
                Value::Null
            }
            ElementOp::InnerHtml => Value::String(node.inner_html()),
            ElementOp::Text => Value::String(node.text_content()),
            ElementOp::Value => Value::String(node.value.clone()),
            ElementOp::IsVisible => Value::Bool(!hidden),
            ElementOp::IsEnabled => Value::Bool(!node.has_attr("disabled")),
            ElementOp::IsChecked => Value::Bool(node.checked),
        };
        Ok(value)
    }
}

pub struct MemoryEngine {
    state: Mutex<State>,
    viewport: (u32, u32),
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            viewport: (1280, 720),
        }
    }

    /// Register the page served at `url`.
    pub fn add_page(&self, url: &str, title: &str, body: Vec<MemElement>) {
        self.state
            .lock()
            .sites
            .insert(canonical_url(url), (title.to_string(), body));
    }

    /// Register every page of a JSON fixture file.
    pub fn load_fixtures(&self, path: &std::path::Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let sites: BTreeMap<String, SiteFixture> = serde_json::from_str(&content)?;
        let count = sites.len();
        for (url, site) in sites {
            self.add_page(&url, &site.title, site.body);
        }
        Ok(count)
    }

    /// Make the next `count` element operations on `target` fail as detached.
    pub fn detach_next(&self, target: &TargetId, count: usize) -> Result<()> {
        self.state.lock().page_mut(target)?.detach_next = count;
        Ok(())
    }

    /// Number of element operations attempted on `target`.
    pub fn perform_calls(&self, target: &TargetId) -> Result<usize> {
        Ok(self.state.lock().page(target)?.perform_calls)
    }

    /// Rebuild the current document, giving every element a new node id.
    pub fn rerender(&self, target: &TargetId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state.page(target)?.index;
        state.load_history_entry(target, index)
    }

    pub fn inputs(&self, target: &TargetId) -> Result<Vec<RecordedInput>> {
        Ok(self.state.lock().page(target)?.inputs.clone())
    }

    pub fn acked_frames(&self, target: &TargetId) -> Result<Vec<i64>> {
        Ok(self.state.lock().page(target)?.acked.clone())
    }

    pub fn emit_console(&self, target: &TargetId, kind: &str, text: &str) -> Result<()> {
        self.state.lock().page_mut(target)?.emit_console(kind, text);
        Ok(())
    }

    /// Render one screencast frame; waits while the frame channel is full.
    pub async fn push_frame(&self, target: &TargetId, image: &[u8]) -> Result<()> {
        let (sender, frame) = {
            let mut state = self.state.lock();
            let page = state.page_mut(target)?;
            let sender = page.screencast.clone().ok_or_else(|| {
                PagewrightError::Protocol(format!("no screencast on {}", target))
            })?;
            page.next_frame += 1;
            let frame = ScreencastFrame {
                data: base64::engine::general_purpose::STANDARD.encode(image),
                metadata: FrameMetadata {
                    device_width: self.viewport.0 as f64,
                    device_height: self.viewport.1 as f64,
                    page_scale_factor: 1.0,
                    ..Default::default()
                },
                session_id: page.next_frame,
            };
            (sender, frame)
        };
        sender
            .send(frame)
            .await
            .map_err(|_| PagewrightError::Protocol("screencast closed".to_string()))
    }

    /// Make every later `start_screencast` wait `delay` before it answers.
    pub fn delay_screencast_start(&self, delay: Duration) {
        self.state.lock().screencast_delay = delay;
    }

    /// Make every later `settle` take `delay`, as a slow page load would.
    pub fn delay_settle(&self, delay: Duration) {
        self.state.lock().settle_delay = delay;
    }

    pub fn is_screencasting(&self, target: &TargetId) -> Result<bool> {
        Ok(self.state.lock().page(target)?.screencast.is_some())
    }
}

#[async_trait]
impl BrowserEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn new_page(&self, url: &str) -> Result<TargetId> {
        Ok(self.state.lock().open(url))
    }

    async fn close_page(&self, target: &TargetId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state.page_index(target)?;
        state.pages.remove(index);
        Ok(())
    }

    async fn targets(&self) -> Result<Vec<TargetId>> {
        Ok(self.state.lock().pages.iter().map(|p| p.target.clone()).collect())
    }

    async fn new_targets_since(&self, known: &[TargetId], _wait: Duration) -> Result<Vec<TargetId>> {
        // Popups open synchronously here, so there is nothing to wait for.
        Ok(self
            .state
            .lock()
            .pages
            .iter()
            .filter(|p| !known.contains(&p.target))
            .map(|p| p.target.clone())
            .collect())
    }

    async fn current_url(&self, target: &TargetId) -> Result<String> {
        Ok(self.state.lock().page(target)?.url().to_string())
    }

    async fn title(&self, target: &TargetId) -> Result<String> {
        Ok(self.state.lock().page(target)?.doc.title.clone())
    }

    async fn navigation_history(&self, target: &TargetId) -> Result<NavigationHistory> {
        let state = self.state.lock();
        let page = state.page(target)?;
        Ok(NavigationHistory {
            entries: page.history.clone(),
            current: page.index,
        })
    }

    async fn go_back(&self, target: &TargetId) -> Result<bool> {
        let mut state = self.state.lock();
        let index = state.page(target)?.index;
        if index == 0 {
            return Ok(false);
        }
        state.load_history_entry(target, index - 1)?;
        Ok(true)
    }

    async fn settle(&self, target: &TargetId, _quiet: Duration) -> Result<()> {
        let delay = {
            let state = self.state.lock();
            state.page(target)?;
            state.settle_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn accessibility_tree(
        &self,
        target: &TargetId,
        scope: Option<ElementHandle>,
    ) -> Result<AxNode> {
        let state = self.state.lock();
        let page = state.page(target)?;
        match scope {
            None => Ok(page.doc.root_ax(page.url())),
            Some(handle) => {
                let (node, _) = page
                    .doc
                    .find(handle.0)
                    .ok_or_else(|| PagewrightError::ElementDetached(handle.to_string()))?;
                page.doc.ax(node, page.url()).ok_or_else(|| {
                    PagewrightError::ElementNotFound(format!("{} is not rendered", handle))
                })
            }
        }
    }

    async fn query_selector_all(
        &self,
        target: &TargetId,
        selector: &str,
    ) -> Result<Vec<ElementHandle>> {
        let state = self.state.lock();
        let page = state.page(target)?;
        Ok(select(&page.doc, selector)?
            .into_iter()
            .map(|n| ElementHandle(n.id))
            .collect())
    }

    async fn locate(
        &self,
        target: &TargetId,
        locator: &EngineLocator,
    ) -> Result<Vec<ElementHandle>> {
        let state = self.state.lock();
        let doc = &state.page(target)?.doc;

        let matches = |node: &DomNode| -> bool {
            match locator {
                EngineLocator::Role { role, name } => {
                    node.role().as_deref() == Some(role.as_str())
                        && !doc.is_hidden(node.id)
                        && name.as_ref().map_or(true, |wanted| {
                            doc.accessible_name(node)
                                .is_some_and(|n| contains_ci(&n, wanted))
                        })
                }
                EngineLocator::Text(text) => {
                    node.text.as_deref().is_some_and(|t| contains_ci(t, text))
                }
                EngineLocator::Label(text) => {
                    node.attr("aria-label").is_some_and(|l| contains_ci(l, text))
                        || doc.label_for(node).is_some_and(|l| contains_ci(&l, text))
                }
                EngineLocator::Placeholder(text) => {
                    node.attr("placeholder").is_some_and(|p| contains_ci(p, text))
                }
                EngineLocator::Alt(text) => node.attr("alt").is_some_and(|a| contains_ci(a, text)),
                EngineLocator::Title(text) => {
                    node.attr("title").is_some_and(|t| contains_ci(t, text))
                }
                EngineLocator::TestId(id) => node.attr("data-testid") == Some(id.as_str()),
            }
        };

        Ok(doc
            .walk()
            .into_iter()
            .filter(|(node, _)| matches(node))
            .map(|(node, _)| ElementHandle(node.id))
            .collect())
    }

    async fn perform(
        &self,
        target: &TargetId,
        handle: ElementHandle,
        op: &ElementOp,
    ) -> Result<Value> {
        self.state.lock().perform(target, handle.0, op)
    }

    async fn press_key(&self, target: &TargetId, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let page = state.page_mut(target)?;
        page.inputs.push(RecordedInput::Key(key.to_string()));

        // Enter in a field submits its form.
        let action = match (key, page.focused) {
            ("Enter", Some(id)) => {
                let base = page.url().to_string();
                page.doc.find(id).and_then(|(_, ancestors)| {
                    ancestors
                        .iter()
                        .rev()
                        .find(|a| a.tag == "form")
                        .and_then(|f| f.attr("action"))
                        .map(|a| resolve_url(&base, a))
                })
            }
            _ => None,
        };
        if let Some(url) = action {
            state.navigate(target, &url)?;
        }
        Ok(())
    }

    async fn take_downloads(&self, target: &TargetId) -> Result<Vec<DownloadInfo>> {
        Ok(std::mem::take(
            &mut self.state.lock().page_mut(target)?.downloads,
        ))
    }

    async fn start_screencast(
        &self,
        target: &TargetId,
        _params: &ScreencastParams,
    ) -> Result<mpsc::Receiver<ScreencastFrame>> {
        let delay = self.state.lock().screencast_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = mpsc::channel(1);
        self.state.lock().page_mut(target)?.screencast = Some(tx);
        Ok(rx)
    }

    async fn ack_frame(&self, target: &TargetId, session_id: i64) -> Result<()> {
        self.state.lock().page_mut(target)?.acked.push(session_id);
        Ok(())
    }

    async fn stop_screencast(&self, target: &TargetId) -> Result<()> {
        self.state.lock().page_mut(target)?.screencast = None;
        Ok(())
    }

    async fn viewport(&self, target: &TargetId) -> Result<(u32, u32)> {
        self.state.lock().page(target)?;
        Ok(self.viewport)
    }

    async fn dispatch_mouse(&self, target: &TargetId, input: &MouseInput) -> Result<()> {
        self.state
            .lock()
            .page_mut(target)?
            .inputs
            .push(RecordedInput::Mouse(input.clone()));
        Ok(())
    }

    async fn dispatch_key(&self, target: &TargetId, input: &KeyboardInput) -> Result<()> {
        self.state
            .lock()
            .page_mut(target)?
            .inputs
            .push(RecordedInput::Keyboard(input.clone()));
        Ok(())
    }

    async fn dispatch_touch(&self, target: &TargetId, input: &TouchInput) -> Result<()> {
        self.state
            .lock()
            .page_mut(target)?
            .inputs
            .push(RecordedInput::Touch(input.clone()));
        Ok(())
    }

    async fn subscribe_console(
        &self,
        target: &TargetId,
    ) -> Result<mpsc::UnboundedReceiver<ConsoleEntry>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().page_mut(target)?.console.push(tx);
        Ok(rx)
    }

    async fn cookies_get(&self, _target: &TargetId) -> Result<Vec<Value>> {
        Ok(self.state.lock().cookies.clone())
    }

    async fn cookies_set(&self, _target: &TargetId, cookies: &[Value]) -> Result<()> {
        let mut state = self.state.lock();
        for cookie in cookies {
            let name = cookie.get("name").cloned();
            state.cookies.retain(|c| c.get("name") != name.as_ref());
            state.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn cookies_clear(&self, _target: &TargetId) -> Result<()> {
        self.state.lock().cookies.clear();
        Ok(())
    }

    async fn storage_get(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>> {
        let state = self.state.lock();
        let page = state.page(target)?;
        let storage = match kind {
            StorageKind::Local => &page.local,
            StorageKind::Session => &page.session,
        };
        Ok(storage
            .iter()
            .filter(|(k, _)| keys.map_or(true, |keys| keys.contains(k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn storage_set(
        &self,
        target: &TargetId,
        kind: StorageKind,
        items: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let page = state.page_mut(target)?;
        let storage = match kind {
            StorageKind::Local => &mut page.local,
            StorageKind::Session => &mut page.session,
        };
        storage.extend(items.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn storage_clear(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let page = state.page_mut(target)?;
        let storage = match kind {
            StorageKind::Local => &mut page.local,
            StorageKind::Session => &mut page.session,
        };
        match keys {
            Some(keys) => storage.retain(|k, _| !keys.contains(k)),
            None => storage.clear(),
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.lock().pages.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(engine: &MemoryEngine, url: &str, body: Vec<MemElement>) -> Document {
        engine.add_page(url, "t", body);
        engine.state.lock().build_doc(&canonical_url(url))
    }

    #[test]
    fn canonical_url_adds_root_path() {
        assert_eq!(canonical_url("https://example.com"), "https://example.com/");
        assert_eq!(canonical_url("https://example.com/a"), "https://example.com/a");
        assert_eq!(canonical_url("about:blank"), "about:blank");
    }

    #[test]
    fn resolve_url_handles_relative_forms() {
        let base = "https://example.com/docs/page";
        assert_eq!(resolve_url(base, "/next"), "https://example.com/next");
        assert_eq!(resolve_url(base, "other"), "https://example.com/docs/other");
        assert_eq!(resolve_url(base, "#top"), "https://example.com/docs/page#top");
        assert_eq!(
            resolve_url(base, "https://iana.org"),
            "https://iana.org/"
        );
    }

    #[test]
    fn selectors_match_compounds_and_descendants() {
        let engine = MemoryEngine::new();
        let doc = doc(
            &engine,
            "https://s.test",
            vec![MemElement::new("ul").attr("id", "menu").children(vec![
                MemElement::new("li").child(MemElement::link("One", "/1").attr("class", "item")),
                MemElement::new("li").child(MemElement::link("Two", "/2").attr("class", "item big")),
            ]),
            MemElement::link("Three", "/3").attr("class", "item")],
        );

        assert_eq!(select(&doc, "a.item").unwrap().len(), 3);
        assert_eq!(select(&doc, "#menu a").unwrap().len(), 2);
        assert_eq!(select(&doc, "a.item.big").unwrap().len(), 1);
        assert_eq!(select(&doc, "a[href=\"/3\"]").unwrap().len(), 1);
        assert_eq!(select(&doc, "li, a[href='/1']").unwrap().len(), 3);
        assert!(select(&doc, "a > li").is_err());
    }

    #[test]
    fn accessibility_tree_names_and_roles() {
        let engine = MemoryEngine::new();
        let doc = doc(
            &engine,
            "https://s.test",
            vec![
                MemElement::new("label").attr("for", "email").text("Email"),
                MemElement::input("email").attr("id", "email"),
                MemElement::input("checkbox").attr("checked", ""),
                MemElement::button("Hidden").attr("hidden", ""),
            ],
        );
        let root = doc.root_ax("https://s.test/");

        let textbox = &root.children[1];
        assert_eq!(textbox.role, "textbox");
        assert_eq!(textbox.name.as_deref(), Some("Email"));
        assert_eq!(root.children[2].checked, Some(true));
        assert_eq!(root.children.len(), 3);
    }

    #[test]
    fn fixtures_register_pages_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.json");
        std::fs::write(
            &path,
            r#"{"https://example.com": {"title": "Example Domain", "body": [
                {"tag": "h1", "text": "Example Domain"},
                {"tag": "a", "attrs": {"href": "https://iana.org"}, "text": "More"}
            ]}}"#,
        )
        .unwrap();

        let engine = MemoryEngine::new();
        assert_eq!(engine.load_fixtures(&path).unwrap(), 1);

        let doc = engine.state.lock().build_doc("https://example.com/");
        assert_eq!(doc.title, "Example Domain");
        assert_eq!(doc.body.len(), 2);
    }

    #[test]
    fn unknown_url_opens_an_empty_page() {
        let engine = MemoryEngine::new();
        let target = tokio_test::block_on(engine.new_page("https://nowhere.test")).unwrap();

        assert_eq!(target, "T1");
        assert_eq!(
            tokio_test::block_on(engine.current_url(&target)).unwrap(),
            "https://nowhere.test/"
        );
        assert_eq!(tokio_test::block_on(engine.title(&target)).unwrap(), "");
    }
}
