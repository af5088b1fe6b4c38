//! The seam between page-level logic and a concrete browser.
//!
//! Everything above this trait (snapshots, refs, actions, streaming) talks to
//! a `dyn BrowserEngine`; `CdpEngine` drives a real Chromium over the DevTools
//! protocol and `MemoryEngine` models pages in memory for tests and dry runs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Engine-side identifier of a page (a CDP target id for `CdpEngine`).
pub type TargetId = String;

/// Weak reference to a DOM element: the engine's backend node id.
///
/// Holding a handle never keeps the node alive; a handle whose node was
/// removed surfaces as `ElementDetached` when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub i64);

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Accessibility node as reported by the engine, roles already normalized
/// (`RootWebArea` -> `document`, `StaticText` -> `text`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxNode {
    pub role: String,
    pub name: Option<String>,
    pub handle: Option<ElementHandle>,
    pub level: Option<u32>,
    pub checked: Option<bool>,
    pub disabled: bool,
    pub value: Option<String>,
    pub url: Option<String>,
    pub children: Vec<AxNode>,
}

impl AxNode {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn named(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: ElementHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_children(mut self, children: Vec<AxNode>) -> Self {
        self.children = children;
        self
    }
}

/// Engine-native locators used by the `find` strategies that are not plain CSS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLocator {
    Role { role: String, name: Option<String> },
    Text(String),
    Label(String),
    Placeholder(String),
    Alt(String),
    Title(String),
    TestId(String),
}

impl fmt::Display for EngineLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role { role, name: Some(name) } => write!(f, "role={}[name=\"{}\"]", role, name),
            Self::Role { role, name: None } => write!(f, "role={}", role),
            Self::Text(v) => write!(f, "text=\"{}\"", v),
            Self::Label(v) => write!(f, "label=\"{}\"", v),
            Self::Placeholder(v) => write!(f, "placeholder=\"{}\"", v),
            Self::Alt(v) => write!(f, "alt=\"{}\"", v),
            Self::Title(v) => write!(f, "title=\"{}\"", v),
            Self::TestId(v) => write!(f, "data-testid=\"{}\"", v),
        }
    }
}

/// A single DOM-level operation on one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementOp {
    Click,
    Hover,
    Focus,
    Fill(String),
    SelectOption(String),
    SetChecked(bool),
    SetFiles(Vec<String>),
    InnerHtml,
    Text,
    Value,
    IsVisible,
    IsEnabled,
    IsChecked,
}

impl ElementOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Hover => "hover",
            Self::Focus => "focus",
            Self::Fill(_) => "fill",
            Self::SelectOption(_) => "select",
            Self::SetChecked(true) => "check",
            Self::SetChecked(false) => "uncheck",
            Self::SetFiles(_) => "upload",
            Self::InnerHtml => "inner_html",
            Self::Text => "text",
            Self::Value => "value",
            Self::IsVisible => "is_visible",
            Self::IsEnabled => "is_enabled",
            Self::IsChecked => "is_checked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub url: String,
    pub suggested_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationHistory {
    pub entries: Vec<String>,
    pub current: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = crate::error::PagewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(crate::error::PagewrightError::InvalidActionParameters(format!(
                "unsupported image format '{}', expected jpeg or png",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreencastParams {
    pub format: ImageFormat,
    pub quality: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub every_nth_frame: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    pub offset_top: f64,
    pub page_scale_factor: f64,
    pub device_width: f64,
    pub device_height: f64,
    pub scroll_offset_x: f64,
    pub scroll_offset_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// One rendered frame; `data` is already base64-encoded by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastFrame {
    pub data: String,
    pub metadata: FrameMetadata,
    pub session_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseEventType {
    #[serde(rename = "mousePressed")]
    Pressed,
    #[serde(rename = "mouseReleased")]
    Released,
    #[serde(rename = "mouseMoved")]
    Moved,
    #[serde(rename = "mouseWheel")]
    Wheel,
}

impl MouseEventType {
    pub fn as_cdp(&self) -> &'static str {
        match self {
            Self::Pressed => "mousePressed",
            Self::Released => "mouseReleased",
            Self::Moved => "mouseMoved",
            Self::Wheel => "mouseWheel",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    None,
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn as_cdp(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Left => "left",
            Self::Middle => "middle",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseInput {
    pub event_type: MouseEventType,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "single_click")]
    pub click_count: u32,
    #[serde(default)]
    pub delta_x: f64,
    #[serde(default)]
    pub delta_y: f64,
    #[serde(default)]
    pub modifiers: u32,
}

fn single_click() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventType {
    #[serde(rename = "keyDown")]
    Down,
    #[serde(rename = "keyUp")]
    Up,
    #[serde(rename = "rawKeyDown")]
    RawDown,
    #[serde(rename = "char")]
    Char,
}

impl KeyEventType {
    pub fn as_cdp(&self) -> &'static str {
        match self {
            Self::Down => "keyDown",
            Self::Up => "keyUp",
            Self::RawDown => "rawKeyDown",
            Self::Char => "char",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardInput {
    pub event_type: KeyEventType,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub modifiers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TouchEventType {
    #[serde(rename = "touchStart")]
    Start,
    #[serde(rename = "touchEnd")]
    End,
    #[serde(rename = "touchMove")]
    Move,
    #[serde(rename = "touchCancel")]
    Cancel,
}

impl TouchEventType {
    pub fn as_cdp(&self) -> &'static str {
        match self {
            Self::Start => "touchStart",
            Self::End => "touchEnd",
            Self::Move => "touchMove",
            Self::Cancel => "touchCancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchInput {
    pub event_type: TouchEventType,
    pub touch_points: Vec<TouchPoint>,
    #[serde(default)]
    pub modifiers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLocation {
    pub url: String,
    #[serde(rename = "lineNumber")]
    pub line_number: i64,
    #[serde(rename = "columnNumber")]
    pub column_number: i64,
}

/// One captured `console.*` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub location: Option<ConsoleLocation>,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Session,
}

impl StorageKind {
    pub fn js_object(&self) -> &'static str {
        match self {
            Self::Local => "localStorage",
            Self::Session => "sessionStorage",
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = crate::error::PagewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "session" => Ok(Self::Session),
            other => Err(crate::error::PagewrightError::InvalidActionParameters(format!(
                "storage must be 'local' or 'session', got '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Short engine name for logs and `status` output.
    fn name(&self) -> &'static str;

    /// Open a new page and wait for its first load.
    async fn new_page(&self, url: &str) -> Result<TargetId>;

    async fn close_page(&self, target: &TargetId) -> Result<()>;

    /// Ids of all open page targets, in creation order.
    async fn targets(&self) -> Result<Vec<TargetId>>;

    /// Targets absent from `known`, waiting up to `wait` for at least one to appear.
    async fn new_targets_since(&self, known: &[TargetId], wait: Duration) -> Result<Vec<TargetId>>;

    async fn current_url(&self, target: &TargetId) -> Result<String>;

    async fn title(&self, target: &TargetId) -> Result<String>;

    async fn navigation_history(&self, target: &TargetId) -> Result<NavigationHistory>;

    /// Step one entry back; `Ok(false)` when there is no earlier entry.
    async fn go_back(&self, target: &TargetId) -> Result<bool>;

    /// Wait for pending navigation to finish and the page to go quiet.
    async fn settle(&self, target: &TargetId, quiet: Duration) -> Result<()>;

    /// Accessibility tree of the page, or of the subtree rooted at `scope`.
    async fn accessibility_tree(
        &self,
        target: &TargetId,
        scope: Option<ElementHandle>,
    ) -> Result<AxNode>;

    /// All elements matching a CSS selector, in document order.
    async fn query_selector_all(
        &self,
        target: &TargetId,
        selector: &str,
    ) -> Result<Vec<ElementHandle>>;

    /// All elements matching an engine-native locator, in document order.
    async fn locate(&self, target: &TargetId, locator: &EngineLocator)
        -> Result<Vec<ElementHandle>>;

    /// Apply `op` to an element; read and query ops return their value.
    async fn perform(&self, target: &TargetId, handle: ElementHandle, op: &ElementOp)
        -> Result<Value>;

    /// Send a named key (`Enter`, `Tab`, `ArrowDown`, ...) to the focused element.
    async fn press_key(&self, target: &TargetId, key: &str) -> Result<()>;

    /// Downloads that started since the last call.
    async fn take_downloads(&self, target: &TargetId) -> Result<Vec<DownloadInfo>>;

    /// Start a screencast; frames arrive on the returned channel in render order.
    async fn start_screencast(
        &self,
        target: &TargetId,
        params: &ScreencastParams,
    ) -> Result<mpsc::Receiver<ScreencastFrame>>;

    async fn ack_frame(&self, target: &TargetId, session_id: i64) -> Result<()>;

    async fn stop_screencast(&self, target: &TargetId) -> Result<()>;

    /// Layout viewport size in CSS pixels.
    async fn viewport(&self, target: &TargetId) -> Result<(u32, u32)>;

    async fn dispatch_mouse(&self, target: &TargetId, input: &MouseInput) -> Result<()>;

    async fn dispatch_key(&self, target: &TargetId, input: &KeyboardInput) -> Result<()>;

    async fn dispatch_touch(&self, target: &TargetId, input: &TouchInput) -> Result<()>;

    /// Console messages of the page from now on.
    async fn subscribe_console(&self, target: &TargetId)
        -> Result<mpsc::UnboundedReceiver<ConsoleEntry>>;

    async fn cookies_get(&self, target: &TargetId) -> Result<Vec<Value>>;

    async fn cookies_set(&self, target: &TargetId, cookies: &[Value]) -> Result<()>;

    async fn cookies_clear(&self, target: &TargetId) -> Result<()>;

    async fn storage_get(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<BTreeMap<String, String>>;

    async fn storage_set(
        &self,
        target: &TargetId,
        kind: StorageKind,
        items: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn storage_clear(
        &self,
        target: &TargetId,
        kind: StorageKind,
        keys: Option<&[String]>,
    ) -> Result<()>;

    /// Release the browser connection (and the process, if this engine launched it).
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_input_uses_cdp_event_names() {
        let input: MouseInput = serde_json::from_value(serde_json::json!({
            "event_type": "mousePressed",
            "x": 10.0,
            "y": 20.0,
            "button": "left",
            "click_count": 1
        }))
        .unwrap();

        assert_eq!(input.event_type, MouseEventType::Pressed);
        assert_eq!(input.button.as_cdp(), "left");
        assert_eq!(input.modifiers, 0);
    }

    #[test]
    fn mouse_press_defaults_to_a_single_click() {
        let input: MouseInput = serde_json::from_value(serde_json::json!({
            "event_type": "mousePressed",
            "x": 1.0,
            "y": 2.0
        }))
        .unwrap();
        assert_eq!(input.click_count, 1);
        assert_eq!(input.button, MouseButton::default());
    }

    #[test]
    fn touch_input_requires_points() {
        let result: std::result::Result<TouchInput, _> =
            serde_json::from_value(serde_json::json!({ "event_type": "touchStart" }));
        assert!(result.is_err());
    }

    #[test]
    fn storage_kind_parses_names() {
        assert_eq!("session".parse::<StorageKind>().unwrap(), StorageKind::Session);
        assert!("cookie".parse::<StorageKind>().is_err());
    }

    #[test]
    fn locator_display_is_readable() {
        let locator = EngineLocator::Role {
            role: "button".into(),
            name: Some("Submit".into()),
        };
        assert_eq!(locator.to_string(), "role=button[name=\"Submit\"]");
    }
}
