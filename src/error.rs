use thiserror::Error;

/// Coarse error categories callers can branch on without matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ElementNotFound,
    RefNotFound,
    RefStale,
    ElementDetached,
    IndexOutOfRange,
    AlreadyStreaming,
    NavigationFailed,
    InvalidActionParameters,
    SessionClosed,
    Browser,
    Config,
    Timeout,
    Io,
    Other,
}

#[derive(Error, Debug)]
pub enum PagewrightError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Unknown ref {0}. Take a snapshot first to mint refs.")]
    RefNotFound(String),

    #[error("Ref {ref_id} is stale (minted before snapshot generation {current}). Take a new snapshot.")]
    RefStale { ref_id: String, current: u64 },

    #[error("Element detached from the document: {0}")]
    ElementDetached(String),

    #[error("Index {index} out of range: {len} element(s) matched {selector}")]
    IndexOutOfRange {
        selector: String,
        index: usize,
        len: usize,
    },

    #[error("Page {0} is already streaming")]
    AlreadyStreaming(String),

    #[error("Navigation failed after {steps_completed} step(s): {message}")]
    NavigationFailed {
        message: String,
        steps_completed: usize,
    },

    #[error("Invalid action parameters: {0}")]
    InvalidActionParameters(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Browser not found. Please install Chrome, Brave, Edge or Chromium.")]
    BrowserNotFound,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("CDP connection failed: {0}")]
    CdpConnectionFailed(String),

    #[error("CDP error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PagewrightError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ElementNotFound(_) => ErrorKind::ElementNotFound,
            Self::RefNotFound(_) => ErrorKind::RefNotFound,
            Self::RefStale { .. } => ErrorKind::RefStale,
            Self::ElementDetached(_) => ErrorKind::ElementDetached,
            Self::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Self::AlreadyStreaming(_) => ErrorKind::AlreadyStreaming,
            Self::NavigationFailed { .. } => ErrorKind::NavigationFailed,
            Self::InvalidActionParameters(_) => ErrorKind::InvalidActionParameters,
            Self::SessionClosed(_) => ErrorKind::SessionClosed,
            Self::BrowserNotFound
            | Self::BrowserLaunchFailed(_)
            | Self::CdpConnectionFailed(_)
            | Self::Protocol(_) => ErrorKind::Browser,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::IoError(_) => ErrorKind::Io,
            Self::NetworkError(_) | Self::JsonError(_) | Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Stable snake_case name of the error kind, used in JSON output.
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::RefNotFound => "ref_not_found",
            ErrorKind::RefStale => "ref_stale",
            ErrorKind::ElementDetached => "element_detached",
            ErrorKind::IndexOutOfRange => "index_out_of_range",
            ErrorKind::AlreadyStreaming => "already_streaming",
            ErrorKind::NavigationFailed => "navigation_failed",
            ErrorKind::InvalidActionParameters => "invalid_action_parameters",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::Browser => "browser",
            ErrorKind::Config => "config",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
            ErrorKind::Other => "other",
        }
    }

    /// Rewrite raw engine failures into messages an agent can act on.
    ///
    /// Taxonomy errors pass through untouched; only `Protocol` messages that match
    /// well-known browser failure modes are rewritten.
    pub fn friendly(self, target: &str) -> Self {
        let Self::Protocol(message) = &self else {
            return self;
        };

        if message.contains("intercepts pointer events") {
            return Self::Other(format!(
                "Element \"{}\" is covered by another element (dialog or overlay?). Dismiss it first.",
                target
            ));
        }
        if message.contains("not visible") || message.contains("Node is not an element") {
            return Self::ElementNotFound(format!(
                "\"{}\" is not visible. Scroll it into view or take a new snapshot.",
                target
            ));
        }
        if message.contains("No node with given id") || message.contains("Could not find node") {
            return Self::ElementDetached(target.to_string());
        }

        self
    }
}

pub type Result<T> = std::result::Result<T, PagewrightError>;
