//! Strategy-based element location followed by one action.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actions::{Action, ActionExecutor, ActionResult};
use crate::browser::{BrowserEngine, ElementHandle, EngineLocator};
use crate::config::ActionsConfig;
use crate::error::{PagewrightError, Result};
use crate::page::Page;
use crate::resolver::{ElementTarget, Resolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Role { role: String, name: Option<String> },
    Text { text: String },
    Label { text: String },
    Placeholder { text: String },
    Alt { text: String },
    Title { text: String },
    TestId { id: String },
    First { selector: String },
    Last { selector: String },
    /// Zero-based.
    Nth { selector: String, index: usize },
    Css { selector: String },
}

impl Strategy {
    /// Engine locator for the accessibility/attribute strategies.
    fn locator(&self) -> Option<EngineLocator> {
        let locator = match self {
            Self::Role { role, name } => EngineLocator::Role {
                role: role.clone(),
                name: name.clone(),
            },
            Self::Text { text } => EngineLocator::Text(text.clone()),
            Self::Label { text } => EngineLocator::Label(text.clone()),
            Self::Placeholder { text } => EngineLocator::Placeholder(text.clone()),
            Self::Alt { text } => EngineLocator::Alt(text.clone()),
            Self::Title { text } => EngineLocator::Title(text.clone()),
            Self::TestId { id } => EngineLocator::TestId(id.clone()),
            Self::First { .. } | Self::Last { .. } | Self::Nth { .. } | Self::Css { .. } => {
                return None
            }
        };
        Some(locator)
    }

    fn selector(&self) -> Option<&str> {
        match self {
            Self::First { selector }
            | Self::Last { selector }
            | Self::Nth { selector, .. }
            | Self::Css { selector } => Some(selector),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First { selector } => write!(f, "first:{}", selector),
            Self::Last { selector } => write!(f, "last:{}", selector),
            Self::Nth { selector, index } => write!(f, "nth:{}[{}]", selector, index),
            Self::Css { selector } => write!(f, "css:{}", selector),
            other => match other.locator() {
                Some(locator) => write!(f, "{}", locator),
                None => Ok(()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindAction {
    /// Size of the raw match set; no element is selected.
    Count,
    Element(Action),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindRequest {
    pub strategy: Strategy,
    pub action: FindAction,
}

impl FindRequest {
    pub fn new(strategy: Strategy, action: Action) -> Self {
        Self {
            strategy,
            action: FindAction::Element(action),
        }
    }

    pub fn count(strategy: Strategy) -> Self {
        Self {
            strategy,
            action: FindAction::Count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FindOutcome {
    Count { count: usize },
    Action(ActionResult),
}

/// Loose, string-typed form of a find call, as it arrives from scripts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindParams {
    pub strategy: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub nth: Option<i64>,
    #[serde(default = "default_find_action")]
    pub action: String,
    #[serde(default)]
    pub action_value: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

fn default_find_action() -> String {
    "click".to_string()
}

fn invalid(message: impl Into<String>) -> PagewrightError {
    PagewrightError::InvalidActionParameters(message.into())
}

impl FindParams {
    /// Validate and type the parameters. Nothing touches the page here.
    pub fn into_request(self) -> Result<FindRequest> {
        let strategy = self.strategy()?;
        let action = self.action()?;
        Ok(FindRequest { strategy, action })
    }

    fn strategy(&self) -> Result<Strategy> {
        let strategy = self.strategy.as_str();

        if self.name.is_some() && strategy != "role" {
            return Err(invalid(format!(
                "name is only used with strategy=role, not strategy={}",
                strategy
            )));
        }
        if self.nth.is_some() && strategy != "nth" {
            return Err(invalid(format!(
                "nth is only used with strategy=nth, not strategy={}",
                strategy
            )));
        }

        let value = |what: &str| {
            self.value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| invalid(format!("strategy={} requires value as {}", strategy, what)))
        };
        let selector = || {
            self.selector
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid(format!("strategy={} requires selector", strategy)))
        };

        let typed = match strategy {
            "role" => Strategy::Role {
                role: value("the role name")?,
                name: self.name.clone(),
            },
            "text" => Strategy::Text {
                text: value("the text content")?,
            },
            "label" => Strategy::Label {
                text: value("the label text")?,
            },
            "placeholder" => Strategy::Placeholder {
                text: value("the placeholder text")?,
            },
            "alt" => Strategy::Alt {
                text: value("the alt text")?,
            },
            "title" => Strategy::Title {
                text: value("the title text")?,
            },
            "testid" => Strategy::TestId {
                id: value("the test id")?,
            },
            "first" => Strategy::First {
                selector: selector()?,
            },
            "last" => Strategy::Last {
                selector: selector()?,
            },
            "nth" => {
                let nth = self
                    .nth
                    .ok_or_else(|| invalid("strategy=nth requires selector and nth"))?;
                let index = usize::try_from(nth)
                    .map_err(|_| invalid(format!("nth must be zero or positive, got {}", nth)))?;
                Strategy::Nth {
                    selector: selector()?,
                    index,
                }
            }
            "css" => Strategy::Css {
                selector: selector()?,
            },
            other => return Err(invalid(format!("unknown strategy: {}", other))),
        };

        if typed.locator().is_some() && self.selector.is_some() {
            return Err(invalid(format!(
                "selector is not used with strategy={}",
                strategy
            )));
        }
        if typed.locator().is_none() && self.value.is_some() {
            return Err(invalid(format!(
                "value is not used with strategy={}; pass the CSS selector as selector",
                strategy
            )));
        }
        Ok(typed)
    }

    fn action(&self) -> Result<FindAction> {
        let action = self.action.as_str();

        let takes_value = matches!(action, "fill" | "select" | "press");
        if self.action_value.is_some() && !takes_value {
            return Err(invalid(format!(
                "action_value is not used with action={}",
                action
            )));
        }
        if self.files.is_some() && action != "upload" {
            return Err(invalid(format!("files is not used with action={}", action)));
        }

        let action_value = || {
            self.action_value
                .clone()
                .ok_or_else(|| invalid(format!("action={} requires action_value", action)))
        };

        let typed = match action {
            "click" => Action::Click,
            "fill" => Action::Fill {
                value: action_value()?,
            },
            "select" => Action::Select {
                value: action_value()?,
            },
            "press" => Action::Press {
                key: action_value()?,
            },
            "check" => Action::Check,
            "uncheck" => Action::Uncheck,
            "upload" => Action::Upload {
                files: self
                    .files
                    .clone()
                    .ok_or_else(|| invalid("action=upload requires files"))?,
            },
            "inner_html" => Action::InnerHtml,
            "text" => Action::Text,
            "value" => Action::Value,
            "hover" => Action::Hover,
            "is_visible" => Action::IsVisible,
            "is_enabled" => Action::IsEnabled,
            "is_checked" => Action::IsChecked,
            "count" => return Ok(FindAction::Count),
            other => return Err(invalid(format!("unknown action: {}", other))),
        };
        typed.validate()?;
        Ok(FindAction::Element(typed))
    }
}

pub struct FindDispatcher<'a> {
    engine: &'a dyn BrowserEngine,
    page: &'a Page,
    config: &'a ActionsConfig,
}

impl<'a> FindDispatcher<'a> {
    pub fn new(engine: &'a dyn BrowserEngine, page: &'a Page, config: &'a ActionsConfig) -> Self {
        Self {
            engine,
            page,
            config,
        }
    }

    pub async fn find(&self, request: FindRequest) -> Result<FindOutcome> {
        match request.action {
            FindAction::Count => {
                let count = match_set(self.engine, self.page, &request.strategy)
                    .await?
                    .len();
                Ok(FindOutcome::Count { count })
            }
            FindAction::Element(action) => {
                let target = ElementTarget::Find(request.strategy);
                ActionExecutor::new(self.engine, self.page, self.config)
                    .run(&target, &action)
                    .await
                    .map(FindOutcome::Action)
            }
        }
    }
}

/// The full match set of a strategy, in document order.
pub async fn match_set(
    engine: &dyn BrowserEngine,
    page: &Page,
    strategy: &Strategy,
) -> Result<Vec<ElementHandle>> {
    if let Some(locator) = strategy.locator() {
        return engine.locate(page.target(), &locator).await;
    }
    let selector = strategy.selector().unwrap_or_default();
    Resolver::new(engine, page).select_all(selector).await
}

/// Narrow a strategy's match set to the single element an action applies to.
pub async fn select_one(
    engine: &dyn BrowserEngine,
    page: &Page,
    strategy: &Strategy,
) -> Result<ElementHandle> {
    let matches = match_set(engine, page, strategy).await?;
    debug!(strategy = %strategy, matched = matches.len(), "find matched");

    let chosen = match strategy {
        Strategy::Last { .. } => matches.last().copied(),
        Strategy::Nth { selector, index } => {
            return matches
                .get(*index)
                .copied()
                .ok_or_else(|| PagewrightError::IndexOutOfRange {
                    selector: selector.clone(),
                    index: *index,
                    len: matches.len(),
                });
        }
        _ => matches.first().copied(),
    };

    chosen.ok_or_else(|| PagewrightError::ElementNotFound(strategy.to_string()))
}
