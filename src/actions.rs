//! Element actions and the side effects they are observed to cause.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::browser::{BrowserEngine, DownloadInfo, ElementHandle, ElementOp, TargetId};
use crate::config::ActionsConfig;
use crate::error::{ErrorKind, PagewrightError, Result};
use crate::page::{Page, PageId};
use crate::resolver::{ElementTarget, Resolver};

/// Serializes actions on one page. Held for the whole resolve/perform/observe cycle.
#[derive(Debug, Default)]
pub struct ActionLock(Mutex<()>);

impl ActionLock {
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Click,
    Fill { value: String },
    Select { value: String },
    Press { key: String },
    Check,
    Uncheck,
    Upload { files: Vec<String> },
    InnerHtml,
    Text,
    Value,
    Hover,
    IsVisible,
    IsEnabled,
    IsChecked,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Fill { .. } => "fill",
            Self::Select { .. } => "select",
            Self::Press { .. } => "press",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::Upload { .. } => "upload",
            Self::InnerHtml => "inner_html",
            Self::Text => "text",
            Self::Value => "value",
            Self::Hover => "hover",
            Self::IsVisible => "is_visible",
            Self::IsEnabled => "is_enabled",
            Self::IsChecked => "is_checked",
        }
    }

    /// Parameter checks that need no page.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Press { key } if key.trim().is_empty() => Err(
                PagewrightError::InvalidActionParameters("press requires a key".to_string()),
            ),
            Self::Upload { files } if files.is_empty() => Err(
                PagewrightError::InvalidActionParameters(
                    "upload requires at least one file".to_string(),
                ),
            ),
            _ => Ok(()),
        }
    }
}

/// Outcome of one action, with everything observed around it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionResult {
    pub ok: bool,
    pub action: String,
    pub url_before: String,
    pub url_after: String,
    pub opened_new_page: bool,
    pub new_page_ids: Vec<PageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_completed: Option<usize>,
    /// Targets that appeared during the action, before the manager assigns page ids.
    #[serde(skip)]
    pub(crate) new_targets: Vec<TargetId>,
}

enum Payload {
    None,
    Value(Value),
    Text(String),
}

pub struct ActionExecutor<'a> {
    engine: &'a dyn BrowserEngine,
    page: &'a Page,
    config: &'a ActionsConfig,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(engine: &'a dyn BrowserEngine, page: &'a Page, config: &'a ActionsConfig) -> Self {
        Self {
            engine,
            page,
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Resolve `target`, apply `action` and observe navigation, new pages and downloads.
    pub async fn run(&self, target: &ElementTarget, action: &Action) -> Result<ActionResult> {
        action.validate()?;

        let label = format!("{} {}", action.name(), target);
        tokio::time::timeout(self.timeout(), self.observe(action, self.apply_with_retry(target, action)))
            .await
            .map_err(|_| PagewrightError::Timeout(label))?
    }

    /// `press` with no element: the key goes to whatever has focus.
    pub async fn press_focused(&self, key: &str) -> Result<ActionResult> {
        let action = Action::Press {
            key: key.to_string(),
        };
        action.validate()?;

        let perform = async {
            self.engine.press_key(self.page.target(), key).await?;
            Ok(Payload::None)
        };
        tokio::time::timeout(self.timeout(), self.observe(&action, perform))
            .await
            .map_err(|_| PagewrightError::Timeout(format!("press {}", key)))?
    }

    /// Step back `steps` history entries, one navigation at a time.
    pub async fn back(&self, steps: usize) -> Result<ActionResult> {
        if steps == 0 {
            return Err(PagewrightError::InvalidActionParameters(
                "back requires steps >= 1".to_string(),
            ));
        }

        let target = self.page.target();
        let settle = Duration::from_millis(self.config.settle_ms);
        let url_before = self.engine.current_url(target).await?;

        for completed in 0..steps {
            let step = async {
                if !self.engine.go_back(target).await? {
                    return Ok(false);
                }
                self.engine.settle(target, settle).await?;
                Ok::<_, PagewrightError>(true)
            };
            let outcome = tokio::time::timeout(self.timeout(), step)
                .await
                .unwrap_or_else(|_| Err(PagewrightError::Timeout("back navigation".to_string())));

            let message = match outcome {
                Ok(true) => continue,
                Ok(false) => format!("no history entry for step {} of {}", completed + 1, steps),
                Err(PagewrightError::Timeout(m)) => format!("step {} of {}: {}", completed + 1, steps, m),
                Err(e) => return Err(e),
            };
            warn!(page = %self.page.id(), completed, steps, "{}", message);
            return Err(PagewrightError::NavigationFailed {
                message,
                steps_completed: completed,
            });
        }

        Ok(ActionResult {
            ok: true,
            action: "back".to_string(),
            url_after: self.engine.current_url(target).await?,
            url_before,
            steps_completed: Some(steps),
            ..Default::default()
        })
    }

    async fn observe(
        &self,
        action: &Action,
        perform: impl std::future::Future<Output = Result<Payload>>,
    ) -> Result<ActionResult> {
        let target = self.page.target();
        let url_before = self.engine.current_url(target).await?;
        let known = self.engine.targets().await?;
        // Drop downloads that started before this action.
        self.engine.take_downloads(target).await?;

        let payload = perform.await?;

        self.engine
            .settle(target, Duration::from_millis(self.config.settle_ms))
            .await?;
        let url_after = self.engine.current_url(target).await?;
        let download = self.engine.take_downloads(target).await?.into_iter().next();

        // Only a click that stayed on the page can still be waiting on a popup.
        let popup_wait = if *action == Action::Click && url_after == url_before && download.is_none()
        {
            Duration::from_millis(self.config.popup_wait_ms)
        } else {
            Duration::ZERO
        };
        let new_targets = self.engine.new_targets_since(&known, popup_wait).await?;

        debug!(
            page = %self.page.id(),
            action = action.name(),
            navigated = url_before != url_after,
            new_targets = new_targets.len(),
            download = download.is_some(),
            "action complete"
        );

        let (value, text) = match payload {
            Payload::None => (None, None),
            Payload::Value(v) => (Some(v), None),
            Payload::Text(t) => (None, Some(t)),
        };

        Ok(ActionResult {
            ok: true,
            action: action.name().to_string(),
            url_before,
            url_after,
            opened_new_page: !new_targets.is_empty(),
            new_page_ids: Vec::new(),
            download,
            value,
            text,
            steps_completed: None,
            new_targets,
        })
    }

    /// One re-resolution through the same target if the element went away.
    async fn apply_with_retry(&self, target: &ElementTarget, action: &Action) -> Result<Payload> {
        let resolver = Resolver::new(self.engine, self.page);
        let handle = resolver.resolve_target(target).await?;

        match self.apply(handle, target, action).await {
            Err(err) if err.kind() == ErrorKind::ElementDetached => {
                debug!(target = %target, "element detached, resolving again");
                let handle = resolver.resolve_target(target).await?;
                self.apply(handle, target, action).await
            }
            other => other,
        }
    }

    async fn apply(
        &self,
        handle: ElementHandle,
        target: &ElementTarget,
        action: &Action,
    ) -> Result<Payload> {
        let page_target = self.page.target();
        let label = target.to_string();
        let perform = |op: ElementOp| {
            let label = label.clone();
            async move {
                self.engine
                    .perform(page_target, handle, &op)
                    .await
                    .map_err(|e| e.friendly(&label))
            }
        };

        let payload = match action {
            Action::Click => {
                perform(ElementOp::Click).await?;
                Payload::None
            }
            Action::Hover => {
                perform(ElementOp::Hover).await?;
                Payload::None
            }
            Action::Fill { value } => {
                perform(ElementOp::Fill(value.clone())).await?;
                Payload::Value(perform(ElementOp::Value).await?)
            }
            Action::Select { value } => {
                perform(ElementOp::SelectOption(value.clone())).await?;
                Payload::Value(perform(ElementOp::Value).await?)
            }
            Action::Press { key } => {
                perform(ElementOp::Focus).await?;
                self.engine
                    .press_key(page_target, key)
                    .await
                    .map_err(|e| e.friendly(&label))?;
                Payload::None
            }
            Action::Check => Payload::Value(perform(ElementOp::SetChecked(true)).await?),
            Action::Uncheck => Payload::Value(perform(ElementOp::SetChecked(false)).await?),
            Action::Upload { files } => {
                perform(ElementOp::SetFiles(files.clone())).await?;
                Payload::Value(Value::from(files.len()))
            }
            Action::InnerHtml => Payload::Text(as_text(perform(ElementOp::InnerHtml).await?)),
            Action::Text => Payload::Text(as_text(perform(ElementOp::Text).await?)),
            Action::Value => Payload::Value(perform(ElementOp::Value).await?),
            Action::IsVisible => Payload::Value(perform(ElementOp::IsVisible).await?),
            Action::IsEnabled => Payload::Value(perform(ElementOp::IsEnabled).await?),
            Action::IsChecked => Payload::Value(perform(ElementOp::IsChecked).await?),
        };
        Ok(payload)
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_key_and_files() {
        assert!(matches!(
            Action::Press { key: " ".into() }.validate(),
            Err(PagewrightError::InvalidActionParameters(_))
        ));
        assert!(matches!(
            Action::Upload { files: vec![] }.validate(),
            Err(PagewrightError::InvalidActionParameters(_))
        ));
        assert!(Action::Fill { value: String::new() }.validate().is_ok());
    }

    #[test]
    fn result_serializes_without_internal_fields() {
        let result = ActionResult {
            ok: true,
            action: "click".into(),
            url_before: "https://example.com/".into(),
            url_after: "https://example.com/next".into(),
            new_targets: vec!["T1".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["url_after"], "https://example.com/next");
        assert!(json.get("new_targets").is_none());
        assert!(json.get("download").is_none());
    }

    #[tokio::test]
    async fn action_lock_serializes_holders() {
        let lock = std::sync::Arc::new(ActionLock::default());
        let guard = lock.acquire().await;

        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _g = lock.acquire().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
