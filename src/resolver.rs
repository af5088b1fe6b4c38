use std::fmt;

use crate::browser::{BrowserEngine, ElementHandle};
use crate::error::{PagewrightError, Result};
use crate::find::{self, Strategy};
use crate::page::Page;
use crate::refs::{parse_ref, Ref};

/// How an action names its element. Kept around after resolution so a
/// detached element can be looked up again the same way.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementTarget {
    /// `@eN` or a CSS selector.
    Query(String),
    /// A ref pinned to the generation that minted it.
    Ref(Ref),
    /// A `find` strategy.
    Find(Strategy),
}

impl fmt::Display for ElementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(q) => f.write_str(q),
            Self::Ref(r) => write!(f, "{}", r),
            Self::Find(strategy) => write!(f, "{}", strategy),
        }
    }
}

impl From<&str> for ElementTarget {
    fn from(s: &str) -> Self {
        Self::Query(s.to_string())
    }
}

impl From<String> for ElementTarget {
    fn from(s: String) -> Self {
        Self::Query(s)
    }
}

impl From<Ref> for ElementTarget {
    fn from(r: Ref) -> Self {
        Self::Ref(r)
    }
}

pub struct Resolver<'a> {
    engine: &'a dyn BrowserEngine,
    page: &'a Page,
}

impl<'a> Resolver<'a> {
    pub fn new(engine: &'a dyn BrowserEngine, page: &'a Page) -> Self {
        Self { engine, page }
    }

    /// Resolve a ref (`@e3`) or CSS selector to exactly one element.
    pub async fn resolve(&self, selector_or_ref: &str) -> Result<ElementHandle> {
        if parse_ref(selector_or_ref).is_some() {
            return self.page.refs().lookup(selector_or_ref);
        }

        self.select_all(selector_or_ref)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PagewrightError::ElementNotFound(selector_or_ref.to_string()))
    }

    pub async fn resolve_target(&self, target: &ElementTarget) -> Result<ElementHandle> {
        match target {
            ElementTarget::Query(q) => self.resolve(q).await,
            ElementTarget::Ref(r) => self.page.refs().lookup_ref(*r),
            ElementTarget::Find(strategy) => {
                find::select_one(self.engine, self.page, strategy).await
            }
        }
    }

    /// CSS match set in document order. A ref resolves to a one-element set.
    pub async fn select_all(&self, selector: &str) -> Result<Vec<ElementHandle>> {
        if parse_ref(selector).is_some() {
            return Ok(vec![self.page.refs().lookup(selector)?]);
        }
        self.engine
            .query_selector_all(self.page.target(), selector)
            .await
    }
}
