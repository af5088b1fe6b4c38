//! Accessibility snapshots, stable element refs and live screencasts for
//! browser agents.
//!
//! [`PageManager`] is the entry point: it owns the browser engine and the open
//! pages, takes snapshots that mint `@eN` refs, runs actions against refs or
//! selectors and drives per-page screencast streams.

pub mod actions;
pub mod browser;
pub mod cli;
pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod find;
pub mod manager;
pub mod page;
pub mod refs;
pub mod resolver;
pub mod script;
pub mod snapshot;
pub mod storage;
pub mod stream;

pub use actions::{Action, ActionResult};
pub use config::Config;
pub use error::{ErrorKind, PagewrightError, Result};
pub use find::{FindAction, FindOutcome, FindParams, FindRequest, Strategy};
pub use manager::{normalize_url, PageInfo, PageManager};
pub use page::PageId;
pub use refs::Ref;
pub use resolver::ElementTarget;
pub use snapshot::{SnapshotOptions, SnapshotView};
pub use stream::{StreamEvent, StreamHandle, StreamOptions, StreamState};
