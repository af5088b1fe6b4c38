//! Per-page state owned by the [`PageManager`](crate::manager::PageManager).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::actions::ActionLock;
use crate::browser::TargetId;
use crate::console::{ConsoleBuffer, ConsoleServer};
use crate::refs::RefRegistry;
use crate::snapshot::Snapshot;
use crate::stream::StreamSession;

/// Caller-facing page id (`p1`, `p2`, ...), stable for the page's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    pub fn from_index(n: u64) -> Self {
        Self(format!("p{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub struct Page {
    id: PageId,
    target: TargetId,
    refs: RefRegistry,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    stream: StreamSession,
    console: Arc<ConsoleBuffer>,
    console_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pub(crate) console_server: tokio::sync::Mutex<Option<ConsoleServer>>,
    lock: ActionLock,
}

impl Page {
    pub fn new(id: PageId, target: TargetId, console: Arc<ConsoleBuffer>) -> Self {
        Self {
            stream: StreamSession::new(id.clone()),
            id,
            target,
            refs: RefRegistry::new(),
            snapshot: RwLock::new(None),
            console,
            console_task: parking_lot::Mutex::new(None),
            console_server: tokio::sync::Mutex::new(None),
            lock: ActionLock::default(),
        }
    }

    pub fn id(&self) -> &PageId {
        &self.id
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn refs(&self) -> &RefRegistry {
        &self.refs
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().clone()
    }

    pub(crate) fn set_snapshot(&self, snapshot: Arc<Snapshot>) {
        *self.snapshot.write() = Some(snapshot);
    }

    pub fn stream(&self) -> &StreamSession {
        &self.stream
    }

    pub fn console(&self) -> &Arc<ConsoleBuffer> {
        &self.console
    }

    pub fn lock(&self) -> &ActionLock {
        &self.lock
    }

    pub(crate) fn set_console_task(&self, task: JoinHandle<()>) {
        if let Some(old) = self.console_task.lock().replace(task) {
            old.abort();
        }
    }

    pub(crate) fn abort_console_task(&self) {
        if let Some(task) = self.console_task.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("generation", &self.refs.generation())
            .field("stream", &self.stream.state())
            .finish()
    }
}
