mod cdp;
mod chrome;
mod discovery;
mod engine;
mod keys;
mod launcher;
mod memory;

pub use cdp::CdpClient;
pub use chrome::CdpEngine;
pub use discovery::{discover_all_browsers, discover_browser, BrowserInfo, BrowserType};
pub use engine::{
    AxNode, BrowserEngine, ConsoleEntry, ConsoleLocation, DownloadInfo, ElementHandle, ElementOp,
    EngineLocator, FrameMetadata, ImageFormat, KeyEventType, KeyboardInput, MouseButton,
    MouseEventType, MouseInput, NavigationHistory, ScreencastFrame, ScreencastParams, StorageKind,
    TargetId, TouchEventType, TouchInput, TouchPoint,
};
pub use keys::{key_definition, KeyDefinition};
pub use launcher::{resolve_cdp_endpoint, BrowserLauncher};
pub use memory::{MemElement, MemoryEngine, RecordedInput};
