//! Live screencast sessions and synthetic input injection.
//!
//! A session moves `Idle -> Starting -> Active -> Stopping -> Idle`. Frames
//! are pumped by a background task into a bounded channel the consumer drains
//! through a [`StreamHandle`]; a frame is acknowledged to the engine only once
//! the channel has taken it, so a slow consumer slows the screencast down
//! instead of growing a buffer.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::{
    BrowserEngine, FrameMetadata, ImageFormat, KeyboardInput, MouseInput, ScreencastParams,
    TargetId, TouchInput,
};
use crate::config::StreamConfig;
use crate::error::{PagewrightError, Result};
use crate::page::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Active,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub connected: bool,
    pub screencasting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamFrame {
    /// Base64-encoded image.
    pub data: String,
    pub metadata: FrameMetadata,
}

/// What the consumer receives, serialized as `{"type":"status",...}` / `{"type":"frame",...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status(StreamStatus),
    Frame(StreamFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub image_format: ImageFormat,
    pub quality: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub every_nth_frame: Option<u32>,
    pub channel_capacity: usize,
    pub stop_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::Jpeg,
            quality: 80,
            max_width: None,
            max_height: None,
            every_nth_frame: None,
            channel_capacity: 2,
            stop_timeout: Duration::from_millis(1_000),
        }
    }
}

impl StreamOptions {
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            image_format: config.image_format.parse()?,
            quality: config.quality,
            max_width: config.max_width,
            max_height: config.max_height,
            every_nth_frame: config.every_nth_frame,
            channel_capacity: config.channel_capacity,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
        })
    }

    fn params(&self) -> Result<ScreencastParams> {
        if self.quality > 100 {
            return Err(PagewrightError::InvalidActionParameters(format!(
                "quality must be between 0 and 100, got {}",
                self.quality
            )));
        }
        Ok(ScreencastParams {
            format: self.image_format,
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
            every_nth_frame: self.every_nth_frame,
        })
    }
}

/// Consumer end of a stream. Yields `None` once the session has stopped.
#[derive(Debug)]
pub struct StreamHandle {
    page_id: PageId,
    events: mpsc::Receiver<StreamEvent>,
}

impl StreamHandle {
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }
}

impl Stream for StreamHandle {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

struct Running {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    events: mpsc::Sender<StreamEvent>,
    stop_timeout: Duration,
}

/// Per-page screencast session.
pub struct StreamSession {
    page_id: PageId,
    state: AtomicU8,
    running: Mutex<Option<Running>>,
    /// Signalled whenever the session leaves Starting or Stopping.
    settled: Notify,
}

impl StreamSession {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            state: AtomicU8::new(StreamState::Idle as u8),
            running: Mutex::new(None),
            settled: Notify::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: StreamState, to: StreamState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            debug!(page = %self.page_id, ?from, ?to, "stream state");
            if matches!(from, StreamState::Starting | StreamState::Stopping) {
                self.settled.notify_waiters();
            }
        }
        ok
    }

    fn reset(&self) {
        self.state.store(StreamState::Idle as u8, Ordering::Release);
        self.settled.notify_waiters();
    }

    pub async fn start(
        &self,
        engine: Arc<dyn BrowserEngine>,
        target: TargetId,
        options: &StreamOptions,
    ) -> Result<StreamHandle> {
        let params = options.params()?;

        if !self.transition(StreamState::Idle, StreamState::Starting) {
            return Err(PagewrightError::AlreadyStreaming(self.page_id.to_string()));
        }

        let opened = async {
            let frames = engine.start_screencast(&target, &params).await?;
            let viewport = engine.viewport(&target).await?;
            Ok::<_, PagewrightError>((frames, viewport))
        }
        .await;

        let (frames, (width, height)) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        // Fresh channel with capacity >= 1: the initial status always fits.
        let _ = tx.try_send(StreamEvent::Status(StreamStatus {
            connected: true,
            screencasting: true,
            viewport_width: Some(width),
            viewport_height: Some(height),
        }));

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_frames(
            engine,
            target,
            frames,
            tx.clone(),
            cancel.clone(),
        ));

        *self.running.lock() = Some(Running {
            cancel,
            pump,
            events: tx,
            stop_timeout: options.stop_timeout,
        });
        self.transition(StreamState::Starting, StreamState::Active);

        Ok(StreamHandle {
            page_id: self.page_id.clone(),
            events: rx,
        })
    }

    /// Stop the session. A no-op when Idle; a pending start or stop is waited out first.
    pub async fn stop(&self, engine: &dyn BrowserEngine, target: &TargetId) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            match self.state() {
                StreamState::Idle => {
                    debug!(page = %self.page_id, "stream stop ignored");
                    return Ok(());
                }
                StreamState::Active => {
                    if self.transition(StreamState::Active, StreamState::Stopping) {
                        break;
                    }
                }
                StreamState::Starting | StreamState::Stopping => settled.await,
            }
        }

        let running = self.running.lock().take();
        let mut result = Ok(());

        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.pump.await {
                warn!(page = %self.page_id, "frame pump ended abnormally: {}", e);
            }

            result = engine.stop_screencast(target).await;

            let final_status = StreamEvent::Status(StreamStatus {
                connected: true,
                screencasting: false,
                viewport_width: None,
                viewport_height: None,
            });
            match tokio::time::timeout(running.stop_timeout, running.events.send(final_status)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(page = %self.page_id, "stream consumer already gone"),
                Err(_) => warn!(page = %self.page_id, "final stream status not taken in time"),
            }
        }

        self.reset();
        result
    }
}

async fn pump_frames(
    engine: Arc<dyn BrowserEngine>,
    target: TargetId,
    mut frames: mpsc::Receiver<crate::browser::ScreencastFrame>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => {
                    debug!(target = %target, "screencast ended by engine");
                    break;
                }
            },
        };

        let session_id = frame.session_id;
        let event = StreamEvent::Frame(StreamFrame {
            data: frame.data,
            metadata: frame.metadata,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    debug!(target = %target, "stream consumer dropped");
                    break;
                }
            }
        }

        if let Err(e) = engine.ack_frame(&target, session_id).await {
            warn!(target = %target, "failed to ack screencast frame: {}", e);
        }
    }
}

pub async fn inject_mouse(
    engine: &dyn BrowserEngine,
    target: &TargetId,
    input: &MouseInput,
) -> Result<()> {
    engine.dispatch_mouse(target, input).await
}

pub async fn inject_keyboard(
    engine: &dyn BrowserEngine,
    target: &TargetId,
    input: &KeyboardInput,
) -> Result<()> {
    if input.key.as_deref().map_or(true, str::is_empty) {
        return Err(PagewrightError::InvalidActionParameters(
            "keyboard input requires key".to_string(),
        ));
    }
    engine.dispatch_key(target, input).await
}

pub async fn inject_touch(
    engine: &dyn BrowserEngine,
    target: &TargetId,
    input: &TouchInput,
) -> Result<()> {
    engine.dispatch_touch(target, input).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let status = StreamEvent::Status(StreamStatus {
            connected: true,
            screencasting: true,
            viewport_width: Some(1280),
            viewport_height: Some(720),
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["viewportWidth"], 1280);

        let frame = StreamEvent::Frame(StreamFrame {
            data: "aGk=".into(),
            metadata: FrameMetadata::default(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "frame");
        assert_eq!(json["metadata"]["pageScaleFactor"], 0.0);
    }

    #[test]
    fn session_starts_idle() {
        let session = StreamSession::new(PageId::from_index(1));
        assert_eq!(session.state(), StreamState::Idle);
        assert!(session.transition(StreamState::Idle, StreamState::Starting));
        assert!(!session.transition(StreamState::Idle, StreamState::Starting));
    }

    #[test]
    fn options_reject_out_of_range_quality() {
        let options = StreamOptions {
            quality: 120,
            ..Default::default()
        };
        assert!(matches!(
            options.params(),
            Err(PagewrightError::InvalidActionParameters(_))
        ));
    }
}
