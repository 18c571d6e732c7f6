//! Output Router
//!
//! Demultiplexes raw subprocess output by session id into that session's
//! lane (formatter + playback queue). Non-blocking: a chunk is formatted
//! and queued inline, never awaited.

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{FormatterConfig, PipelineConfig, PlaybackConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::format::{Segment, SegmentKind, Span, StreamFormatter, Style};
use crate::playback::PlaybackQueue;
use crate::session::events::{DisplayEvent, DisplaySink, Notice};

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A chunk of subprocess output, as read from the OS
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub session_id: String,
    /// Generation of the process that produced it
    pub generation: u64,
    pub stream: StreamKind,
    pub bytes: Bytes,
}

struct LaneInner {
    /// Generation currently accepted; `None` while muted
    generation: Option<u64>,
    formatter: StreamFormatter,
    stderr_pending: Vec<u8>,
}

impl LaneInner {
    fn push_stderr(&mut self, bytes: &[u8]) -> Vec<Segment> {
        self.stderr_pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.stderr_pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.stderr_pending.drain(..=pos).collect();
            out.push(stderr_segment(&line));
        }
        out
    }

    fn flush_stderr(&mut self) -> Option<Segment> {
        if self.stderr_pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.stderr_pending);
        Some(stderr_segment(&line))
    }
}

fn stderr_segment(line: &[u8]) -> Segment {
    let mut segment = Segment::new(SegmentKind::Stderr);
    segment.push(Span::new(String::from_utf8_lossy(line), Style::Stderr));
    segment
}

/// Per-session formatter and playback pair
pub struct SessionLane {
    session_id: String,
    inner: Mutex<LaneInner>,
    playback: Arc<PlaybackQueue>,
    playback_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionLane {
    fn new(
        session_id: &str,
        playback: &PlaybackConfig,
        formatter: &FormatterConfig,
        sink: Arc<dyn DisplaySink>,
    ) -> Arc<Self> {
        let queue = PlaybackQueue::new(session_id, playback, sink);
        let task = queue.start();
        Arc::new(Self {
            session_id: session_id.to_string(),
            inner: Mutex::new(LaneInner {
                generation: None,
                formatter: StreamFormatter::new(formatter.max_line_bytes),
                stderr_pending: Vec::new(),
            }),
            playback: queue,
            playback_task: Mutex::new(Some(task)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn playback(&self) -> &Arc<PlaybackQueue> {
        &self.playback
    }

    /// Format a chunk and queue the completed segments; false if it was stale
    fn accept(&self, chunk: &RawChunk) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != Some(chunk.generation) {
            debug!(
                "Dropping {} bytes from stale generation {} of session {}",
                chunk.bytes.len(),
                chunk.generation,
                self.session_id
            );
            return false;
        }

        let segments = match chunk.stream {
            StreamKind::Stdout => inner.formatter.push(&chunk.bytes),
            StreamKind::Stderr => inner.push_stderr(&chunk.bytes),
        };
        for segment in segments {
            self.playback.enqueue(segment);
        }
        true
    }

    /// Start accepting output from `generation`
    pub fn arm(&self, generation: u64) {
        self.inner.lock().generation = Some(generation);
    }

    /// Stop accepting output until re-armed
    pub fn mute(&self) {
        self.inner.lock().generation = None;
    }

    /// Discard partial lines and any open fence
    pub fn reset_formatter(&self) {
        let mut inner = self.inner.lock();
        inner.formatter.reset();
        inner.stderr_pending.clear();
    }

    pub fn is_fence_open(&self) -> bool {
        self.inner.lock().formatter.is_fence_open()
    }

    /// One pipe of `generation` hit EOF: flush what that pipe left buffered
    fn finish(&self, generation: u64, stream: StreamKind) {
        let mut inner = self.inner.lock();
        if inner.generation != Some(generation) {
            return;
        }
        let segments = match stream {
            StreamKind::Stdout => inner.formatter.flush(),
            StreamKind::Stderr => inner.flush_stderr().into_iter().collect(),
        };
        for segment in segments {
            self.playback.enqueue(segment);
        }
    }

    fn close(&self) {
        self.mute();
        self.playback.shutdown();
        if let Some(task) = self.playback_task.lock().take() {
            task.abort();
        }
    }
}

/// Routes subprocess output to per-session lanes
pub struct OutputRouter {
    lanes: DashMap<String, Arc<SessionLane>>,
    sink: Arc<dyn DisplaySink>,
    playback: PlaybackConfig,
    formatter: FormatterConfig,
}

impl OutputRouter {
    pub fn new(config: &PipelineConfig, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            lanes: DashMap::new(),
            sink,
            playback: config.playback.clone(),
            formatter: config.formatter.clone(),
        }
    }

    /// Create a fresh, muted lane for a session, replacing any previous one.
    ///
    /// Must be called within a tokio runtime (starts the playback loop).
    pub fn open_lane(&self, session_id: &str) -> Arc<SessionLane> {
        let lane = SessionLane::new(session_id, &self.playback, &self.formatter, Arc::clone(&self.sink));
        if let Some(previous) = self.lanes.insert(session_id.to_string(), Arc::clone(&lane)) {
            previous.close();
        }
        debug!("Opened lane for session {}", session_id);
        lane
    }

    /// Remove a session's lane and stop its playback
    pub fn close_lane(&self, session_id: &str) -> bool {
        match self.lanes.remove(session_id) {
            Some((_, lane)) => {
                lane.close();
                info!("Closed lane for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn lane(&self, session_id: &str) -> Option<Arc<SessionLane>> {
        self.lanes.get(session_id).map(|lane| Arc::clone(lane.value()))
    }

    pub fn has_lane(&self, session_id: &str) -> bool {
        self.lanes.contains_key(session_id)
    }

    /// Forward one chunk to its session's lane
    pub fn route(&self, chunk: RawChunk) -> PipelineResult<()> {
        let Some(lane) = self.lane(&chunk.session_id) else {
            let miss = PipelineError::RouterMiss(chunk.session_id.clone());
            warn!("{} ({} bytes dropped)", miss, chunk.bytes.len());
            return Err(miss);
        };
        lane.accept(&chunk);
        Ok(())
    }

    /// A pipe of a process generation reached EOF
    pub fn finish(&self, session_id: &str, generation: u64, stream: StreamKind) {
        if let Some(lane) = self.lane(session_id) {
            lane.finish(generation, stream);
        }
    }

    pub fn arm(&self, session_id: &str, generation: u64) -> bool {
        match self.lane(session_id) {
            Some(lane) => {
                lane.arm(generation);
                true
            }
            None => false,
        }
    }

    pub fn mute(&self, session_id: &str) {
        if let Some(lane) = self.lane(session_id) {
            lane.mute();
        }
    }

    /// Queue a segment directly into a session's playback
    pub fn enqueue(&self, session_id: &str, segment: Segment) -> PipelineResult<u64> {
        let lane = self.require(session_id)?;
        Ok(lane.playback.enqueue(segment))
    }

    pub fn skip(&self, session_id: &str) -> PipelineResult<usize> {
        let lane = self.require(session_id)?;
        Ok(lane.playback.skip())
    }

    pub fn clear(&self, session_id: &str) -> PipelineResult<usize> {
        let lane = self.require(session_id)?;
        Ok(lane.playback.clear())
    }

    pub fn reset_formatter(&self, session_id: &str) -> PipelineResult<()> {
        let lane = self.require(session_id)?;
        lane.reset_formatter();
        Ok(())
    }

    /// Deliver a notice through the session's lane, or straight to the sink if it has none
    pub fn notify(&self, session_id: &str, notice: Notice) {
        match self.lane(session_id) {
            Some(lane) => lane.playback.notify(notice),
            None => self.sink.emit(DisplayEvent::notice(session_id, notice)),
        }
    }

    fn require(&self, session_id: &str) -> PipelineResult<Arc<SessionLane>> {
        self.lane(session_id)
            .ok_or_else(|| PipelineError::RouterMiss(session_id.to_string()))
    }
}
