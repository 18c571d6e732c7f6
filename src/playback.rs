//! Playback Queue
//!
//! Per-session typewriter emission. Segments are queued in order and a
//! dedicated task drains a fixed number of display units per tick.
//! Every emission happens under the queue lock, so `skip` and `clear`
//! can only truncate what is left, never reorder it.

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{PlaybackConfig, PlaybackUnit};
use crate::format::Segment;
use crate::session::events::{DisplayEvent, DisplaySink, Notice};

/// A queued segment with its per-session sequence number
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub session_id: String,
    pub sequence: u64,
    pub payload: Segment,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PlaybackItem>,
    next_sequence: u64,
}

/// Timed emitter for one session
pub struct PlaybackQueue {
    session_id: String,
    state: Mutex<QueueState>,
    sink: Arc<dyn DisplaySink>,
    units_per_tick: usize,
    unit: PlaybackUnit,
    tick_interval: Duration,
    wake: Notify,
    cancel: CancellationToken,
}

impl PlaybackQueue {
    /// Create a queue without a drain loop; call [`PlaybackQueue::start`] to run one
    pub fn new(
        session_id: impl Into<String>,
        config: &PlaybackConfig,
        sink: Arc<dyn DisplaySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                next_sequence: 1,
            }),
            sink,
            units_per_tick: config.units_per_tick.max(1),
            unit: config.unit,
            tick_interval: config.tick(),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the drain loop for this queue
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run().await })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append a segment; returns its sequence number
    pub fn enqueue(&self, segment: Segment) -> u64 {
        let sequence = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.items.push_back(PlaybackItem {
                session_id: self.session_id.clone(),
                sequence,
                payload: segment,
            });
            sequence
        };
        self.wake.notify_one();
        sequence
    }

    /// Emit up to one tick's worth of display units; returns how many went out
    pub fn tick(&self) -> usize {
        let mut state = self.state.lock();
        let mut budget = self.units_per_tick;
        let mut emitted = 0;

        while budget > 0 {
            let Some(item) = state.items.pop_front() else {
                break;
            };
            let units = item.payload.unit_count(self.unit);
            if units == 0 {
                // Nothing to animate; still shown, in order, for free
                self.sink
                    .emit(DisplayEvent::from_segment(&item.session_id, item.sequence, item.payload));
                continue;
            }

            let (head, rest) = item.payload.split_units(budget, self.unit);
            let taken = units.min(budget);
            budget -= taken;
            emitted += taken;

            self.sink
                .emit(DisplayEvent::from_segment(&item.session_id, item.sequence, head));

            if let Some(rest) = rest {
                state.items.push_front(PlaybackItem {
                    session_id: item.session_id,
                    sequence: item.sequence,
                    payload: rest,
                });
            }
        }

        if emitted > 0 {
            trace!("Session {} played {} units", self.session_id, emitted);
        }
        emitted
    }

    /// Emit everything queued right now, bypassing timing
    pub fn skip(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.items.len();
        for item in state.items.drain(..) {
            self.sink
                .emit(DisplayEvent::from_segment(item.session_id, item.sequence, item.payload));
        }
        if count > 0 {
            debug!("Session {} skipped ahead {} queued items", self.session_id, count);
        }
        count
    }

    /// Discard queued and partly played items without emitting them
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.items.len();
        state.items.clear();
        if count > 0 {
            debug!("Session {} cleared {} queued items", self.session_id, count);
        }
        count
    }

    /// Emit a notice immediately, ordered after anything already played
    pub fn notify(&self, notice: Notice) {
        let _state = self.state.lock();
        self.sink.emit(DisplayEvent::notice(&self.session_id, notice));
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Stop the drain loop and drop anything queued
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(&self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.is_empty() {
                // Idle until something is enqueued
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => ticker.reset(),
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        debug!("Playback loop for session {} stopped", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::{ChannelSink, DisplayPayload};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn queue_with(units_per_tick: usize) -> (Arc<PlaybackQueue>, UnboundedReceiver<DisplayEvent>) {
        let (sink, rx) = ChannelSink::new();
        let config = PlaybackConfig {
            tick_ms: 1,
            units_per_tick,
            unit: PlaybackUnit::Char,
        };
        (PlaybackQueue::new("tab-1", &config, Arc::new(sink)), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<DisplayEvent>) -> Vec<DisplayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn played_text(events: &[DisplayEvent]) -> String {
        events.iter().filter_map(DisplayEvent::text).collect()
    }

    #[test]
    fn test_cancel_after_three_ticks() {
        let (queue, mut rx) = queue_with(10);
        queue.enqueue(Segment::plain("x".repeat(100)));

        for _ in 0..3 {
            assert_eq!(queue.tick(), 10);
        }
        queue.clear();

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.tick(), 0);
        let events = drain(&mut rx);
        assert_eq!(played_text(&events).chars().count(), 30);
        assert!(events.iter().all(|e| e.sequence == Some(1)));
    }

    #[test]
    fn test_tick_spans_items() {
        let (queue, mut rx) = queue_with(5);
        queue.enqueue(Segment::plain("abc"));
        queue.enqueue(Segment::plain("defg"));

        assert_eq!(queue.tick(), 5);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text().as_deref(), Some("abc"));
        assert_eq!(events[1].text().as_deref(), Some("de"));
        assert_eq!(events[1].sequence, Some(2));

        assert_eq!(queue.tick(), 2);
        assert_eq!(played_text(&drain(&mut rx)), "fg");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_skip_flushes_in_order() {
        let (queue, mut rx) = queue_with(2);
        queue.enqueue(Segment::plain("hello"));
        queue.enqueue(Segment::plain(" world"));
        queue.tick();

        assert_eq!(queue.skip(), 2);
        assert!(queue.is_empty());
        assert_eq!(played_text(&drain(&mut rx)), "hello world");
    }

    #[test]
    fn test_empty_segment_played_without_budget() {
        let (queue, mut rx) = queue_with(3);
        let empty_block = Segment::new(crate::format::SegmentKind::CodeBlock {
            language: None,
            highlighted: false,
        });
        queue.enqueue(Segment::plain("ab"));
        queue.enqueue(empty_block);
        queue.enqueue(Segment::plain("cd"));

        assert_eq!(queue.tick(), 3);
        let events = drain(&mut rx);
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(played_text(&events), "abc");

        assert_eq!(queue.tick(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequence_continues_after_clear() {
        let (queue, _rx) = queue_with(1);
        assert_eq!(queue.enqueue(Segment::plain("a")), 1);
        queue.clear();
        assert_eq!(queue.enqueue(Segment::plain("b")), 2);
    }

    #[test]
    fn test_notice_is_immediate() {
        let (queue, mut rx) = queue_with(1);
        queue.enqueue(Segment::plain("pending"));
        queue.notify(Notice::cancelled());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, DisplayPayload::Notice(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_random_ops_never_reorder() {
        let (queue, mut rx) = queue_with(3);
        let mut seed: u32 = 0x1234_5678;
        let mut enqueued = std::collections::HashMap::new();

        for step in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            match (seed >> 16) % 10 {
                0..=3 => {
                    let text = format!("item-{}|", step);
                    let seq = queue.enqueue(Segment::plain(text.clone()));
                    enqueued.insert(seq, text);
                }
                4..=7 => {
                    queue.tick();
                }
                8 => {
                    queue.skip();
                }
                _ => {
                    queue.clear();
                }
            }
        }
        queue.skip();

        let mut last = 0;
        let mut per_item: std::collections::HashMap<u64, String> = Default::default();
        for event in drain(&mut rx) {
            let seq = event.sequence.unwrap();
            assert!(seq >= last, "sequence {} after {}", seq, last);
            last = seq;
            per_item.entry(seq).or_default().push_str(&event.text().unwrap());
        }
        for (seq, text) in per_item {
            assert!(enqueued[&seq].starts_with(&text), "item {} played out of order", seq);
        }
    }

    #[tokio::test]
    async fn test_loop_drains_and_stops() {
        let (queue, mut rx) = queue_with(4);
        let handle = queue.start();

        queue.enqueue(Segment::plain("typewriter"));
        let mut text = String::new();
        while text.len() < "typewriter".len() {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("playback stalled")
                .unwrap();
            text.push_str(&event.text().unwrap());
        }
        assert_eq!(text, "typewriter");

        queue.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert!(queue.is_shutdown());
    }

    #[tokio::test]
    async fn test_clear_stops_running_emission() {
        let (queue, mut rx) = queue_with(1);
        let handle = queue.start();

        queue.enqueue(Segment::plain("a".repeat(10_000)));
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        queue.clear();
        drain(&mut rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(drain(&mut rx).is_empty());

        queue.shutdown();
        let _ = handle.await;
    }
}
