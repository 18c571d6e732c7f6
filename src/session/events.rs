//! Session Events
//!
//! Display events handed to the consumer, user-facing notices, and
//! lifecycle status changes.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::state::SessionStatus;
use crate::format::Segment;

/// Payload of a display event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum DisplayPayload {
    /// Unstyled text
    Text(String),
    /// Text carrying styling
    StyledSegment(Segment),
    /// Out-of-band notice
    Notice(Notice),
}

/// One event delivered to the display consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayEvent {
    pub session_id: String,
    /// Playback sequence number; notices carry none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(flatten)]
    pub payload: DisplayPayload,
}

impl DisplayEvent {
    /// Wrap a played segment, downgrading unstyled segments to text
    pub fn from_segment(session_id: impl Into<String>, sequence: u64, segment: Segment) -> Self {
        let payload = if segment.is_plain() {
            DisplayPayload::Text(segment.text())
        } else {
            DisplayPayload::StyledSegment(segment)
        };
        Self {
            session_id: session_id.into(),
            sequence: Some(sequence),
            payload,
        }
    }

    pub fn notice(session_id: impl Into<String>, notice: Notice) -> Self {
        Self {
            session_id: session_id.into(),
            sequence: None,
            payload: DisplayPayload::Notice(notice),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            DisplayPayload::Text(_) => "text",
            DisplayPayload::StyledSegment(_) => "styled_segment",
            DisplayPayload::Notice(_) => "notice",
        }
    }

    /// Rendered text for output events
    pub fn text(&self) -> Option<String> {
        match &self.payload {
            DisplayPayload::Text(text) => Some(text.clone()),
            DisplayPayload::StyledSegment(segment) => Some(segment.text()),
            DisplayPayload::Notice(_) => None,
        }
    }

    pub fn as_notice(&self) -> Option<&Notice> {
        match &self.payload {
            DisplayPayload::Notice(notice) => Some(notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// User cancel completed; the agent was restarted
    Cancelled,
    /// Spawn or respawn failed; the session needs recreating
    SessionError,
    /// Input arrived while the session could not accept it
    InputDropped,
}

/// User-facing, dismissible notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub kind: NoticeKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remedy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn cancelled() -> Self {
        Self {
            level: NoticeLevel::Info,
            kind: NoticeKind::Cancelled,
            message: "Cancelled".to_string(),
            remedy: None,
            timestamp: Utc::now(),
        }
    }

    pub fn session_error(session_id: &str, message: impl std::fmt::Display) -> Self {
        Self {
            level: NoticeLevel::Error,
            kind: NoticeKind::SessionError,
            message: format!("Session {}: {}", session_id, message),
            remedy: Some(
                "Check that the agent executable exists and is executable, then reopen the tab"
                    .to_string(),
            ),
            timestamp: Utc::now(),
        }
    }

    pub fn input_dropped(reason: impl std::fmt::Display) -> Self {
        Self {
            level: NoticeLevel::Warning,
            kind: NoticeKind::InputDropped,
            message: format!("Input dropped: {}", reason),
            remedy: None,
            timestamp: Utc::now(),
        }
    }
}

/// Session status transition, broadcast by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub session_id: String,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
}

/// Receiver of display events; must render in per-session arrival order
pub trait DisplaySink: Send + Sync {
    fn emit(&self, event: DisplayEvent);
}

/// Display sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DisplayEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the consumer drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisplayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DisplaySink for ChannelSink {
    fn emit(&self, event: DisplayEvent) {
        if self.tx.send(event).is_err() {
            debug!("Display consumer gone; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Span, Style};

    #[test]
    fn test_event_kinds() {
        let event = DisplayEvent::from_segment("test-123", 1, Segment::plain("Hello"));
        assert_eq!(event.session_id, "test-123");
        assert_eq!(event.kind(), "text");

        let event = DisplayEvent::notice("test-123", Notice::cancelled());
        assert_eq!(event.kind(), "notice");
    }

    #[test]
    fn test_styled_segment_kept() {
        let segment = Segment::line(vec![Span::new("Title", Style::Heading { level: 1 })]);
        let event = DisplayEvent::from_segment("s", 7, segment);
        assert_eq!(event.kind(), "styled_segment");
        assert_eq!(event.text().as_deref(), Some("Title"));
        assert_eq!(event.sequence, Some(7));
    }

    #[test]
    fn test_serialized_shape() {
        let event = DisplayEvent::from_segment("tab-1", 3, Segment::plain("hi"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sessionId"], "tab-1");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["kind"], "text");
        assert_eq!(json["payload"], "hi");

        let event = DisplayEvent::notice("tab-1", Notice::session_error("tab-1", "missing"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "notice");
        assert_eq!(json["payload"]["kind"], "session_error");
        assert!(json["payload"]["remedy"].is_string());
        assert!(json.get("sequence").is_none());
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(DisplayEvent::notice("a", Notice::cancelled()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "a");

        drop(rx);
        // Emitting into a closed channel is harmless
        sink.emit(DisplayEvent::notice("a", Notice::cancelled()));
    }
}
