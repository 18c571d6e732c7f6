//! Output Formatting
//!
//! Turns raw agent output into styled segments: markdown line transforms
//! for prose and grammar-based highlighting for fenced code.

pub mod highlight;
pub mod markdown;
pub mod segment;
pub mod stream;

pub use segment::{Segment, SegmentKind, Span, Style};
pub use stream::StreamFormatter;
