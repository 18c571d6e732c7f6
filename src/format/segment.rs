//! Formatted Segments
//!
//! The unit handed from the formatter to playback: a run of styled spans.

use serde::{Deserialize, Serialize};

use crate::config::PlaybackUnit;

/// Visual style of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum Style {
    Plain,
    Heading { level: u8 },
    Bold,
    Italic,
    BoldItalic,
    /// Inline `code`
    Code,
    /// List bullet glyph
    Bullet,
    /// Clickable file path
    Path,
    Keyword,
    String,
    Comment,
    Number,
    Identifier,
    Punctuation,
    Stderr,
}

/// A run of text with one style
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    #[serde(flatten)]
    pub style: Style,
}

impl Span {
    pub fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Style::Plain)
    }
}

/// What a segment represents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentKind {
    /// One line of markdown-ish prose
    Line,
    /// A fenced code block, emitted whole
    CodeBlock {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        /// False when the language has no grammar and the body is unstyled
        highlighted: bool,
    },
    /// One line from the agent's stderr
    Stderr,
}

/// A discrete, styled piece of output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(flatten)]
    pub kind: SegmentKind,
    pub spans: Vec<Span>,
}

impl Segment {
    pub fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            spans: Vec::new(),
        }
    }

    pub fn line(spans: Vec<Span>) -> Self {
        let mut segment = Self::new(SegmentKind::Line);
        for span in spans {
            segment.push(span);
        }
        segment
    }

    /// Unstyled text line
    pub fn plain(text: impl Into<String>) -> Self {
        Self::line(vec![Span::plain(text)])
    }

    /// Append a span, merging with the previous one when the style matches
    pub fn push(&mut self, span: Span) {
        if span.text.is_empty() {
            return;
        }
        match self.spans.last_mut() {
            Some(last) if last.style == span.style => last.text.push_str(&span.text),
            _ => self.spans.push(span),
        }
    }

    pub fn extend(&mut self, spans: impl IntoIterator<Item = Span>) {
        for span in spans {
            self.push(span);
        }
    }

    /// Concatenated text of every span
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.iter().all(|s| s.text.is_empty())
    }

    /// True when the segment carries no styling at all
    pub fn is_plain(&self) -> bool {
        self.kind == SegmentKind::Line && self.spans.iter().all(|s| s.style == Style::Plain)
    }

    /// Number of display units in this segment
    pub fn unit_count(&self, unit: PlaybackUnit) -> usize {
        match unit {
            PlaybackUnit::Char => self.spans.iter().map(|s| s.text.chars().count()).sum(),
            PlaybackUnit::Token => self.spans.len(),
        }
    }

    /// Split off the first `n` display units.
    ///
    /// Returns the head and whatever remains. Both halves keep the segment kind.
    pub fn split_units(mut self, n: usize, unit: PlaybackUnit) -> (Segment, Option<Segment>) {
        if n >= self.unit_count(unit) {
            return (self, None);
        }

        let mut head = Segment::new(self.kind.clone());
        let mut remaining = n;
        let mut rest_spans = Vec::new();

        for span in self.spans.drain(..) {
            if remaining == 0 {
                rest_spans.push(span);
                continue;
            }
            match unit {
                PlaybackUnit::Token => {
                    head.spans.push(span);
                    remaining -= 1;
                }
                PlaybackUnit::Char => {
                    let len = span.text.chars().count();
                    if len <= remaining {
                        remaining -= len;
                        head.spans.push(span);
                    } else {
                        let cut = span
                            .text
                            .char_indices()
                            .nth(remaining)
                            .map(|(idx, _)| idx)
                            .unwrap_or(span.text.len());
                        head.spans.push(Span::new(&span.text[..cut], span.style));
                        rest_spans.push(Span::new(&span.text[cut..], span.style));
                        remaining = 0;
                    }
                }
            }
        }

        let rest = Segment {
            kind: self.kind,
            spans: rest_spans,
        };
        (head, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_merges_same_style() {
        let mut segment = Segment::new(SegmentKind::Line);
        segment.push(Span::plain("Hello"));
        segment.push(Span::plain(", world"));
        segment.push(Span::new("!", Style::Bold));
        assert_eq!(segment.spans.len(), 2);
        assert_eq!(segment.text(), "Hello, world!");
        assert!(!segment.is_plain());
    }

    #[test]
    fn test_split_chars_across_spans() {
        let segment = Segment::line(vec![
            Span::new("fn", Style::Keyword),
            Span::plain(" main"),
        ]);

        let (head, rest) = segment.split_units(4, PlaybackUnit::Char);
        assert_eq!(head.text(), "fn m");
        assert_eq!(head.spans[0].style, Style::Keyword);
        let rest = rest.unwrap();
        assert_eq!(rest.text(), "ain");
        assert_eq!(rest.spans.len(), 1);
    }

    #[test]
    fn test_split_multibyte() {
        let segment = Segment::plain("héllo→");
        let (head, rest) = segment.split_units(2, PlaybackUnit::Char);
        assert_eq!(head.text(), "hé");
        assert_eq!(rest.unwrap().text(), "llo→");
    }

    #[test]
    fn test_split_tokens() {
        let segment = Segment::line(vec![
            Span::new("let", Style::Keyword),
            Span::plain(" "),
            Span::new("x", Style::Identifier),
        ]);
        assert_eq!(segment.unit_count(PlaybackUnit::Token), 3);

        let (head, rest) = segment.split_units(2, PlaybackUnit::Token);
        assert_eq!(head.text(), "let ");
        assert_eq!(rest.unwrap().text(), "x");
    }

    #[test]
    fn test_split_whole() {
        let segment = Segment::plain("abc");
        let (head, rest) = segment.split_units(10, PlaybackUnit::Char);
        assert_eq!(head.text(), "abc");
        assert!(rest.is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let segment = Segment {
            kind: SegmentKind::CodeBlock {
                language: Some("python".to_string()),
                highlighted: true,
            },
            spans: vec![Span::new("print", Style::Identifier)],
        };
        let json = serde_json::to_value(&segment).unwrap();
        assert_eq!(json["type"], "code_block");
        assert_eq!(json["language"], "python");
        assert_eq!(json["spans"][0]["style"], "identifier");
    }
}
