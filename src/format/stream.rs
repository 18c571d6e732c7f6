//! Streaming Formatter
//!
//! Incremental parser for one session's output. Bytes arrive in arbitrary
//! chunks; only complete lines are formatted, and an open code fence holds
//! back all emission until its closing delimiter arrives.

use log::debug;

use super::highlight::CodeHighlighter;
use super::markdown;
use super::segment::{Segment, SegmentKind, Span};
use crate::error::PipelineError;

/// A fence that has been opened but not yet closed
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenFence {
    marker: char,
    marker_len: usize,
    language: Option<String>,
    lines: Vec<String>,
}

impl OpenFence {
    /// Recognize a fence opener: up to 3 spaces, then 3+ backticks or tildes
    fn parse(line: &str) -> Option<Self> {
        let (marker, marker_len, info) = fence_run(line)?;
        if marker == '`' && info.contains('`') {
            return None;
        }
        let language = info.split_whitespace().next().map(str::to_string);
        Some(Self {
            marker,
            marker_len,
            language,
            lines: Vec::new(),
        })
    }

    fn is_close(&self, line: &str) -> bool {
        match fence_run(line) {
            Some((marker, len, info)) => {
                marker == self.marker && len >= self.marker_len && info.is_empty()
            }
            None => false,
        }
    }

    /// Build the code block segment, highlighting when a grammar exists
    fn into_segment(self) -> Segment {
        let mut highlighter = self
            .language
            .as_deref()
            .and_then(CodeHighlighter::for_language);
        let mut segment = Segment::new(SegmentKind::CodeBlock {
            language: self.language.clone(),
            highlighted: highlighter.is_some(),
        });

        for line in &self.lines {
            match highlighter.as_mut() {
                Some(highlighter) => segment.extend(highlighter.highlight_line(line)),
                None => segment.push(Span::plain(line.as_str())),
            }
            segment.push(Span::plain("\n"));
        }
        segment
    }
}

/// Split a candidate fence line into (marker, run length, trimmed info string)
fn fence_run(line: &str) -> Option<(char, usize, &str)> {
    let rest = line.trim_start_matches(' ');
    if line.len() - rest.len() > 3 {
        return None;
    }
    let marker = rest.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let run = rest.chars().take_while(|c| *c == marker).count();
    if run < 3 {
        return None;
    }
    Some((marker, run, rest[run..].trim()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FenceState {
    Plain,
    InFence(OpenFence),
}

/// Per-session incremental formatter
#[derive(Debug, Clone)]
pub struct StreamFormatter {
    /// Bytes of the current, not yet newline-terminated line
    pending: Vec<u8>,
    state: FenceState,
    max_line_bytes: usize,
}

impl StreamFormatter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            state: FenceState::Plain,
            max_line_bytes: max_line_bytes.max(4),
        }
    }

    /// Feed a raw chunk and return every segment it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let newline = self.pending.iter().position(|b| *b == b'\n');
            let line_len = newline.unwrap_or(self.pending.len());

            if !self.is_fence_open() && line_len > self.max_line_bytes {
                let cut = utf8_floor(&self.pending, self.max_line_bytes);
                let piece: Vec<u8> = self.pending.drain(..cut).collect();
                let (text, _) = decode(&piece);
                out.push(Segment::line(markdown::render_inline(&text)));
                continue;
            }

            let Some(pos) = newline else {
                break;
            };
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let (line, faulted) = decode(&raw[..raw.len() - 1]);
            self.process_line(line, faulted, &mut out);
        }

        out
    }

    /// Emit whatever is buffered, best-effort, and return to `Plain`.
    ///
    /// Used when the session's output ends; an unclosed fence becomes a code block.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let tail = std::mem::take(&mut self.pending);
        let (tail, faulted) = decode(&tail);

        match std::mem::replace(&mut self.state, FenceState::Plain) {
            FenceState::InFence(mut fence) => {
                if !tail.is_empty() {
                    fence.lines.push(tail);
                }
                debug!(
                    "Flushing unclosed {} fence with {} lines",
                    fence.language.as_deref().unwrap_or("plain"),
                    fence.lines.len()
                );
                out.push(fence.into_segment());
            }
            FenceState::Plain => {
                if !tail.is_empty() {
                    if faulted {
                        out.push(Segment::plain(tail));
                    } else {
                        out.push(Segment::line(markdown::render_line(&tail)));
                    }
                }
            }
        }

        out
    }

    /// Drop all buffered bytes and fence state
    pub fn reset(&mut self) {
        if self.is_fence_open() || !self.pending.is_empty() {
            debug!(
                "Formatter reset discarding {} pending bytes (fence open: {})",
                self.pending.len(),
                self.is_fence_open()
            );
        }
        self.pending.clear();
        self.state = FenceState::Plain;
    }

    pub fn is_fence_open(&self) -> bool {
        matches!(self.state, FenceState::InFence(_))
    }

    pub fn fence_language(&self) -> Option<&str> {
        match &self.state {
            FenceState::InFence(fence) => fence.language.as_deref(),
            FenceState::Plain => None,
        }
    }

    /// Bytes not yet emitted, including the body of an open fence
    pub fn pending_len(&self) -> usize {
        let fenced = match &self.state {
            FenceState::InFence(fence) => fence.lines.iter().map(|l| l.len() + 1).sum(),
            FenceState::Plain => 0,
        };
        self.pending.len() + fenced
    }

    fn process_line(&mut self, line: String, faulted: bool, out: &mut Vec<Segment>) {
        match &mut self.state {
            FenceState::Plain => {
                if !faulted {
                    if let Some(fence) = OpenFence::parse(&line) {
                        debug!(
                            "Fence opened (language: {})",
                            fence.language.as_deref().unwrap_or("none")
                        );
                        self.state = FenceState::InFence(fence);
                        return;
                    }
                }

                let mut segment = if faulted {
                    Segment::plain(line)
                } else {
                    Segment::line(markdown::render_line(&line))
                };
                segment.push(Span::plain("\n"));
                out.push(segment);
            }
            FenceState::InFence(fence) => {
                if fence.is_close(&line) {
                    if let FenceState::InFence(fence) =
                        std::mem::replace(&mut self.state, FenceState::Plain)
                    {
                        out.push(fence.into_segment());
                    }
                } else {
                    fence.lines.push(line);
                }
            }
        }
    }
}

impl Default for StreamFormatter {
    fn default() -> Self {
        Self::new(8192)
    }
}

/// Decode one line, falling back to lossy passthrough on invalid UTF-8
fn decode(bytes: &[u8]) -> (String, bool) {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => (text, false),
        Err(err) => {
            let fault = PipelineError::from(err);
            debug!("{}; passing line through unstyled", fault);
            (String::from_utf8_lossy(bytes).into_owned(), true)
        }
    }
}

/// Largest index <= `max` that does not split a UTF-8 sequence
fn utf8_floor(bytes: &[u8], max: usize) -> usize {
    let mut idx = max.min(bytes.len());
    while idx > 0 && idx < bytes.len() && (bytes[idx] & 0xC0) == 0x80 {
        idx -= 1;
    }
    if idx == 0 {
        max.min(bytes.len())
    } else {
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::segment::Style;

    fn feed(formatter: &mut StreamFormatter, chunks: &[&[u8]]) -> Vec<Segment> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(formatter.push(chunk));
        }
        out.extend(formatter.flush());
        out
    }

    #[test]
    fn test_fence_withholds_until_close() {
        let mut formatter = StreamFormatter::default();

        assert!(formatter.push(b"```python\n").is_empty());
        assert!(formatter.is_fence_open());
        assert_eq!(formatter.fence_language(), Some("python"));

        assert!(formatter.push(b"print(1)\n").is_empty());

        let out = formatter.push(b"```\n");
        assert_eq!(out.len(), 1);
        let block = &out[0];
        assert_eq!(
            block.kind,
            SegmentKind::CodeBlock {
                language: Some("python".to_string()),
                highlighted: true,
            }
        );
        assert_eq!(block.text(), "print(1)\n");
        assert_eq!(block.spans[0], Span::new("print", Style::Identifier));
        assert!(!formatter.is_fence_open());
        assert_eq!(formatter.pending_len(), 0);
    }

    #[test]
    fn test_plain_lines_emit_per_line() {
        let mut formatter = StreamFormatter::default();
        assert!(formatter.push(b"# Tit").is_empty());

        let out = formatter.push(b"le\nbody");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].spans[0], Span::new("Title", Style::Heading { level: 1 }));
        assert_eq!(out[0].text(), "Title\n");

        let out = formatter.flush();
        assert_eq!(out[0].text(), "body");
    }

    #[test]
    fn test_lines_before_fence_are_not_withheld() {
        let mut formatter = StreamFormatter::default();
        let out = formatter.push(b"Here:\n```rust\nfn main() {}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "Here:\n");
        assert!(formatter.is_fence_open());
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_output() {
        let doc = "Intro with **bold** and src/lib.rs\n```rust\nfn main() {\n    println!(\"→ hi\");\n}\n```\n- done\n";
        let bytes = doc.as_bytes();
        let expected = feed(&mut StreamFormatter::default(), &[bytes]);
        assert_eq!(expected.len(), 3);

        // Every one- and two-cut split
        for a in 0..=bytes.len() {
            for b in a..=bytes.len() {
                let got = feed(
                    &mut StreamFormatter::default(),
                    &[&bytes[..a], &bytes[a..b], &bytes[b..]],
                );
                assert_eq!(got, expected, "cuts at {} and {}", a, b);
            }
        }

        // Pseudo-random five-cut splits
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..500 {
            let mut cuts: Vec<usize> = (0..5)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    (seed % (bytes.len() as u64 + 1)) as usize
                })
                .collect();
            cuts.sort_unstable();

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            assert_eq!(feed(&mut StreamFormatter::default(), &chunks), expected);
        }
    }

    #[test]
    fn test_flush_unclosed_fence() {
        let mut formatter = StreamFormatter::default();
        assert!(formatter.push(b"~~~\nraw text\npartial").is_empty());

        let out = formatter.flush();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].kind,
            SegmentKind::CodeBlock {
                language: None,
                highlighted: false,
            }
        );
        assert_eq!(out[0].text(), "raw text\npartial\n");
        assert!(!formatter.is_fence_open());
    }

    #[test]
    fn test_reset_mid_fence_leaves_no_artifacts() {
        let mut formatter = StreamFormatter::default();
        formatter.push(b"```js\nconst x = 1;\nconst y");
        assert!(formatter.is_fence_open());

        formatter.reset();
        assert!(!formatter.is_fence_open());
        assert_eq!(formatter.pending_len(), 0);

        let out = formatter.push(b"fresh line\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "fresh line\n");
        assert!(formatter.flush().is_empty());
    }

    #[test]
    fn test_unknown_language_passthrough() {
        let mut formatter = StreamFormatter::default();
        let out = feed(&mut formatter, &[b"```cobol\nDISPLAY 'HI'.\n```\n"]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].kind,
            SegmentKind::CodeBlock {
                language: Some("cobol".to_string()),
                highlighted: false,
            }
        );
        assert!(out[0].spans.iter().all(|s| s.style == Style::Plain));
    }

    #[test]
    fn test_close_requires_same_marker() {
        let mut formatter = StreamFormatter::default();
        assert!(formatter.push(b"````\n```\n~~~\n").is_empty());
        let out = formatter.push(b"````\n");
        assert_eq!(out[0].text(), "```\n~~~\n");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "naïve → ok\n".as_bytes();
        let mut formatter = StreamFormatter::default();
        let mut out = Vec::new();
        for byte in text {
            out.extend(formatter.push(std::slice::from_ref(byte)));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "naïve → ok\n");
    }

    #[test]
    fn test_invalid_utf8_is_plain_passthrough() {
        let mut formatter = StreamFormatter::default();
        let out = formatter.push(b"# bad \xff byte\n");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_plain());
        assert!(out[0].text().contains('\u{FFFD}'));
    }

    #[test]
    fn test_long_line_force_commit() {
        let mut formatter = StreamFormatter::new(16);
        let out = formatter.push(b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "abcdefghijklmnop");

        let out = formatter.push(b"\n");
        assert_eq!(out[0].text(), "qrstuvwxyz\n");
    }

    #[test]
    fn test_crlf_lines() {
        let mut formatter = StreamFormatter::default();
        let out = feed(&mut formatter, &[b"```sh\r\necho hi\r\n```\r\n"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "echo hi\n");
    }
}
