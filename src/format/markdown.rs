//! Markdown Line Transforms
//!
//! Plain-state rendering of a single complete line with pulldown-cmark:
//! headings, list items, emphasis and code spans, followed by a pass that
//! marks file paths in the remaining plain text.

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

use super::segment::{Span, Style};

/// Extensions that make a separator-bearing token a path
const PATH_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "css", "go", "h", "hpp", "html", "java", "js", "json", "jsx", "kt",
    "lock", "lua", "md", "mjs", "php", "py", "rb", "rs", "scss", "sh", "sql", "swift", "toml",
    "ts", "tsx", "txt", "vue", "xml", "yaml", "yml", "zig",
];

pub const BULLET_GLYPH: &str = "• ";

/// Render one line (no trailing newline) into styled spans
pub fn render_line(line: &str) -> Vec<Span> {
    render(line, false)
}

/// Inline spans of a line fragment; block syntax is left as written
pub fn render_inline(text: &str) -> Vec<Span> {
    render(text, true)
}

fn render(line: &str, inline_only: bool) -> Vec<Span> {
    if line.trim().is_empty() {
        return plain_spans(line);
    }

    let mut renderer = LineRenderer::new(leading_whitespace(line));
    for event in Parser::new(line) {
        if !renderer.process_event(event, inline_only) {
            return with_paths(plain_spans(line));
        }
    }

    if renderer.spans.is_empty() {
        // e.g. a link reference definition, which produces no events
        return with_paths(plain_spans(line));
    }
    with_paths(renderer.spans)
}

/// Collects styled spans for one line of markdown
struct LineRenderer<'a> {
    indent: &'a str,
    spans: Vec<Span>,
    heading: Option<u8>,
    strong: usize,
    emphasis: usize,
    /// Next number of an ordered list; `None` for bullets
    ordered: Option<u64>,
    started: bool,
}

impl<'a> LineRenderer<'a> {
    fn new(indent: &'a str) -> Self {
        Self {
            indent,
            spans: Vec::new(),
            heading: None,
            strong: 0,
            emphasis: 0,
            ordered: None,
            started: false,
        }
    }

    fn current_style(&self) -> Style {
        if let Some(level) = self.heading {
            return Style::Heading { level };
        }
        match (self.strong > 0, self.emphasis > 0) {
            (true, true) => Style::BoldItalic,
            (true, false) => Style::Bold,
            (false, true) => Style::Italic,
            (false, false) => Style::Plain,
        }
    }

    /// Returns false when the line should be shown as written
    fn process_event(&mut self, event: Event, inline_only: bool) -> bool {
        let first = !self.started;
        self.started = true;

        match event {
            Event::Start(tag) => {
                if inline_only && first && !matches!(tag, Tag::Paragraph) {
                    return false;
                }
                return self.start_tag(tag);
            }
            Event::End(tag) => self.end_tag(tag),
            Event::Text(text) => {
                let style = self.current_style();
                push_span(&mut self.spans, Span::new(text.as_ref(), style));
            }
            Event::Code(code) => push_span(&mut self.spans, Span::new(code.as_ref(), Style::Code)),
            // Agent prose often has `<T>` style text; keep it visible
            Event::Html(html) | Event::InlineHtml(html) => {
                push_span(&mut self.spans, Span::plain(html.as_ref()))
            }
            Event::SoftBreak | Event::HardBreak => push_span(&mut self.spans, Span::plain(" ")),
            Event::TaskListMarker(checked) => {
                let marker = if checked { "[x] " } else { "[ ] " };
                push_span(&mut self.spans, Span::new(marker, Style::Bullet));
            }
            Event::Rule => return false,
            Event::FootnoteReference(_) | Event::InlineMath(_) | Event::DisplayMath(_) => {
                return false
            }
        }
        true
    }

    fn start_tag(&mut self, tag: Tag) -> bool {
        match tag {
            Tag::Paragraph => {
                // A paragraph's own indentation is dropped by the parser
                if self.spans.is_empty() {
                    push_span(&mut self.spans, Span::plain(self.indent));
                }
            }
            Tag::Heading { level, .. } => {
                self.heading = Some(heading_level(level));
            }
            Tag::List(start) => {
                self.ordered = start;
            }
            Tag::Item => {
                push_span(&mut self.spans, Span::plain(self.indent));
                let marker = match self.ordered {
                    Some(n) => format!("{}. ", n),
                    None => BULLET_GLYPH.to_string(),
                };
                push_span(&mut self.spans, Span::new(marker, Style::Bullet));
            }
            Tag::BlockQuote(_) => {
                push_span(&mut self.spans, Span::plain(self.indent));
                push_span(&mut self.spans, Span::new("> ", Style::Comment));
            }
            Tag::Emphasis => self.emphasis += 1,
            Tag::Strong => self.strong += 1,
            Tag::Link { .. } | Tag::Strikethrough | Tag::Superscript | Tag::Subscript => {}
            // Code blocks, HTML blocks, tables and the like stay as written
            _ => return false,
        }
        true
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Heading(_) => self.heading = None,
            TagEnd::Emphasis => self.emphasis = self.emphasis.saturating_sub(1),
            TagEnd::Strong => self.strong = self.strong.saturating_sub(1),
            TagEnd::List(_) => self.ordered = None,
            _ => {}
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

fn plain_spans(text: &str) -> Vec<Span> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Span::plain(text)]
    }
}

/// Append a span, merging with the previous one when the style matches
fn push_span(spans: &mut Vec<Span>, span: Span) {
    if span.text.is_empty() {
        return;
    }
    match spans.last_mut() {
        Some(last) if last.style == span.style => last.text.push_str(&span.text),
        _ => spans.push(span),
    }
}

/// Split path-like tokens out of plain spans
fn with_paths(spans: Vec<Span>) -> Vec<Span> {
    let mut out = Vec::with_capacity(spans.len());
    for span in spans {
        if span.style != Style::Plain {
            push_span(&mut out, span);
            continue;
        }
        for piece in span.text.split_inclusive(char::is_whitespace) {
            let word = piece.trim_end_matches(char::is_whitespace);
            let token = word
                .trim_start_matches(['(', '"', '\''])
                .trim_end_matches(['.', ',', ';', ')', '"', '\'']);
            if token.is_empty() || !is_path_like(token) {
                push_span(&mut out, Span::plain(piece));
                continue;
            }
            let start = word.len() - word.trim_start_matches(['(', '"', '\'']).len();
            let end = start + token.len();
            push_span(&mut out, Span::plain(&piece[..start]));
            push_span(&mut out, Span::new(token, Style::Path));
            push_span(&mut out, Span::plain(&piece[end..]));
        }
    }
    out
}

/// Has a separator and ends in a recognized extension (ignoring `:line:col`)
pub fn is_path_like(token: &str) -> bool {
    if !token.contains('/') && !token.contains('\\') {
        return false;
    }
    let file = token.trim_end_matches(|c: char| c.is_ascii_digit() || c == ':');
    let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() || name.starts_with('.') => {
            PATH_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn styled(spans: &[Span]) -> Vec<(&str, Style)> {
        spans.iter().map(|s| (s.text.as_str(), s.style)).collect()
    }

    fn text(spans: &[Span]) -> String {
        spans.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_heading_levels() {
        assert_eq!(
            styled(&render_line("## Install")),
            vec![("Install", Style::Heading { level: 2 })]
        );
        assert_eq!(
            styled(&render_line("###### deep")),
            vec![("deep", Style::Heading { level: 6 })]
        );
        // Seven hashes is not a heading
        assert_eq!(render_line("####### no")[0].style, Style::Plain);
        // Missing space is not a heading
        assert_eq!(render_line("#tag")[0].style, Style::Plain);
    }

    #[test]
    fn test_bullets() {
        let spans = render_line("  - first **item**");
        assert_eq!(
            styled(&spans),
            vec![
                ("  ", Style::Plain),
                (BULLET_GLYPH, Style::Bullet),
                ("first ", Style::Plain),
                ("item", Style::Bold),
            ]
        );
    }

    #[test]
    fn test_ordered_items_keep_number() {
        let spans = render_line("3. third");
        assert_eq!(
            styled(&spans),
            vec![("3. ", Style::Bullet), ("third", Style::Plain)]
        );
    }

    #[test]
    fn test_bold_line_is_not_bullet() {
        let spans = render_line("**Note** read this");
        assert_eq!(spans[0], Span::new("Note", Style::Bold));
    }

    #[test]
    fn test_inline_styles() {
        let spans = render_line("use `cargo` *now* or ***never***");
        assert_eq!(
            styled(&spans),
            vec![
                ("use ", Style::Plain),
                ("cargo", Style::Code),
                (" ", Style::Plain),
                ("now", Style::Italic),
                (" or ", Style::Plain),
                ("never", Style::BoldItalic),
            ]
        );
    }

    #[test]
    fn test_nested_emphasis_leaves_no_markers() {
        let spans = render_line("**bold *it* x**");
        assert_eq!(text(&spans), "bold it x");
        assert_eq!(
            styled(&spans),
            vec![
                ("bold ", Style::Bold),
                ("it", Style::BoldItalic),
                (" x", Style::Bold),
            ]
        );
    }

    #[test]
    fn test_snake_case_not_italic() {
        let spans = render_line("call my_var_name here");
        assert_eq!(spans, vec![Span::plain("call my_var_name here")]);
        let spans = render_line("an _emphasis_ word");
        assert_eq!(spans[1], Span::new("emphasis", Style::Italic));
    }

    #[test]
    fn test_paths() {
        let spans = render_line("Edited src/main.rs:42 and docs/guide.md.");
        assert_eq!(
            styled(&spans),
            vec![
                ("Edited ", Style::Plain),
                ("src/main.rs:42", Style::Path),
                (" and ", Style::Plain),
                ("docs/guide.md", Style::Path),
                (".", Style::Plain),
            ]
        );
    }

    #[test]
    fn test_non_paths_stay_plain() {
        assert!(!is_path_like("and/or"));
        assert!(!is_path_like("main.rs"));
        assert!(is_path_like(r"C:\proj\lib.rs"));
        assert!(is_path_like("./.config/app.toml"));
        assert_eq!(render_line("either and/or")[0].style, Style::Plain);
    }

    #[test]
    fn test_block_syntax_shown_as_written() {
        assert_eq!(render_line("---"), vec![Span::plain("---")]);
        assert_eq!(render_line("    indented code"), vec![Span::plain("    indented code")]);
        assert_eq!(render_line("| a | b |"), vec![Span::plain("| a | b |")]);
    }

    #[test]
    fn test_inline_fragment_keeps_block_markers() {
        let spans = render_inline("# not a heading **yet**");
        assert_eq!(spans, vec![Span::plain("# not a heading **yet**")]);

        let spans = render_inline("see **this** in lib/mod.rs");
        assert_eq!(
            styled(&spans),
            vec![
                ("see ", Style::Plain),
                ("this", Style::Bold),
                (" in ", Style::Plain),
                ("lib/mod.rs", Style::Path),
            ]
        );
    }
}
