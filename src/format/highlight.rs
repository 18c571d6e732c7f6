//! Code Block Highlighting
//!
//! Line-at-a-time highlighting of fenced code with syntect's bundled
//! grammars. Parser state carries across lines, so block comments and
//! multi-line strings stay styled until they close.

use log::debug;
use once_cell::sync::Lazy;
use syntect::easy::ScopeRegionIterator;
use syntect::parsing::{ParseState, Scope, ScopeStack, SyntaxReference, SyntaxSet};

use super::segment::{Span, Style};

static SYNTAXES: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);

/// Fence tags the bundled grammars do not know by name
const ALIASES: &[(&str, &str)] = &[
    ("ts", "js"),
    ("tsx", "js"),
    ("typescript", "js"),
    ("jsx", "js"),
    ("shell", "sh"),
    ("zsh", "sh"),
    ("console", "sh"),
    ("golang", "go"),
    ("python3", "py"),
];

/// Find the grammar for a fence language tag, case-insensitively
pub fn lookup(tag: &str) -> Option<&'static SyntaxReference> {
    let tag = tag.trim().to_ascii_lowercase();
    if tag.is_empty() {
        return None;
    }
    let token = ALIASES
        .iter()
        .find(|(alias, _)| *alias == tag)
        .map(|(_, target)| *target)
        .unwrap_or(tag.as_str());
    SYNTAXES.find_syntax_by_token(token)
}

/// Highlights the lines of one code block in order
pub struct CodeHighlighter {
    syntax: &'static SyntaxReference,
    parse: ParseState,
    stack: ScopeStack,
}

impl CodeHighlighter {
    pub fn new(syntax: &'static SyntaxReference) -> Self {
        Self {
            syntax,
            parse: ParseState::new(syntax),
            stack: ScopeStack::new(),
        }
    }

    pub fn for_language(tag: &str) -> Option<Self> {
        lookup(tag).map(Self::new)
    }

    pub fn language(&self) -> &str {
        &self.syntax.name
    }

    /// Style one line (without its newline)
    pub fn highlight_line(&mut self, line: &str) -> Vec<Span> {
        let text = format!("{}\n", line);
        let ops = match self.parse.parse_line(&text, &SYNTAXES) {
            Ok(ops) => ops,
            Err(e) => {
                debug!("{} grammar failed on a line, leaving it unstyled: {}", self.syntax.name, e);
                self.parse = ParseState::new(self.syntax);
                self.stack = ScopeStack::new();
                return vec![Span::plain(line)];
            }
        };

        let mut spans: Vec<Span> = Vec::new();
        for (region, op) in ScopeRegionIterator::new(&ops, &text) {
            if let Err(e) = self.stack.apply(op) {
                debug!("Scope stack out of step in {}: {:?}", self.syntax.name, e);
            }
            let region = region.trim_end_matches('\n');
            if region.is_empty() {
                continue;
            }
            let style = classify(self.stack.as_slice(), region);
            match spans.last_mut() {
                Some(last) if last.style == style => last.text.push_str(region),
                _ => spans.push(Span::new(region, style)),
            }
        }
        spans
    }
}

/// Map the innermost meaningful scope onto a span style.
///
/// Comments and strings win over anything nested inside them.
fn classify(scopes: &[Scope], text: &str) -> Style {
    let names: Vec<String> = scopes.iter().map(|scope| scope.build_string()).collect();
    let has = |prefix: &str| names.iter().any(|name| name.starts_with(prefix));

    if has("comment") {
        Style::Comment
    } else if has("string") || has("constant.character") {
        Style::String
    } else if has("constant.numeric") {
        Style::Number
    } else if has("keyword.operator") || has("punctuation") {
        Style::Punctuation
    } else if has("keyword") || has("storage") || has("constant.language") {
        Style::Keyword
    } else if has("entity") || has("variable") || has("support") {
        Style::Identifier
    } else if text.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Style::Identifier
    } else {
        Style::Plain
    }
}
