//! Markdown to ratatui rendering for assistant replies.
//!
//! Rendering is cached per thread so the transcript can be redrawn every
//! frame without re-parsing unchanged messages.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};

use crate::theme::Palette;

const CACHE_MAX_ENTRIES: usize = 128;
const INDENT: &str = "  ";

thread_local! {
    static RENDER_CACHE: RefCell<HashMap<u64, Vec<Line<'static>>>> = RefCell::new(HashMap::new());
}

fn cache_key(content: &str, style: Style) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    style.fg.hash(&mut hasher);
    style.bg.hash(&mut hasher);
    style.add_modifier.hash(&mut hasher);
    hasher.finish()
}

/// Render markdown content to indented ratatui lines.
#[must_use]
pub fn render_markdown(content: &str, base_style: Style, palette: &Palette) -> Vec<Line<'static>> {
    let key = cache_key(content, base_style);
    if let Some(lines) = RENDER_CACHE.with(|cache| cache.borrow().get(&key).cloned()) {
        return lines;
    }

    let lines = MarkdownRenderer::new(base_style, palette).render(content);

    RENDER_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() >= CACHE_MAX_ENTRIES {
            // Streaming replies produce a new key every frame; drop everything
            // rather than tracking recency.
            cache.clear();
        }
        cache.insert(key, lines.clone());
    });

    lines
}

struct MarkdownRenderer<'p> {
    base_style: Style,
    palette: &'p Palette,
    lines: Vec<Line<'static>>,
    spans: Vec<Span<'static>>,

    // Counters rather than flags so `# Title **bold**` stays bold after the
    // inner strong span closes.
    bold: usize,
    italic: usize,
    strike: usize,
    heading: Option<HeadingLevel>,

    code_block: Option<Vec<String>>,
    code_lang: String,

    lists: Vec<Option<u64>>,
}

impl<'p> MarkdownRenderer<'p> {
    fn new(base_style: Style, palette: &'p Palette) -> Self {
        Self {
            base_style,
            palette,
            lines: Vec::new(),
            spans: Vec::new(),
            bold: 0,
            italic: 0,
            strike: 0,
            heading: None,
            code_block: None,
            code_lang: String::new(),
            lists: Vec::new(),
        }
    }

    fn render(mut self, content: &str) -> Vec<Line<'static>> {
        let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
        for event in Parser::new_ext(content, options) {
            self.handle_event(event);
        }
        self.flush_line();
        while self.lines.last().is_some_and(|line| line.spans.is_empty()) {
            self.lines.pop();
        }
        self.lines
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(tag) => self.start_tag(tag),
            Event::End(tag) => self.end_tag(tag),
            // Model output often contains XML-like tags; show them verbatim.
            Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => self.text(&text),
            Event::Code(code) => {
                let style = Style::default()
                    .fg(self.palette.peach)
                    .add_modifier(Modifier::BOLD);
                self.spans.push(Span::styled(code.to_string(), style));
            }
            Event::SoftBreak => {
                if self.code_block.is_none() {
                    self.spans.push(Span::raw(" "));
                }
            }
            Event::HardBreak => self.flush_line(),
            Event::Rule => {
                self.flush_line();
                self.lines.push(Line::from(vec![
                    Span::raw(INDENT),
                    Span::styled("─".repeat(24), Style::default().fg(self.palette.bg_border)),
                ]));
            }
            Event::TaskListMarker(done) => {
                let marker = if done { "[x] " } else { "[ ] " };
                self.spans.push(Span::styled(marker, self.base_style));
            }
            _ => {}
        }
    }

    fn start_tag(&mut self, tag: Tag) {
        match tag {
            Tag::Heading { level, .. } => {
                self.flush_line();
                self.blank_line();
                self.heading = Some(level);
                self.bold += 1;
            }
            Tag::Strong => self.bold += 1,
            Tag::Emphasis => self.italic += 1,
            Tag::Strikethrough => self.strike += 1,
            Tag::CodeBlock(kind) => {
                self.flush_line();
                self.code_lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.code_block = Some(Vec::new());
            }
            Tag::List(start) => {
                self.flush_line();
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush_line();
                let indent = INDENT.repeat(self.lists.len().saturating_sub(1));
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{indent}{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => format!("{indent}• "),
                };
                self.spans
                    .push(Span::styled(marker, Style::default().fg(self.palette.accent)));
            }
            Tag::Paragraph => {
                if self.lists.is_empty() {
                    self.blank_line();
                }
            }
            _ => {}
        }
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Heading(_) => {
                self.flush_line();
                self.heading = None;
                self.bold = self.bold.saturating_sub(1);
            }
            TagEnd::Strong => self.bold = self.bold.saturating_sub(1),
            TagEnd::Emphasis => self.italic = self.italic.saturating_sub(1),
            TagEnd::Strikethrough => self.strike = self.strike.saturating_sub(1),
            TagEnd::CodeBlock => {
                let code = self.code_block.take().unwrap_or_default();
                self.render_code_block(&code);
            }
            TagEnd::List(_) => {
                self.flush_line();
                self.lists.pop();
            }
            TagEnd::Item | TagEnd::Paragraph => self.flush_line(),
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(code) = self.code_block.as_mut() {
            code.extend(text.lines().map(str::to_string));
            return;
        }
        let style = self.current_style();
        self.spans.push(Span::styled(text.to_string(), style));
    }

    fn current_style(&self) -> Style {
        let mut style = self.base_style;
        if let Some(level) = self.heading {
            let color = match level {
                HeadingLevel::H1 => self.palette.primary,
                HeadingLevel::H2 => self.palette.blue,
                _ => self.palette.accent,
            };
            style = style.fg(color);
        }
        if self.bold > 0 {
            style = style.add_modifier(Modifier::BOLD);
        }
        if self.italic > 0 {
            style = style.add_modifier(Modifier::ITALIC);
        }
        if self.strike > 0 {
            style = style.add_modifier(Modifier::CROSSED_OUT);
        }
        style
    }

    fn blank_line(&mut self) {
        if self.lines.last().is_some_and(|line| !line.spans.is_empty()) {
            self.lines.push(Line::default());
        }
    }

    fn flush_line(&mut self) {
        if self.spans.is_empty() {
            return;
        }
        let mut spans = vec![Span::raw(INDENT)];
        spans.append(&mut self.spans);
        self.lines.push(Line::from(spans));
    }

    fn render_code_block(&mut self, code: &[String]) {
        let fence_style = Style::default().fg(self.palette.text_muted);
        let code_style = Style::default().fg(self.palette.text_secondary);
        let lang = mem::take(&mut self.code_lang);

        self.lines.push(Line::from(vec![
            Span::raw(INDENT),
            Span::styled(format!("```{lang}"), fence_style),
        ]));
        for line in code {
            self.lines.push(Line::from(vec![
                Span::raw(INDENT),
                Span::styled(line.clone(), code_style),
            ]));
        }
        self.lines.push(Line::from(vec![
            Span::raw(INDENT),
            Span::styled("```", fence_style),
        ]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(content: &str) -> Vec<Line<'static>> {
        render_markdown(content, Style::default(), &Palette::standard())
    }

    fn text_of(line: &Line<'_>) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn plain_paragraph_is_indented() {
        let lines = render("Hello world");
        assert_eq!(lines.len(), 1);
        assert_eq!(text_of(&lines[0]), "  Hello world");
    }

    #[test]
    fn bold_survives_nested_span_in_heading() {
        let lines = render("# Intro **key** point");
        let heading = lines
            .iter()
            .find(|l| text_of(l).contains("point"))
            .unwrap();
        for span in heading.spans.iter().filter(|s| !s.content.trim().is_empty()) {
            assert!(span.style.add_modifier.contains(Modifier::BOLD), "{}", span.content);
        }
    }

    #[test]
    fn lists_get_markers() {
        let lines = render("- one\n- two\n\n1. first\n2. second");
        let texts: Vec<String> = lines.iter().map(text_of).collect();
        assert!(texts.contains(&"  • one".to_string()), "{texts:?}");
        assert!(texts.contains(&"  • two".to_string()), "{texts:?}");
        assert!(texts.contains(&"  2. second".to_string()), "{texts:?}");
    }

    #[test]
    fn code_block_keeps_lines_and_language() {
        let lines = render("```rust\nfn main() {}\nlet x = 1;\n```");
        let texts: Vec<String> = lines.iter().map(text_of).collect();
        assert_eq!(
            texts,
            vec!["  ```rust", "  fn main() {}", "  let x = 1;", "  ```"]
        );
    }

    #[test]
    fn inline_code_is_highlighted() {
        let palette = Palette::standard();
        let lines = render_markdown("run `cargo fmt` now", Style::default(), &palette);
        let code = lines[0]
            .spans
            .iter()
            .find(|s| s.content == "cargo fmt")
            .unwrap();
        assert_eq!(code.style.fg, Some(palette.peach));
    }

    #[test]
    fn xml_like_tags_are_not_dropped() {
        let lines = render("<thinking>This is important</thinking>");
        let all: String = lines.iter().map(text_of).collect();
        assert!(all.contains("important"), "{all}");
    }

    #[test]
    fn cached_render_matches_fresh_render() {
        let first = render("**bold** and _italic_");
        let second = render("**bold** and _italic_");
        assert_eq!(first, second);
    }
}
