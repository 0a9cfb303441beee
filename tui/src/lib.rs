//! TUI rendering for Kiln using ratatui.

mod app;
mod composer;
mod input;
pub mod markdown;
mod modals;
mod sanitize;
mod settings;
mod theme;

#[cfg(test)]
mod testing;

pub use app::{App, Entry, SCROLL_PAGE, entries_from_history};
pub use composer::Composer;
pub use input::{InputPump, apply_event, handle_events};
pub use sanitize::sanitize_terminal_text;
pub use settings::{Settings, SettingsAction, SettingsView, mask_api_key};
pub use theme::{Palette, spinner_frame, styles};

use std::mem;

use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph};
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use kiln_engine::Mode;

use self::markdown::render_markdown;
use self::theme::glyphs;

const MAX_INPUT_LINES: usize = 6;
const TOOL_INPUT_PREVIEW_CHARS: usize = 200;
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 500;

/// Main draw function.
pub fn draw(frame: &mut Frame, app: &mut App) {
    let palette = Palette::standard();
    frame.render_widget(
        Block::default().style(Style::default().bg(palette.bg_dark)),
        frame.area(),
    );

    let input_lines = app.composer().line_count().clamp(1, MAX_INPUT_LINES);
    let input_height = u16::try_from(input_lines).unwrap_or(1) + 2;
    let [header, body, input, status] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(3),
        Constraint::Length(input_height),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    draw_header(frame, app, header, &palette);
    draw_transcript(frame, app, body, &palette);
    draw_input(frame, app, input, &palette);
    draw_status_bar(frame, app, status, &palette);

    if app.permission_request().is_some() {
        modals::draw_permission(frame, app, &palette);
    } else if app.settings().is_some() {
        modals::draw_settings(frame, app, &palette);
    }
}

fn mode_badge(mode: Mode, palette: &Palette) -> Span<'static> {
    let style = match mode {
        Mode::Plan => styles::mode_plan(palette),
        Mode::Build => styles::mode_build(palette),
    };
    Span::styled(format!(" {} ", mode.label()), style)
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect, palette: &Palette) {
    let bg = Style::default().bg(palette.bg_panel);
    let left = Line::from(vec![
        Span::styled(
            " kiln ",
            Style::default()
                .fg(palette.primary)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        mode_badge(app.mode(), palette),
    ]);
    let right = Line::from(vec![
        Span::styled("model: ", styles::key_hint(palette)),
        Span::styled(app.model(), Style::default().fg(palette.text_primary)),
        Span::styled("  tokens: ", styles::key_hint(palette)),
        Span::styled(
            format_count(app.token_total()),
            Style::default().fg(palette.text_primary),
        ),
        Span::raw(" "),
    ]);
    frame.render_widget(Paragraph::new(left).style(bg), area);
    frame.render_widget(
        Paragraph::new(right).alignment(Alignment::Right).style(bg),
        area,
    );
}

fn draw_transcript(frame: &mut Frame, app: &mut App, area: Rect, palette: &Palette) {
    if app.transcript().is_empty() {
        let hint = Paragraph::new(Line::from(Span::styled(
            "No messages yet. Type a prompt below to get started.",
            styles::key_hint(palette),
        )))
        .alignment(Alignment::Center);
        let middle = Rect {
            y: area.y + area.height / 2,
            height: 1.min(area.height),
            ..area
        };
        frame.render_widget(hint, middle);
        return;
    }

    let width = usize::from(area.width.saturating_sub(1)).max(10);
    let lines = wrap_lines(transcript_lines(app, palette), width);

    let height = usize::from(area.height);
    let max_scroll = lines.len().saturating_sub(height);
    app.clamp_scroll(max_scroll);
    let start = max_scroll - app.scroll();
    let visible: Vec<Line<'static>> = lines.into_iter().skip(start).take(height).collect();

    frame.render_widget(Paragraph::new(visible), area);
}

fn transcript_lines(app: &App, palette: &Palette) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    let body_style = Style::default().fg(palette.text_primary);
    let muted = styles::key_hint(palette);

    for (i, entry) in app.transcript().iter().enumerate() {
        if i > 0 {
            lines.push(Line::default());
        }
        match entry {
            Entry::User { text, at } => {
                lines.push(Line::from(vec![
                    Span::styled(format!("{} You", glyphs::USER), styles::user_name(palette)),
                    Span::styled(format!("  {}", at.format("%H:%M:%S")), muted),
                ]));
                lines.extend(indented(&sanitize_terminal_text(text), body_style));
            }
            Entry::Assistant {
                text,
                streaming,
                at,
            } => {
                let mut header = vec![
                    Span::styled(
                        format!("{} Assistant", glyphs::ASSISTANT),
                        styles::assistant_name(palette),
                    ),
                    Span::styled(format!("  {}", at.format("%H:%M:%S")), muted),
                ];
                if *streaming {
                    header.push(Span::styled(
                        format!("  {}", spinner_frame(app.tick_count())),
                        Style::default().fg(palette.yellow),
                    ));
                }
                lines.push(Line::from(header));
                lines.extend(render_markdown(
                    &sanitize_terminal_text(text),
                    body_style,
                    palette,
                ));
            }
            Entry::System(text) => {
                let style = styles::system_text(palette);
                let text = sanitize_terminal_text(text);
                for (n, line) in text.lines().enumerate() {
                    let prefix = if n == 0 { glyphs::SYSTEM } else { " " };
                    lines.push(Line::from(Span::styled(format!("{prefix} {line}"), style)));
                }
            }
            Entry::ToolCall { name, input, .. } => {
                lines.push(Line::from(vec![
                    Span::styled(format!("{} ", glyphs::TOOL), styles::tool_name(palette)),
                    Span::styled(format!("tool: {name}"), styles::tool_name(palette)),
                ]));
                if !input.is_empty() {
                    let preview = truncate_chars(input, TOOL_INPUT_PREVIEW_CHARS);
                    let preview = sanitize_terminal_text(&preview).replace('\n', " ");
                    lines.push(Line::from(Span::styled(
                        format!("  {} {preview}", glyphs::CONNECTOR),
                        muted,
                    )));
                }
            }
            Entry::ToolResult {
                name,
                output,
                is_error,
            } => {
                let (glyph, color) = if *is_error {
                    (glyphs::TOOL_ERR, palette.red)
                } else {
                    (glyphs::TOOL_OK, palette.green)
                };
                lines.push(Line::from(Span::styled(
                    format!("{glyph} result: {name}"),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                )));
                let mut preview = truncate_chars(output, TOOL_OUTPUT_PREVIEW_CHARS);
                if preview.len() < output.len() {
                    preview.push_str("\n... (truncated)");
                }
                lines.extend(indented(&sanitize_terminal_text(&preview), muted));
            }
        }
    }
    lines
}

fn indented(text: &str, style: Style) -> impl Iterator<Item = Line<'static>> + '_ {
    text.lines()
        .map(move |line| Line::from(Span::styled(format!("  {line}"), style)))
}

fn draw_input(frame: &mut Frame, app: &App, area: Rect, palette: &Palette) {
    let border_color = match app.mode() {
        Mode::Plan => palette.blue,
        Mode::Build => palette.peach,
    };
    let title = if app.is_running() {
        Line::from(Span::styled(
            format!(" {} thinking... ", spinner_frame(app.tick_count())),
            Style::default().fg(palette.yellow),
        ))
    } else {
        Line::from(Span::styled(" prompt ", Style::default().fg(border_color)))
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border_color))
        .title(title);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let composer = app.composer();
    if composer.is_empty() {
        frame.render_widget(
            Paragraph::new(Span::styled("Ask anything...", styles::key_hint(palette))),
            inner,
        );
    } else {
        let (row, _) = composer.cursor_position();
        let offset = row.saturating_sub(usize::from(inner.height).saturating_sub(1));
        let lines: Vec<Line> = composer
            .text()
            .split('\n')
            .skip(offset)
            .map(|line| Line::from(Span::styled(line, Style::default().fg(palette.text_primary))))
            .collect();
        frame.render_widget(Paragraph::new(lines), inner);
    }

    if app.permission_request().is_none() && app.settings().is_none() && inner.width > 0 {
        let (row, col) = composer.cursor_position();
        let offset = row.saturating_sub(usize::from(inner.height).saturating_sub(1));
        let x = u16::try_from(col)
            .unwrap_or(u16::MAX)
            .min(inner.width - 1);
        let y = u16::try_from(row - offset).unwrap_or(0);
        frame.set_cursor_position((inner.x + x, inner.y + y));
    }
}

fn draw_status_bar(frame: &mut Frame, app: &App, area: Rect, palette: &Palette) {
    let key = styles::key_highlight(palette);
    let hint = styles::key_hint(palette);
    let value = Style::default().fg(palette.text_secondary);
    let sep = Span::styled(" | ", Style::default().fg(palette.bg_border));

    let mut items: Vec<Vec<Span<'static>>> = vec![
        vec![Span::styled("mode: ", hint), Span::styled(app.mode().to_string(), value)],
        vec![
            Span::styled("msgs: ", hint),
            Span::styled(app.transcript().len().to_string(), value),
        ],
        vec![Span::styled("model: ", hint), Span::styled(app.model(), value)],
    ];
    if app.is_running() {
        items.push(vec![Span::styled(
            "thinking...",
            Style::default()
                .fg(palette.yellow)
                .add_modifier(Modifier::ITALIC),
        )]);
    }
    for (k, desc) in [
        ("enter", "submit"),
        ("alt+enter", "newline"),
        ("ctrl+t", "mode"),
        ("ctrl+k", "settings"),
        ("esc", "cancel"),
        ("ctrl+c", "quit"),
    ] {
        items.push(vec![Span::styled(k, key), Span::styled(format!(" {desc}"), hint)]);
    }

    let mut spans = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            spans.push(sep.clone());
        }
        spans.extend(item);
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans))
            .alignment(Alignment::Center)
            .style(Style::default().bg(palette.bg_panel)),
        area,
    );
}

/// Hard-wrap lines to `width` columns, splitting on grapheme boundaries and
/// keeping span styles.
#[must_use]
pub fn wrap_lines(lines: Vec<Line<'static>>, width: usize) -> Vec<Line<'static>> {
    let width = width.max(1);
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        if line.width() <= width {
            out.push(line);
            continue;
        }
        let mut current: Vec<Span<'static>> = Vec::new();
        let mut used = 0;
        for span in line.spans {
            let mut chunk = String::new();
            for g in span.content.graphemes(true) {
                let w = g.width();
                if used + w > width && used > 0 {
                    if !chunk.is_empty() {
                        current.push(Span::styled(mem::take(&mut chunk), span.style));
                    }
                    out.push(Line::from(mem::take(&mut current)));
                    used = 0;
                }
                chunk.push_str(g);
                used += w;
            }
            if !chunk.is_empty() {
                current.push(Span::styled(chunk, span.style));
            }
        }
        if !current.is_empty() {
            out.push(Line::from(current));
        }
    }
    out
}

/// First `max` characters of `text`, with `...` appended when cut.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// `1234567` -> `1,234,567`.
#[must_use]
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
