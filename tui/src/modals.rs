//! Permission prompt and settings overlays.

use ratatui::Frame;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph, Wrap};

use crate::app::App;
use crate::sanitize::sanitize_terminal_text;
use crate::settings::{ModelList, SettingsView, mask_api_key};
use crate::theme::{Palette, glyphs, spinner_frame, styles};
use crate::truncate_chars;

const PERMISSION_INPUT_PREVIEW_CHARS: usize = 200;

fn centered_rect(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn modal_block(title: &str, border: Style, palette: &Palette) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border)
        .title(Span::styled(
            format!(" {title} "),
            border.add_modifier(Modifier::BOLD),
        ))
        .style(Style::default().bg(palette.bg_popup))
}

fn hint_line(pairs: &[(&'static str, &'static str)], palette: &Palette) -> Line<'static> {
    let mut spans = Vec::new();
    for (i, (key, desc)) in pairs.iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw("  "));
        }
        spans.push(Span::styled(*key, styles::key_highlight(palette)));
        spans.push(Span::styled(format!(" {desc}"), styles::key_hint(palette)));
    }
    Line::from(spans)
}

pub(crate) fn draw_permission(frame: &mut Frame, app: &App, palette: &Palette) {
    let Some(request) = app.permission_request() else {
        return;
    };
    let area = centered_rect(frame.area(), 70, 12);
    frame.render_widget(Clear, area);

    let border = Style::default().fg(palette.yellow);
    let block = modal_block("Permission required", border, palette);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let label = Style::default()
        .fg(palette.text_secondary)
        .add_modifier(Modifier::BOLD);
    let preview = truncate_chars(&request.input, PERMISSION_INPUT_PREVIEW_CHARS);
    let lines = vec![
        Line::from(vec![
            Span::styled("Tool: ", label),
            Span::styled(request.tool_name.clone(), styles::tool_name(palette)),
        ]),
        Line::default(),
        Line::from(Span::styled("Input:", label)),
        Line::from(Span::styled(
            sanitize_terminal_text(&preview).into_owned(),
            Style::default().fg(palette.text_primary),
        )),
    ];

    let [body, keys] =
        Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(inner);
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), body);
    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled("[y]", Style::default().fg(palette.green)),
            Span::styled(" Allow  ", styles::key_hint(palette)),
            Span::styled("[n]", Style::default().fg(palette.red)),
            Span::styled(" Deny  ", styles::key_hint(palette)),
            Span::styled("[a]", Style::default().fg(palette.blue)),
            Span::styled(" Allow for session", styles::key_hint(palette)),
        ])),
        keys,
    );
}

pub(crate) fn draw_settings(frame: &mut Frame, app: &App, palette: &Palette) {
    let Some(settings) = app.settings() else {
        return;
    };
    let area = centered_rect(frame.area(), 64, 20);
    frame.render_widget(Clear, area);

    let border = Style::default().fg(palette.primary);
    let block = modal_block("Settings", border, palette);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let text = Style::default().fg(palette.text_primary);
    let muted = styles::key_hint(palette);

    let (mut lines, hints): (Vec<Line<'static>>, Line<'static>) = match settings.view() {
        SettingsView::Menu => (
            vec![
                Line::from(vec![
                    Span::styled("[1] ", styles::key_highlight(palette)),
                    Span::styled("API key        ", text),
                    Span::styled(mask_api_key(app.api_key()), muted),
                ]),
                Line::from(vec![
                    Span::styled("[2] ", styles::key_highlight(palette)),
                    Span::styled("Model          ", text),
                    Span::styled(app.model(), muted),
                ]),
                Line::from(vec![
                    Span::styled("[3] ", styles::key_highlight(palette)),
                    Span::styled("Max iterations ", text),
                    Span::styled(app.max_iterations().to_string(), muted),
                ]),
            ],
            hint_line(&[("esc", "close")], palette),
        ),
        SettingsView::ApiKey(input) => (
            vec![
                Line::from(Span::styled("Enter API key:", text)),
                Line::from(Span::styled(
                    "*".repeat(input.text().chars().count()),
                    Style::default().fg(palette.accent),
                )),
            ],
            hint_line(&[("enter", "save"), ("esc", "back")], palette),
        ),
        SettingsView::Models(list) => (
            model_list_lines(list, &app.model(), palette),
            hint_line(
                &[("up/down", "navigate"), ("enter", "select"), ("esc", "back")],
                palette,
            ),
        ),
        SettingsView::MaxIterations(input) => (
            vec![
                Line::from(vec![
                    Span::styled("Current: ", muted),
                    Span::styled(app.max_iterations().to_string(), text),
                ]),
                Line::from(Span::styled("New value:", text)),
                Line::from(Span::styled(
                    input.text().to_string(),
                    Style::default().fg(palette.accent),
                )),
            ],
            hint_line(&[("enter", "save"), ("esc", "back")], palette),
        ),
    };

    if let Some(feedback) = settings.feedback() {
        let color = if feedback.is_error {
            palette.red
        } else {
            palette.green
        };
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            feedback.text.clone(),
            Style::default().fg(color),
        )));
    }

    let [body, keys] =
        Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(inner);
    frame.render_widget(Paragraph::new(lines), body);
    frame.render_widget(Paragraph::new(hints), keys);
}

fn model_list_lines(list: &ModelList, current: &str, palette: &Palette) -> Vec<Line<'static>> {
    if list.loading {
        return vec![Line::from(Span::styled(
            format!("{} Loading models...", spinner_frame(0)),
            Style::default().fg(palette.yellow),
        ))];
    }
    if let Some(err) = &list.error {
        return vec![Line::from(Span::styled(
            format!("Error: {err}"),
            Style::default().fg(palette.red),
        ))];
    }
    if list.models.is_empty() {
        return vec![Line::from(Span::styled(
            "No models available",
            styles::key_hint(palette),
        ))];
    }

    let (start, end) = list.visible_range();
    let mut lines: Vec<Line<'static>> = list.models[start..end]
        .iter()
        .enumerate()
        .map(|(offset, model)| {
            let selected = start + offset == list.cursor;
            let marker = if selected { glyphs::SELECTED } else { " " };
            let style = if selected {
                Style::default()
                    .fg(palette.text_primary)
                    .bg(palette.bg_highlight)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(palette.text_secondary)
            };
            let mut spans = vec![Span::styled(format!("{marker} {model}"), style)];
            if model == current {
                spans.push(Span::styled(" (current)", Style::default().fg(palette.green)));
            }
            Line::from(spans)
        })
        .collect();
    if list.models.len() > end - start {
        lines.push(Line::from(Span::styled(
            format!("showing {}-{} of {}", start + 1, end, list.models.len()),
            styles::key_hint(palette),
        )));
    }
    lines
}

#[cfg(test)]
mod tests {
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;

    use super::*;

    #[test]
    fn centered_rect_is_clamped_to_area() {
        let area = Rect::new(0, 0, 40, 10);
        let rect = centered_rect(area, 70, 12);
        assert_eq!(rect, area);

        let rect = centered_rect(Rect::new(0, 0, 100, 40), 60, 20);
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (20, 10, 60, 20));
    }

    #[test]
    fn model_list_marks_cursor_and_current() {
        let list = ModelList {
            models: vec!["gpt-4o".to_string(), "o3".to_string()],
            cursor: 1,
            ..ModelList::default()
        };
        let palette = Palette::standard();
        let lines = model_list_lines(&list, "gpt-4o", &palette);
        let texts: Vec<String> = lines
            .iter()
            .map(|l| l.spans.iter().map(|s| s.content.as_ref()).collect())
            .collect();
        assert_eq!(texts, vec!["  gpt-4o (current)", "▸ o3"]);
    }

    #[test]
    fn long_model_list_shows_window_footer() {
        let list = ModelList {
            models: (0..15).map(|i| format!("m{i}")).collect(),
            cursor: 12,
            ..ModelList::default()
        };
        let lines = model_list_lines(&list, "", &Palette::standard());
        let footer: String = lines
            .last()
            .unwrap()
            .spans
            .iter()
            .map(|s| s.content.as_ref())
            .collect();
        assert_eq!(footer, "showing 4-13 of 15");
    }

    #[test]
    fn hint_line_renders_pairs() {
        let backend = TestBackend::new(40, 1);
        let mut terminal = Terminal::new(backend).unwrap();
        terminal
            .draw(|frame| {
                frame.render_widget(
                    Paragraph::new(hint_line(
                        &[("enter", "save"), ("esc", "back")],
                        &Palette::standard(),
                    )),
                    frame.area(),
                );
            })
            .unwrap();
        let buffer = terminal.backend().buffer();
        let row: String = (0..buffer.area.width)
            .map(|x| buffer[(x, 0)].symbol().to_string())
            .collect();
        assert!(row.starts_with("enter save  esc back"), "{row}");
    }
}
