//! Settings modal: API key, model selection, and iteration cap.
//!
//! The modal only edits its own state and reports what the user asked for
//! as a [`SettingsAction`]; [`crate::App`] applies and persists it.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::composer::Composer;

/// Rows shown at once in the model list.
pub const MODEL_LIST_VISIBLE: usize = 10;
const API_KEY_MAX_LEN: usize = 256;
const MAX_ITER_DIGITS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsAction {
    None,
    Close,
    /// Entered the model list; fetch models from the provider.
    LoadModels,
    SaveApiKey(String),
    SelectModel(String),
    SaveMaxIterations(usize),
}

#[derive(Debug)]
pub enum SettingsView {
    Menu,
    ApiKey(Composer),
    Models(ModelList),
    MaxIterations(Composer),
}

#[derive(Debug, Default)]
pub struct ModelList {
    pub loading: bool,
    pub models: Vec<String>,
    pub cursor: usize,
    pub error: Option<String>,
}

impl ModelList {
    /// Half-open range of rows to display, keeping the cursor visible.
    #[must_use]
    pub fn visible_range(&self) -> (usize, usize) {
        let shown = MODEL_LIST_VISIBLE.min(self.models.len());
        let start = (self.cursor + 1).saturating_sub(shown);
        (start, start + shown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug)]
pub struct Settings {
    view: SettingsView,
    feedback: Option<Feedback>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: SettingsView::Menu,
            feedback: None,
        }
    }

    #[must_use]
    pub fn view(&self) -> &SettingsView {
        &self.view
    }

    #[must_use]
    pub fn feedback(&self) -> Option<&Feedback> {
        self.feedback.as_ref()
    }

    pub fn set_feedback(&mut self, text: impl Into<String>, is_error: bool) {
        self.feedback = Some(Feedback {
            text: text.into(),
            is_error,
        });
    }

    pub fn back_to_menu(&mut self) {
        self.view = SettingsView::Menu;
    }

    /// Deliver the result of a model fetch. Ignored if the user already left
    /// the model list.
    pub fn models_loaded(&mut self, result: Result<Vec<String>, String>) {
        let SettingsView::Models(list) = &mut self.view else {
            return;
        };
        list.loading = false;
        list.cursor = 0;
        match result {
            Ok(models) => list.models = models,
            Err(err) => list.error = Some(err),
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> SettingsAction {
        match &mut self.view {
            SettingsView::Menu => self.handle_menu(key),
            SettingsView::ApiKey(input) => match key.code {
                KeyCode::Esc => {
                    self.view = SettingsView::Menu;
                    SettingsAction::None
                }
                KeyCode::Enter => {
                    let value = input.text().trim().to_string();
                    if value.is_empty() {
                        self.set_feedback("API key cannot be empty", true);
                        return SettingsAction::None;
                    }
                    SettingsAction::SaveApiKey(value)
                }
                _ => {
                    edit_field(input, key, |c| !c.is_control(), API_KEY_MAX_LEN);
                    SettingsAction::None
                }
            },
            SettingsView::Models(list) => {
                if list.loading || list.error.is_some() {
                    if key.code == KeyCode::Esc {
                        self.view = SettingsView::Menu;
                    }
                    return SettingsAction::None;
                }
                match key.code {
                    KeyCode::Esc => {
                        self.view = SettingsView::Menu;
                        SettingsAction::None
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        list.cursor = list.cursor.saturating_sub(1);
                        SettingsAction::None
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        if list.cursor + 1 < list.models.len() {
                            list.cursor += 1;
                        }
                        SettingsAction::None
                    }
                    KeyCode::Enter => list
                        .models
                        .get(list.cursor)
                        .map_or(SettingsAction::None, |m| {
                            SettingsAction::SelectModel(m.clone())
                        }),
                    _ => SettingsAction::None,
                }
            }
            SettingsView::MaxIterations(input) => match key.code {
                KeyCode::Esc => {
                    self.view = SettingsView::Menu;
                    SettingsAction::None
                }
                KeyCode::Enter => {
                    let value = input.text().trim();
                    if value.is_empty() {
                        self.set_feedback("Value cannot be empty", true);
                        return SettingsAction::None;
                    }
                    match value.parse::<usize>() {
                        Ok(n) if n >= 1 => SettingsAction::SaveMaxIterations(n),
                        _ => {
                            self.set_feedback("Enter a positive integer", true);
                            SettingsAction::None
                        }
                    }
                }
                _ => {
                    edit_field(input, key, |c| c.is_ascii_digit(), MAX_ITER_DIGITS);
                    SettingsAction::None
                }
            },
        }
    }

    fn handle_menu(&mut self, key: KeyEvent) -> SettingsAction {
        if key.code == KeyCode::Esc
            || (key.code == KeyCode::Char('k') && key.modifiers.contains(KeyModifiers::CONTROL))
        {
            return SettingsAction::Close;
        }
        let KeyCode::Char(c) = key.code else {
            return SettingsAction::None;
        };
        match c.to_ascii_lowercase() {
            '1' | 'a' => {
                self.feedback = None;
                self.view = SettingsView::ApiKey(Composer::default());
                SettingsAction::None
            }
            '2' | 'm' => {
                self.feedback = None;
                self.view = SettingsView::Models(ModelList {
                    loading: true,
                    ..ModelList::default()
                });
                SettingsAction::LoadModels
            }
            '3' | 'i' => {
                self.feedback = None;
                self.view = SettingsView::MaxIterations(Composer::default());
                SettingsAction::None
            }
            _ => SettingsAction::None,
        }
    }
}

/// Single-line text field editing shared by the key and iteration inputs.
fn edit_field(input: &mut Composer, key: KeyEvent, accept: impl Fn(char) -> bool, max_len: usize) {
    match key.code {
        KeyCode::Char(c)
            if !key.modifiers.contains(KeyModifiers::CONTROL)
                && accept(c)
                && input.text().len() < max_len =>
        {
            input.insert_char(c);
        }
        KeyCode::Backspace => input.backspace(),
        KeyCode::Delete => input.delete(),
        KeyCode::Left => input.move_left(),
        KeyCode::Right => input.move_right(),
        KeyCode::Home => input.move_home(),
        KeyCode::End => input.move_end(),
        _ => {}
    }
}

/// `sk-...abcd` style display of a stored key.
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.is_empty() {
        return "(not set)".to_string();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
