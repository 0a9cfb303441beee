//! Application state behind the TUI.
//!
//! [`App`] owns the agent, the session store, and everything on screen. The
//! frame loop calls [`App::tick`] to drain agent events and permission
//! requests, input handling calls the action methods, and [`crate::draw`]
//! reads the accessors.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use crossterm::event::KeyEvent;
use kiln_config::SettingsFile;
use kiln_engine::{Agent, AgentEvent, Mode, PermissionRequest, PermissionResponse};
use kiln_store::SessionManager;
use kiln_types::{Message, Role};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::composer::Composer;
use crate::settings::{Settings, SettingsAction};

/// Agent events applied per frame before yielding to rendering.
const MAX_AGENT_EVENTS_PER_TICK: usize = 256;
pub const SCROLL_PAGE: usize = 10;

/// One row group in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    User {
        text: String,
        at: DateTime<Local>,
    },
    Assistant {
        text: String,
        streaming: bool,
        at: DateTime<Local>,
    },
    System(String),
    ToolCall {
        id: String,
        name: String,
        input: String,
    },
    ToolResult {
        name: String,
        output: String,
        is_error: bool,
    },
}

/// Rebuild transcript entries from stored messages.
#[must_use]
pub fn entries_from_history(messages: &[Message]) -> Vec<Entry> {
    let mut entries = Vec::new();
    for message in messages {
        let at = message.created_at().with_timezone(&Local);
        match message.role() {
            Role::User => entries.push(Entry::User {
                text: message.content().to_string(),
                at,
            }),
            Role::Assistant => {
                if !message.content().is_empty() {
                    entries.push(Entry::Assistant {
                        text: message.content().to_string(),
                        streaming: false,
                        at,
                    });
                }
                entries.extend(message.tool_calls().iter().map(|call| Entry::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }));
            }
            Role::Tool => {
                entries.extend(message.tool_results().iter().map(|r| Entry::ToolResult {
                    name: r.tool_name.clone(),
                    output: r.output.clone(),
                    is_error: r.is_error,
                }));
            }
            Role::System => entries.push(Entry::System(message.content().to_string())),
        }
    }
    entries
}

struct ActiveRun {
    events: mpsc::Receiver<AgentEvent>,
    cancel: CancellationToken,
}

pub struct App {
    agent: Agent,
    sessions: SessionManager,
    permission_requests: mpsc::Receiver<PermissionRequest>,
    settings_file: Option<SettingsFile>,
    api_key: String,

    transcript: Vec<Entry>,
    streaming: Option<usize>,
    composer: Composer,
    /// Lines scrolled up from the bottom of the transcript.
    scroll: usize,
    token_total: u64,

    run: Option<ActiveRun>,
    permission: Option<PermissionRequest>,
    settings: Option<Settings>,
    models: Option<oneshot::Receiver<Result<Vec<String>, String>>>,

    tick: usize,
    should_quit: bool,
}

impl App {
    /// `settings_file` is where settings changes are persisted; `None` keeps
    /// them in memory only.
    pub fn new(
        agent: Agent,
        sessions: SessionManager,
        permission_requests: mpsc::Receiver<PermissionRequest>,
        settings_file: Option<SettingsFile>,
        api_key: String,
    ) -> Result<Self> {
        let history = sessions.messages().context("loading session history")?;
        let token_total = sessions.token_total().context("loading token usage")?;
        Ok(Self {
            agent,
            sessions,
            permission_requests,
            settings_file,
            api_key,
            transcript: entries_from_history(&history),
            streaming: None,
            composer: Composer::default(),
            scroll: 0,
            token_total,
            run: None,
            permission: None,
            settings: None,
            models: None,
            tick: 0,
            should_quit: false,
        })
    }

    // ---- accessors ----

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.agent.mode()
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.agent.provider().model()
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.agent.max_iterations()
    }

    #[must_use]
    pub fn token_total(&self) -> u64 {
        self.token_total
    }

    #[must_use]
    pub fn transcript(&self) -> &[Entry] {
        &self.transcript
    }

    #[must_use]
    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    #[must_use]
    pub fn scroll(&self) -> usize {
        self.scroll
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    #[must_use]
    pub fn permission_request(&self) -> Option<&PermissionRequest> {
        self.permission.as_ref()
    }

    #[must_use]
    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    #[must_use]
    pub fn tick_count(&self) -> usize {
        self.tick
    }

    #[must_use]
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    // ---- frame work ----

    /// Apply pending permission requests, agent events, and model-list
    /// results. Called once per frame.
    pub fn tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);

        while let Ok(request) = self.permission_requests.try_recv() {
            self.handle_agent_event(AgentEvent::PermissionRequest(request));
        }

        for _ in 0..MAX_AGENT_EVENTS_PER_TICK {
            let Some(run) = self.run.as_mut() else {
                break;
            };
            match run.events.try_recv() {
                Ok(event) => self.handle_agent_event(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    warn!("agent event stream closed without a final event");
                    self.run = None;
                    self.finish_stream("");
                    break;
                }
            }
        }

        if let Some(rx) = self.models.as_mut() {
            match rx.try_recv() {
                Ok(result) => {
                    self.models = None;
                    if let Some(settings) = self.settings.as_mut() {
                        settings.models_loaded(result);
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.models = None;
                    if let Some(settings) = self.settings.as_mut() {
                        settings.models_loaded(Err("model request aborted".to_string()));
                    }
                }
            }
        }
    }

    pub fn handle_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::StreamText(delta) => self.append_stream(&delta),
            AgentEvent::ToolCallStart { id, name } => {
                self.push(Entry::ToolCall {
                    id,
                    name,
                    input: String::new(),
                });
            }
            AgentEvent::ToolCallEnd { id, name, input } => {
                let existing = self.transcript.iter_mut().rev().find_map(|entry| match entry {
                    Entry::ToolCall {
                        id: entry_id,
                        input: slot,
                        ..
                    } if *entry_id == id => Some(slot),
                    _ => None,
                });
                match existing {
                    Some(slot) => *slot = input,
                    None => self.push(Entry::ToolCall { id, name, input }),
                }
            }
            AgentEvent::ToolResult(result) => self.push(Entry::ToolResult {
                name: result.tool_name,
                output: result.output,
                is_error: result.is_error,
            }),
            AgentEvent::PersistMessage(message) => {
                self.persist(&message);
                if message.role() == Role::Assistant {
                    self.finish_stream(message.content());
                }
            }
            AgentEvent::Done(message) => {
                self.persist(&message);
                self.finish_stream(message.content());
                self.run = None;
                debug!("agent run finished");
            }
            AgentEvent::Error(err) => {
                self.finish_stream("");
                self.run = None;
                self.push_system(format!("Error: {err}"));
            }
            AgentEvent::PermissionRequest(request) => {
                if self.permission.is_some() {
                    warn!(tool = %request.tool_name, "permission prompt already open, denying");
                    request.respond(PermissionResponse::Deny);
                    return;
                }
                self.permission = Some(request);
            }
        }
    }

    // ---- actions ----

    /// Send the composer contents as a new user turn.
    pub fn submit(&mut self) {
        if self.is_running() {
            return;
        }
        let prompt = self.composer.text().trim().to_string();
        if prompt.is_empty() {
            return;
        }
        self.composer.clear();
        if let Err(err) = self.start_run(prompt) {
            error!("failed to start agent run: {err:#}");
            self.push_system(format!("Error: {err:#}"));
        }
    }

    fn start_run(&mut self, prompt: String) -> Result<()> {
        let session = self.sessions.current().context("initializing session")?;
        let message = Message::user(session.id.clone(), prompt.clone());
        self.push(Entry::User {
            text: prompt,
            at: Local::now(),
        });
        self.sessions
            .add_message(&message)
            .context("persisting user message")?;
        let history = self.sessions.messages().context("loading history")?;

        let cancel = CancellationToken::new();
        let events = self.agent.run(history, session.id, cancel.clone());
        self.streaming = None;
        self.run = Some(ActiveRun { events, cancel });
        Ok(())
    }

    /// Stop the active run, if any.
    pub fn cancel_run(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.cancel.cancel();
        // Dropping the request resolves the gate's wait as a denial.
        self.permission = None;
        self.finish_stream("");
        self.push_system("Agent cancelled.");
    }

    pub fn quit(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
        }
        self.permission = None;
        self.should_quit = true;
    }

    /// Switch between plan and build. Ignored while a run is active.
    pub fn toggle_mode(&mut self) {
        if self.is_running() {
            return;
        }
        let mode = self.agent.mode().toggled();
        self.agent.set_mode(mode);
        self.push_system(match mode {
            Mode::Build => "Switched to BUILD mode. The assistant can now create and modify files.",
            Mode::Plan => "Switched to PLAN mode. The assistant will only analyze, not modify files.",
        });
    }

    pub fn respond_permission(&mut self, response: PermissionResponse) {
        if let Some(request) = self.permission.take() {
            debug!(tool = %request.tool_name, ?response, "permission answered");
            request.respond(response);
        }
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll = self.scroll.saturating_add(lines);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll = self.scroll.saturating_sub(lines);
    }

    /// Keep the scroll offset within the rendered transcript height.
    pub fn clamp_scroll(&mut self, max: usize) {
        self.scroll = self.scroll.min(max);
    }

    pub fn open_settings(&mut self) {
        if self.settings.is_none() {
            self.settings = Some(Settings::new());
        }
    }

    pub fn handle_settings_key(&mut self, key: KeyEvent) {
        let Some(settings) = self.settings.as_mut() else {
            return;
        };
        let action = settings.handle_key(key);
        self.apply_settings_action(action);
    }

    fn apply_settings_action(&mut self, action: SettingsAction) {
        match action {
            SettingsAction::None => {}
            SettingsAction::Close => {
                self.settings = None;
                self.models = None;
            }
            SettingsAction::LoadModels => {
                let provider = Arc::clone(self.agent.provider());
                let (tx, rx) = oneshot::channel();
                tokio::spawn(async move {
                    let result = provider.list_models().await.map_err(|e| e.to_string());
                    let _ = tx.send(result);
                });
                self.models = Some(rx);
            }
            SettingsAction::SaveApiKey(key) => {
                self.agent.provider().set_api_key(key.clone());
                let persisted = self.persist_setting(|file| file.set_api_key(&key));
                self.api_key = key;
                self.settings_saved("API key saved", persisted);
            }
            SettingsAction::SelectModel(model) => {
                self.agent.provider().set_model(model.clone());
                let persisted = self.persist_setting(|file| file.set_model(&model));
                self.settings_saved(&format!("Model set to {model}"), persisted);
            }
            SettingsAction::SaveMaxIterations(n) => {
                self.agent.set_max_iterations(n);
                let persisted = self.persist_setting(|file| file.set_max_iterations(n));
                self.settings_saved(&format!("Max iterations set to {n}"), persisted);
            }
        }
    }

    fn persist_setting(
        &self,
        write: impl FnOnce(&SettingsFile) -> Result<(), kiln_config::ConfigError>,
    ) -> Result<(), String> {
        match &self.settings_file {
            Some(file) => write(file).map_err(|err| {
                warn!(%err, "failed to persist setting");
                err.to_string()
            }),
            None => Ok(()),
        }
    }

    fn settings_saved(&mut self, message: &str, persisted: Result<(), String>) {
        let Some(settings) = self.settings.as_mut() else {
            return;
        };
        settings.back_to_menu();
        match persisted {
            Ok(()) => settings.set_feedback(message, false),
            Err(err) => settings.set_feedback(format!("{message} (not saved: {err})"), true),
        }
    }

    // ---- transcript helpers ----

    fn push(&mut self, entry: Entry) {
        self.transcript.push(entry);
        self.scroll = 0;
    }

    fn push_system(&mut self, text: impl Into<String>) {
        self.push(Entry::System(text.into()));
    }

    fn append_stream(&mut self, delta: &str) {
        if let Some(Entry::Assistant { text, .. }) =
            self.streaming.and_then(|i| self.transcript.get_mut(i))
        {
            text.push_str(delta);
            self.scroll = 0;
            return;
        }
        self.streaming = Some(self.transcript.len());
        self.push(Entry::Assistant {
            text: delta.to_string(),
            streaming: true,
            at: Local::now(),
        });
    }

    /// Close the streaming entry. Non-empty `content` replaces the streamed
    /// text; with no streaming entry it becomes a new one.
    fn finish_stream(&mut self, content: &str) {
        match self.streaming.take().and_then(|i| self.transcript.get_mut(i)) {
            Some(Entry::Assistant {
                text, streaming, ..
            }) => {
                if !content.is_empty() {
                    *text = content.to_string();
                }
                *streaming = false;
            }
            _ if !content.is_empty() => self.push(Entry::Assistant {
                text: content.to_string(),
                streaming: false,
                at: Local::now(),
            }),
            _ => {}
        }
    }

    fn persist(&mut self, message: &Message) {
        if let Err(err) = self.sessions.add_message(message) {
            error!("failed to persist message: {err:#}");
            self.push_system(format!("Error: {err:#}"));
        }
        match self.sessions.token_total() {
            Ok(total) => self.token_total = total,
            Err(err) => warn!("failed to read token usage: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use crossterm::event::KeyCode;
    use kiln_engine::{PermissionDecision, PermissionGate};
    use kiln_types::{SessionId, StreamEvent, TokenUsage, ToolCall, ToolResult};
    use tempfile::TempDir;
    use tokio::time::sleep;

    use super::*;
    use crate::settings::SettingsView;
    use crate::testing::{FakeProvider, app_with};

    async fn run_to_idle(app: &mut App) {
        for _ in 0..200 {
            app.tick();
            if !app.is_running() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("agent run did not finish");
    }

    fn type_prompt(app: &mut App, text: &str) {
        app.composer_mut().insert_str(text);
    }

    #[tokio::test]
    async fn submit_streams_and_persists_reply() {
        let provider = FakeProvider::new(vec![vec![
            StreamEvent::TextDelta("Hel".into()),
            StreamEvent::TextDelta("lo!".into()),
            StreamEvent::Done(TokenUsage::new(10, 5)),
        ]]);
        let mut app = app_with(provider, None);

        type_prompt(&mut app, "  hi there  ");
        app.submit();
        assert!(app.is_running());
        assert!(app.composer().is_empty());
        run_to_idle(&mut app).await;

        let transcript = app.transcript();
        assert!(matches!(&transcript[0], Entry::User { text, .. } if text == "hi there"));
        assert!(matches!(
            &transcript[1],
            Entry::Assistant { text, streaming: false, .. } if text == "Hello!"
        ));
        assert_eq!(app.sessions.message_count().unwrap(), 2);
        assert_eq!(app.token_total(), 15);
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let mut app = app_with(FakeProvider::new(Vec::new()), None);
        type_prompt(&mut app, "   ");
        app.submit();
        assert!(!app.is_running());
        assert!(app.transcript().is_empty());
        assert!(app.sessions.current_id().is_none());
    }

    #[tokio::test]
    async fn stream_error_is_reported() {
        let provider = FakeProvider::new(vec![vec![StreamEvent::Error("boom".into())]]);
        let mut app = app_with(provider, None);
        type_prompt(&mut app, "go");
        app.submit();
        run_to_idle(&mut app).await;

        assert_eq!(
            app.transcript().last(),
            Some(&Entry::System("Error: boom".to_string()))
        );
    }

    #[tokio::test]
    async fn cancel_marks_transcript() {
        let mut app = app_with(FakeProvider::new(Vec::new()), None);
        type_prompt(&mut app, "go");
        app.submit();
        app.cancel_run();
        assert!(!app.is_running());
        assert_eq!(
            app.transcript().last(),
            Some(&Entry::System("Agent cancelled.".to_string()))
        );
        // A second cancel with no run is a no-op.
        app.cancel_run();
        assert_eq!(app.transcript().len(), 2);
    }

    #[tokio::test]
    async fn toggle_mode_announces_and_is_blocked_while_running() {
        let mut app = app_with(FakeProvider::new(Vec::new()), None);
        assert_eq!(app.mode(), Mode::Plan);
        app.toggle_mode();
        assert_eq!(app.mode(), Mode::Build);
        assert_eq!(
            app.transcript().last(),
            Some(&Entry::System(
                "Switched to BUILD mode. The assistant can now create and modify files.".into()
            ))
        );

        type_prompt(&mut app, "go");
        app.submit();
        app.toggle_mode();
        assert_eq!(app.mode(), Mode::Build);
    }

    #[tokio::test]
    async fn tool_call_entries_track_final_input() {
        let mut app = app_with(FakeProvider::new(Vec::new()), None);
        app.handle_agent_event(AgentEvent::ToolCallStart {
            id: "c1".into(),
            name: "ls".into(),
        });
        app.handle_agent_event(AgentEvent::ToolCallEnd {
            id: "c1".into(),
            name: "ls".into(),
            input: "{\"path\":\".\"}".into(),
        });
        app.handle_agent_event(AgentEvent::ToolResult(ToolResult::success("c1", "ls", "a\nb")));

        assert_eq!(
            app.transcript(),
            &[
                Entry::ToolCall {
                    id: "c1".into(),
                    name: "ls".into(),
                    input: "{\"path\":\".\"}".into(),
                },
                Entry::ToolResult {
                    name: "ls".into(),
                    output: "a\nb".into(),
                    is_error: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn permission_request_is_answered_once() {
        let (gate, mut requests) = PermissionGate::new();
        let gate = Arc::new(gate);
        let mut app = app_with(FakeProvider::new(Vec::new()), None);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.check("bash", "{}", &CancellationToken::new()).await
            })
        };
        // This gate is not the app's own, so hand the request over directly.
        let request = requests.recv().await.unwrap();
        app.handle_agent_event(AgentEvent::PermissionRequest(request));
        assert_eq!(app.permission_request().map(|r| r.tool_name.as_str()), Some("bash"));

        app.respond_permission(PermissionResponse::AllowForSession);
        assert!(app.permission_request().is_none());
        assert_eq!(waiter.await.unwrap(), PermissionDecision::Allow);
        assert!(gate.is_allowed("bash"));
    }

    #[tokio::test]
    async fn settings_apply_to_provider_and_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let provider = FakeProvider::new(Vec::new());
        let mut app = app_with(Arc::clone(&provider), Some(SettingsFile::new(&path)));

        app.open_settings();
        app.apply_settings_action(SettingsAction::SaveApiKey("sk-abcdefghijkl".into()));
        app.apply_settings_action(SettingsAction::SelectModel("o3".into()));
        app.apply_settings_action(SettingsAction::SaveMaxIterations(7));

        assert_eq!(*provider.key.lock().unwrap(), "sk-abcdefghijkl");
        assert_eq!(app.model(), "o3");
        assert_eq!(app.max_iterations(), 7);
        assert_eq!(app.api_key(), "sk-abcdefghijkl");

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("model = \"o3\""), "{written}");
        assert!(written.contains("max_iterations = 7"), "{written}");
        assert_eq!(
            app.settings().and_then(|s| s.feedback()).map(|f| f.text.clone()),
            Some("Max iterations set to 7".to_string())
        );

        app.apply_settings_action(SettingsAction::Close);
        assert!(app.settings().is_none());
    }

    #[tokio::test]
    async fn model_list_arrives_through_tick() {
        let mut app = app_with(FakeProvider::new(Vec::new()), None);
        app.open_settings();
        app.handle_settings_key(KeyEvent::from(KeyCode::Char('2')));
        for _ in 0..100 {
            app.tick();
            if app.models.is_none() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let Some(SettingsView::Models(list)) = app.settings().map(Settings::view)
        else {
            panic!("model list not open");
        };
        assert!(!list.loading);
        assert_eq!(list.models, vec!["gpt-4o".to_string(), "o3".to_string()]);
    }

    #[test]
    fn history_rebuilds_tool_entries() {
        let session = SessionId::generate();
        let messages = vec![
            Message::user(session.clone(), "list files"),
            Message::assistant(
                session.clone(),
                "",
                vec![ToolCall::new("c1", "ls", "{}")],
            ),
            Message::tool_turn(
                session.clone(),
                vec![ToolResult::error("c1", "ls", "nope")],
            ),
            Message::assistant(session, "done", Vec::new()),
        ];
        let entries = entries_from_history(&messages);
        assert_eq!(entries.len(), 4);
        assert!(matches!(&entries[1], Entry::ToolCall { name, .. } if name == "ls"));
        assert!(matches!(&entries[2], Entry::ToolResult { is_error: true, .. }));
        assert!(matches!(&entries[3], Entry::Assistant { text, .. } if text == "done"));
    }
}
