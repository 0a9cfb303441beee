//! Kiln CLI - Binary entry point and terminal session management.
//!
//! # Architecture
//!
//! The CLI wires configuration, storage, tools and the provider into a
//! [`kiln_engine::Agent`], then hands it to [`kiln_tui::App`] and drives the
//! render loop inside an RAII terminal session.
//!
//! ```text
//! main() -> KilnConfig::load() -> build_app() -> TerminalSession::new() -> run_app()
//! ```
//!
//! # Event Loop
//!
//! A fixed 8ms (~120 FPS) render cadence:
//!
//! 1. Wait for frame tick
//! 2. Drain input queue (non-blocking via [`kiln_tui::InputPump`])
//! 3. Advance application state (`app.tick()`)
//! 4. Render frame

use std::fs::{self, File, OpenOptions};
use std::io::{Stdout, Write, stdout};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossterm::event::{DisableBracketedPaste, EnableBracketedPaste};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::{Backend, CrosstermBackend};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use kiln_config::{KilnConfig, SettingsFile};
use kiln_engine::{Agent, AgentConfig, Mode, PermissionGate};
use kiln_providers::OpenAIProvider;
use kiln_store::{SessionManager, Store};
use kiln_tools::{ToolRegistry, detect_shell, register_builtins};
use kiln_tui::{App, InputPump, draw, handle_events};

const FRAME_DURATION: Duration = Duration::from_millis(8);
const LOG_FILE_NAME: &str = "kiln.log";

fn init_tracing(config: &KilnConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // Without a log file, prefer no logs over corrupting the TUI by writing
    // to stdout/stderr.
    if let Ok((path, file)) = open_log_file(config.log_dir()) {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
        info!(path = %path.display(), "Logging initialized");
    }
}

fn open_log_file(dir: PathBuf) -> Result<(PathBuf, File)> {
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok((path, file))
}

fn build_app(config: &KilnConfig) -> Result<App> {
    if config.provider != "openai" {
        bail!("unsupported provider '{}'", config.provider);
    }

    let store = Store::open(config.db_path())
        .with_context(|| format!("Failed to open {}", config.db_path().display()))?;
    let sessions = SessionManager::new(store);

    let provider = Arc::new(
        OpenAIProvider::new(config.api_key.clone(), config.model.clone())
            .with_stream_idle_timeout(config.stream_idle_timeout()),
    );

    let mut registry = ToolRegistry::default();
    register_builtins(&mut registry, detect_shell(Some(&config.shell)))
        .context("Failed to register built-in tools")?;

    let (gate, permission_requests) = PermissionGate::new();
    let agent = Agent::new(
        provider,
        Arc::new(registry),
        Arc::new(gate),
        AgentConfig {
            max_iterations: config.max_iterations,
            max_tokens: config.max_tokens,
            mode: Mode::default(),
            work_dir: config.work_dir.clone(),
        },
    );

    let settings_file = match SettingsFile::user() {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(%err, "Settings changes will not be persisted");
            None
        }
    };

    App::new(
        agent,
        sessions,
        permission_requests,
        settings_file,
        config.api_key.clone(),
    )
}

/// RAII wrapper for terminal state with guaranteed cleanup on drop.
///
/// Manages raw mode, bracketed paste, the alternate screen and alternate
/// scroll mode (scroll wheel mapped to arrow keys without mouse capture).
/// On drop, all terminal state is restored, even after panics or early
/// returns.
struct TerminalSession {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalSession {
    fn new() -> Result<Self> {
        enable_raw_mode()?;

        let mut out = stdout();
        if let Err(err) = execute!(out, EnableBracketedPaste, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            let _ = execute!(out, LeaveAlternateScreen, DisableBracketedPaste);
            return Err(err.into());
        }
        // Enable alternate scroll mode: CSI ? 1007 h
        let _ = out.write_all(b"\x1b[?1007h");
        let _ = out.flush();

        match Terminal::new(CrosstermBackend::new(out)) {
            Ok(terminal) => Ok(Self { terminal }),
            Err(err) => {
                let mut out = stdout();
                let _ = disable_raw_mode();
                let _ = out.write_all(b"\x1b[?1007l");
                let _ = out.flush();
                let _ = execute!(out, LeaveAlternateScreen, DisableBracketedPaste);
                Err(err.into())
            }
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let backend = self.terminal.backend_mut();
        // Disable alternate scroll mode: CSI ? 1007 l
        let _ = backend.write_all(b"\x1b[?1007l");
        let _ = Write::flush(backend);
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableBracketedPaste
        );
        let _ = self.terminal.show_cursor();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = KilnConfig::load().context("Failed to load configuration")?;
    init_tracing(&config);
    info!(
        provider = %config.provider,
        model = %config.model,
        work_dir = %config.work_dir.display(),
        "Starting kiln"
    );

    let mut app = build_app(&config)?;

    let mut session = TerminalSession::new()?;
    run_app(&mut session.terminal, &mut app).await
}

async fn run_app<B>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()>
where
    B: Backend,
    B::Error: Send + Sync + 'static,
{
    let mut input = InputPump::new();
    let mut frames = interval(FRAME_DURATION);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result: Result<()> = loop {
        frames.tick().await;

        // Non-blocking input (drain queue only)
        match handle_events(app, &mut input) {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }

        app.tick();

        if let Err(e) = terminal.draw(|frame| draw(frame, app)) {
            break Err(e.into());
        }

        if app.should_quit() {
            break Ok(());
        }
    };

    input.shutdown().await;
    app.quit();
    result
}
