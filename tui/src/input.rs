//! Terminal input: a blocking reader task feeding a bounded queue, drained
//! once per frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use kiln_engine::PermissionResponse;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::timeout;

use crate::app::{App, SCROLL_PAGE};

const INPUT_POLL_TIMEOUT: Duration = Duration::from_millis(25); // shutdown responsiveness
const INPUT_CHANNEL_CAPACITY: usize = 1024; // bounded: no OOM
const MAX_EVENTS_PER_FRAME: usize = 64; // never starve rendering
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

enum InputMsg {
    Event(Event),
    Error(String),
}

/// Owns the reader task. Events are queued with backpressure so large
/// pastes arrive intact.
pub struct InputPump {
    rx: mpsc::Receiver<InputMsg>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl InputPump {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_reader = Arc::clone(&stop);
        let join = spawn_blocking(move || input_loop(&stop_reader, &tx));
        Self {
            rx,
            stop,
            join: Some(join),
        }
    }

    pub async fn shutdown(&mut self) {
        // Closing first unblocks a reader stuck on a full queue.
        self.rx.close();
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = timeout(SHUTDOWN_TIMEOUT, join).await;
        }
    }
}

impl Default for InputPump {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InputPump {
    fn drop(&mut self) {
        self.rx.close();
        self.stop.store(true, Ordering::Release);
    }
}

fn input_loop(stop: &AtomicBool, tx: &mpsc::Sender<InputMsg>) {
    while !stop.load(Ordering::Acquire) {
        match event::poll(INPUT_POLL_TIMEOUT) {
            Ok(true) => match event::read() {
                Ok(ev) => {
                    if tx.blocking_send(InputMsg::Event(ev)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(InputMsg::Error(e.to_string()));
                    break;
                }
            },
            Ok(false) => {}
            Err(e) => {
                let _ = tx.blocking_send(InputMsg::Error(e.to_string()));
                break;
            }
        }
    }
}

/// Apply queued input to `app`. Returns `true` when the app should quit.
pub fn handle_events(app: &mut App, input: &mut InputPump) -> Result<bool> {
    for _ in 0..MAX_EVENTS_PER_FRAME {
        let ev = match input.rx.try_recv() {
            Ok(InputMsg::Event(ev)) => ev,
            Ok(InputMsg::Error(msg)) => return Err(anyhow!("input error: {msg}")),
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(anyhow!("input pump disconnected"));
            }
        };
        apply_event(app, ev);
        if app.should_quit() {
            return Ok(true);
        }
    }
    Ok(app.should_quit())
}

/// Route one terminal event. Modals take keys before the main bindings;
/// Ctrl+C always quits.
pub fn apply_event(app: &mut App, event: Event) {
    match event {
        Event::Key(key) => {
            if key.kind == KeyEventKind::Release {
                return;
            }
            if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                app.quit();
                return;
            }
            if app.permission_request().is_some() {
                handle_permission_key(app, key);
            } else if app.settings().is_some() {
                app.handle_settings_key(key);
            } else {
                handle_main_key(app, key);
            }
        }
        Event::Paste(text) => {
            if app.permission_request().is_none() && app.settings().is_none() {
                let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
                app.composer_mut().insert_str(&normalized);
            }
        }
        _ => {}
    }
}

fn handle_permission_key(app: &mut App, key: KeyEvent) {
    let response = match key.code {
        KeyCode::Char('y' | 'Y') => PermissionResponse::Allow,
        KeyCode::Char('n' | 'N') => PermissionResponse::Deny,
        KeyCode::Char('a' | 'A') => PermissionResponse::AllowForSession,
        _ => return,
    };
    app.respond_permission(response);
}

fn handle_main_key(app: &mut App, key: KeyEvent) {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    let shift = key.modifiers.contains(KeyModifiers::SHIFT);

    match key.code {
        KeyCode::Esc => app.cancel_run(),
        KeyCode::Char('t') if ctrl => app.toggle_mode(),
        KeyCode::Char('k') if ctrl => app.open_settings(),
        KeyCode::Char('s') if ctrl => app.submit(),
        KeyCode::Enter if alt || shift => app.composer_mut().insert_char('\n'),
        KeyCode::Enter => app.submit(),
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::PageUp => app.scroll_up(SCROLL_PAGE),
        KeyCode::PageDown => app.scroll_down(SCROLL_PAGE),
        KeyCode::Backspace => app.composer_mut().backspace(),
        KeyCode::Delete => app.composer_mut().delete(),
        KeyCode::Left => app.composer_mut().move_left(),
        KeyCode::Right => app.composer_mut().move_right(),
        KeyCode::Home => app.composer_mut().move_home(),
        KeyCode::End => app.composer_mut().move_end(),
        KeyCode::Char(c) if !ctrl => app.composer_mut().insert_char(c),
        _ => {}
    }
}
