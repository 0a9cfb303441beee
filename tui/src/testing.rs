//! Shared fixtures for the crate's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use kiln_config::SettingsFile;
use kiln_engine::{Agent, AgentConfig, PermissionGate};
use kiln_providers::{Provider, ProviderError, ProviderFut, Request};
use kiln_store::{SessionManager, Store};
use kiln_tools::ToolRegistry;
use kiln_types::StreamEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::App;

/// Replays canned turns; each turn is a list of stream events.
pub(crate) struct FakeProvider {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    model: Mutex<String>,
    pub(crate) key: Mutex<String>,
}

impl FakeProvider {
    pub(crate) fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            model: Mutex::new("gpt-4o".to_string()),
            key: Mutex::new(String::new()),
        })
    }
}

impl Provider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn send_message(
        &self,
        _request: Request,
        _cancel: CancellationToken,
    ) -> ProviderFut<'_, mpsc::Receiver<StreamEvent>> {
        let events = self.turns.lock().unwrap().pop_front().unwrap_or_default();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.send(event).await.unwrap();
            }
            Ok(rx)
        })
    }

    fn list_models(&self) -> ProviderFut<'_, Vec<String>> {
        Box::pin(async { Ok::<_, ProviderError>(vec!["gpt-4o".to_string(), "o3".to_string()]) })
    }

    fn set_api_key(&self, api_key: String) {
        *self.key.lock().unwrap() = api_key;
    }

    fn set_model(&self, model: String) {
        *self.model.lock().unwrap() = model;
    }
}

pub(crate) fn app_with(provider: Arc<FakeProvider>, settings_file: Option<SettingsFile>) -> App {
    let (gate, requests) = PermissionGate::new();
    let agent = Agent::new(
        provider,
        Arc::new(ToolRegistry::default()),
        Arc::new(gate),
        AgentConfig::default(),
    );
    let sessions = SessionManager::new(Store::open_in_memory().unwrap());
    App::new(agent, sessions, requests, settings_file, String::new()).unwrap()
}
