use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use nerva_config::ContextConfig;
use nerva_core::{Engine, Event, Hub};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub text: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ContextFile {
    window: Vec<ContextEntry>,
}

/// Rolling context window: a capped deque of annotated text entries,
/// persisted to a JSON file after every mutation and rebuilt at startup.
///
/// The reference integration of the engine contract — it subscribes to the
/// bus and turns notable system events into window entries.
pub struct ContextEngine {
    window: Mutex<VecDeque<ContextEntry>>,
    path: PathBuf,
    max_window_size: usize,
}

impl ContextEngine {
    pub fn new(config: &ContextConfig, data_dir: impl AsRef<Path>) -> Arc<Self> {
        let path = data_dir.as_ref().join(&config.state_file);
        let max = config.max_window_size.max(1);

        let mut window = VecDeque::with_capacity(max);
        if let Ok(raw) = fs::read_to_string(&path) {
            match serde_json::from_str::<ContextFile>(&raw) {
                Ok(file) => {
                    for entry in file.window.into_iter() {
                        if window.len() == max {
                            window.pop_front();
                        }
                        window.push_back(entry);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), ?err, "corrupt context window; starting empty");
                }
            }
        }

        Arc::new(Self {
            window: Mutex::new(window),
            path,
            max_window_size: max,
        })
    }

    pub fn add_text(&self, text: impl Into<String>, source: impl Into<String>) {
        let entry = ContextEntry {
            text: text.into(),
            source: source.into(),
            timestamp: Utc::now(),
        };
        {
            let mut window = self.lock_window();
            if window.len() == self.max_window_size {
                window.pop_front();
            }
            window.push_back(entry);
        }
        self.persist();
    }

    /// Most recent entries, oldest first, at most `limit`.
    pub fn window(&self, limit: usize) -> Vec<ContextEntry> {
        let window = self.lock_window();
        let skip = window.len().saturating_sub(limit);
        window.iter().skip(skip).cloned().collect()
    }

    /// Case-insensitive substring search over the window, newest first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<ContextEntry> {
        let needle = query.to_lowercase();
        let window = self.lock_window();
        window
            .iter()
            .rev()
            .filter(|entry| entry.text.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock_window().clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.lock_window().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_window().is_empty()
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, VecDeque<ContextEntry>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) {
        let file = ContextFile {
            window: self.lock_window().iter().cloned().collect(),
        };
        let result = serde_json::to_string_pretty(&file)
            .map_err(std::io::Error::other)
            .and_then(|raw| {
                let tmp = self.path.with_extension("json.tmp");
                fs::write(&tmp, raw)?;
                fs::rename(&tmp, &self.path)
            });
        if let Err(err) = result {
            warn!(path = %self.path.display(), ?err, "context window write failed");
        }
    }
}

impl Engine for ContextEngine {
    fn name(&self) -> &'static str {
        "context"
    }

    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>) {
        hub.subscribe_engine(self);
    }

    fn handle_event(&self, event: &Event) {
        match event.event_type.as_str() {
            "chaos.file.created" => {
                if let Some(filename) = event.payload_str("filename") {
                    self.add_text(format!("CHAOS file created: {filename}"), "chaos_system");
                }
            }
            "chaos.file.updated" => {
                if let Some(filename) = event.payload_str("filename") {
                    self.add_text(format!("CHAOS file updated: {filename}"), "chaos_system");
                }
            }
            "filesystem.deleted" => {
                if let Some(path) = event.payload_str("path") {
                    self.add_text(format!("File deleted: {path}"), "filesystem_system");
                }
            }
            "agent.trust.changed" => {
                let agent = event.payload_str("agent_id").unwrap_or("unknown");
                let level = event.payload_str("level").unwrap_or("unknown");
                self.add_text(
                    format!("Agent trust changed: {agent} -> {level}"),
                    "governance_system",
                );
            }
            "media.registered" => {
                if let Some(path) = event.payload_str("file_path") {
                    self.add_text(format!("Media registered: {path}"), "media_system");
                }
            }
            "agent.intent.proposed" => {
                // Agents may propose context notes through the gateway.
                if event.payload_str("intent") == Some("add_context_note") {
                    if let Some(text) = event.payload_str("text") {
                        let source = event.payload_str("source").unwrap_or("agent").to_string();
                        self.add_text(text.to_string(), source);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerva_core::payload;
    use serde_json::json;

    fn engine_with_max(dir: &tempfile::TempDir, max: usize) -> Arc<ContextEngine> {
        let config = ContextConfig {
            state_file: "context-window.json".to_string(),
            max_window_size: max,
        };
        ContextEngine::new(&config, dir.path())
    }

    #[test]
    fn window_drops_oldest_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine_with_max(&dir, 3);

        for i in 0..5 {
            ctx.add_text(format!("entry {i}"), "test");
        }

        let window = ctx.window(10);
        let texts: Vec<&str> = window.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn search_is_case_insensitive_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine_with_max(&dir, 10);
        ctx.add_text("Alpha note", "test");
        ctx.add_text("beta note", "test");
        ctx.add_text("ALPHA again", "test");

        let hits = ctx.search("alpha", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "ALPHA again");
    }

    #[test]
    fn window_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctx = engine_with_max(&dir, 10);
            ctx.add_text("persisted", "test");
        }
        let ctx = engine_with_max(&dir, 10);
        assert_eq!(ctx.window(10)[0].text, "persisted");
    }

    #[test]
    fn reacts_to_chaos_and_intent_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine_with_max(&dir, 10);
        let hub = Hub::new();
        let engines: Vec<Arc<dyn Engine>> = vec![ctx.clone()];
        hub.boot(&engines);

        hub.emit(
            "chaos.file.created",
            payload(json!({"filename": "dream.chaos"})),
        );
        hub.emit(
            "agent.intent.proposed",
            payload(json!({
                "intent": "add_context_note",
                "text": "observed a pattern",
                "source": "toy-001",
            })),
        );
        // Unrelated events leave the window alone.
        hub.emit("system.started", payload(json!({"component": "hub"})));

        let window = ctx.window(10);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].text, "CHAOS file created: dream.chaos");
        assert_eq!(window[1].text, "observed a pattern");
        assert_eq!(window[1].source, "toy-001");
    }
}
