use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use nerva_config::NotesConfig;
use nerva_core::{Engine, Error, Event, Hub, Result, payload};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed note store. Each note lives in its own JSON file under the
/// configured directory, and every mutation is announced on the bus as a
/// `chaos.file.*` event so other engines (and connected agents) can react.
pub struct NotesEngine {
    dir: PathBuf,
    hub: OnceLock<Weak<Hub>>,
}

impl NotesEngine {
    pub fn new(config: &NotesConfig, data_dir: impl AsRef<Path>) -> Arc<Self> {
        let dir = data_dir.as_ref().join(&config.notes_dir);
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), ?err, "could not create notes directory");
        }
        Arc::new(Self {
            dir,
            hub: OnceLock::new(),
        })
    }

    pub fn create_note(&self, title: &str, content: &str, tags: Vec<String>) -> Result<Note> {
        if title.trim().is_empty() {
            return Err(Error::Validation("note title must not be empty".into()));
        }
        let now = Utc::now();
        let note = Note {
            id: format!("note-{}", Uuid::new_v4().simple()),
            title: title.to_string(),
            content: content.to_string(),
            tags,
            created_at: now,
            updated_at: now,
        };
        self.write_note(&note)?;
        self.emit(
            "chaos.file.created",
            json!({"filename": self.filename(&note.id), "note_id": note.id}),
        );
        Ok(note)
    }

    pub fn read_note(&self, id: &str) -> Result<Note> {
        let raw = fs::read_to_string(self.note_path(id))
            .map_err(|_| Error::NotFound(format!("note {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn update_note(&self, id: &str, content: &str) -> Result<Note> {
        let mut note = self.read_note(id)?;
        note.content = content.to_string();
        note.updated_at = Utc::now();
        self.write_note(&note)?;
        self.emit(
            "chaos.file.updated",
            json!({"filename": self.filename(id), "note_id": id}),
        );
        Ok(note)
    }

    pub fn delete_note(&self, id: &str) -> Result<()> {
        let path = self.note_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("note {id}")));
        }
        fs::remove_file(&path)?;
        self.emit(
            "filesystem.deleted",
            json!({"path": path.display().to_string(), "note_id": id}),
        );
        Ok(())
    }

    /// All notes in the store, newest first.
    pub fn list_notes(&self) -> Vec<Note> {
        let mut notes = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return notes,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<Note>(&raw)?))
            {
                Ok(note) => notes.push(note),
                Err(err) => {
                    warn!(path = %path.display(), ?err, "skipping unreadable note");
                }
            }
        }
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notes
    }

    fn filename(&self, id: &str) -> String {
        format!("{id}.json")
    }

    fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(self.filename(id))
    }

    fn write_note(&self, note: &Note) -> Result<()> {
        let raw = serde_json::to_string_pretty(note)?;
        let path = self.note_path(&note.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn emit(&self, event_type: &str, value: serde_json::Value) {
        if let Some(hub) = self.hub.get().and_then(Weak::upgrade) {
            hub.emit(event_type, payload(value));
        }
    }
}

impl Engine for NotesEngine {
    fn name(&self) -> &'static str {
        "notes"
    }

    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>) {
        let _ = self.hub.set(Arc::downgrade(hub));
        hub.subscribe_engine(self);
    }

    fn handle_event(&self, event: &Event) {
        // Agents can ask for a note through the gateway instead of touching
        // the store directly.
        if event.event_type == "agent.intent.proposed"
            && event.payload_str("intent") == Some("create_note")
        {
            let title = event.payload_str("title").unwrap_or("untitled");
            let content = event.payload_str("content").unwrap_or_default();
            if let Err(err) = self.create_note(title, content, vec!["agent".to_string()]) {
                warn!(?err, "agent note creation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn store(dir: &tempfile::TempDir) -> Arc<NotesEngine> {
        NotesEngine::new(&NotesConfig::default(), dir.path())
    }

    #[test]
    fn create_read_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let notes = store(&dir);

        let note = notes
            .create_note("morning", "first thought", vec!["daily".into()])
            .unwrap();
        assert_eq!(notes.read_note(&note.id).unwrap().content, "first thought");

        let updated = notes.update_note(&note.id, "second thought").unwrap();
        assert_eq!(updated.content, "second thought");
        assert!(updated.updated_at >= updated.created_at);

        notes.delete_note(&note.id).unwrap();
        assert!(matches!(notes.read_note(&note.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn empty_title_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let notes = store(&dir);
        assert!(matches!(
            notes.create_note("  ", "body", vec![]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn list_is_newest_first_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let notes = store(&dir);
        notes.create_note("one", "a", vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        notes.create_note("two", "b", vec![]).unwrap();
        fs::write(dir.path().join("chaos_files/broken.json"), "not json").unwrap();

        let all = notes.list_notes();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "two");
    }

    #[test]
    fn mutations_are_announced_on_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let notes = store(&dir);
        let hub = Hub::new();
        let engines: Vec<Arc<dyn Engine>> = vec![notes.clone()];
        hub.boot(&engines);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.bus().subscribe(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.event_type.clone());
        }));

        let note = notes.create_note("hello", "body", vec![]).unwrap();
        notes.update_note(&note.id, "body 2").unwrap();
        notes.delete_note(&note.id).unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["chaos.file.created", "chaos.file.updated", "filesystem.deleted"]
        );
    }

    #[test]
    fn agent_intent_creates_a_note() {
        let dir = tempfile::tempdir().unwrap();
        let notes = store(&dir);
        let hub = Hub::new();
        let engines: Vec<Arc<dyn Engine>> = vec![notes.clone()];
        hub.boot(&engines);

        hub.emit(
            "agent.intent.proposed",
            payload(json!({
                "intent": "create_note",
                "title": "from agent",
                "content": "proposed through the gateway",
            })),
        );

        let all = notes.list_notes();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "from agent");
        assert_eq!(all[0].tags, vec!["agent".to_string()]);
    }
}
