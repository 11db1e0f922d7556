use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use nerva_core::{Engine, Error, Event, Hub, Result, payload};

/// Agent trust levels, least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Unknown,
    Untrusted,
    Limited,
    Trusted,
    Privileged,
    System,
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Limited => "limited",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Privileged => "privileged",
            TrustLevel::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub info: Map<String, Value>,
    pub level: TrustLevel,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// In-memory registry of known agents and their trust levels. Trust changes
/// are announced as `agent.trust.changed` so the permission and context
/// engines can react without being called directly.
pub struct TrustEngine {
    agents: Mutex<HashMap<String, AgentRecord>>,
    hub: OnceLock<Weak<Hub>>,
}

impl TrustEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            hub: OnceLock::new(),
        })
    }

    pub fn register_agent(&self, info: Map<String, Value>, level: TrustLevel) -> String {
        let id = info
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4().simple()));
        let record = AgentRecord {
            id: id.clone(),
            info,
            level,
            registered_at: Utc::now(),
            last_seen: None,
        };
        self.lock_agents().insert(id.clone(), record);
        id
    }

    pub fn set_trust_level(
        &self,
        agent_id: &str,
        level: TrustLevel,
        reason: Option<&str>,
    ) -> Result<()> {
        {
            let mut agents = self.lock_agents();
            let record = agents
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            record.level = level;
        }
        if let Some(hub) = self.hub.get().and_then(Weak::upgrade) {
            hub.emit(
                "agent.trust.changed",
                payload(json!({
                    "agent_id": agent_id,
                    "level": level.as_str(),
                    "reason": reason,
                })),
            );
        }
        Ok(())
    }

    pub fn trust_level(&self, agent_id: &str) -> Option<TrustLevel> {
        self.lock_agents().get(agent_id).map(|record| record.level)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.lock_agents().get(agent_id).cloned()
    }

    fn lock_agents(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for TrustEngine {
    fn name(&self) -> &'static str {
        "agent_trust"
    }

    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>) {
        let _ = self.hub.set(Arc::downgrade(hub));
        hub.subscribe_engine(self);
    }

    fn handle_event(&self, event: &Event) {
        // Proposals carry the submitting agent's identity; stamp activity for
        // agents we already know.
        if event.event_type == "agent.intent.proposed" {
            let agent_id = event
                .payload
                .get("_agent")
                .and_then(|agent| agent.get("id"))
                .and_then(Value::as_str);
            if let Some(id) = agent_id {
                if let Some(record) = self.lock_agents().get_mut(id) {
                    record.last_seen = Some(event.timestamp);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_levels_are_ordered() {
        assert!(TrustLevel::Unknown < TrustLevel::Limited);
        assert!(TrustLevel::Trusted < TrustLevel::System);
    }

    #[test]
    fn trust_change_emits_event_for_other_engines() {
        let hub = Hub::new();
        let trust = TrustEngine::new();
        let engines: Vec<Arc<dyn Engine>> = vec![trust.clone()];
        hub.boot(&engines);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.bus().subscribe(Arc::new(move |event: &Event| {
            sink.lock()
                .unwrap()
                .push((event.event_type.clone(), event.payload.clone()));
        }));

        let id = trust.register_agent(payload(json!({"id": "toy-001"})), TrustLevel::Unknown);
        trust
            .set_trust_level(&id, TrustLevel::Trusted, Some("manual review"))
            .unwrap();

        assert_eq!(trust.trust_level("toy-001"), Some(TrustLevel::Trusted));
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "agent.trust.changed");
        assert_eq!(events[0].1["level"], "trusted");
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let trust = TrustEngine::new();
        assert!(matches!(
            trust.set_trust_level("ghost", TrustLevel::Trusted, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn proposal_events_stamp_last_seen() {
        let hub = Hub::new();
        let trust = TrustEngine::new();
        let engines: Vec<Arc<dyn Engine>> = vec![trust.clone()];
        hub.boot(&engines);

        trust.register_agent(payload(json!({"id": "toy-001"})), TrustLevel::Limited);
        hub.emit(
            "agent.intent.proposed",
            payload(json!({
                "intent": "summarize_new_chaos_file",
                "_agent": {"id": "toy-001", "name": "ToyAgent"},
            })),
        );

        assert!(trust.agent("toy-001").unwrap().last_seen.is_some());
    }
}
