use std::sync::{Arc, OnceLock, Weak};

use serde_json::json;

use nerva_core::{Engine, Event, Hub, Result, payload};

use crate::manager::PermissionManager;
use crate::store::PermissionGrant;

/// Bus-facing wrapper around the [`PermissionManager`].
///
/// Observes trust, filesystem, and note events to keep the audit trail
/// complete, and announces grant/revoke outcomes back onto the bus as
/// `permissions.granted` / `permissions.revoked`.
pub struct PermissionsEngine {
    manager: Arc<PermissionManager>,
    hub: OnceLock<Weak<Hub>>,
}

impl PermissionsEngine {
    pub fn new(manager: Arc<PermissionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            hub: OnceLock::new(),
        })
    }

    pub fn manager(&self) -> &Arc<PermissionManager> {
        &self.manager
    }

    /// Grant a pending request and announce it on the bus.
    pub fn grant(
        &self,
        request_id: &str,
        granter: &str,
        duration_secs: Option<u64>,
    ) -> Result<PermissionGrant> {
        let grant = self
            .manager
            .grant_permission(request_id, granter, duration_secs)?;
        self.emit(
            "permissions.granted",
            json!({
                "permission_id": grant.id,
                "action": grant.action,
                "target": grant.target,
            }),
        );
        Ok(grant)
    }

    /// Revoke a grant and announce it on the bus.
    pub fn revoke(&self, grant_id: &str) -> Result<()> {
        self.manager.revoke_permission(grant_id)?;
        self.emit("permissions.revoked", json!({"permission_id": grant_id}));
        Ok(())
    }

    fn emit(&self, event_type: &str, value: serde_json::Value) {
        if let Some(hub) = self.hub.get().and_then(Weak::upgrade) {
            hub.emit(event_type, payload(value));
        }
    }
}

impl Engine for PermissionsEngine {
    fn name(&self) -> &'static str {
        "permissions"
    }

    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>) {
        let _ = self.hub.set(Arc::downgrade(hub));
        hub.subscribe_engine(self);
    }

    fn handle_event(&self, event: &Event) {
        match event.event_type.as_str() {
            "agent.trust.changed" => {
                self.manager.audit_event(
                    "trust_change_reacted",
                    payload(json!({
                        "agent": event.payload_str("agent_id"),
                        "level": event.payload_str("level"),
                    })),
                );
            }
            "filesystem.deleted" => {
                self.manager.audit_event(
                    "file_deletion_noted",
                    payload(json!({"path": event.payload_str("path")})),
                );
            }
            "chaos.file.created" => {
                self.manager.audit_event(
                    "chaos_creation_noted",
                    payload(json!({"filename": event.payload_str("filename")})),
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerva_config::PermissionsConfig;
    use std::sync::Mutex;

    fn booted_engine(dir: &tempfile::TempDir) -> (Arc<Hub>, Arc<PermissionsEngine>) {
        let manager = Arc::new(PermissionManager::new(
            &PermissionsConfig::default(),
            dir.path(),
        ));
        let engine = PermissionsEngine::new(manager);
        let hub = Hub::new();
        let engines: Vec<Arc<dyn Engine>> = vec![engine.clone()];
        hub.boot(&engines);
        (hub, engine)
    }

    #[test]
    fn granting_emits_permissions_granted() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, engine) = booted_engine(&dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.bus().subscribe(Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.event_type.clone());
        }));

        let req = engine
            .manager()
            .request_permission("read_file", "/data/x.txt", "agentA")
            .unwrap();
        let grant = engine.grant(&req, "user", Some(60)).unwrap();
        engine.revoke(&grant.id).unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events, vec!["permissions.granted", "permissions.revoked"]);
    }

    #[test]
    fn reacts_to_trust_and_chaos_events_with_audit_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, engine) = booted_engine(&dir);

        hub.emit(
            "agent.trust.changed",
            payload(json!({"agent_id": "toy-001", "level": "trusted"})),
        );
        hub.emit(
            "chaos.file.created",
            payload(json!({"filename": "dream-01.chaos"})),
        );

        let events: Vec<String> = engine
            .manager()
            .audit_log(10)
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert!(events.contains(&"trust_change_reacted".to_string()));
        assert!(events.contains(&"chaos_creation_noted".to_string()));
    }
}
