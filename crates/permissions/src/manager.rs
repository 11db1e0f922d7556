use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use nerva_config::PermissionsConfig;
use nerva_core::{Error, Result, payload};

use crate::store::{
    AuditEntry, PermissionGrant, PermissionRequest, PermissionState, Session, SessionLevel,
    SnapshotDoc,
};

/// Single authority for requests, grants, sessions, and the audit trail.
///
/// All reads and writes happen on the hub's dispatch thread; the state mutex
/// exists so the gateway's proposal path can consult sessions from its own
/// worker. Every mutating call writes exactly one audit entry and then
/// persists the whole snapshot; a failed write is logged and retried
/// naturally on the next mutation.
pub struct PermissionManager {
    state: Mutex<PermissionState>,
    /// Serializes snapshot writes so concurrent mutations never interleave
    /// partial documents.
    write_lock: Mutex<()>,
    path: PathBuf,
    exclusion_zones: Vec<String>,
    audit_cap: usize,
    allow_session_ttl: Duration,
    allow_action_session_ttl: Duration,
}

impl PermissionManager {
    pub fn new(config: &PermissionsConfig, data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join(&config.state_file);
        let doc = SnapshotDoc::load(&path);
        Self {
            state: Mutex::new(doc.permissions),
            write_lock: Mutex::new(()),
            path,
            exclusion_zones: config.exclusion_zones.clone(),
            audit_cap: config.audit_cap.max(1),
            allow_session_ttl: Duration::seconds(config.allow_session_ttl_secs as i64),
            allow_action_session_ttl: Duration::seconds(
                config.allow_action_session_ttl_secs as i64,
            ),
        }
    }

    // ── Requests and grants ─────────────────────────────────────────────────

    /// Create a pending request. Targets inside an exclusion zone are
    /// rejected synchronously and no request is created.
    pub fn request_permission(
        &self,
        action: &str,
        target: &str,
        requester: &str,
    ) -> Result<String> {
        if action.trim().is_empty() || target.trim().is_empty() {
            return Err(Error::Validation(
                "action and target must be non-empty".to_string(),
            ));
        }
        if self.is_excluded(target) {
            return Err(Error::ProtectedResource(target.to_string()));
        }

        let id = format!("req-{}", Uuid::new_v4().simple());
        let request = PermissionRequest {
            id: id.clone(),
            action: action.to_string(),
            target: target.to_string(),
            requester: requester.to_string(),
            created_at: Utc::now(),
        };

        let mut state = self.lock_state();
        state.requests.insert(id.clone(), request);
        self.audit_locked(
            &mut state,
            "request_created",
            payload(json!({
                "request_id": id,
                "action": action,
                "target": target,
                "requester": requester,
            })),
        );
        self.persist(&state);
        Ok(id)
    }

    /// Approve a pending request, consuming it. `duration_secs` bounds the
    /// grant's lifetime; `None` means no expiry. A second call for the same
    /// request id fails with `NotFound`.
    pub fn grant_permission(
        &self,
        request_id: &str,
        granter: &str,
        duration_secs: Option<u64>,
    ) -> Result<PermissionGrant> {
        let now = Utc::now();
        let mut state = self.lock_state();
        let request = state
            .requests
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;

        let grant = PermissionGrant {
            id: format!("perm-{}", Uuid::new_v4().simple()),
            action: request.action,
            target: request.target,
            requester: request.requester,
            granted_by: granter.to_string(),
            granted_at: now,
            expires_at: duration_secs.map(|secs| now + Duration::seconds(secs as i64)),
            allowed: true,
            revoked_at: None,
        };
        state.granted.insert(grant.id.clone(), grant.clone());
        self.audit_locked(
            &mut state,
            "permission_granted",
            payload(json!({
                "permission_id": grant.id,
                "request_id": request_id,
                "granted_by": granter,
            })),
        );
        self.persist(&state);
        Ok(grant)
    }

    /// Turn down a pending request, consuming it.
    pub fn decline_permission(&self, request_id: &str, decliner: &str) -> Result<()> {
        let mut state = self.lock_state();
        state
            .requests
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;
        self.audit_locked(
            &mut state,
            "request_declined",
            payload(json!({"request_id": request_id, "declined_by": decliner})),
        );
        self.persist(&state);
        Ok(())
    }

    /// Soft-revoke a grant: `allowed` flips to false and the record stays for
    /// audit continuity.
    pub fn revoke_permission(&self, grant_id: &str) -> Result<()> {
        let mut state = self.lock_state();
        let grant = state
            .granted
            .get_mut(grant_id)
            .ok_or_else(|| Error::NotFound(format!("grant {grant_id}")))?;
        grant.allowed = false;
        grant.revoked_at = Some(Utc::now());
        self.audit_locked(
            &mut state,
            "permission_revoked",
            payload(json!({"permission_id": grant_id})),
        );
        self.persist(&state);
        Ok(())
    }

    /// True iff the grant exists, is live, the action matches exactly, and
    /// `target` equals the grant's target or is path-nested under it.
    pub fn check_permission(&self, action: &str, target: &str, grant_id: &str) -> bool {
        self.check_permission_at(action, target, grant_id, Utc::now())
    }

    pub(crate) fn check_permission_at(
        &self,
        action: &str,
        target: &str,
        grant_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let state = self.lock_state();
        let Some(grant) = state.granted.get(grant_id) else {
            return false;
        };
        grant.is_live(now) && grant.action == action && target_covered(&grant.target, target)
    }

    /// Scan all live grants for one covering `action` on `target`. Returns
    /// the matching grant id, if any.
    pub fn check_permission_any(&self, action: &str, target: &str) -> Option<String> {
        let now = Utc::now();
        let state = self.lock_state();
        state
            .granted
            .values()
            .find(|grant| {
                grant.is_live(now) && grant.action == action && target_covered(&grant.target, target)
            })
            .map(|grant| grant.id.clone())
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.lock_state().requests.values().cloned().collect()
    }

    pub fn grant(&self, grant_id: &str) -> Option<PermissionGrant> {
        self.lock_state().granted.get(grant_id).cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.lock_state().sessions.get(session_id).cloned()
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Open a session at the given level. `allow_action_session` requires an
    /// action to match against. Default TTLs: `allow_session` and
    /// `allow_action_session` come from config; `always_allow_all` never
    /// expires; `decline` expires immediately.
    pub fn create_session(
        &self,
        level: SessionLevel,
        action: Option<&str>,
        ttl_secs: Option<u64>,
    ) -> Result<String> {
        if level == SessionLevel::AllowActionSession && action.is_none() {
            return Err(Error::Validation(
                "allow_action_session requires an action".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = match ttl_secs {
            Some(secs) => Some(now + Duration::seconds(secs as i64)),
            None => match level {
                SessionLevel::AlwaysAllowAll => None,
                SessionLevel::AllowSession => Some(now + self.allow_session_ttl),
                SessionLevel::AllowActionSession => Some(now + self.allow_action_session_ttl),
                SessionLevel::Decline => Some(now),
            },
        };

        let id = format!("sess-{}", Uuid::new_v4().simple());
        let session = Session {
            id: id.clone(),
            level,
            action: action.map(str::to_string),
            created_at: now,
            last_activity: now,
            expires_at,
        };

        let mut state = self.lock_state();
        state.sessions.insert(id.clone(), session);
        self.audit_locked(
            &mut state,
            "session_created",
            payload(json!({"session_id": id, "level": level})),
        );
        self.persist(&state);
        Ok(id)
    }

    /// Refresh a session's `last_activity` stamp.
    pub fn touch_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock_state();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        session.last_activity = Utc::now();
        self.audit_locked(
            &mut state,
            "session_touched",
            payload(json!({"session_id": session_id})),
        );
        self.persist(&state);
        Ok(())
    }

    /// Evaluate active sessions in fixed precedence order
    /// (`always_allow_all > allow_session > allow_action_session(+action) >
    /// decline`); the first matching live session wins. `None` means no
    /// session had an opinion.
    pub fn evaluate_sessions(&self, action: &str) -> Option<SessionLevel> {
        self.evaluate_sessions_at(action, Utc::now())
    }

    pub(crate) fn evaluate_sessions_at(
        &self,
        action: &str,
        now: DateTime<Utc>,
    ) -> Option<SessionLevel> {
        let state = self.lock_state();
        for level in SessionLevel::PRECEDENCE {
            let matched = state.sessions.values().any(|session| {
                session.level == level
                    && session.is_live(now)
                    && (level != SessionLevel::AllowActionSession
                        || session.action.as_deref() == Some(action))
            });
            if matched {
                return Some(level);
            }
        }
        None
    }

    // ── Exclusion zones and audit ───────────────────────────────────────────

    /// Case-insensitive path-prefix match against the configured exclusion
    /// zones. An empty target is treated as excluded.
    pub fn is_excluded(&self, target: &str) -> bool {
        if target.trim().is_empty() {
            return true;
        }
        let normalized = normalize(target);
        self.exclusion_zones
            .iter()
            .any(|zone| normalized.starts_with(&normalize(zone)))
    }

    /// Record an externally observed event in the audit trail.
    pub fn audit_event(&self, event: &str, details: Map<String, Value>) {
        let mut state = self.lock_state();
        self.audit_locked(&mut state, event, details);
        self.persist(&state);
    }

    /// Recent audit entries, most recent first.
    pub fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        let state = self.lock_state();
        state.audit.iter().rev().take(limit).cloned().collect()
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PermissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn audit_locked(&self, state: &mut PermissionState, event: &str, details: Map<String, Value>) {
        state.audit.push_back(AuditEntry {
            id: format!("audit-{}", Uuid::new_v4().simple()),
            event: event.to_string(),
            details,
            timestamp: Utc::now(),
        });
        while state.audit.len() > self.audit_cap {
            state.audit.pop_front();
        }
    }

    fn persist(&self, state: &PermissionState) {
        let _write = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut doc = SnapshotDoc::load(&self.path);
        doc.permissions = state.clone();
        if let Err(err) = doc.save(&self.path) {
            warn!(path = %self.path.display(), ?err, "permission snapshot write failed; will retry on next mutation");
        }
    }
}

/// `target` is covered when it equals the grant target or is nested under it
/// as a path descendant.
fn target_covered(grant_target: &str, target: &str) -> bool {
    if grant_target == target {
        return true;
    }
    Path::new(target).starts_with(Path::new(grant_target))
}

fn normalize(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}
