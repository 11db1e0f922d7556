use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use nerva_core::Result;

/// A pending approval. Consumed exactly once — by being granted or declined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub action: String,
    pub target: String,
    pub requester: String,
    pub created_at: DateTime<Utc>,
}

/// A time-bounded, revocable approval. Never hard-deleted once issued;
/// revocation flips `allowed` and stamps `revoked_at` so the audit trail
/// stays continuous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: String,
    pub action: String,
    pub target: String,
    pub requester: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl PermissionGrant {
    /// A grant is live while `allowed` and not past expiry; an expiry equal
    /// to `now` counts as expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.allowed && self.expires_at.is_none_or(|expires| expires > now)
    }
}

/// Session permission levels, in evaluation precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLevel {
    AlwaysAllowAll,
    AllowSession,
    AllowActionSession,
    Decline,
}

impl SessionLevel {
    /// Fixed precedence used when evaluating active sessions.
    pub const PRECEDENCE: [SessionLevel; 4] = [
        SessionLevel::AlwaysAllowAll,
        SessionLevel::AllowSession,
        SessionLevel::AllowActionSession,
        SessionLevel::Decline,
    ];

    pub fn grants_access(self) -> bool {
        !matches!(self, SessionLevel::Decline)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub level: SessionLevel,
    /// Required action match for `allow_action_session`; ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires| expires > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub event: String,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// In-memory permission state, rebuilt from the snapshot at boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionState {
    pub granted: HashMap<String, PermissionGrant>,
    pub requests: HashMap<String, PermissionRequest>,
    pub sessions: HashMap<String, Session>,
    pub audit: VecDeque<AuditEntry>,
}

/// On-disk snapshot document. Sections other than `permissions` belong to
/// engines that share the file and are preserved across rewrites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotDoc {
    pub permissions: PermissionState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SnapshotDoc {
    /// Load the snapshot, falling back to an empty document when the file is
    /// missing or unreadable. A corrupt snapshot is logged, not fatal.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), ?err, "corrupt permission snapshot; starting empty");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the whole document atomically: serialize to a `.tmp` sibling,
    /// then rename over the original so a crash never leaves a partial file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = {
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "permissions.json".to_string());
            path.with_file_name(format!("{filename}.tmp"))
        };

        let raw = serde_json::to_string_pretty(self)?;
        if let Err(err) = fs::write(&tmp_path, raw) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}
