//! Permission/session authority: requests, time-bounded grants, session
//! levels, and a capped audit trail, persisted as a whole-document JSON
//! snapshot after every mutating call.

mod engine;
mod manager;
mod store;

pub use engine::PermissionsEngine;
pub use manager::PermissionManager;
pub use store::{
    AuditEntry, PermissionGrant, PermissionRequest, PermissionState, Session, SessionLevel,
};
