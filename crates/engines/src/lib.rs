//! Reference engines built on the hub's capability contract: a rolling
//! context window, an agent trust registry, and a structured note store.
//! Each reacts to bus events and announces its own state changes back
//! through the hub — never by calling another engine.

pub mod context;
pub mod notes;
pub mod trust;

pub use context::{ContextEngine, ContextEntry};
pub use notes::{Note, NotesEngine};
pub use trust::{TrustEngine, TrustLevel};
