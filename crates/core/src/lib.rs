//! Event-driven nervous system core: the typed in-process bus, the [`Hub`]
//! that owns it, and the [`Engine`] capability contract every module
//! satisfies.
//!
//! Engines never hold references to each other — every cross-engine effect
//! travels as an [`Event`] through the hub.

pub mod bus;
pub mod error;
pub mod event;
pub mod hub;

pub use bus::{EventBus, SubscriptionId};
pub use error::{Error, Result};
pub use event::{Event, payload};
pub use hub::{Engine, Hub};
