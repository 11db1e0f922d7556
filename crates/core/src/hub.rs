use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::bus::EventBus;
use crate::event::Event;

/// Capability contract every module satisfies.
///
/// An engine holds a reference to the [`Hub`] only — never to another engine.
/// All cross-engine effects are observable exclusively as events, which is
/// what lets any engine be removed from the boot list without touching the
/// rest.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called exactly once during boot, in boot-list order. Implementations
    /// subscribe their own [`Engine::handle_event`] to the bus here and may
    /// stash a `Weak<Hub>` for later emission.
    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>);

    /// Receives every event regardless of type; each engine filters on
    /// `event.event_type` itself. Runs on the publisher's thread — anything
    /// slow must be handed off, never run inline.
    fn handle_event(&self, event: &Event);
}

/// Owner of the bus and the deterministic engine boot sequence; the sole
/// `emit` entry point for engines and the gateway alike.
pub struct Hub {
    bus: EventBus,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: EventBus::new(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Announce a state change. Fans out synchronously to every subscriber
    /// before returning.
    pub fn emit(&self, event_type: impl Into<String>, payload: Map<String, Value>) {
        let event = Event::new(event_type, payload);
        self.bus.publish(&event);
    }

    /// Boot every engine exactly once, in list order. Removing an engine
    /// from the list affects nobody else.
    pub fn boot(self: &Arc<Self>, engines: &[Arc<dyn Engine>]) {
        for engine in engines {
            info!(engine = engine.name(), "engine boot");
            Arc::clone(engine).on_boot(self);
        }
    }

    /// Subscribe an engine's `handle_event` to the bus. The usual body of an
    /// [`Engine::on_boot`] implementation.
    pub fn subscribe_engine<E: Engine + 'static>(&self, engine: Arc<E>) -> crate::SubscriptionId {
        self.bus
            .subscribe(Arc::new(move |event: &Event| engine.handle_event(event)))
    }
}
