//! Local event gateway: bridges the in-process bus to remote WebSocket
//! clients, bidirectionally.
//!
//! Engine boot is synchronous and may happen before any async runtime
//! exists in the host process, so the gateway never borrows the caller's
//! execution context. It spawns a dedicated worker thread that owns a
//! single-threaded tokio runtime and drives the listener inside it.
//!
//! Events published before the listener is up are held in a capped FIFO
//! queue; when the gateway reaches `Listening` the queue is frozen into a
//! backlog that is replayed once to every client that connects afterwards,
//! ahead of that client's live stream. Live fan-out goes through a bounded
//! per-client channel with a non-blocking send, so one stalled client can
//! never hold up the dispatch thread or its siblings.

mod server;

pub mod probe;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use nerva_config::GatewayConfig;
use nerva_core::{Engine, Event, Hub};
use nerva_permissions::PermissionManager;

/// Inbound frames of this type are re-emitted onto the internal bus.
pub const PROPOSAL_TYPE: &str = "agent.intent.proposed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPhase {
    Init,
    Starting,
    Listening,
    /// Terminal: the listener could not bind. The hub and the other
    /// engines keep running.
    Failed,
    /// Terminal: the listener was shut down. Later events are discarded.
    Stopped,
}

/// State shared between the hub's dispatch thread and the worker runtime.
pub(crate) struct Shared {
    phase: Mutex<GatewayPhase>,
    phase_changed: Condvar,
    pending: Mutex<VecDeque<Event>>,
    pending_cap: usize,
    backlog: Mutex<Vec<Event>>,
    clients: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_client_id: AtomicU64,
    client_buffer: usize,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn new(config: &GatewayConfig) -> Self {
        Self {
            phase: Mutex::new(GatewayPhase::Init),
            phase_changed: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            pending_cap: config.pending_queue_cap.max(1),
            backlog: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            client_buffer: config.client_buffer.max(1),
            bound_addr: Mutex::new(None),
        }
    }

    pub(crate) fn phase(&self) -> GatewayPhase {
        *lock(&self.phase)
    }

    pub(crate) fn set_phase(&self, phase: GatewayPhase) {
        *lock(&self.phase) = phase;
        self.phase_changed.notify_all();
    }

    /// Freeze the pending queue into the replay backlog and flip to
    /// `Listening`. The pending lock is held across the phase change so a
    /// concurrent `dispatch` either lands in the queue before the freeze or
    /// observes `Listening` and broadcasts.
    pub(crate) fn go_listening(&self) {
        let mut pending = lock(&self.pending);
        let buffered: Vec<Event> = pending.drain(..).collect();
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "flushing pre-listen event queue");
        }
        lock(&self.backlog).extend(buffered);
        self.set_phase(GatewayPhase::Listening);
    }

    /// Route one bus event: broadcast when live, buffer while starting,
    /// drop once failed.
    fn dispatch(&self, event: &Event) {
        let mut pending = lock(&self.pending);
        match self.phase() {
            GatewayPhase::Listening => {
                drop(pending);
                self.broadcast(event);
            }
            GatewayPhase::Failed | GatewayPhase::Stopped => {}
            GatewayPhase::Init | GatewayPhase::Starting => {
                if pending.len() == self.pending_cap {
                    pending.pop_front();
                    warn!("gateway pending queue full; dropping oldest event");
                }
                pending.push_back(event.clone());
            }
        }
    }

    /// Best-effort fan-out. A full client channel drops the frame for that
    /// client only; a closed channel unregisters the client.
    fn broadcast(&self, event: &Event) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(?err, "unserializable event; not relayed");
                return;
            }
        };
        let mut gone = Vec::new();
        let clients = lock(&self.clients);
        for (id, tx) in clients.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = id, "client send queue full; frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        drop(clients);
        if !gone.is_empty() {
            let mut clients = lock(&self.clients);
            for id in gone {
                clients.remove(&id);
            }
        }
    }

    pub(crate) fn register_client(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_buffer);
        lock(&self.clients).insert(id, tx);
        (id, rx)
    }

    pub(crate) fn remove_client(&self, id: u64) {
        lock(&self.clients).remove(&id);
    }

    pub(crate) fn backlog_snapshot(&self) -> Vec<Event> {
        lock(&self.backlog).clone()
    }

    pub(crate) fn set_bound_addr(&self, addr: Option<SocketAddr>) {
        *lock(&self.bound_addr) = addr;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The gateway engine. Subscribes to the bus like any other engine; its
/// listener lives on its own supervised worker thread.
pub struct Gateway {
    config: GatewayConfig,
    shared: Arc<Shared>,
    hub: OnceLock<Weak<Hub>>,
    sessions: Option<Arc<PermissionManager>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Gateway {
    /// `sessions`, when present, gates inbound proposals through session
    /// policy before they reach the bus.
    pub fn new(config: &GatewayConfig, sessions: Option<Arc<PermissionManager>>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config: config.clone(),
            shared: Arc::new(Shared::new(config)),
            hub: OnceLock::new(),
            sessions,
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> GatewayPhase {
        self.shared.phase()
    }

    /// Address the listener actually bound to. `None` until `Listening`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.bound_addr)
    }

    /// Block until the gateway is `Listening` or `Failed`, or the timeout
    /// elapses. Returns the phase observed last.
    pub fn wait_until_ready(&self, timeout: Duration) -> GatewayPhase {
        let deadline = Instant::now() + timeout;
        let mut phase = lock(&self.shared.phase);
        loop {
            match *phase {
                GatewayPhase::Listening | GatewayPhase::Failed | GatewayPhase::Stopped => {
                    return *phase;
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return *phase;
            }
            let (guard, _) = self
                .shared
                .phase_changed
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            phase = guard;
        }
    }

    /// Spawn the worker thread. Called once from `on_boot`; extra calls are
    /// no-ops.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }
        let ctx = server::ServerCtx {
            shared: self.shared.clone(),
            config: self.config.clone(),
            hub: self.hub.get().cloned().unwrap_or_default(),
            sessions: self.sessions.clone(),
            shutdown: self.shutdown_rx.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name("nerva-gateway".to_string())
            .spawn(move || server::run(ctx));
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(err) => {
                error!(?err, "gateway worker thread failed to spawn");
                self.shared.set_phase(GatewayPhase::Failed);
            }
        }
    }

    /// Close all sockets and join the worker. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("gateway worker panicked during shutdown");
            }
        }
        // A failed bind stays visible as `Failed`; everything else ends up
        // terminal `Stopped` even if the worker never ran.
        if self.shared.phase() != GatewayPhase::Failed {
            self.shared.set_phase(GatewayPhase::Stopped);
        }
    }
}

impl Engine for Gateway {
    fn name(&self) -> &'static str {
        "local_event_gateway"
    }

    fn on_boot(self: Arc<Self>, hub: &Arc<Hub>) {
        let _ = self.hub.set(Arc::downgrade(hub));
        hub.subscribe_engine(self.clone());
        self.start();
    }

    fn handle_event(&self, event: &Event) {
        self.shared.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerva_core::payload;
    use serde_json::json;

    fn shared_with_cap(cap: usize) -> Shared {
        Shared::new(&GatewayConfig {
            pending_queue_cap: cap,
            ..GatewayConfig::default()
        })
    }

    #[test]
    fn pending_queue_drops_oldest_past_cap() {
        let shared = shared_with_cap(2);
        for i in 0..3 {
            shared.dispatch(&Event::new(
                "chaos.file.created",
                payload(json!({"seq": i})),
            ));
        }
        let pending = lock(&shared.pending);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["seq"], 1);
        assert_eq!(pending[1].payload["seq"], 2);
    }

    #[test]
    fn listening_transition_freezes_queue_into_backlog() {
        let shared = shared_with_cap(16);
        shared.dispatch(&Event::new("a", payload(json!({}))));
        shared.dispatch(&Event::new("b", payload(json!({}))));
        shared.go_listening();

        assert_eq!(shared.phase(), GatewayPhase::Listening);
        assert!(lock(&shared.pending).is_empty());
        let backlog = shared.backlog_snapshot();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].event_type, "a");

        // Live events no longer touch the queue or the backlog.
        shared.dispatch(&Event::new("c", payload(json!({}))));
        assert!(lock(&shared.pending).is_empty());
        assert_eq!(shared.backlog_snapshot().len(), 2);
    }

    #[test]
    fn terminal_phases_discard_events() {
        let shared = shared_with_cap(16);
        shared.set_phase(GatewayPhase::Failed);
        shared.dispatch(&Event::new("a", payload(json!({}))));
        assert!(lock(&shared.pending).is_empty());

        shared.set_phase(GatewayPhase::Stopped);
        shared.dispatch(&Event::new("b", payload(json!({}))));
        assert!(lock(&shared.pending).is_empty());
    }

    #[test]
    fn broadcast_skips_full_clients_and_prunes_closed_ones() {
        let shared = shared_with_cap(16);
        shared.set_phase(GatewayPhase::Listening);

        let (slow_id, mut slow_rx) = shared.register_client();
        let (gone_id, gone_rx) = shared.register_client();
        drop(gone_rx);

        // client_buffer defaults well above 2; fill the slow client's queue.
        for _ in 0..shared.client_buffer {
            shared.dispatch(&Event::new("fill", payload(json!({}))));
        }
        shared.dispatch(&Event::new("overflow", payload(json!({}))));

        assert!(!lock(&shared.clients).contains_key(&gone_id));
        assert!(lock(&shared.clients).contains_key(&slow_id));

        let mut received = 0;
        while slow_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, shared.client_buffer);
    }
}
