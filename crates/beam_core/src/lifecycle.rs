//! Self-healing TCP accept loop shared by the registry and the agent.
//!
//! A service owns one [`ListenerControl`]. The accept loop publishes its
//! [`ServiceState`] through a watch channel and consults a single stop
//! flag after every wake-up and after every listener re-creation, so a
//! stop can never be overtaken by a concurrent restart.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// Delay between two failed attempts to re-create a listener.
pub const REBIND_BACKOFF: Duration = Duration::from_millis(200);

/// Lifecycle of a listening service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, accept loop not yet running.
    Starting,
    /// Accepting connections.
    Serving,
    /// Listener dropped, waiting to be re-created.
    Restarting,
    /// Terminal. The loop has exited and will not restart.
    Stopped,
}

/// Stop flag, restart requests and state publication for one accept loop.
pub struct ListenerControl {
    name: String,
    stop: AtomicBool,
    restart: AtomicBool,
    running: AtomicBool,
    wake: Notify,
    state_tx: watch::Sender<ServiceState>,
    restarts_tx: watch::Sender<u64>,
}

impl ListenerControl {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ServiceState::Starting);
        let (restarts_tx, _) = watch::channel(0);
        Arc::new(Self {
            name: name.into(),
            stop: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            state_tx,
            restarts_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Number of times the listener has been re-created.
    pub fn restart_count(&self) -> u64 {
        *self.restarts_tx.borrow()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop for good. Returns `true` only for the call
    /// that actually flipped the flag.
    pub fn request_stop(&self) -> bool {
        let first = !self.stop.swap(true, Ordering::SeqCst);
        if first {
            info!(service = %self.name, "Stop requested");
            self.wake.notify_one();
            // No loop will ever observe the flag, so finish here.
            if !self.running.load(Ordering::SeqCst) {
                self.set_state(ServiceState::Stopped);
            }
        }
        first
    }

    /// Drop the current listener and re-create it through the same path an
    /// accept failure takes. Ignored once a stop has been requested.
    pub fn request_restart(&self) {
        if self.is_stop_requested() {
            return;
        }
        self.restart.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wait until the loop has reached [`ServiceState::Stopped`].
    pub async fn stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ServiceState::Stopped).await;
    }

    /// Resolves after the next successful listener re-creation, yielding the
    /// new restart count. The subscription is taken when this is called, not
    /// when the future is first polled.
    pub fn restarted(&self) -> impl Future<Output = u64> + Send + 'static {
        let mut rx = self.restarts_tx.subscribe();
        rx.borrow_and_update();
        async move {
            let _ = rx.changed().await;
            *rx.borrow()
        }
    }

    fn set_state(&self, state: ServiceState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(service = %self.name, ?prev, ?state, "Service state changed");
        }
    }

    fn record_restart(&self) -> u64 {
        let mut count = 0;
        self.restarts_tx.send_modify(|n| {
            *n += 1;
            count = *n;
        });
        count
    }
}

/// Run the accept loop on `listener` until a stop is requested.
///
/// Every accepted stream is handed to `on_accept`, which is expected to
/// spawn its own task. When accepting fails, or a restart is requested,
/// the listener is dropped and `addr` is bound again.
pub async fn run_accept_loop<F>(
    control: Arc<ListenerControl>,
    addr: SocketAddr,
    listener: TcpListener,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr),
{
    control.running.store(true, Ordering::SeqCst);
    let mut listener = Some(listener);

    loop {
        if control.is_stop_requested() {
            break;
        }

        let current = match listener.take() {
            Some(l) => l,
            None => match rebind(&control, addr).await {
                Some(l) => {
                    let count = control.record_restart();
                    warn!(service = %control.name, %addr, count, "Listener restarted");
                    l
                }
                None => break,
            },
        };
        control.set_state(ServiceState::Serving);

        let accepted = tokio::select! {
            biased;
            _ = control.wake.notified() => None,
            res = current.accept() => Some(res),
        };

        match accepted {
            Some(Ok((stream, peer))) => {
                on_accept(stream, peer);
                listener = Some(current);
            }
            Some(Err(e)) => {
                warn!(service = %control.name, "Accept failed, re-creating listener: {e}");
                drop(current);
                control.set_state(ServiceState::Restarting);
            }
            None if control.is_stop_requested() => break,
            None if control.restart.swap(false, Ordering::SeqCst) => {
                info!(service = %control.name, "Listener restart requested");
                drop(current);
                control.set_state(ServiceState::Restarting);
            }
            None => listener = Some(current),
        }
    }

    control.set_state(ServiceState::Stopped);
    info!(service = %control.name, %addr, "Listener stopped");
}

/// Bind `addr` again, retrying with a fixed backoff. Returns `None` if a
/// stop is requested before or right after a successful bind.
async fn rebind(control: &ListenerControl, addr: SocketAddr) -> Option<TcpListener> {
    control.restart.store(false, Ordering::SeqCst);
    loop {
        if control.is_stop_requested() {
            return None;
        }
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if control.is_stop_requested() {
                    return None;
                }
                return Some(listener);
            }
            Err(e) => {
                warn!(service = %control.name, %addr, "Rebind failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(REBIND_BACKOFF) => {}
                    _ = control.wake.notified() => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
