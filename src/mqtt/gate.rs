//! Reconnect-ready gate
//!
//! Single-slot signal the reconnect loop awaits before it tries the broker
//! again. Connectivity signals arm and disarm it:
//!
//! ```text
//!                 online (was offline)
//!   ┌──────────┐ ─────────────────────► ┌───────────┐
//!   │  closed  │                        │   open    │
//!   └──────────┘ ◄───────────────────── └───────────┘
//!      ▲   │        offline (always)        │
//!      │   │                                │ online again, or a second
//!      │   │                                │ session loss while online
//!      │   └──── backoff timer fires ◄──────┘
//! ```
//!
//! The first session loss after the network comes back reconnects through
//! the open gate. Later losses on the same network arm the backoff.
//!
//! The backoff timer is owned by the gate and aborted when the gate closes
//! or is dropped. A timer that already woke only opens the gate if it is
//! still the armed one and the network is still present.

use super::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Delay before a repeated "network present" signal releases the gate
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Default)]
struct GateState {
    online: bool,
    // A session loss already went through since the last online transition
    reconnected: bool,
    // Bumped on every arm and disarm, a timer only fires for its own epoch
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl GateState {
    fn disarm(&mut self) {
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn timer_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

pub struct ReconnectGate {
    ready: Arc<watch::Sender<bool>>,
    state: Arc<Mutex<GateState>>,
    backoff: Duration,
}

impl Default for ReconnectGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectGate {
    pub fn new() -> Self {
        Self::with_backoff(RECONNECT_BACKOFF)
    }

    pub fn with_backoff(backoff: Duration) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready: Arc::new(ready),
            state: Arc::new(Mutex::new(GateState::default())),
            backoff,
        }
    }

    /// Applies a connectivity signal
    ///
    /// Must be called from within a tokio runtime; a repeated online signal
    /// spawns the backoff timer.
    pub fn on_connectivity(&self, online: bool) {
        let mut state = lock(&self.state);

        if !online {
            state.online = false;
            state.disarm();
            if self.ready.send_replace(false) {
                debug!("Network lost, reconnect gate closed");
            }
            return;
        }

        if !state.online {
            state.online = true;
            state.reconnected = false;
            state.disarm();
            self.ready.send_replace(true);
            info!("Network present, reconnect gate open");
            return;
        }

        self.arm(&mut state);
    }

    /// Records that a session ended and a reconnect is about to wait here
    ///
    /// Offline, the gate stays closed until the network returns. Online, the
    /// first loss passes through and every later one arms the backoff.
    pub fn on_session_lost(&self) {
        let mut state = lock(&self.state);
        if !state.online {
            return;
        }
        if !state.reconnected {
            state.reconnected = true;
            debug!("First session loss on this network, gate left as is");
            return;
        }
        self.arm(&mut state);
    }

    fn arm(&self, state: &mut GateState) {
        if state.timer_pending() {
            debug!("Reconnect backoff already running");
            return;
        }

        state.disarm();
        let epoch = state.epoch;
        self.ready.send_replace(false);
        let ready = Arc::clone(&self.ready);
        let shared = Arc::clone(&self.state);
        let backoff = self.backoff;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            release(&shared, &ready, epoch);
        }));
        info!("Reconnect gate closed for {:?}", backoff);
    }

    /// Resolves once the gate is open
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail while awaited
        let _ = ready.wait_for(|open| *open).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }
}

// Backoff expiry, a no-op for a timer that was disarmed after waking
fn release(state: &Mutex<GateState>, ready: &watch::Sender<bool>, epoch: u64) {
    let state = lock(state);
    if state.epoch != epoch || !state.online {
        debug!("Stale reconnect backoff ignored");
        return;
    }
    ready.send_replace(true);
    debug!("Reconnect backoff elapsed, gate open");
}

impl Drop for ReconnectGate {
    fn drop(&mut self) {
        lock(&self.state).disarm();
    }
}
