//! # MQTT side of the bridge
//!
//! Everything that talks to the broker lives here. Devices publish their
//! status under `stat/...`; the bridge subscribes once per session, routes
//! every status message into the [`Registry`](crate::registry::Registry) and
//! publishes commands under `cmnd/...`.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker settings the engine runs with
//! ├── connectivity.rs  - Network probe feeding connectivity signals
//! ├── engine.rs        - Connection state machine, send, reconfigure
//! ├── error.rs         - EngineError and SendError
//! ├── gate.rs          - Reconnect-ready gate with its backoff timer
//! ├── session.rs       - One broker session (handshake, subscribe, live)
//! └── tracker.rs       - PUBACK bookkeeping for acknowledged sends
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! ConnectivityProbe ──signals──► ConnectionEngine ──owns──► Session<Live>
//!                                 │        ▲                    │
//!                           send()│        │PubAck           stat/#
//!                                 ▼        │                    ▼
//!                               broker ────┘                 Registry
//! ```

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod gate;
pub mod session;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Nothing guarded here is left half-written by a panic
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
