//! Publish acknowledgement tracking
//!
//! The client hands out packet ids only when the event loop actually writes
//! a publish, so waiters are queued first and bound to a packet id once the
//! outgoing publish shows up:
//!
//! ```text
//! send() ──► enqueue ──► client.publish ─┐
//!                                        ▼
//!            Outgoing::Publish(pkid) ──► bind(pkid)
//!            Incoming::PubAck(pkid)  ──► complete(pkid) ──► waiter resumes
//! ```
//!
//! Callers serialize `enqueue` + `publish` so queue order is request order.

use std::collections::{HashMap, VecDeque};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

#[derive(Default)]
struct Pending {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct PublishTracker {
    pending: Mutex<Pending>,
}

impl PublishTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the next publish handed to the client
    pub async fn enqueue(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.queued.push_back(tx);
        rx
    }

    /// Drops the most recent waiter, for a publish that never reached the client
    pub async fn cancel_last(&self) {
        self.pending.lock().await.queued.pop_back();
    }

    pub async fn bind(&self, pkid: u16) {
        let mut pending = self.pending.lock().await;
        match pending.queued.pop_front() {
            Some(waiter) => {
                pending.inflight.insert(pkid, waiter);
            }
            None => debug!("Outgoing publish {} has no waiter", pkid),
        }
    }

    /// Resumes the waiter for `pkid`, false if nobody waited for it
    pub async fn complete(&self, pkid: u16) -> bool {
        match self.pending.lock().await.inflight.remove(&pkid) {
            Some(waiter) => waiter.send(()).is_ok(),
            None => {
                debug!("Unexpected acknowledgement for {}", pkid);
                false
            }
        }
    }

    /// Fails every waiter, used when the session ends
    pub async fn reset(&self) {
        let mut pending = self.pending.lock().await;
        let dropped = pending.queued.len() + pending.inflight.len();
        pending.queued.clear();
        pending.inflight.clear();
        if dropped > 0 {
            debug!("Dropped {} unacknowledged publishes", dropped);
        }
    }

    pub async fn len(&self) -> usize {
        let pending = self.pending.lock().await;
        pending.queued.len() + pending.inflight.len()
    }
}
