//! Connectivity signal source
//!
//! Periodically checks whether the broker address accepts TCP connections
//! and tells the engine whenever the answer changes. The first result is
//! always reported.

use super::engine::ConnectionEngine;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityProbe {
    /// `None` for a zero interval, which disables probing
    pub fn new(target: impl Into<String>, interval: Duration) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }
        Some(Self {
            target: target.into(),
            interval,
            timeout: PROBE_TIMEOUT.min(interval),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{} unreachable: {}", self.target, e);
                false
            }
            Err(_) => {
                debug!("{} did not answer within {:?}", self.target, self.timeout);
                false
            }
        }
    }

    pub fn spawn(self, engine: ConnectionEngine, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Probing {} every {:?}", self.target, self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let online = self.check().await;
                if last != Some(online) {
                    last = Some(online);
                    engine.notify_connectivity(online);
                }
            }
            debug!("Probe for {} stopped", self.target);
        })
    }
}
