//! One broker session as a statum state machine
//!
//! ```text
//! open ──► Handshaking ──► Subscribing ──► Live ──► Closed
//!            (ConnAck)      (SubAck)        │
//!                                           ├─ cancelled: disconnect sent
//!                                           └─ lost: transport error
//! ```
//!
//! A session never reconnects by itself. When it ends the event loop is
//! dropped and the engine decides whether and when to open a new one.

use super::config::MqttConfig;
use super::error::EngineError;
use super::tracker::PublishTracker;
use crate::registry::{Registry, STATUS_FILTER};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Handshaking, // CONNECT sent, waiting for the broker's answer
    Subscribing, // Status filter requested
    Live,        // Dispatching inbound status messages
}

#[machine]
pub struct Session<S: SessionState> {
    client: AsyncClient,
    eventloop: EventLoop,
    broker: String,
    registry: Arc<Registry>,
    acks: Arc<PublishTracker>,
}

/// How a live session ended
#[derive(Debug)]
pub enum Closed {
    Cancelled,
    Lost(EngineError),
}

impl<S: SessionState> Session<S> {
    pub fn broker(&self) -> &str {
        &self.broker
    }

    async fn next_event(&mut self) -> Result<Event, EngineError> {
        match self.eventloop.poll().await {
            Ok(event) => Ok(event),
            Err(ConnectionError::ConnectionRefused(code)) => {
                Err(EngineError::ConnectRefused(code))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch(&mut self, publish: &Publish) {
        debug!("Message on {} ({} bytes)", publish.topic, publish.payload.len());
        self.registry.route(&publish.topic, &publish.payload).await;
    }
}

impl Session<Handshaking> {
    /// Starts a session with its own acknowledgement tracker
    pub fn open(config: &MqttConfig, registry: Arc<Registry>) -> Self {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive).set_clean_session(true);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        debug!("Opening session with {}", config.broker());
        let acks = Arc::new(PublishTracker::new());
        Self::new(client, eventloop, config.broker(), registry, acks)
    }

    /// Drives the event loop until the broker answers the CONNECT
    pub async fn handshake(mut self) -> Result<Session<Subscribing>, EngineError> {
        loop {
            match self.next_event().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(EngineError::ConnectRefused(ack.code));
                    }
                    info!("Connected to {}", self.broker);
                    return Ok(self.transition());
                }
                other => debug!("Handshake event: {:?}", other),
            }
        }
    }
}

impl Session<Subscribing> {
    /// Subscribes to every status topic at the strongest QoS
    ///
    /// Any rejected filter fails the whole session. Status messages that
    /// arrive before the acknowledgement are dispatched as usual.
    pub async fn subscribe(mut self) -> Result<Session<Live>, EngineError> {
        self.client.subscribe(STATUS_FILTER, QoS::ExactlyOnce).await?;

        loop {
            match self.next_event().await? {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(EngineError::SubscribeRejected(STATUS_FILTER.to_string()));
                    }
                    info!("Subscribed to {} on {}", STATUS_FILTER, self.broker);
                    return Ok(self.transition());
                }
                Event::Incoming(Packet::Publish(publish)) => self.dispatch(&publish).await,
                other => debug!("Subscribe event: {:?}", other),
            }
        }
    }
}

impl Session<Live> {
    /// Handle for publishing while the session runs
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Waiters for this session's publishes, failed when it closes
    pub fn acks(&self) -> Arc<PublishTracker> {
        Arc::clone(&self.acks)
    }

    /// Dispatches inbound traffic until cancelled or the transport fails
    pub async fn run_until_closed(mut self, cancel: CancellationToken) -> Closed {
        let closed = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.disconnect().await;
                    break Closed::Cancelled;
                }

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish).await,
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        self.acks.complete(ack.pkid).await;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.acks.bind(pkid).await,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Session with {} lost: {}", self.broker, e);
                        break Closed::Lost(e.into());
                    }
                }
            }
        };

        self.acks.reset().await;
        closed
    }

    // Best effort, the broker may already be gone
    async fn disconnect(&mut self) {
        info!("Disconnecting from {}", self.broker);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request failed: {}", e);
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Disconnect to {} not flushed in time", self.broker);
        }
    }
}
