//! Connection engine
//!
//! Owns the single broker session and everything that decides when one
//! exists. Cheap to clone; every clone drives the same engine.
//!
//! # State Machine
//!
//! ```text
//!                 configure
//!   Idle ◄──────────────────────► Disconnected ──connect()──► Connecting
//!   (no host/port)                    ▲                           │
//!                                     │ failure / session lost    │ ConnAck + SubAck
//!                                     │                           ▼
//!            WaitingForNetwork ◄──────┴─────────────────────── Connected
//!                   │   ▲
//!          online   │   │ offline
//!                   ▼   │
//!               BackoffWait ──gate opens──► connect()
//! ```
//!
//! Concurrent `connect()` calls collapse into one attempt. Reconnects always
//! wait on the [`ReconnectGate`], which connectivity signals and repeated
//! session losses open and close.

use super::config::MqttConfig;
use super::error::{EngineError, SendError};
use super::gate::ReconnectGate;
use super::lock;
use super::session::{Closed, Live, Session};
use super::tracker::PublishTracker;
use crate::command::Command;
use crate::device::remote::COMMAND_GET_STATE;
use crate::registry::{Registry, RegistryError};
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Disconnected,
    Connecting,
    Connected,
    WaitingForNetwork,
    BackoffWait,
}

// In-flight or completed connection attempt
struct Attempt {
    generation: u64,
    result: watch::Receiver<Option<bool>>,
    cancel: CancellationToken,
}

struct LiveSession {
    generation: u64,
    client: AsyncClient,
    acks: Arc<PublishTracker>,
    cancel: CancellationToken,
}

struct Inner {
    config: RwLock<MqttConfig>,
    registry: Arc<Registry>,
    gate: ReconnectGate,
    state: watch::Sender<ConnectionState>,
    attempt: Mutex<Option<Attempt>>,
    session: Mutex<Option<LiveSession>>,
    session_task: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    send_order: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionEngine {
    inner: Arc<Inner>,
}

impl ConnectionEngine {
    pub fn new(config: MqttConfig, registry: Arc<Registry>) -> Self {
        Self::with_gate(config, registry, ReconnectGate::new())
    }

    pub fn with_gate(config: MqttConfig, registry: Arc<Registry>, gate: ReconnectGate) -> Self {
        let initial = if config.is_configured() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Idle
        };
        let (state, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                registry,
                gate,
                state,
                attempt: Mutex::new(None),
                session: Mutex::new(None),
                session_task: Mutex::new(None),
                reconnect: Mutex::new(None),
                generation: AtomicU64::new(0),
                send_order: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> MqttConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn network_online(&self) -> bool {
        self.inner.gate.is_online()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!("Connection state: {:?} -> {:?}", previous, state);
        }
    }

    /// Connects to the configured broker, `true` once a session is live
    ///
    /// Calls racing an attempt in flight share its result instead of opening
    /// a second connection. Without host/port this resolves to `false`
    /// immediately and leaves the engine idle.
    pub async fn connect(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let config = self.config();
        if !config.is_configured() {
            debug!("{}", EngineError::NotConfigured);
            self.set_state(ConnectionState::Idle);
            return false;
        }

        let mut result = {
            let mut slot = lock(&self.inner.attempt);
            match slot.as_ref() {
                Some(attempt) => attempt.result.clone(),
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let cancel = self.inner.shutdown.child_token();
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(Attempt {
                        generation,
                        result: rx.clone(),
                        cancel: cancel.clone(),
                    });

                    let engine = self.clone();
                    let task = tokio::spawn(async move {
                        engine.run_attempt(config, generation, cancel, tx).await;
                    });
                    *lock(&self.inner.session_task) = Some(task);
                    rx
                }
            }
        };

        let connected = match result.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.unwrap_or(false),
            Err(_) => false,
        };
        connected
    }

    async fn establish(&self, config: &MqttConfig) -> Result<Session<Live>, EngineError> {
        let session = Session::open(config, Arc::clone(&self.inner.registry));
        tokio::time::timeout(config.connect_timeout, async {
            session.handshake().await?.subscribe().await
        })
        .await
        .map_err(|_| EngineError::Timeout(config.connect_timeout))?
    }

    async fn run_attempt(
        self,
        config: MqttConfig,
        generation: u64,
        cancel: CancellationToken,
        result: watch::Sender<Option<bool>>,
    ) {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {} (attempt {})", config.broker(), generation);

        let established = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::ShutDown),
            established = self.establish(&config) => established,
        };

        let session = match established {
            Ok(session) => session,
            Err(e) => {
                self.clear_attempt(generation);
                result.send_replace(Some(false));
                if cancel.is_cancelled() {
                    debug!("Attempt {} cancelled", generation);
                    return;
                }
                error!("Connecting to {} failed: {}", config.broker(), e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
                return;
            }
        };

        let installed = {
            let mut slot = lock(&self.inner.session);
            if cancel.is_cancelled() {
                false
            } else {
                *slot = Some(LiveSession {
                    generation,
                    client: session.client(),
                    acks: session.acks(),
                    cancel: cancel.clone(),
                });
                true
            }
        };
        if !installed {
            // Torn down between SubAck and here
            result.send_replace(Some(false));
            session.run_until_closed(cancel).await;
            return;
        }
        self.set_state(ConnectionState::Connected);
        result.send_replace(Some(true));

        let closed = session.run_until_closed(cancel).await;
        self.on_session_closed(generation, closed);
    }

    fn clear_attempt(&self, generation: u64) {
        let mut slot = lock(&self.inner.attempt);
        if slot.as_ref().is_some_and(|a| a.generation == generation) {
            *slot = None;
        }
    }

    fn on_session_closed(&self, generation: u64, closed: Closed) {
        let current = {
            let mut slot = lock(&self.inner.session);
            let current = slot.as_ref().is_some_and(|s| s.generation == generation);
            if current {
                *slot = None;
            }
            current
        };
        self.clear_attempt(generation);

        if !current {
            debug!("Superseded session {} closed", generation);
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        match closed {
            Closed::Cancelled => info!("Session {} closed", generation),
            Closed::Lost(e) => {
                warn!("Session {} lost: {}", generation, e);
                self.schedule_reconnect();
            }
        }
    }

    // State to show while a reconnect is pending on the gate
    fn waiting_state(&self) -> ConnectionState {
        if !self.inner.gate.is_online() {
            ConnectionState::WaitingForNetwork
        } else if !self.inner.gate.is_ready() {
            ConnectionState::BackoffWait
        } else {
            ConnectionState::Disconnected
        }
    }

    fn reconnect_pending(&self) -> bool {
        lock(&self.inner.reconnect)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn schedule_reconnect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let mut slot = lock(&self.inner.reconnect);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Reconnect already pending");
            return;
        }

        let engine = self.clone();
        *slot = Some(tokio::spawn(async move {
            engine.reconnect_when_ready().await;
        }));
    }

    async fn reconnect_when_ready(self) {
        self.inner.gate.on_session_lost();
        self.set_state(self.waiting_state());

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                debug!("Pending reconnect dropped on shutdown");
                return;
            }
            _ = self.inner.gate.wait_ready() => {}
        }

        // Failures from here schedule a fresh reconnect task
        lock(&self.inner.reconnect).take();
        info!("Reconnect gate open, reconnecting");
        self.connect().await;
    }

    /// Feeds a connectivity signal into the reconnect gate
    pub fn notify_connectivity(&self, online: bool) {
        info!("Network {}", if online { "present" } else { "absent" });
        self.inner.gate.on_connectivity(online);
        if self.reconnect_pending() {
            self.set_state(self.waiting_state());
        }
    }

    fn live_session(&self) -> Option<(AsyncClient, Arc<PublishTracker>)> {
        lock(&self.inner.session)
            .as_ref()
            .map(|s| (s.client.clone(), Arc::clone(&s.acks)))
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Publishes a command at QoS 1 and waits for the broker's acknowledgement
    ///
    /// Commands without a payload are rejected before the transport is
    /// looked at. Failures are reported, never retried.
    pub async fn send(&self, command: &Command) -> Result<(), SendError> {
        let payload = command.sendable_payload()?;
        let (client, acks) = self.live_session().ok_or(SendError::NotConnected)?;
        let timeout = self.config().publish_timeout;

        let acked = {
            let _order = self.inner.send_order.lock().await;
            let acked = acks.enqueue().await;
            if let Err(e) = client
                .publish(&payload.topic, QoS::AtLeastOnce, false, payload.body.clone())
                .await
            {
                acks.cancel_last().await;
                warn!("Publishing {} failed: {}", command, e);
                return Err(SendError::Transport(e));
            }
            acked
        };

        match tokio::time::timeout(timeout, acked).await {
            Ok(Ok(())) => {
                info!("Sent {} to {}", command, payload.topic);
                Ok(())
            }
            Ok(Err(_)) => {
                warn!("Session ended before {} was acknowledged", command);
                Err(SendError::TransportDown(command.id()))
            }
            Err(_) => {
                warn!("No acknowledgement for {} within {:?}", command, timeout);
                Err(SendError::Timeout(timeout))
            }
        }
    }

    /// Sends a registered command by id
    pub async fn send_action(&self, command_id: &str) -> Result<(), SendError> {
        let command = self.inner.registry.command(command_id).await?;
        self.send(&command).await
    }

    /// Sends a copy of a registered state command carrying `state`
    pub async fn send_with_state(&self, command_id: &str, state: &str) -> Result<(), SendError> {
        let mut command = self.inner.registry.command(command_id).await?;
        command.set_state(state)?;
        self.send(&command).await
    }

    /// Fires a device's state request command, if it has one
    pub async fn request_state(&self, device_id: &str) -> Result<(), SendError> {
        let device = self
            .inner
            .registry
            .device(device_id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        let request = device.state_request().ok_or_else(|| {
            RegistryError::UnknownCommand(format!("{}/{}", device_id, COMMAND_GET_STATE))
        })?;
        self.send(request).await
    }

    /// Applies new broker settings
    ///
    /// A host or port change tears the current session down and connects to
    /// the new broker in the background. Returns whether that happened.
    pub fn reconfigure(&self, config: MqttConfig) -> bool {
        let moved = {
            let mut current = self
                .inner
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let moved = !current.same_broker(&config);
            *current = config;
            moved
        };
        if !moved {
            debug!("Broker unchanged, keeping session");
            return false;
        }

        let config = self.config();
        info!("Broker changed to {}, dropping current session", config.broker());
        self.teardown();

        if config.is_configured() {
            self.set_state(ConnectionState::Disconnected);
            let engine = self.clone();
            tokio::spawn(async move {
                engine.connect().await;
            });
        } else {
            self.set_state(ConnectionState::Idle);
        }
        true
    }

    fn teardown(&self) {
        if let Some(task) = lock(&self.inner.reconnect).take() {
            task.abort();
        }
        if let Some(attempt) = lock(&self.inner.attempt).take() {
            attempt.cancel.cancel();
        }
        if let Some(session) = lock(&self.inner.session).take() {
            session.cancel.cancel();
        }
    }

    /// Closes the session and releases every pending wait
    pub async fn shutdown(&self) {
        info!("Shutting down connection engine");
        self.inner.shutdown.cancel();
        self.teardown();

        let task = lock(&self.inner.session_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Session task failed: {}", e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOptions;
    use crate::mqtt::testing::{BrokerBehaviour, FakeBroker};
    use std::time::Duration;

    fn engine_for(port: u16) -> ConnectionEngine {
        engine_with_backoff(port, Duration::from_millis(200))
    }

    fn engine_with_backoff(port: u16, backoff: Duration) -> ConnectionEngine {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(2),
            ..MqttConfig::default()
        };
        ConnectionEngine::with_gate(
            config,
            Arc::new(Registry::new(DeviceOptions::default())),
            ReconnectGate::with_backoff(backoff),
        )
    }

    async fn wait_for_state(engine: &ConnectionEngine, wanted: ConnectionState) {
        let mut states = engine.watch_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
            .await
            .unwrap()
            .unwrap();
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn unconfigured_engine_idles() {
        let engine = ConnectionEngine::new(
            MqttConfig::unconfigured(),
            Arc::new(Registry::new(DeviceOptions::default())),
        );
        assert_eq!(engine.state(), ConnectionState::Idle);
        assert!(!engine.connect().await);
        assert_eq!(engine.state(), ConnectionState::Idle);
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn empty_state_fails_before_transport() {
        let engine = engine_for(1);
        let command = Command::state("", "LEVEL", "primelan/hall", "");
        assert!(matches!(
            engine.send(&command).await,
            Err(SendError::NothingToSend(id)) if id == "primelan/hall/LEVEL"
        ));

        let command = Command::state("", "ON", "s20/lamp", "1");
        assert!(matches!(engine.send(&command).await, Err(SendError::NotConnected)));
    }

    #[tokio::test]
    async fn connects_and_routes_status() {
        let broker = FakeBroker::start(BrokerBehaviour {
            retained: vec![("stat/s20/lamp".to_string(), b"0".to_vec())],
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        let mut lamp = engine.registry().subscribe(["s20/lamp"]).await;

        assert!(engine.connect().await);
        assert_eq!(engine.state(), ConnectionState::Connected);
        let device = tokio::time::timeout(Duration::from_secs(5), lamp.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.id(), "s20/lamp");

        // Already connected: same completed attempt, no new socket
        assert!(engine.connect().await);
        assert_eq!(broker.connections(), 1);

        engine.shutdown().await;
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let broker = FakeBroker::start(BrokerBehaviour::default()).await;
        let engine = engine_for(broker.port());

        let (a, b, c) = tokio::join!(engine.connect(), engine.connect(), engine.connect());
        assert!(a && b && c);
        assert_eq!(broker.connections(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn commands_wait_for_puback() {
        let mut broker = FakeBroker::start(BrokerBehaviour {
            retained: vec![("stat/s20/lamp".to_string(), b"0".to_vec())],
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        let mut lamp = engine.registry().subscribe(["s20/lamp"]).await;
        assert!(engine.connect().await);
        lamp.next().await.unwrap();

        engine.send_action("s20/lamp/ON").await.unwrap();
        let (topic, body) = broker.next_published().await.unwrap();
        assert_eq!(topic, "cmnd/s20/lamp/state");
        assert_eq!(body, b"1");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn level_is_sent_from_a_copy() {
        let mut broker = FakeBroker::start(BrokerBehaviour {
            retained: vec![(
                "stat/primelan/hall".to_string(),
                br#"{"subtype":0,"state":"0"}"#.to_vec(),
            )],
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        let mut hall = engine.registry().subscribe(["primelan/hall"]).await;
        assert!(engine.connect().await);
        hall.next().await.unwrap();

        assert!(matches!(
            engine.send_action("primelan/hall/LEVEL").await,
            Err(SendError::NothingToSend(_))
        ));
        engine.send_with_state("primelan/hall/LEVEL", "60").await.unwrap();
        let (_, body) = broker.next_published().await.unwrap();
        assert_eq!(body, b"60");

        let stored = engine.registry().command("primelan/hall/LEVEL").await.unwrap();
        assert!(stored.payload().is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn missing_puback_times_out() {
        let broker = FakeBroker::start(BrokerBehaviour {
            withhold_puback: true,
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        assert!(engine.connect().await);

        let command = Command::state("", "ON", "s20/lamp", "1");
        assert!(matches!(engine.send(&command).await, Err(SendError::Timeout(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn state_request_targets_polled_remotes() {
        let mut broker = FakeBroker::start(BrokerBehaviour {
            retained: vec![
                ("stat/upnpirta2/box/upnp".to_string(), b"1".to_vec()),
                ("stat/rm/den/emit".to_string(), br#"[{"status":1}]"#.to_vec()),
            ],
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        let mut devices = engine.registry().subscribe(["upnpirta2/box", "rm/den"]).await;
        assert!(engine.connect().await);
        devices.next().await.unwrap();
        devices.next().await.unwrap();

        engine.request_state("upnpirta2/box").await.unwrap();
        let (topic, body) = broker.next_published().await.unwrap();
        assert_eq!(topic, "cmnd/upnpirta2/box/state");
        assert_eq!(body, b"get");

        assert!(matches!(
            engine.request_state("rm/den").await,
            Err(SendError::Lookup(RegistryError::UnknownCommand(_)))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn failed_attempt_waits_for_network() {
        let engine = engine_for(unused_port().await);
        assert!(!engine.connect().await);
        wait_for_state(&engine, ConnectionState::WaitingForNetwork).await;

        // The failed attempt is not cached
        assert!(!engine.connect().await);
        engine.shutdown().await;
        assert!(!engine.connect().await);
    }

    #[tokio::test]
    async fn lost_session_reconnects_through_the_gate() {
        let broker = FakeBroker::start(BrokerBehaviour {
            drop_after_suback: true,
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_for(broker.port());
        engine.notify_connectivity(true);
        assert!(engine.connect().await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connections() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reconfigure_moves_to_new_broker() {
        let first = FakeBroker::start(BrokerBehaviour::default()).await;
        let second = FakeBroker::start(BrokerBehaviour::default()).await;
        let engine = engine_for(first.port());
        assert!(engine.connect().await);

        let same = MqttConfig {
            publish_timeout: Duration::from_secs(9),
            ..engine.config()
        };
        assert!(!engine.reconfigure(same));
        assert!(engine.is_connected());

        let moved = MqttConfig {
            port: second.port(),
            ..engine.config()
        };
        assert!(engine.reconfigure(moved));
        wait_for_state(&engine, ConnectionState::Connected).await;
        assert_eq!(second.connections(), 1);
        assert_eq!(first.connections(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reconfigure_to_nothing_idles() {
        let broker = FakeBroker::start(BrokerBehaviour::default()).await;
        let engine = engine_for(broker.port());
        assert!(engine.connect().await);

        assert!(engine.reconfigure(MqttConfig::unconfigured()));
        assert_eq!(engine.state(), ConnectionState::Idle);
        assert!(!engine.is_connected());
        assert!(!engine.connect().await);
    }

    #[tokio::test]
    async fn first_loss_reconnects_without_backoff() {
        let broker = FakeBroker::start(BrokerBehaviour {
            drop_after_suback: true,
            ..BrokerBehaviour::default()
        })
        .await;
        let engine = engine_with_backoff(broker.port(), Duration::from_secs(30));
        engine.notify_connectivity(true);
        assert!(engine.connect().await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connections() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        // The second loss on the same network has to sit out the backoff
        wait_for_state(&engine, ConnectionState::BackoffWait).await;
        assert_eq!(broker.connections(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn new_session_ignores_waiters_of_the_old_one() {
        let first = FakeBroker::start(BrokerBehaviour::default()).await;
        let mut second = FakeBroker::start(BrokerBehaviour::default()).await;
        let engine = engine_for(first.port());
        assert!(engine.connect().await);

        let (_, old_acks) = engine.live_session().unwrap();
        let _stale = old_acks.enqueue().await;

        let moved = MqttConfig {
            port: second.port(),
            ..engine.config()
        };
        assert!(engine.reconfigure(moved));
        wait_for_state(&engine, ConnectionState::Connected).await;

        let command = Command::state("", "ON", "s20/lamp", "1");
        engine.send(&command).await.unwrap();
        let (topic, _) = second.next_published().await.unwrap();
        assert_eq!(topic, "cmnd/s20/lamp/state");
        engine.shutdown().await;
    }
}
