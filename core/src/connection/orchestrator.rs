//! Connection orchestrator
//!
//! One tokio task per peripheral owns every piece of link state. BLE
//! callbacks, caller requests and timers all arrive as [`Input`] messages
//! or deadlines and are processed serially, so the pairing and handshake
//! machines, the dispatcher and the reconnect policy never race.
//!
//! Lifecycle of a connection cycle:
//!
//! 1. `connect()` publishes `PreparingToConnect`, arms the watchdog and asks
//!    the bridge to connect.
//! 2. Pairing, handshake and startup commands advance the progress scale.
//! 3. Any failure publishes `Disconnected(Some(err))`, cancels the link if it
//!    is still up and schedules a reconnect with exponential backoff.
//! 4. The watchdog ends the cycle with exactly one
//!    `Disconnected(ConnectionTimeout)` if `Connected` is not reached in time.

use super::initialization::{InitializationState, InitializationStateMachine};
use super::pairing::{PairingState, PairingStateMachine};
use super::state::{ConnectionState, ConnectionStateStream, StatePublisher};
use crate::config::SdkConfig;
use crate::dispatch::{CommandError, Dispatcher, NotificationSender};
use crate::error::TagError;
use crate::protocol::{NotificationKind, Request, Response};
use crate::tag::{ConnectedTag, TagMetadata};
use crate::transport::ble::{BleEvent, CentralBridge, PeripheralId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pairing steps occupy 1..=4 on the progress scale
const PAIRING_STEPS: usize = 4;
/// Handshake steps occupy 5..=9
const HANDSHAKE_STEPS: usize = 5;

/// Messages processed by a peripheral's orchestrator task
pub(crate) enum Input {
    Ble {
        peripheral: PeripheralId,
        event: BleEvent,
    },
    Connect {
        reply: oneshot::Sender<ConnectionStateStream>,
    },
    Disconnect {
        reply: oneshot::Sender<ConnectionStateStream>,
    },
    Enqueue {
        generation: u64,
        request: Request,
        retries: u32,
        timeout: Duration,
        reply: oneshot::Sender<Result<Response, CommandError>>,
    },
    Subscribe {
        generation: u64,
        kind: Option<NotificationKind>,
        sender: NotificationSender,
    },
    SubscriptionsReady {
        generation: u64,
    },
    Shutdown,
}

/// Cheap handle to a running orchestrator
#[derive(Clone)]
pub(crate) struct OrchestratorHandle {
    inputs: mpsc::UnboundedSender<Input>,
    publisher: StatePublisher,
}

impl OrchestratorHandle {
    /// Spawn the orchestrator task for `peripheral`
    pub(crate) fn spawn(
        peripheral: PeripheralId,
        bridge: Arc<dyn CentralBridge>,
        config: Arc<SdkConfig>,
    ) -> Self {
        let (inputs, receiver) = mpsc::unbounded_channel();
        let publisher = StatePublisher::new(config.state_channel_capacity);
        let orchestrator = Orchestrator::new(
            peripheral,
            bridge,
            config,
            publisher.clone(),
            inputs.downgrade(),
        );
        tokio::spawn(
            orchestrator
                .run(receiver)
                .instrument(info_span!("tag", peripheral = %peripheral)),
        );
        Self { inputs, publisher }
    }

    pub(crate) async fn connect(&self) -> Result<ConnectionStateStream, TagError> {
        let (reply, stream) = oneshot::channel();
        self.inputs
            .send(Input::Connect { reply })
            .map_err(|_| TagError::ShutDown)?;
        stream.await.map_err(|_| TagError::ShutDown)
    }

    pub(crate) async fn disconnect(&self) -> Result<ConnectionStateStream, TagError> {
        let (reply, stream) = oneshot::channel();
        self.inputs
            .send(Input::Disconnect { reply })
            .map_err(|_| TagError::ShutDown)?;
        stream.await.map_err(|_| TagError::ShutDown)
    }

    pub(crate) fn observe(&self) -> ConnectionStateStream {
        self.publisher.subscribe()
    }

    pub(crate) fn latest(&self) -> ConnectionState {
        self.publisher.latest()
    }

    /// Forward a BLE callback; false once the task has stopped
    pub(crate) fn post(&self, peripheral: PeripheralId, event: BleEvent) -> bool {
        self.inputs.send(Input::Ble { peripheral, event }).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }
}

enum Phase {
    /// No cycle running
    Idle,
    Pairing(PairingStateMachine),
    Initializing(InitializationStateMachine),
    Configuring {
        metadata: TagMetadata,
        next_command: usize,
    },
    Connected,
    /// Link cancelled, waiting for the bridge to report the disconnect
    AwaitingLinkDown,
    /// Reconnect scheduled at `reconnect_at`
    Reconnecting,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Pairing(_) => "pairing",
            Phase::Initializing(_) => "initializing",
            Phase::Configuring { .. } => "configuring",
            Phase::Connected => "connected",
            Phase::AwaitingLinkDown => "awaiting link down",
            Phase::Reconnecting => "reconnecting",
        }
    }
}

struct Orchestrator {
    peripheral: PeripheralId,
    bridge: Arc<dyn CentralBridge>,
    config: Arc<SdkConfig>,
    publisher: StatePublisher,
    /// Handed to every `ConnectedTag`; only handles keep the task alive
    inputs: mpsc::WeakUnboundedSender<Input>,
    phase: Phase,
    dispatcher: Option<Dispatcher>,
    /// Handshake write acks still owed by the tag, never routed to the dispatcher
    handshake_acks: usize,
    startup_reply: Option<oneshot::Receiver<Result<Response, CommandError>>>,
    link_up: bool,
    user_disconnect: bool,
    timed_out: bool,
    watchdog: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    generation: u64,
}

impl Orchestrator {
    fn new(
        peripheral: PeripheralId,
        bridge: Arc<dyn CentralBridge>,
        config: Arc<SdkConfig>,
        publisher: StatePublisher,
        inputs: mpsc::WeakUnboundedSender<Input>,
    ) -> Self {
        Self {
            peripheral,
            bridge,
            config,
            publisher,
            inputs,
            phase: Phase::Idle,
            dispatcher: None,
            handshake_acks: 0,
            startup_reply: None,
            link_up: false,
            user_disconnect: false,
            timed_out: false,
            watchdog: None,
            reconnect_at: None,
            reconnect_attempt: 0,
            generation: 0,
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Input>) {
        debug!("Orchestrator started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                input = receiver.recv() => match input {
                    Some(Input::Shutdown) | None => break,
                    Some(input) => self.handle_input(input),
                },
                _ = Self::sleep_until_deadline(deadline) => self.on_deadline(Instant::now()),
                result = Self::startup_result(&mut self.startup_reply) => {
                    self.startup_reply = None;
                    self.on_startup_result(result);
                }
            }
        }
        self.teardown();
        debug!("Orchestrator stopped");
    }

    async fn sleep_until_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn startup_result(
        reply: &mut Option<oneshot::Receiver<Result<Response, CommandError>>>,
    ) -> Result<Response, CommandError> {
        match reply {
            Some(reply) => reply.await.unwrap_or(Err(CommandError::Disconnected)),
            None => std::future::pending().await,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.watchdog,
            self.reconnect_at,
            self.dispatcher.as_ref().and_then(Dispatcher::next_deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn total_steps(&self) -> usize {
        PAIRING_STEPS + HANDSHAKE_STEPS + 1 + self.config.startup_commands.len()
    }

    fn publish(&self, state: ConnectionState) {
        debug!("State -> {}", state);
        self.publisher.publish(state);
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Ble { peripheral, event } => self.on_ble_event(peripheral, event),
            Input::Connect { reply } => self.on_connect(reply),
            Input::Disconnect { reply } => self.on_disconnect(reply),
            Input::Enqueue {
                generation,
                request,
                retries,
                timeout,
                reply,
            } => match self.live_dispatcher(generation) {
                Some(dispatcher) => {
                    dispatcher.enqueue(request, retries, timeout, reply, Instant::now())
                }
                None => {
                    let _ = reply.send(Err(CommandError::Disconnected));
                }
            },
            Input::Subscribe {
                generation,
                kind,
                sender,
            } => match self.live_dispatcher(generation) {
                Some(dispatcher) => dispatcher.subscribe(kind, sender),
                None => {
                    let _ = sender.send(Err(CommandError::Disconnected));
                }
            },
            Input::SubscriptionsReady { generation } => {
                if let Some(dispatcher) = self.live_dispatcher(generation) {
                    dispatcher.subscriptions_ready();
                }
            }
            Input::Shutdown => {}
        }
    }

    /// The dispatcher, if `generation` is the link currently connected
    fn live_dispatcher(&mut self, generation: u64) -> Option<&mut Dispatcher> {
        if !matches!(self.phase, Phase::Connected) || generation != self.generation {
            debug!("Rejecting request for stale link generation {}", generation);
            return None;
        }
        self.dispatcher.as_mut()
    }

    fn on_connect(&mut self, reply: oneshot::Sender<ConnectionStateStream>) {
        match self.phase {
            Phase::Idle => {
                info!("Connecting");
                self.user_disconnect = false;
                self.timed_out = false;
                self.reconnect_attempt = 0;
                let _ = reply.send(self.publisher.subscribe_live());
                self.begin_attempt();
            }
            Phase::AwaitingLinkDown if self.user_disconnect => {
                // reconnect once the cancelled link reports down
                info!("Connect requested while disconnecting");
                self.user_disconnect = false;
                self.timed_out = false;
                self.reconnect_attempt = 0;
                let _ = reply.send(self.publisher.subscribe_live());
            }
            _ => {
                debug!("Connect while {}, replaying state", self.phase.name());
                let _ = reply.send(self.publisher.subscribe());
            }
        }
    }

    fn on_disconnect(&mut self, reply: oneshot::Sender<ConnectionStateStream>) {
        info!("Disconnect requested while {}", self.phase.name());
        let _ = reply.send(self.publisher.subscribe_live());
        self.user_disconnect = true;
        self.watchdog = None;
        self.reconnect_at = None;
        self.teardown_dispatcher();

        let had_cycle = !matches!(self.phase, Phase::Idle);
        match self.phase {
            Phase::AwaitingLinkDown => {}
            _ if self.link_up => {
                self.cancel_link();
                self.phase = Phase::AwaitingLinkDown;
            }
            _ => {
                if had_cycle {
                    // a connect may still be pending at the platform
                    self.cancel_link();
                }
                self.phase = Phase::Idle;
                self.publish(ConnectionState::Disconnected(None));
            }
        }
    }

    /// Start one connection attempt within the current cycle
    fn begin_attempt(&mut self) {
        self.reconnect_at = None;
        self.publish(ConnectionState::PreparingToConnect);
        if self.watchdog.is_none() {
            self.watchdog = Some(Instant::now() + self.config.connection_timeout());
        }
        self.phase = Phase::Pairing(PairingStateMachine::new(
            self.bridge.clone(),
            self.peripheral,
            &self.config,
        ));
        if let Err(e) = self.bridge.connect(&self.peripheral) {
            self.fail(TagError::PlatformBridgeError(e));
        }
    }

    fn on_ble_event(&mut self, peripheral: PeripheralId, event: BleEvent) {
        if peripheral != self.peripheral {
            error!("Received {} for foreign peripheral {}", event, peripheral);
            return;
        }
        match &event {
            BleEvent::DidConnect { .. } => {
                self.link_up = true;
                if !matches!(self.phase, Phase::Pairing(_)) {
                    warn!("Late connection while {}, cancelling", self.phase.name());
                    self.cancel_link();
                    return;
                }
            }
            BleEvent::DidDisconnect { error } => {
                self.on_link_down(error.clone());
                return;
            }
            _ => {}
        }
        if self.timed_out {
            debug!("Ignoring {} after timeout", event);
            return;
        }

        let now = Instant::now();
        let phase_name = self.phase.name();
        match &mut self.phase {
            Phase::Pairing(pairing) => {
                if let Some(state) = pairing.handle(&peripheral, &event) {
                    self.on_pairing_state(state);
                }
            }
            Phase::Initializing(initialization) => {
                let notify = self.config.characteristics.notify;
                match &event {
                    BleEvent::DidUpdateValue {
                        characteristic,
                        value,
                        error: None,
                    } if *characteristic == notify => {
                        if let Some(dispatcher) = self.dispatcher.as_mut() {
                            dispatcher.handle_notification_fragment(value);
                        }
                    }
                    _ => {
                        let states = initialization.handle(&event);
                        self.on_initialization_states(states);
                    }
                }
            }
            Phase::Configuring { .. } | Phase::Connected => {
                if self.handshake_acks > 0 {
                    if let BleEvent::DidWriteValue { characteristic, .. } = &event {
                        if *characteristic == self.config.characteristics.command {
                            self.handshake_acks -= 1;
                            debug!("Late handshake ack, {} still owed", self.handshake_acks);
                            return;
                        }
                    }
                }
                if let Some(dispatcher) = self.dispatcher.as_mut() {
                    dispatcher.handle_event(&event, now);
                }
            }
            _ => debug!("Ignoring {} while {}", event, phase_name),
        }
    }

    fn on_pairing_state(&mut self, state: PairingState) {
        let total = self.total_steps();
        let step = match state {
            PairingState::Disconnected => return,
            PairingState::BluetoothConnected => 1,
            PairingState::ServicesDiscovered => 2,
            PairingState::AwaitingNotificationUpdates => 3,
            PairingState::TagPaired(paired) => {
                self.publish(ConnectionState::Connecting {
                    step: PAIRING_STEPS,
                    total,
                });
                info!("Paired, mtu {}", paired.mtu);
                self.on_paired(paired);
                return;
            }
            PairingState::Error(e) => {
                self.fail(e.into());
                return;
            }
        };
        self.publish(ConnectionState::Connecting { step, total });
    }

    fn on_paired(&mut self, paired: super::pairing::PairedTag) {
        // notifications may arrive during the handshake, buffer them from here
        let dispatcher = Dispatcher::new(
            self.bridge.clone(),
            self.peripheral,
            self.config.characteristics,
            paired.mtu,
            self.config.notification_buffer_limit,
        );
        let initialization =
            InitializationStateMachine::new(self.bridge.clone(), paired, &self.config);
        match (dispatcher, initialization) {
            (Ok(dispatcher), Ok(mut initialization)) => {
                self.dispatcher = Some(dispatcher);
                let states = initialization.start();
                self.phase = Phase::Initializing(initialization);
                self.on_initialization_states(states);
            }
            (Err(e), _) => self.fail(TagError::Initialization(e.into())),
            (_, Err(e)) => self.fail(e.into()),
        }
    }

    fn on_initialization_states(&mut self, states: Vec<InitializationState>) {
        let total = self.total_steps();
        for state in states {
            let step = match state {
                InitializationState::Paired => continue,
                InitializationState::HelloSent => 1,
                InitializationState::HelloAcked(_) => 2,
                InitializationState::BeginSent => 3,
                InitializationState::BeginAcked(_) => 4,
                InitializationState::CreatingTagInstance => 5,
                InitializationState::TagInitialized(metadata) => {
                    self.on_initialized(metadata);
                    return;
                }
                InitializationState::Error(e) => {
                    self.fail(e.into());
                    return;
                }
            };
            self.publish(ConnectionState::Initializing {
                step: PAIRING_STEPS + step,
                total,
            });
        }
    }

    fn on_initialized(&mut self, metadata: TagMetadata) {
        info!(
            "Initialized {} (firmware {}, protocol {})",
            metadata.name, metadata.firmware_version, metadata.protocol
        );
        if let Phase::Initializing(initialization) = &self.phase {
            self.handshake_acks = initialization.unacknowledged_writes();
        }
        self.phase = Phase::Configuring {
            metadata,
            next_command: 0,
        };
        // dispatcher attached
        self.publish(ConnectionState::Configuring {
            step: PAIRING_STEPS + HANDSHAKE_STEPS + 1,
            total: self.total_steps(),
        });
        self.send_next_startup_command();
    }

    fn send_next_startup_command(&mut self) {
        let Phase::Configuring { next_command, .. } = &self.phase else {
            return;
        };
        let index = *next_command;
        let Some(request) = self.config.startup_commands.get(index).cloned() else {
            self.on_configured();
            return;
        };
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            self.fail(TagError::StartupCommand(CommandError::Disconnected));
            return;
        };
        debug!("Startup command {}: {}/{}", index, request.domain, request.opcode);
        let (reply, result) = oneshot::channel();
        dispatcher.enqueue(
            request,
            self.config.command_retries,
            self.config.command_timeout(),
            reply,
            Instant::now(),
        );
        self.startup_reply = Some(result);
    }

    fn on_startup_result(&mut self, result: Result<Response, CommandError>) {
        let Phase::Configuring { next_command, .. } = &mut self.phase else {
            debug!("Dropping startup command result outside configuration");
            return;
        };
        match result {
            Ok(_) => {
                *next_command += 1;
                let step = PAIRING_STEPS + HANDSHAKE_STEPS + 1 + *next_command;
                self.publish(ConnectionState::Configuring {
                    step,
                    total: self.total_steps(),
                });
                self.send_next_startup_command();
            }
            Err(e) => self.fail(TagError::StartupCommand(e)),
        }
    }

    fn on_configured(&mut self) {
        let Phase::Configuring { metadata, .. } = std::mem::replace(&mut self.phase, Phase::Connected)
        else {
            return;
        };
        self.generation += 1;
        self.watchdog = None;
        self.reconnect_attempt = 0;
        self.user_disconnect = false;
        info!("Connected to {} (generation {})", metadata.name, self.generation);
        let tag = ConnectedTag::new(
            metadata,
            self.generation,
            self.config.command_retries,
            self.config.command_timeout(),
            self.inputs.clone(),
        );
        self.publish(ConnectionState::Connected(tag));
    }

    /// Attempt failed: report it and retry the cycle
    fn fail(&mut self, error: TagError) {
        if self.timed_out {
            return;
        }
        warn!("Connection attempt failed while {}: {}", self.phase.name(), error);
        self.teardown_dispatcher();
        self.publish(ConnectionState::Disconnected(Some(error)));
        if self.user_disconnect {
            self.phase = Phase::Idle;
        } else if self.link_up {
            self.cancel_link();
            self.phase = Phase::AwaitingLinkDown;
        } else {
            self.schedule_reconnect();
        }
    }

    fn on_link_down(&mut self, error: Option<String>) {
        self.link_up = false;
        match self.phase {
            Phase::AwaitingLinkDown => {
                if self.user_disconnect {
                    info!("Disconnected");
                    self.phase = Phase::Idle;
                    self.publish(ConnectionState::Disconnected(None));
                } else {
                    self.schedule_reconnect();
                }
            }
            Phase::Pairing(_) | Phase::Initializing(_) | Phase::Configuring { .. } | Phase::Connected => {
                warn!("Link lost while {}: {:?}", self.phase.name(), error);
                self.teardown_dispatcher();
                self.publish(ConnectionState::Disconnected(Some(TagError::LinkLost(error))));
                self.schedule_reconnect();
            }
            Phase::Idle | Phase::Reconnecting => {
                debug!("Link down while {}", self.phase.name());
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.reconnect_delay(self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        info!("Reconnecting in {:?} (attempt {})", delay, self.reconnect_attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.phase = Phase::Reconnecting;
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.watchdog.is_some_and(|deadline| deadline <= now) {
            self.on_timeout();
            return;
        }
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            if matches!(self.phase, Phase::Reconnecting) {
                self.begin_attempt();
            }
        }
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.poll_timeouts(now);
        }
    }

    fn on_timeout(&mut self) {
        warn!(
            "Connection timed out after {:?} while {}",
            self.config.connection_timeout(),
            self.phase.name()
        );
        self.watchdog = None;
        self.reconnect_at = None;
        self.timed_out = true;
        self.teardown_dispatcher();
        self.phase = Phase::Idle;
        self.cancel_link();
        self.publish(ConnectionState::Disconnected(Some(TagError::ConnectionTimeout)));
    }

    fn cancel_link(&self) {
        if let Err(e) = self.bridge.cancel_connection(&self.peripheral) {
            warn!("Cancel connection failed: {}", e);
        }
    }

    fn teardown_dispatcher(&mut self) {
        self.startup_reply = None;
        self.handshake_acks = 0;
        if let Some(mut dispatcher) = self.dispatcher.take() {
            debug!(
                "Tearing down dispatcher with {} pending commands",
                dispatcher.pending_commands()
            );
            dispatcher.shutdown();
        }
    }

    fn teardown(&mut self) {
        self.teardown_dispatcher();
        if self.link_up || !matches!(self.phase, Phase::Idle) {
            self.cancel_link();
        }
        self.watchdog = None;
        self.reconnect_at = None;
        self.phase = Phase::Idle;
        if !matches!(self.publisher.latest(), ConnectionState::Disconnected(None)) {
            self.publish(ConnectionState::Disconnected(Some(TagError::ShutDown)));
        }
        self.publisher.close();
    }
}
