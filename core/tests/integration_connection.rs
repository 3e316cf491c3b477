//! Connection lifecycle integration tests
//!
//! Drives `TagManager` against the in-process `SimulatedTag` with a paused
//! tokio clock, so reconnect backoff and the connection watchdog run
//! deterministically.
//!
//! Run with: cargo test --test integration_connection

use jacquard_core::connection::{InitializationError, PairingError};
use jacquard_core::{
    CommandError, ConnectedTag, ConnectionState, ConnectionStateStream, Domain, PeripheralId,
    Request, SdkConfig, SimulatedTag, TagError, TagManager,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn peripheral() -> PeripheralId {
    PeripheralId::new(Uuid::from_u128(0x7A6_0001))
}

fn setup(tag: SimulatedTag, config: SdkConfig) -> (Arc<SimulatedTag>, TagManager) {
    let tag = Arc::new(tag);
    let manager = TagManager::new(tag.clone(), config).expect("manager");
    tag.attach(manager.event_sink());
    (tag, manager)
}

async fn until_settled(stream: &mut ConnectionStateStream) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Some(state) = stream.next().await {
        let settled = state.is_settled();
        states.push(state);
        if settled {
            break;
        }
    }
    states
}

async fn connect(manager: &TagManager) -> (ConnectionStateStream, ConnectedTag) {
    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let states = until_settled(&mut stream).await;
    match states.last() {
        Some(ConnectionState::Connected(tag)) => {
            let tag = tag.clone();
            (stream, tag)
        }
        other => panic!("connection did not settle as connected: {:?}", other),
    }
}

fn steps(states: &[ConnectionState]) -> Vec<usize> {
    states
        .iter()
        .filter_map(ConnectionState::progress)
        .map(|(step, _)| step)
        .collect()
}

/// Read states until nothing happens for `quiet`
async fn drain(stream: &mut ConnectionStateStream, quiet: Duration) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(quiet, stream.next()).await {
        states.push(state);
    }
    states
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_every_step_in_order() {
    let config = SdkConfig::default().with_startup_command(Request::new(Domain::Base, 30, vec![]));
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), config);

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let states = until_settled(&mut stream).await;

    assert!(matches!(states.first(), Some(ConnectionState::PreparingToConnect)));
    assert_eq!(steps(&states), (1..=11).collect::<Vec<_>>());
    assert!(states
        .iter()
        .filter_map(ConnectionState::progress)
        .all(|(_, total)| total == 11));
    assert!(states[1..5]
        .iter()
        .all(|s| matches!(s, ConnectionState::Connecting { .. })));
    assert!(states[5..10]
        .iter()
        .all(|s| matches!(s, ConnectionState::Initializing { .. })));
    assert!(states[10..12]
        .iter()
        .all(|s| matches!(s, ConnectionState::Configuring { .. })));
    assert!(states.iter().all(|s| s.error().is_none()));

    match states.last() {
        Some(ConnectionState::Connected(connected)) => {
            let metadata = connected.metadata();
            assert_eq!(metadata.name, "Simulated Tag");
            assert_eq!(metadata.protocol, 2);
            assert_eq!(metadata.notification_queue_depth, 14);
            assert_eq!(metadata.mtu, 185);
        }
        other => panic!("unexpected final state {:?}", other),
    }
    assert_eq!(tag.requests_for(Domain::Base, 30), 1);
    assert_eq!(manager.connected_peripherals(), vec![peripheral()]);
}

#[tokio::test(start_paused = true)]
async fn test_hello_write_failure_reconnects_automatically() {
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), SdkConfig::default());
    tag.fail_next_writes(1);

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let failed = until_settled(&mut stream).await;
    assert!(matches!(failed.first(), Some(ConnectionState::PreparingToConnect)));
    assert_eq!(steps(&failed), vec![1, 2, 3, 4, 5]);
    assert!(matches!(
        failed.last(),
        Some(ConnectionState::Disconnected(Some(TagError::Initialization(
            InitializationError::WriteFailed(_)
        ))))
    ));

    let retried = until_settled(&mut stream).await;
    assert!(matches!(retried.first(), Some(ConnectionState::PreparingToConnect)));
    assert!(matches!(retried[1], ConnectionState::Connecting { step: 1, .. }));
    assert!(retried.last().map(ConnectionState::is_connected).unwrap_or(false));

    assert_eq!(tag.connect_count(), 2);
    assert_eq!(tag.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_handshake_ack_does_not_mask_startup_write_error() {
    let config = SdkConfig::default()
        .with_startup_command(Request::new(Domain::Base, 30, vec![]))
        .with_command_policy(8000, 0);
    let (tag, manager) = setup(
        SimulatedTag::new(peripheral()).with_deferred_write_acks(),
        config,
    );
    // hello, begin, then the startup command
    tag.fail_write_at(3);

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let failed = until_settled(&mut stream).await;
    match failed.last() {
        Some(ConnectionState::Disconnected(Some(TagError::StartupCommand(
            CommandError::WriteFailed(e),
        )))) => assert_eq!(e, "simulated write failure"),
        other => panic!("unexpected settled state {:?}", other),
    }
    assert_eq!(tag.requests_for(Domain::Base, 30), 0);

    let retried = until_settled(&mut stream).await;
    assert!(retried.last().map(ConnectionState::is_connected).unwrap_or(false));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_exactly_once_without_reconnect() {
    let config = SdkConfig::default().with_connection_timeout(5);
    let (tag, manager) = setup(SimulatedTag::new(peripheral()).with_hello(None), config);

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let states = until_settled(&mut stream).await;
    assert_eq!(steps(&states), vec![1, 2, 3, 4, 5]);
    assert!(states
        .last()
        .and_then(ConnectionState::error)
        .map(TagError::is_timeout)
        .unwrap_or(false));

    assert!(drain(&mut stream, Duration::from_secs(120)).await.is_empty());
    assert_eq!(tag.connect_count(), 1);
    assert!(!tag.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_error_retries_share_one_watchdog() {
    let config = SdkConfig::default()
        .with_connection_timeout(10)
        .with_reconnect_interval(500, 1000);
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), config);
    tag.set_write_error(Some("gatt 133".to_string()));

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let states = drain(&mut stream, Duration::from_secs(60)).await;

    let timeouts = states
        .iter()
        .filter(|s| s.error().map(TagError::is_timeout).unwrap_or(false))
        .count();
    assert_eq!(timeouts, 1);
    assert!(states
        .last()
        .and_then(ConnectionState::error)
        .map(TagError::is_timeout)
        .unwrap_or(false));
    assert!(tag.connect_count() > 2);
    assert!(!states.iter().any(ConnectionState::is_connected));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_suppresses_reconnection() {
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), SdkConfig::default());
    let (_connect_stream, connected) = connect(&manager).await;

    let mut stream = manager.disconnect(&connected).await.expect("disconnect");
    assert!(matches!(stream.next().await, Some(ConnectionState::Disconnected(None))));

    assert!(drain(&mut stream, Duration::from_secs(120)).await.is_empty());
    assert_eq!(tag.connect_count(), 1);
    assert!(manager.connected_peripherals().is_empty());
    assert_eq!(
        connected.enqueue(Request::new(Domain::Base, 30, vec![])).await,
        Err(CommandError::Disconnected)
    );

    // a new connect clears the disconnect request
    let (_stream, again) = connect(&manager).await;
    assert_eq!(again.generation(), connected.generation() + 1);
    assert_eq!(tag.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_disconnect_reconnects() {
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), SdkConfig::default());
    let (mut stream, first) = connect(&manager).await;

    tag.drop_link();
    let lost = until_settled(&mut stream).await;
    assert!(matches!(
        lost.as_slice(),
        [ConnectionState::Disconnected(Some(TagError::LinkLost(Some(_))))]
    ));

    let recovered = until_settled(&mut stream).await;
    assert!(matches!(recovered.first(), Some(ConnectionState::PreparingToConnect)));
    let second = match recovered.last() {
        Some(ConnectionState::Connected(tag)) => tag.clone(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(tag.connect_count(), 2);

    assert_eq!(
        first.enqueue(Request::new(Domain::Base, 30, vec![])).await,
        Err(CommandError::Disconnected)
    );
    assert!(second
        .enqueue(Request::new(Domain::Base, 30, vec![]))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_retried() {
    let tag = SimulatedTag::new(peripheral()).with_connect_error("peripheral out of range");
    let (tag, manager) = setup(tag, SdkConfig::default());

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let failed = until_settled(&mut stream).await;
    assert!(matches!(
        failed.last(),
        Some(ConnectionState::Disconnected(Some(TagError::Pairing(
            PairingError::ConnectFailed(_)
        ))))
    ));

    tag.set_connect_error(None);
    let retried = until_settled(&mut stream).await;
    assert!(retried.last().map(ConnectionState::is_connected).unwrap_or(false));
    assert_eq!(tag.cancel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_service_is_reported() {
    let tag = SimulatedTag::new(peripheral()).with_services(vec![Uuid::from_u128(0x180F)]);
    let (_tag, manager) = setup(tag, SdkConfig::default());

    let mut stream = manager.connect(peripheral()).await.expect("connect");
    let states = until_settled(&mut stream).await;
    assert_eq!(steps(&states), vec![1]);
    assert!(matches!(
        states.last(),
        Some(ConnectionState::Disconnected(Some(TagError::Pairing(
            PairingError::ServiceNotFound
        ))))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_observe_replays_connected_state() {
    let (_tag, manager) = setup(SimulatedTag::new(peripheral()), SdkConfig::default());
    let (_stream, connected) = connect(&manager).await;

    let mut observer = manager.observe(peripheral()).expect("observe");
    match observer.next().await {
        Some(ConnectionState::Connected(tag)) => {
            assert_eq!(tag.generation(), connected.generation())
        }
        other => panic!("unexpected {:?}", other),
    }

    // connect while connected hands back the same state
    let mut replay = manager.connect(peripheral()).await.expect("connect");
    assert!(matches!(replay.next().await, Some(ConnectionState::Connected(_))));
}

#[tokio::test(start_paused = true)]
async fn test_remove_tears_down_the_link() {
    let (tag, manager) = setup(SimulatedTag::new(peripheral()), SdkConfig::default());
    let (mut stream, connected) = connect(&manager).await;

    assert!(manager.remove(peripheral()));
    assert!(matches!(
        stream.next().await,
        Some(ConnectionState::Disconnected(Some(TagError::ShutDown)))
    ));
    assert!(stream.next().await.is_none());
    assert!(!tag.is_connected());
    assert_eq!(
        connected.enqueue(Request::new(Domain::Base, 30, vec![])).await,
        Err(CommandError::Disconnected)
    );
}
