//! Public connection state and its multicast stream

use crate::error::TagError;
use crate::tag::ConnectedTag;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Caller-visible connection progress.
///
/// `step`/`total` are one progress scale across an attempt: pairing covers
/// the first steps, the handshake the middle ones and configuration the rest.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    PreparingToConnect,
    Connecting { step: usize, total: usize },
    Initializing { step: usize, total: usize },
    Configuring { step: usize, total: usize },
    Connected(ConnectedTag),
    /// `None` when the caller asked for the disconnect
    Disconnected(Option<TagError>),
}

impl ConnectionState {
    /// Connected and Disconnected are the only settled states
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected(_) | ConnectionState::Disconnected(_)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// `(step, total)` for in-progress states
    pub fn progress(&self) -> Option<(usize, usize)> {
        match self {
            ConnectionState::Connecting { step, total }
            | ConnectionState::Initializing { step, total }
            | ConnectionState::Configuring { step, total } => Some((*step, *total)),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TagError> {
        match self {
            ConnectionState::Disconnected(error) => error.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::PreparingToConnect => write!(f, "preparing to connect"),
            ConnectionState::Connecting { step, total } => write!(f, "connecting ({}/{})", step, total),
            ConnectionState::Initializing { step, total } => {
                write!(f, "initializing ({}/{})", step, total)
            }
            ConnectionState::Configuring { step, total } => write!(f, "configuring ({}/{})", step, total),
            ConnectionState::Connected(tag) => write!(f, "connected to {}", tag.metadata().name),
            ConnectionState::Disconnected(None) => write!(f, "disconnected"),
            ConnectionState::Disconnected(Some(error)) => write!(f, "disconnected: {}", error),
        }
    }
}

struct PublisherInner {
    latest: ConnectionState,
    sender: Option<broadcast::Sender<ConnectionState>>,
}

/// Latest-value cell plus broadcast of every transition
#[derive(Clone)]
pub(crate) struct StatePublisher {
    inner: Arc<Mutex<PublisherInner>>,
}

impl StatePublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Mutex::new(PublisherInner {
                latest: ConnectionState::Disconnected(None),
                sender: Some(sender),
            })),
        }
    }

    pub(crate) fn publish(&self, state: ConnectionState) {
        let mut inner = self.inner.lock();
        inner.latest = state.clone();
        if let Some(sender) = &inner.sender {
            // no receivers is fine
            let _ = sender.send(state);
        }
    }

    pub(crate) fn latest(&self) -> ConnectionState {
        self.inner.lock().latest.clone()
    }

    /// Stream starting at the next transition
    pub(crate) fn subscribe_live(&self) -> ConnectionStateStream {
        let inner = self.inner.lock();
        ConnectionStateStream::new(None, Self::receiver(&inner))
    }

    /// Stream replaying the latest value first
    pub(crate) fn subscribe(&self) -> ConnectionStateStream {
        let inner = self.inner.lock();
        ConnectionStateStream::new(Some(inner.latest.clone()), Self::receiver(&inner))
    }

    /// End every stream once buffered states are drained
    pub(crate) fn close(&self) {
        self.inner.lock().sender = None;
    }

    fn receiver(inner: &PublisherInner) -> broadcast::Receiver<ConnectionState> {
        match &inner.sender {
            Some(sender) => sender.subscribe(),
            // closed channel: the receiver reports Closed immediately
            None => broadcast::channel(1).1,
        }
    }
}

/// Connection states of one peripheral, in order
pub struct ConnectionStateStream {
    replay: Option<ConnectionState>,
    receiver: broadcast::Receiver<ConnectionState>,
}

impl ConnectionStateStream {
    fn new(replay: Option<ConnectionState>, receiver: broadcast::Receiver<ConnectionState>) -> Self {
        Self { replay, receiver }
    }

    /// Next state, or `None` once the connection is torn down
    pub async fn next(&mut self) -> Option<ConnectionState> {
        if let Some(state) = self.replay.take() {
            return Some(state);
        }
        loop {
            match self.receiver.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Connection state observer lagged, skipped {} states", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Skip to the next Connected or Disconnected state
    pub async fn settled(&mut self) -> Option<ConnectionState> {
        loop {
            let state = self.next().await?;
            if state.is_settled() {
                return Some(state);
            }
        }
    }
}

impl fmt::Debug for ConnectionStateStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateStream")
            .field("replay", &self.replay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pairing::PairingError;

    #[tokio::test]
    async fn test_live_stream_starts_at_next_transition() {
        let publisher = StatePublisher::new(8);
        publisher.publish(ConnectionState::PreparingToConnect);

        let mut stream = publisher.subscribe_live();
        publisher.publish(ConnectionState::Connecting { step: 1, total: 10 });

        let state = stream.next().await.expect("state");
        assert_eq!(state.progress(), Some((1, 10)));
    }

    #[tokio::test]
    async fn test_replaying_stream_yields_latest_first() {
        let publisher = StatePublisher::new(8);
        publisher.publish(ConnectionState::Initializing { step: 6, total: 10 });

        let mut stream = publisher.subscribe();
        publisher.publish(ConnectionState::Disconnected(Some(TagError::ConnectionTimeout)));

        assert_eq!(stream.next().await.and_then(|s| s.progress()), Some((6, 10)));
        let settled = stream.settled().await.expect("settled");
        assert!(settled.error().map(TagError::is_timeout).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let publisher = StatePublisher::new(8);
        let mut stream = publisher.subscribe_live();
        publisher.publish(ConnectionState::Disconnected(None));
        publisher.close();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());

        let mut late = publisher.subscribe();
        assert!(late.next().await.is_some());
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_observer_keeps_newest() {
        let publisher = StatePublisher::new(2);
        let mut stream = publisher.subscribe_live();
        for step in 1..=5 {
            publisher.publish(ConnectionState::Connecting { step, total: 10 });
        }
        assert_eq!(stream.next().await.and_then(|s| s.progress()), Some((4, 10)));
    }

    #[test]
    fn test_display() {
        let state = ConnectionState::Disconnected(Some(PairingError::ServiceNotFound.into()));
        assert_eq!(
            state.to_string(),
            "disconnected: Pairing failed: Protocol service not found"
        );
        assert!(state.is_settled());
        assert!(!ConnectionState::PreparingToConnect.is_settled());
    }
}
