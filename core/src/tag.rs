//! Connected tag handle
//!
//! `ConnectedTag` is what callers hold once a connection settles. It is a
//! cheap clone that forwards every request to the peripheral's orchestrator,
//! so it carries no link state of its own.

use crate::connection::orchestrator::Input;
use crate::dispatch::{CommandError, NotificationItem};
use crate::protocol::{
    Command, FirmwareVersion, Notification, NotificationKind, Request, Response, TagNotification,
};
use crate::transport::PeripheralId;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// What the handshake learned about the tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMetadata {
    pub peripheral: PeripheralId,
    pub name: String,
    pub vendor_id: u32,
    pub product_id: u32,
    pub firmware_version: FirmwareVersion,
    /// Negotiated protocol version
    pub protocol: u32,
    /// Queue depth confirmed by the begin response
    pub notification_queue_depth: u32,
    pub mtu: u16,
}

#[derive(Clone)]
pub struct ConnectedTag {
    metadata: Arc<TagMetadata>,
    generation: u64,
    default_retries: u32,
    default_timeout: Duration,
    inputs: mpsc::WeakUnboundedSender<Input>,
}

impl ConnectedTag {
    pub(crate) fn new(
        metadata: TagMetadata,
        generation: u64,
        default_retries: u32,
        default_timeout: Duration,
        inputs: mpsc::WeakUnboundedSender<Input>,
    ) -> Self {
        Self {
            metadata: Arc::new(metadata),
            generation,
            default_retries,
            default_timeout,
            inputs,
        }
    }

    pub fn metadata(&self) -> &TagMetadata {
        &self.metadata
    }

    pub fn peripheral(&self) -> PeripheralId {
        self.metadata.peripheral
    }

    /// Link generation this handle belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send a request with the configured retry count and timeout
    pub async fn enqueue(&self, request: Request) -> Result<Response, CommandError> {
        self.enqueue_with(request, self.default_retries, self.default_timeout)
            .await
    }

    /// Send a request, resending up to `retries` times on write failure or timeout
    pub async fn enqueue_with(
        &self,
        request: Request,
        retries: u32,
        timeout: Duration,
    ) -> Result<Response, CommandError> {
        let (reply, response) = oneshot::channel();
        self.post(Input::Enqueue {
            generation: self.generation,
            request,
            retries,
            timeout,
            reply,
        })
        .map_err(|_| CommandError::Disconnected)?;
        response.await.map_err(|_| CommandError::Disconnected)?
    }

    /// Send a typed command and decode its response
    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Response, CommandError> {
        let request = command
            .to_request()
            .map_err(|e| CommandError::InvalidRequest(e.to_string()))?;
        let response = self.enqueue(request).await?;
        C::parse_response(&response).map_err(|e| CommandError::MalformedResponse(e.to_string()))
    }

    /// Notifications of one kind
    pub fn subscribe(&self, kind: NotificationKind) -> NotificationStream {
        self.open_subscription(Some(kind))
    }

    /// Every notification the tag sends
    pub fn subscribe_all(&self) -> NotificationStream {
        self.open_subscription(None)
    }

    /// Notifications decoded as `N`; undecodable ones are skipped
    pub fn subscribe_typed<N: TagNotification>(&self) -> TypedNotificationStream<N> {
        TypedNotificationStream {
            inner: self.subscribe(N::KIND),
            _marker: PhantomData,
        }
    }

    /// Release notifications buffered since the link came up
    pub fn subscriptions_ready(&self) {
        let ready = Input::SubscriptionsReady {
            generation: self.generation,
        };
        if self.post(ready).is_err() {
            warn!("Tag {} is gone, subscriptions_ready ignored", self.peripheral());
        }
    }

    fn open_subscription(&self, kind: Option<NotificationKind>) -> NotificationStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscribe = Input::Subscribe {
            generation: self.generation,
            kind,
            sender,
        };
        if let Err(Input::Subscribe { sender, .. }) = self.post(subscribe) {
            let _ = sender.send(Err(CommandError::Disconnected));
        }
        NotificationStream { receiver }
    }

    /// Hand `input` to the orchestrator, or back if it has stopped
    fn post(&self, input: Input) -> Result<(), Input> {
        match self.inputs.upgrade() {
            Some(inputs) => inputs
                .send(input)
                .map_err(|mpsc::error::SendError(input)| input),
            None => Err(input),
        }
    }
}

impl fmt::Debug for ConnectedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedTag")
            .field("peripheral", &self.metadata.peripheral)
            .field("name", &self.metadata.name)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Stream of notifications for one subscription.
///
/// Ends after yielding `Err(CommandError::Disconnected)` when the link goes
/// away. Dropping the stream cancels the subscription.
pub struct NotificationStream {
    receiver: mpsc::UnboundedReceiver<NotificationItem>,
}

impl NotificationStream {
    pub async fn recv(&mut self) -> Option<Result<Notification, CommandError>> {
        self.receiver.recv().await
    }
}

impl Stream for NotificationStream {
    type Item = Result<Notification, CommandError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

pub struct TypedNotificationStream<N> {
    inner: NotificationStream,
    _marker: PhantomData<fn() -> N>,
}

impl<N: TagNotification> Stream for TypedNotificationStream<N> {
    type Item = Result<N, CommandError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(notification))) => match N::parse(&notification) {
                    Ok(parsed) => return Poll::Ready(Some(Ok(parsed))),
                    Err(e) => warn!("Skipping undecodable {} notification: {}", N::KIND, e),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
