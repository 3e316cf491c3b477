// Notification side of the dispatcher: reassembly, buffering and fan-out

use super::{CommandError, NotificationItem};
use crate::protocol::{decode_notification, Notification, NotificationKind};
use crate::transport::fragmenter::{FragmentError, Fragmenter};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type NotificationSender = mpsc::UnboundedSender<NotificationItem>;

struct Subscriber {
    kind: Option<NotificationKind>,
    sender: NotificationSender,
}

impl Subscriber {
    fn wants(&self, notification: &Notification) -> bool {
        self.kind.map_or(true, |kind| kind == notification.kind())
    }
}

pub struct NotificationHub {
    fragmenter: Fragmenter,
    subscribers: Vec<Subscriber>,
    buffer: VecDeque<Notification>,
    buffer_limit: usize,
    ready: bool,
}

impl NotificationHub {
    pub fn new(mtu: u16, buffer_limit: usize) -> Result<Self, FragmentError> {
        Ok(Self {
            fragmenter: Fragmenter::new(mtu)?,
            subscribers: Vec::new(),
            buffer: VecDeque::new(),
            buffer_limit,
            ready: false,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn subscribe(&mut self, kind: Option<NotificationKind>, sender: NotificationSender) {
        self.subscribers.push(Subscriber { kind, sender });
    }

    pub fn handle_fragment(&mut self, fragment: &[u8]) {
        let Some(packet) = self.fragmenter.add_fragment(fragment) else {
            return;
        };
        match decode_notification(&packet) {
            Ok(notification) => self.deliver_or_buffer(notification),
            Err(e) => warn!("Dropping undecodable notification ({} bytes): {}", packet.len(), e),
        }
    }

    /// Flush buffered notifications in arrival order and switch to live delivery
    pub fn subscriptions_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        debug!("Releasing {} buffered notifications", self.buffer.len());
        while let Some(notification) = self.buffer.pop_front() {
            self.fan_out(&notification);
        }
    }

    /// End every subscription with a terminal error
    pub fn shutdown(&mut self) {
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.sender.send(Err(CommandError::Disconnected));
        }
        self.buffer.clear();
        self.fragmenter.reset();
    }

    fn deliver_or_buffer(&mut self, notification: Notification) {
        if self.ready {
            self.fan_out(&notification);
            return;
        }
        if self.buffer.len() >= self.buffer_limit {
            if let Some(dropped) = self.buffer.pop_front() {
                warn!("Notification buffer full, dropping oldest {}", dropped.kind());
            }
        }
        self.buffer.push_back(notification);
    }

    fn fan_out(&mut self, notification: &Notification) {
        self.subscribers.retain(|subscriber| {
            if !subscriber.wants(notification) {
                return !subscriber.sender.is_closed();
            }
            subscriber.sender.send(Ok(notification.clone())).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_notification, Domain};

    const GESTURE: NotificationKind = NotificationKind::new(Domain::Gear, 3);
    const BATTERY: NotificationKind = NotificationKind::new(Domain::Base, 20);

    fn feed(hub: &mut NotificationHub, notification: &Notification) {
        let packet = encode_notification(notification).expect("encode");
        for fragment in Fragmenter::new(23)
            .expect("fragmenter")
            .fragments(&packet)
            .expect("fragments")
        {
            hub.handle_fragment(&fragment);
        }
    }

    fn gesture(id: u8) -> Notification {
        Notification::new(GESTURE.domain, GESTURE.opcode, vec![id])
    }

    #[test]
    fn test_buffers_until_ready() {
        let mut hub = NotificationHub::new(23, 8).expect("hub");
        feed(&mut hub, &gesture(1));
        feed(&mut hub, &gesture(2));
        assert_eq!(hub.buffered(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(Some(GESTURE), tx);
        assert!(rx.try_recv().is_err());

        hub.subscriptions_ready();
        assert_eq!(rx.try_recv().expect("first"), Ok(gesture(1)));
        assert_eq!(rx.try_recv().expect("second"), Ok(gesture(2)));

        feed(&mut hub, &gesture(3));
        assert_eq!(rx.try_recv().expect("live"), Ok(gesture(3)));
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut hub = NotificationHub::new(23, 2).expect("hub");
        for id in 1..=3 {
            feed(&mut hub, &gesture(id));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(None, tx);
        hub.subscriptions_ready();
        assert_eq!(rx.try_recv().expect("first"), Ok(gesture(2)));
        assert_eq!(rx.try_recv().expect("second"), Ok(gesture(3)));
    }

    #[test]
    fn test_filtering_and_fan_out() {
        let mut hub = NotificationHub::new(23, 8).expect("hub");
        hub.subscriptions_ready();
        let (gestures_a, mut rx_a) = mpsc::unbounded_channel();
        let (gestures_b, mut rx_b) = mpsc::unbounded_channel();
        let (batteries, mut rx_battery) = mpsc::unbounded_channel();
        hub.subscribe(Some(GESTURE), gestures_a);
        hub.subscribe(Some(GESTURE), gestures_b);
        hub.subscribe(Some(BATTERY), batteries);

        feed(&mut hub, &gesture(7));
        assert_eq!(rx_a.try_recv().expect("a"), Ok(gesture(7)));
        assert_eq!(rx_b.try_recv().expect("b"), Ok(gesture(7)));
        assert!(rx_battery.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let mut hub = NotificationHub::new(23, 8).expect("hub");
        hub.subscriptions_ready();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe(None, tx);
        drop(rx);
        feed(&mut hub, &gesture(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_shutdown_ends_subscriptions() {
        let mut hub = NotificationHub::new(23, 8).expect("hub");
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(None, tx);
        hub.shutdown();
        assert_eq!(rx.try_recv().expect("terminal"), Err(CommandError::Disconnected));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
