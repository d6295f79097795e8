//! Notification fan-out to host application subscribers.

use std::sync::mpsc;

use mculink_proto::{Direction, RegisterValue, TraceEvent, VersionInfo};

/// Events the session pushes to subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    NodeDiscovered {
        node_id: u8,
        info: VersionInfo,
    },
    RegisterUpdated {
        node_id: u8,
        offset: u32,
        direction: Direction,
        value: RegisterValue,
        /// Telemetry timestamp when the value came from a channel batch.
        timestamp: Option<u32>,
    },
    /// One telemetry frame was dispatched; per-register updates are
    /// delivered separately.
    ChannelData {
        node_id: u8,
        timestamp: u32,
    },
    DebugString {
        node_id: u8,
        text: String,
    },
    Trace {
        node_id: u8,
        event: TraceEvent,
    },
}

/// Subscriber registry. Senders whose receiver has gone away are pruned
/// on the next publish.
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    subscribers: Vec<mpsc::Sender<Notification>>,
}

impl Notifier {
    pub(crate) fn subscribe(&mut self) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, notification: Notification) {
        self.subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut notifier = Notifier::default();
        let keep = notifier.subscribe();
        let drop_me = notifier.subscribe();
        drop(drop_me);

        notifier.publish(Notification::ChannelData {
            node_id: 1,
            timestamp: 42,
        });
        assert_eq!(notifier.subscribers.len(), 1);
        assert!(matches!(
            keep.recv().unwrap(),
            Notification::ChannelData { timestamp: 42, .. }
        ));
    }
}
