//! In-process message channel between the router and one plugin.
//!
//! [`connect`] returns two ports joined by a pair of unbounded queues, one
//! per direction. Sending never blocks and never runs the receiving side:
//! a message is only handled when the task owning the other port polls it,
//! so a failing plugin cannot unwind into the router. Messages are delivered
//! in the order they were sent on each direction.
//!
//! There is no backpressure. A plugin that stops reading keeps accumulating
//! queued requests until its port is dropped.

use gotapi_types::PluginMessage;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Sending half of a port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender(mpsc::UnboundedSender<PluginMessage>);

impl PortSender {
    /// Queue a message for the other port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the other port has been dropped.
    pub fn send(&self, message: PluginMessage) -> Result<()> {
        self.0.send(message).map_err(|_| Error::ChannelClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

pub type PortReceiver = mpsc::UnboundedReceiver<PluginMessage>;

/// One endpoint of a message channel.
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the other port has been dropped.
    pub fn send(&self, message: PluginMessage) -> Result<()> {
        self.sender.send(message)
    }

    /// Next message from the other port, `None` once it is dropped and drained.
    pub async fn recv(&mut self) -> Option<PluginMessage> {
        self.receiver.recv().await
    }

    /// Next already-queued message, without waiting.
    pub fn try_recv(&mut self) -> Option<PluginMessage> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    #[must_use]
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create a connected pair of ports.
#[must_use]
pub fn connect() -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MessagePort {
            sender: PortSender(a_tx),
            receiver: a_rx,
        },
        MessagePort {
            sender: PortSender(b_tx),
            receiver: b_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(code: &str) -> PluginMessage {
        let mut message = PluginMessage::request("echo", "");
        message.request_code = Some(code.to_string());
        message
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_each_direction() {
        let (a, mut b) = connect();
        for code in ["1", "2", "3"] {
            a.send(message(code)).unwrap();
        }
        b.send(message("back")).unwrap();

        for code in ["1", "2", "3"] {
            let received = b.recv().await.unwrap();
            assert_eq!(received.request_code.as_deref(), Some(code));
        }

        let (_, mut a_rx) = a.split();
        assert_eq!(
            a_rx.recv().await.unwrap().request_code.as_deref(),
            Some("back")
        );
    }

    #[test]
    fn test_send_returns_before_receiver_runs() {
        let (a, mut b) = connect();
        a.send(message("queued")).unwrap();
        // Nothing has polled `b`; the message sits in the queue.
        assert_eq!(b.try_recv().unwrap().request_code.as_deref(), Some("queued"));
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_send_after_peer_dropped_fails() {
        let (a, b) = connect();
        drop(b);
        assert!(a.sender().is_closed());
        assert!(matches!(a.send(message("x")), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_recv_ends_after_peer_dropped() {
        let (a, mut b) = connect();
        a.send(message("last")).unwrap();
        drop(a);
        assert!(b.recv().await.is_some());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cloned_sender_shares_queue() {
        let (a, mut b) = connect();
        let extra = a.sender();
        a.send(message("first")).unwrap();
        extra.send(message("second")).unwrap();
        assert_eq!(b.recv().await.unwrap().request_code.as_deref(), Some("first"));
        assert_eq!(b.recv().await.unwrap().request_code.as_deref(), Some("second"));
    }
}
