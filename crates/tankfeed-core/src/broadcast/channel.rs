//! Bounded per-subscriber channel sink.
//!
//! The hub pushes frames into the channel; a connection task owned by the
//! server drains them onto the socket.

use super::hub::SubscriberSink;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Ping,
    Close,
}

/// [`SubscriberSink`] writing into a bounded mpsc channel. A full channel
/// counts as a failed send.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
}

impl ChannelSink {
    /// Create a sink and the receiver its connection task drains.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        });
        (sink, rx)
    }

    fn push(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Connection("connection closed".into()));
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Connection("subscriber is not keeping up".into())
            }
            mpsc::error::TrySendError::Closed(_) => Error::Connection("connection closed".into()),
        })
    }
}

impl SubscriberSink for ChannelSink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send_text(&self, text: Arc<str>) -> Result<()> {
        self.push(Frame::Text(text))
    }

    fn send_ping(&self) -> Result<()> {
        self.push(Frame::Ping)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Best effort; a full buffer means the reader is gone or stuck,
            // and dropping the receiver ends the connection task anyway.
            let _ = self.tx.try_send(Frame::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_in_order() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.send_text(Arc::from("a")).unwrap();
        sink.send_ping().unwrap();
        sink.close();

        assert_eq!(rx.try_recv().unwrap(), Frame::Text(Arc::from("a")));
        assert_eq!(rx.try_recv().unwrap(), Frame::Ping);
        assert_eq!(rx.try_recv().unwrap(), Frame::Close);
        assert!(!sink.is_open());
        assert!(sink.send_ping().is_err());
    }

    #[test]
    fn test_full_buffer_fails() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.send_text(Arc::from("a")).unwrap();
        assert!(matches!(
            sink.send_text(Arc::from("b")),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_dropped_receiver_closes() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert!(!sink.is_open());
    }
}
