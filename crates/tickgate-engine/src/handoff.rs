//! Rendezvous channel carrying requests from a control thread to the driver.
//!
//! Capacity is zero: [`publish`](HandoffChannel::publish) returns only once
//! the driver has taken the item, so a producer can never race ahead of the
//! driver and a request is never silently queued for a later tick. Both
//! ends select on the channel's [`CancelToken`], so
//! [`close`](HandoffChannel::close) wakes a blocked producer and a blocked
//! consumer immediately instead of leaving them to time out.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use thiserror::Error;
use tickgate_core::CancelToken;

/// Failure of a handoff operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// No counterpart arrived within the timeout.
    #[error("handoff timed out")]
    TimedOut,
    /// The channel was closed.
    #[error("handoff channel closed")]
    Closed,
}

/// Zero-capacity, cancellable channel.
pub struct HandoffChannel<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    cancel: CancelToken,
}

impl<T> Default for HandoffChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffChannel<T> {
    /// Create an open channel.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            tx,
            rx,
            cancel: CancelToken::new(),
        }
    }

    /// Block until a consumer takes `item`, the timeout elapses, or the
    /// channel is closed. On error the item is dropped.
    pub fn publish(&self, item: T, timeout: Duration) -> Result<(), HandoffError> {
        if self.cancel.is_cancelled() {
            return Err(HandoffError::Closed);
        }
        select! {
            send(self.tx, item) -> res => res.map_err(|_| HandoffError::Closed),
            recv(self.cancel.signal()) -> _ => Err(HandoffError::Closed),
            default(timeout) => Err(HandoffError::TimedOut),
        }
    }

    /// Block until an item is published, the timeout elapses, or the
    /// channel is closed.
    pub fn take(&self, timeout: Duration) -> Result<T, HandoffError> {
        if self.cancel.is_cancelled() {
            return Err(HandoffError::Closed);
        }
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| HandoffError::Closed),
            recv(self.cancel.signal()) -> _ => Err(HandoffError::Closed),
            default(timeout) => Err(HandoffError::TimedOut),
        }
    }

    /// Take an item only if a producer is blocked in `publish` right now.
    pub fn try_take(&self) -> Result<Option<T>, HandoffError> {
        if self.cancel.is_cancelled() {
            return Err(HandoffError::Closed);
        }
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(HandoffError::Closed),
        }
    }

    /// Close the channel, waking every blocked producer and consumer.
    /// Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        self.cancel.cancel()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> fmt::Debug for HandoffChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn publish_completes_only_when_taken() {
        let ch = Arc::new(HandoffChannel::new());
        let producer = Arc::clone(&ch);
        let h = thread::spawn(move || producer.publish(7u32, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        assert!(!h.is_finished(), "capacity zero: publish must block");
        assert_eq!(ch.take(Duration::from_secs(5)), Ok(7));
        assert_eq!(h.join().unwrap(), Ok(()));
    }

    #[test]
    fn publish_without_consumer_times_out() {
        let ch = HandoffChannel::new();
        assert_eq!(
            ch.publish(1u8, Duration::from_millis(10)),
            Err(HandoffError::TimedOut)
        );
        // Nothing was buffered.
        assert_eq!(ch.try_take(), Ok(None));
    }

    #[test]
    fn take_without_producer_times_out() {
        let ch: HandoffChannel<u8> = HandoffChannel::new();
        assert_eq!(
            ch.take(Duration::from_millis(10)),
            Err(HandoffError::TimedOut)
        );
    }

    #[test]
    fn try_take_pairs_with_blocked_producer() {
        let ch = Arc::new(HandoffChannel::new());
        let producer = Arc::clone(&ch);
        let h = thread::spawn(move || producer.publish("reset", Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        let got = loop {
            if let Some(item) = ch.try_take().unwrap() {
                break item;
            }
            assert!(Instant::now() < deadline, "producer never showed up");
            thread::yield_now();
        };
        assert_eq!(got, "reset");
        assert_eq!(h.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let ch: Arc<HandoffChannel<u8>> = Arc::new(HandoffChannel::new());
        let consumer = Arc::clone(&ch);
        let start = Instant::now();
        let h = thread::spawn(move || consumer.take(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        assert!(ch.close());
        assert_eq!(h.join().unwrap(), Err(HandoffError::Closed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_wakes_blocked_producer() {
        let ch = Arc::new(HandoffChannel::new());
        let producer = Arc::clone(&ch);
        let h = thread::spawn(move || producer.publish(3u8, Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(h.join().unwrap(), Err(HandoffError::Closed));
    }

    #[test]
    fn operations_after_close_fail_fast() {
        let ch = HandoffChannel::new();
        ch.close();
        assert!(!ch.close());
        assert_eq!(
            ch.publish(1u8, Duration::from_secs(30)),
            Err(HandoffError::Closed)
        );
        assert_eq!(ch.take(Duration::from_secs(30)), Err(HandoffError::Closed));
        assert_eq!(ch.try_take(), Err(HandoffError::Closed));
    }
}
