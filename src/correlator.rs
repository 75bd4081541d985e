//! Request/reply correlation
//!
//! A request registers a one-shot [`ReplySlot`] with the link's
//! [`Dispatcher`] before it is transmitted. The slot is settled exactly once,
//! by the first of: a matching packet, the timeout, a cancellation, or the
//! link closing. The completion primitive is a `tokio::sync::oneshot`
//! channel whose sender is taken out of a mutex, so the losing side of a
//! race finds it gone and does nothing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;

use crate::dispatch::{Dispatcher, ListenerId, PendingSlot};
use crate::error::{DccError, Result};
use crate::packet::Packet;
use crate::selector::Selector;
use crate::transport::PacketSink;

type Extractor<T> = Box<dyn Fn(&Packet) -> Option<T> + Send + Sync>;

/// Single-assignment completion for one request
pub struct ReplySlot<T> {
    sender: Mutex<Option<oneshot::Sender<Result<T>>>>,
    selector: Box<dyn Selector>,
    extractor: Extractor<T>,
}

impl<T: Send> ReplySlot<T> {
    fn new(
        selector: Box<dyn Selector>,
        extractor: Extractor<T>,
    ) -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        let slot = ReplySlot {
            sender: Mutex::new(Some(tx)),
            selector,
            extractor,
        };
        (slot, rx)
    }

    /// Settle with `outcome`; `false` if already settled
    pub fn resolve(&self, outcome: Result<T>) -> bool {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(tx) => {
                // receiver gone means the caller stopped waiting; still settled
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether the slot has been settled
    pub fn is_settled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T: Send> PendingSlot for ReplySlot<T> {
    fn offer(&self, packet: &Arc<Packet>) -> bool {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return true;
        }
        if !self.selector.matches(packet) {
            return false;
        }
        match (self.extractor)(packet) {
            Some(value) => {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(Ok(value));
                }
                true
            }
            None => false,
        }
    }

    fn fail(&self, error: DccError) -> bool {
        self.resolve(Err(error))
    }
}

/// Cloneable handle that cancels a [`PendingReply`] from elsewhere
#[derive(Clone)]
pub struct ReplyCanceller {
    id: ListenerId,
    slot: Arc<dyn PendingSlot>,
    dispatcher: Arc<Dispatcher>,
}

impl ReplyCanceller {
    /// Cancel the request; `false` if it had already been settled
    pub fn cancel(&self) -> bool {
        let won = self.slot.fail(DccError::Cancelled);
        self.dispatcher.unregister_reply(self.id);
        won
    }
}

/// A registered request waiting for its reply
///
/// Dropping it cancels the request and unregisters its listener.
pub struct PendingReply<T: Send + 'static> {
    id: ListenerId,
    slot: Arc<ReplySlot<T>>,
    receiver: oneshot::Receiver<Result<T>>,
    dispatcher: Arc<Dispatcher>,
}

impl<T: Send + 'static> PendingReply<T> {
    /// Registry id of the listener
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Whether a match, timeout, cancellation or close already happened
    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    /// Cancel the request; `false` if it had already been settled
    pub fn cancel(&self) -> bool {
        let won = self.slot.resolve(Err(DccError::Cancelled));
        self.dispatcher.unregister_reply(self.id);
        won
    }

    /// Handle for cancelling from another task
    pub fn canceller(&self) -> ReplyCanceller {
        ReplyCanceller {
            id: self.id,
            slot: self.slot.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Wait for the outcome, settling the slot with [`DccError::Timeout`] if
    /// nothing else does within `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let outcome = match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DccError::Cancelled),
            Err(_) => {
                if self.slot.resolve(Err(DccError::Timeout)) {
                    debug!("reply {} timed out after {:?}", self.id, timeout);
                }
                // the winner's outcome is already in the channel
                self.receiver.try_recv().unwrap_or(Err(DccError::Timeout))
            }
        };
        self.dispatcher.unregister_reply(self.id);
        outcome
    }
}

impl<T: Send + 'static> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.slot.resolve(Err(DccError::Cancelled));
        self.dispatcher.unregister_reply(self.id);
    }
}

/// Issues requests on a link and matches them to their replies
#[derive(Clone)]
pub struct ReplyCorrelator {
    dispatcher: Arc<Dispatcher>,
}

impl ReplyCorrelator {
    /// Correlate replies arriving through `dispatcher`
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        ReplyCorrelator { dispatcher }
    }

    /// Dispatcher the replies are read from
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register interest in the first packet accepted by `selector` for
    /// which `extractor` yields a value
    ///
    /// Packets for which the extractor returns `None` leave the request
    /// waiting.
    pub fn register<T, S, E>(&self, selector: S, extractor: E) -> Result<PendingReply<T>>
    where
        T: Send + 'static,
        S: Selector + 'static,
        E: Fn(&Packet) -> Option<T> + Send + Sync + 'static,
    {
        let (slot, receiver) = ReplySlot::new(Box::new(selector), Box::new(extractor));
        let slot = Arc::new(slot);
        let id = self.dispatcher.register_reply(slot.clone())?;
        Ok(PendingReply {
            id,
            slot,
            receiver,
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Send `packet` and wait for its reply
    ///
    /// The listener is registered before transmission so a fast reply cannot
    /// be missed. A failed send cancels the request and returns the send
    /// error.
    pub async fn send_and_await<K, T, S, E>(
        &self,
        sink: &K,
        packet: &Packet,
        selector: S,
        extractor: E,
        timeout: Duration,
    ) -> Result<T>
    where
        K: PacketSink + ?Sized,
        T: Send + 'static,
        S: Selector + 'static,
        E: Fn(&Packet) -> Option<T> + Send + Sync + 'static,
    {
        let pending = self.register(selector, extractor)?;
        if let Err(e) = sink.send_packet(packet) {
            pending.cancel();
            return Err(e);
        }
        pending.wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CommandMode, Transport};
    use crate::selector::PacketSelector;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(command: u8, value: u8) -> Packet {
        Packet::builder(Transport::Zcan)
            .with_group(0x16)
            .with_command(command)
            .with_mode(CommandMode::Ack)
            .with_payload(vec![value])
            .build()
            .expect("valid packet")
    }

    fn selector() -> PacketSelector {
        PacketSelector::zcan(0x16, 0x08, CommandMode::Ack, 1)
    }

    fn first_byte(packet: &Packet) -> Option<u8> {
        packet.payload().first().copied()
    }

    fn correlator() -> (Arc<Dispatcher>, ReplyCorrelator) {
        let dispatcher = Arc::new(Dispatcher::new());
        let correlator = ReplyCorrelator::new(dispatcher.clone());
        (dispatcher, correlator)
    }

    /// Loops every sent packet back as a reply with the same first byte
    struct Echo {
        dispatcher: Arc<Dispatcher>,
        sent: AtomicUsize,
    }

    impl PacketSink for Echo {
        fn send_packet(&self, packet: &Packet) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.dispatcher.dispatch(reply(0x08, packet.payload()[0]));
            Ok(())
        }
    }

    struct Broken;

    impl PacketSink for Broken {
        fn send_packet(&self, _packet: &Packet) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged").into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_resolves() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.dispatch(reply(0x09, 1));
        assert!(!pending.is_settled());

        dispatcher.dispatch(reply(0x08, 42));
        assert!(pending.is_settled());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(pending.wait(Duration::from_secs(1)).await?, 42);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unregisters() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;

        let result = pending.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DccError::Timeout)));
        assert_eq!(dispatcher.pending_count(), 0);

        // a late reply is ignored
        dispatcher.dispatch(reply(0x08, 42));
        assert_eq!(dispatcher.pending_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_before_timeout_wins() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;

        // the reply lands first, then the deadline is already due
        dispatcher.dispatch(reply(0x08, 7));
        assert_eq!(pending.wait(Duration::ZERO).await?, 7);
        assert_eq!(dispatcher.pending_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_match_wins() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let pending = correlator.register(selector(), move |p: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            first_byte(p)
        })?;

        dispatcher.dispatch(reply(0x08, 1));
        dispatcher.dispatch(reply(0x08, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending.wait(Duration::from_secs(1)).await?, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_extractor_none_keeps_waiting() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), |p: &Packet| {
            first_byte(p).filter(|v| *v != 0)
        })?;

        dispatcher.dispatch(reply(0x08, 0));
        assert!(!pending.is_settled());
        dispatcher.dispatch(reply(0x08, 5));
        assert_eq!(pending.wait(Duration::from_secs(1)).await?, 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;
        let canceller = pending.canceller();

        let waiter = tokio::spawn(pending.wait(Duration::from_secs(10)));
        tokio::task::yield_now().await;

        assert!(canceller.cancel());
        assert!(!canceller.cancel());
        assert_eq!(dispatcher.pending_count(), 0);

        let result = waiter.await.expect("task");
        assert!(matches!(result, Err(DccError::Cancelled)));

        dispatcher.dispatch(reply(0x08, 1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unregisters() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;
        assert_eq!(dispatcher.pending_count(), 1);
        drop(pending);
        assert_eq!(dispatcher.pending_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiters() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let pending = correlator.register(selector(), first_byte)?;

        dispatcher.close();
        let result = pending.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DccError::ConnectionClosed)));
        assert!(matches!(
            correlator.register(selector(), first_byte),
            Err(DccError::ConnectionClosed)
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_await() -> Result<()> {
        let (dispatcher, correlator) = correlator();
        let echo = Echo {
            dispatcher: dispatcher.clone(),
            sent: AtomicUsize::new(0),
        };

        let request = reply(0x08, 99);
        let value = correlator
            .send_and_await(&echo, &request, selector(), first_byte, Duration::from_secs(1))
            .await?;
        assert_eq!(value, 99);
        assert_eq!(echo.sent.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_count(), 0);

        let result = correlator
            .send_and_await(&Broken, &request, selector(), first_byte, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(DccError::Io(_))));
        assert_eq!(dispatcher.pending_count(), 0);
        Ok(())
    }
}
