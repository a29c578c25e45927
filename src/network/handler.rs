use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

use crate::network::error::ProtocolError;
use crate::network::message::{read_frame, write_frame, NetworkMessage};

/// Pause after a receive fault before the loop exits
const FAULT_PAUSE: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

/// Byte stream a handler can own
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for T {}

type BoxedTransport = Box<dyn Transport + Unpin>;

/// Callback run for every received message, after any waiter was resolved
pub type MessageCallback = Arc<dyn Fn(&NetworkMessage) + Send + Sync>;

/// Notifications published by a handler
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    MessageReceived(NetworkMessage),
    Exception(String),
    Closed,
}

/// Owns one connection: frames outgoing messages, runs the receive loop and
/// correlates a single outstanding response waiter
pub struct MessageHandler {
    peer: String,
    reader: Mutex<Option<ReadHalf<BoxedTransport>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    waiter: Mutex<Option<oneshot::Sender<NetworkMessage>>>,
    callback: OnceLock<MessageCallback>,
    events: broadcast::Sender<HandlerEvent>,
    closed: watch::Sender<bool>,
    disposed: AtomicBool,
}

/// A response slot armed by `expect_response`
pub struct PendingResponse {
    handler: Arc<MessageHandler>,
    receiver: oneshot::Receiver<NetworkMessage>,
}

impl PendingResponse {
    /// Wait for the message that resolves this slot
    pub async fn wait(self, timeout: Duration) -> Result<NetworkMessage, ProtocolError> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ProtocolError::Disposed),
            Err(_) => {
                self.handler.clear_waiter();
                Err(ProtocolError::Timeout(timeout))
            }
        }
    }
}

impl MessageHandler {
    /// Wrap a stream. The receive loop does not run until `start`.
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Arc<Self>
    where
        S: Transport + Unpin,
    {
        let boxed: BoxedTransport = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            peer: peer.into(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            waiter: Mutex::new(None),
            callback: OnceLock::new(),
            events,
            closed,
            disposed: AtomicBool::new(false),
        })
    }

    /// Wrap a stream and install its per-message callback
    pub fn with_callback<S>(stream: S, peer: impl Into<String>, callback: MessageCallback) -> Arc<Self>
    where
        S: Transport + Unpin,
    {
        let handler = Self::new(stream, peer);
        handler.set_callback(callback);
        handler
    }

    /// Install the per-message callback; only the first call takes effect
    pub fn set_callback(&self, callback: MessageCallback) -> bool {
        self.callback.set(callback).is_ok()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.events.subscribe()
    }

    /// Resolves once the handler is closed, by `dispose` or by a receive fault
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Start the receive loop; later calls do nothing
    pub fn start(self: &Arc<Self>) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.receive_loop(reader).await;
        });
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedTransport>) {
        let mut closed = self.closed.subscribe();
        debug!("Receive loop started for {}", self.peer);

        loop {
            if *closed.borrow() {
                break;
            }

            let result = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = closed.changed() => break,
            };

            match result {
                Ok(message) => self.dispatch(message),
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    if e.is_disconnect() {
                        debug!("Connection to {} closed: {}", self.peer, e);
                    } else {
                        warn!("Receive fault on {}: {}", self.peer, e);
                    }
                    let _ = self.events.send(HandlerEvent::Exception(e.to_string()));
                    tokio::time::sleep(FAULT_PAUSE).await;
                    break;
                }
            }
        }

        self.mark_closed();
        let _ = self.events.send(HandlerEvent::Closed);
        debug!("Receive loop stopped for {}", self.peer);
    }

    fn dispatch(&self, message: NetworkMessage) {
        let _ = self.events.send(HandlerEvent::MessageReceived(message.clone()));

        if let Some(waiter) = self.waiter.lock().take() {
            let _ = waiter.send(message.clone());
        }

        if let Some(callback) = self.callback.get() {
            callback(&message);
        }
    }

    /// Serialize and write one message
    pub async fn send(&self, message: &NetworkMessage) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Disposed);
        }

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ProtocolError::Disposed)?;
        write_frame(writer, message).await
    }

    /// Arm the response slot so the next received message resolves it.
    ///
    /// Arm before sending the request, or the reply may arrive first and be
    /// missed.
    pub fn expect_response(self: &Arc<Self>) -> Result<PendingResponse, ProtocolError> {
        let mut waiter = self.waiter.lock();
        if self.is_closed() {
            return Err(ProtocolError::Disposed);
        }
        if waiter.as_ref().map_or(false, |sender| !sender.is_closed()) {
            return Err(ProtocolError::WaiterBusy);
        }

        let (sender, receiver) = oneshot::channel();
        *waiter = Some(sender);

        Ok(PendingResponse {
            handler: Arc::clone(self),
            receiver,
        })
    }

    /// Wait for the next message to arrive within `timeout`
    pub async fn wait_for_response(self: &Arc<Self>, timeout: Duration) -> Result<NetworkMessage, ProtocolError> {
        self.expect_response()?.wait(timeout).await
    }

    /// Send a request and wait for the message that follows it
    pub async fn request(
        self: &Arc<Self>,
        message: &NetworkMessage,
        timeout: Duration,
    ) -> Result<NetworkMessage, ProtocolError> {
        let pending = self.expect_response()?;
        self.send(message).await?;
        pending.wait(timeout).await
    }

    fn clear_waiter(&self) {
        self.waiter.lock().take();
    }

    fn mark_closed(&self) {
        let mut waiter = self.waiter.lock();
        self.closed.send_replace(true);
        // Dropping the sender fails any pending wait with Disposed
        waiter.take();
    }

    /// Close the handler and the underlying stream. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.mark_closed();
        self.reader.lock().take();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error closing stream to {}: {}", self.peer, e);
            }
        }
        debug!("Disposed handler for {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageType;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(2);

    fn pair() -> (Arc<MessageHandler>, Arc<MessageHandler>) {
        let (a, b) = duplex(64 * 1024);
        let left = MessageHandler::new(a, "left");
        let right = MessageHandler::new(b, "right");
        left.start();
        right.start();
        (left, right)
    }

    #[tokio::test]
    async fn request_gets_the_next_message() {
        let (left, right) = pair();

        let pending = right.expect_response().unwrap();
        assert_ok!(left.send(&NetworkMessage::work("https://example.com/")).await);
        let received = pending.wait(WAIT).await.unwrap();
        assert_eq!(received.text(), Some("https://example.com/"));

        let echo = tokio::spawn({
            let right = right.clone();
            async move {
                let message = right.wait_for_response(WAIT).await.unwrap();
                assert!(message.is(MessageType::StatusCheck));
                right.send(&NetworkMessage::ok()).await.unwrap();
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = left.request(&NetworkMessage::empty(MessageType::StatusCheck), WAIT).await.unwrap();
        assert!(reply.is(MessageType::Ok));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_without_a_message() {
        let (_left, right) = pair();
        let err = right.wait_for_response(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));

        // The slot is free again after a timeout
        assert!(right.expect_response().is_ok());
    }

    #[tokio::test]
    async fn only_one_waiter_at_a_time() {
        let (_left, right) = pair();
        let _first = right.expect_response().unwrap();
        assert!(matches!(right.expect_response(), Err(ProtocolError::WaiterBusy)));
    }

    #[tokio::test]
    async fn messages_are_not_buffered_for_late_waiters() {
        let (left, right) = pair();
        let mut events = right.subscribe();

        left.send(&NetworkMessage::ok()).await.unwrap();
        match events.recv().await.unwrap() {
            HandlerEvent::MessageReceived(message) => assert!(message.is(MessageType::Ok)),
            other => panic!("unexpected event {:?}", other),
        }

        let err = right.wait_for_response(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test]
    async fn callback_sees_every_message() {
        let (a, b) = duplex(1024);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let receiver = MessageHandler::with_callback(
            b,
            "receiver",
            Arc::new(move |_message: &NetworkMessage| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        receiver.start();
        receiver.start();
        let sender = MessageHandler::new(a, "sender");

        let mut events = receiver.subscribe();
        for _ in 0..3 {
            sender.send(&NetworkMessage::ok()).await.unwrap();
        }
        for _ in 0..3 {
            events.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn send_after_dispose_fails() {
        let (left, _right) = pair();
        left.dispose().await;
        left.dispose().await;

        assert!(left.is_closed());
        assert!(matches!(
            left.send(&NetworkMessage::ok()).await,
            Err(ProtocolError::Disposed)
        ));
        assert!(matches!(left.expect_response(), Err(ProtocolError::Disposed)));
    }

    #[tokio::test]
    async fn dispose_wakes_a_pending_waiter() {
        let (_left, right) = pair();
        let pending = right.expect_response().unwrap();

        right.dispose().await;
        assert!(matches!(pending.wait(WAIT).await, Err(ProtocolError::Disposed)));
    }

    #[tokio::test]
    async fn peer_disconnect_closes_the_handler() {
        let (left, right) = pair();
        let mut events = right.subscribe();

        left.dispose().await;
        tokio::time::timeout(WAIT, right.closed()).await.unwrap();

        let mut saw_exception = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HandlerEvent::Exception(_)) {
                saw_exception = true;
            }
        }
        assert!(saw_exception);
        assert!(right.is_closed());
    }
}
