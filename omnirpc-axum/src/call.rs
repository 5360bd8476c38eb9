//! Call lifecycle: the protocol-neutral request/response pair for one RPC.
//!
//! A call moves `Open → Responding → Ended`, or to `Cancelled` from any
//! non-terminal state (transport close, explicit cancel signal, or deadline
//! expiry). Handlers see the call through three pieces: [`CallContext`]
//! (deadline and cancellation), [`Inbound`] (the decoded request stream),
//! and [`Outbound`] (the backpressured response sink). Which wire protocol
//! is in use is never visible to the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use omnirpc_axum_core::{MessageDecoder, MessageEncoder, Status, WireFormat, WireMessage};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Lifecycle states of one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Accepting inbound messages, nothing sent yet.
    Open,
    /// First outbound message committed.
    Responding,
    /// Both directions closed, trailers flushed.
    Ended,
    /// Terminated early by the caller, the transport, or the deadline.
    Cancelled,
}

/// State shared between the dispatcher, the response sink, the deadline
/// timer, and the transport body.
pub(crate) struct CallShared {
    state: Mutex<CallState>,
    status: Mutex<Status>,
    cancelled: AtomicBool,
    terminal_tx: watch::Sender<bool>,
    deadline: Option<Instant>,
}

impl CallShared {
    pub fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (terminal_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CallState::Open),
            status: Mutex::new(Status::ok()),
            cancelled: AtomicBool::new(false),
            terminal_tx,
            deadline,
        })
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    /// First outbound message or headers committed.
    pub fn mark_responding(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == CallState::Open {
            *state = CallState::Responding;
        }
    }

    /// Normal completion. No-op if the call was already cancelled.
    pub fn finish(&self, status: Status) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, CallState::Open | CallState::Responding) {
            *state = CallState::Ended;
            *self.status.lock().unwrap() = status;
            let _ = self.terminal_tx.send(true);
        }
    }

    /// Early termination. No-op if the call already ended.
    pub fn cancel(&self, status: Status) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, CallState::Open | CallState::Responding) {
            *state = CallState::Cancelled;
            *self.status.lock().unwrap() = status;
            self.cancelled.store(true, Ordering::SeqCst);
            let _ = self.terminal_tx.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        self.status.lock().unwrap().clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the call reaches a terminal state.
    pub async fn closed(&self) {
        let mut rx = self.terminal_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Handler-facing view of one call.
#[derive(Clone)]
pub struct CallContext {
    shared: Arc<CallShared>,
}

impl CallContext {
    pub(crate) fn new(shared: Arc<CallShared>) -> Self {
        Self { shared }
    }

    /// Whether the call has been cancelled. A cooperative handler checks
    /// this and stops producing work; the sink drops writes either way.
    pub fn cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once the call reaches a terminal state. Combine with
    /// [`cancelled`](Self::cancelled) to distinguish cancellation from
    /// normal completion.
    pub async fn closed(&self) {
        self.shared.closed().await
    }

    /// The advisory deadline for this call, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline()
    }
}

/// The decoded inbound message stream of one call.
///
/// Messages are delivered in the order received; an `Err` item is the
/// terminal protocol or decode failure for the stream.
pub struct Inbound<I> {
    rx: mpsc::Receiver<Result<WireMessage, Status>>,
    decoder: MessageDecoder<I>,
}

impl<I> Inbound<I> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<WireMessage, Status>>,
        decoder: MessageDecoder<I>,
    ) -> Self {
        Self { rx, decoder }
    }

    /// Receive the next decoded message, or `None` at end of input.
    pub async fn next(&mut self) -> Option<Result<I, Status>> {
        match self.rx.recv().await? {
            Ok(msg) => Some(self.decoder.decode(&msg).map_err(Status::from)),
            Err(status) => Some(Err(status)),
        }
    }
}

/// Error from a non-blocking write attempt.
#[derive(Debug)]
pub enum TrySendError {
    /// The response queue is full; wait for [`Outbound::ready`] and retry.
    Full,
    /// The write was rejected outright (encode failure or cardinality
    /// violation).
    Rejected(Status),
}

/// Wire-level response sink: enforces cancellation drop and response
/// cardinality regardless of handler cooperation.
pub(crate) struct ResponseSink {
    tx: mpsc::Sender<WireMessage>,
    shared: Arc<CallShared>,
    /// Maximum number of response messages, `None` for streaming.
    limit: Option<usize>,
    sent: usize,
}

impl ResponseSink {
    pub fn new(
        tx: mpsc::Sender<WireMessage>,
        shared: Arc<CallShared>,
        limit: Option<usize>,
    ) -> Self {
        Self {
            tx,
            shared,
            limit,
            sent: 0,
        }
    }

    fn check_cardinality(&self) -> Result<(), Status> {
        if let Some(limit) = self.limit {
            if self.sent >= limit {
                return Err(Status::internal(
                    "cardinality violation: method produces a single response message",
                ));
            }
        }
        Ok(())
    }

    /// Write one message, waiting for queue capacity.
    ///
    /// After cancellation the message is silently dropped and `Ok` is
    /// returned; the handler is expected to notice via the cancellation
    /// flag, but the drop is enforced here either way.
    pub async fn send(&mut self, msg: WireMessage) -> Result<(), Status> {
        if self.shared.is_cancelled() {
            return Ok(());
        }
        self.check_cardinality()?;
        self.shared.mark_responding();
        match self.tx.send(msg).await {
            Ok(()) => {
                self.sent += 1;
                Ok(())
            }
            Err(_) => {
                // Receiver gone: the transport hung up.
                self.shared.cancel(Status::cancelled("transport closed"));
                Ok(())
            }
        }
    }

    /// Write one message without waiting. `Full` signals queue pressure.
    pub fn try_send(&mut self, msg: WireMessage) -> Result<(), TrySendError> {
        if self.shared.is_cancelled() {
            return Ok(());
        }
        if let Err(status) = self.check_cardinality() {
            return Err(TrySendError::Rejected(status));
        }
        self.shared.mark_responding();
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.sent += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TrySendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.cancel(Status::cancelled("transport closed"));
                Ok(())
            }
        }
    }

    /// Resolves once the queue has capacity for another message (the
    /// drained notification).
    pub async fn ready(&self) {
        if let Ok(permit) = self.tx.reserve().await {
            drop(permit);
        }
    }
}

/// The typed response sink handed to streaming handlers.
///
/// Server-streaming producers must respect backpressure: on
/// [`TrySendError::Full`], pause and resume after [`ready`](Self::ready)
/// resolves. [`send`](Self::send) combines both.
pub struct Outbound<O> {
    sink: ResponseSink,
    encoder: MessageEncoder<O>,
    format: WireFormat,
}

impl<O> Outbound<O> {
    pub(crate) fn new(sink: ResponseSink, encoder: MessageEncoder<O>, format: WireFormat) -> Self {
        Self {
            sink,
            encoder,
            format,
        }
    }

    /// Encode and write one message, waiting for queue capacity.
    pub async fn send(&mut self, message: &O) -> Result<(), Status> {
        let payload = self.encoder.encode(message, self.format).map_err(Status::from)?;
        self.sink.send(WireMessage::new(self.format, payload)).await
    }

    /// Encode and write one message without waiting.
    pub fn try_send(&mut self, message: &O) -> Result<(), TrySendError> {
        let payload = self
            .encoder
            .encode(message, self.format)
            .map_err(|e| TrySendError::Rejected(Status::from(e)))?;
        self.sink.try_send(WireMessage::new(self.format, payload))
    }

    /// Resolves once the queue has drained capacity for another message.
    pub async fn ready(&self) {
        self.sink.ready().await
    }
}
