//! Streaming inference support
//!
//! A generation is split into a producer half ([`GenerationSession`], owned by
//! the worker thread) and a consumer half ([`TokenStream`], handed to the
//! caller). They are joined by a bounded channel: the producer waits a bounded
//! time for room and then gives up on the consumer rather than buffering
//! without limit.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::inference::engine::EngineError;

/// How often a blocked producer retries a full queue
const DELIVERY_POLL: Duration = Duration::from_millis(2);

/// Queue sizing and slow-consumer policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Events buffered before the producer has to wait
    pub queue_depth: usize,
    /// How long the producer waits on a full queue before dropping the consumer
    pub delivery_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// One generated piece of text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub token: String,
    /// Position in the stream, starting at 0
    pub index: u32,
}

/// Final statistics of a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStats {
    /// Token events delivered before this one
    pub token_count: u32,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
    /// Halted by `stop()` or `unload()`
    pub cancelled: bool,
    /// The consumer stopped draining the stream and was dropped
    pub incomplete: bool,
}

/// Represents an event emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(TokenEvent),
    /// Terminal: generation finished or was cancelled
    Complete(CompletionStats),
    /// Terminal: generation failed
    Error(EngineError),
}

impl StreamEvent {
    pub fn is_token(&self) -> bool {
        matches!(self, StreamEvent::Token(_))
    }

    /// Returns true for the single event that ends a stream
    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamEvent::Token(event) => Some(&event.token),
            _ => None,
        }
    }

    pub fn as_stats(&self) -> Option<&CompletionStats> {
        match self {
            StreamEvent::Complete(stats) => Some(stats),
            _ => None,
        }
    }
}

/// Cancellation handle of the live session, shared with `stop()`
#[derive(Debug, Clone)]
pub(crate) struct SessionControl {
    pub(crate) id: Uuid,
    cancel: Arc<AtomicBool>,
}

impl SessionControl {
    /// Returns true the first time it is called
    pub(crate) fn request_stop(&self) -> bool {
        !self.cancel.swap(true, Ordering::AcqRel)
    }
}

/// Why a token could not be handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryFailure {
    Cancelled,
    ConsumerGone,
    TimedOut,
}

/// Producer half of a generation. Lives on the worker thread.
pub(crate) struct GenerationSession {
    control: SessionControl,
    tx: mpsc::Sender<StreamEvent>,
    started: Instant,
    token_count: u32,
    max_tokens: u32,
    delivery_timeout: Duration,
    abandoned: bool,
    /// Set once the sink has refused a token because of a stop request
    cancelled: bool,
}

impl GenerationSession {
    /// Creates both halves of a new session
    pub(crate) fn open(config: &StreamConfig, max_tokens: u32) -> (Self, TokenStream) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let session = Self {
            control: SessionControl {
                id,
                cancel: Arc::new(AtomicBool::new(false)),
            },
            tx,
            started: Instant::now(),
            token_count: 0,
            max_tokens,
            delivery_timeout: config.delivery_timeout,
            abandoned: false,
            cancelled: false,
        };
        (session, TokenStream::new(id, rx))
    }

    pub(crate) fn id(&self) -> Uuid {
        self.control.id
    }

    pub(crate) fn control(&self) -> SessionControl {
        self.control.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.control.cancel.load(Ordering::Acquire)
    }

    /// Records a pending stop request as the reason this session ends.
    pub(crate) fn observe_cancel(&mut self) -> bool {
        if self.is_cancelled() {
            self.cancelled = true;
        }
        self.cancelled
    }

    /// Token sink for the native loop. Checked between tokens only.
    pub(crate) fn offer(&mut self, piece: String) -> ControlFlow<()> {
        if self.abandoned || self.observe_cancel() {
            return ControlFlow::Break(());
        }
        if piece.is_empty() {
            return ControlFlow::Continue(());
        }

        let event = StreamEvent::Token(TokenEvent {
            token: piece,
            index: self.token_count,
        });
        match self.deliver(event, true) {
            Ok(()) => self.token_count += 1,
            Err(DeliveryFailure::Cancelled) => {
                self.cancelled = true;
                return ControlFlow::Break(());
            }
            Err(failure) => {
                tracing::warn!(
                    "Dropping consumer of session {} ({:?}) after {} tokens",
                    self.control.id,
                    failure,
                    self.token_count
                );
                self.abandoned = true;
                return ControlFlow::Break(());
            }
        }

        if self.token_count >= self.max_tokens {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Ends the stream with its statistics and returns them.
    pub(crate) fn complete(mut self) -> CompletionStats {
        let stats = self.stats();
        self.finish(StreamEvent::Complete(stats.clone()));
        stats
    }

    /// Ends the stream with an error.
    pub(crate) fn fail(mut self, error: EngineError) {
        self.finish(StreamEvent::Error(error));
    }

    fn stats(&self) -> CompletionStats {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        CompletionStats {
            token_count: self.token_count,
            elapsed_ms: elapsed.as_millis() as u64,
            tokens_per_second: if secs > 0.0 {
                self.token_count as f64 / secs
            } else {
                0.0
            },
            cancelled: self.cancelled,
            incomplete: self.abandoned,
        }
    }

    fn finish(&mut self, terminal: StreamEvent) {
        if self.abandoned {
            // Last chance for a consumer that caught up in the meantime.
            let _ = self.tx.try_send(terminal);
            return;
        }
        if let Err(failure) = self.deliver(terminal, false) {
            tracing::warn!(
                "Terminal event of session {} not delivered: {:?}",
                self.control.id,
                failure
            );
        }
    }

    /// Pushes one event, waiting at most `delivery_timeout` for queue space.
    fn deliver(&self, mut event: StreamEvent, honour_cancel: bool) -> Result<(), DeliveryFailure> {
        let deadline = Instant::now() + self.delivery_timeout;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(DeliveryFailure::ConsumerGone),
                Err(TrySendError::Full(returned)) => {
                    if honour_cancel && self.is_cancelled() {
                        return Err(DeliveryFailure::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        return Err(DeliveryFailure::TimedOut);
                    }
                    event = returned;
                    thread::sleep(DELIVERY_POLL);
                }
            }
        }
    }
}

/// Consumer half of a generation: token events, then exactly one terminal.
///
/// Can be drained with [`TokenStream::next_event`], as a
/// [`futures_util::Stream`], or from a plain thread with
/// [`TokenStream::blocking_next`]. Dropping it tells the producer to stop.
#[derive(Debug)]
pub struct TokenStream {
    session_id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl TokenStream {
    fn new(session_id: Uuid, rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            session_id,
            rx,
            finished: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next event, or `None` once the terminal event has been returned.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let received = self.rx.recv().await;
        self.observe(received)
    }

    /// Blocking variant of [`next_event`](Self::next_event).
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let received = self.rx.blocking_recv();
        self.observe(received)
    }

    /// Drains the stream, concatenating every token.
    pub async fn collect_text(mut self) -> Result<(String, CompletionStats), EngineError> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Token(token) => text.push_str(&token.token),
                StreamEvent::Complete(stats) => return Ok((text, stats)),
                StreamEvent::Error(error) => return Err(error),
            }
        }
        Err(EngineError::WorkerError("stream ended without a terminal event".into()))
    }

    fn observe(&mut self, received: Option<StreamEvent>) -> Option<StreamEvent> {
        match received {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Some(event)
            }
            None => {
                // Producer vanished without a terminal event (worker died).
                self.finished = true;
                Some(StreamEvent::Error(EngineError::WorkerError(
                    "generation ended without a terminal event".into(),
                )))
            }
        }
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(received) => Poll::Ready(this.observe(received)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Reassembles UTF-8 text from token byte pieces.
///
/// A single token can end in the middle of a multi-byte character; those bytes
/// are held back until the rest arrives.
#[derive(Debug, Default)]
pub(crate) struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    /// Appends bytes and returns the longest complete text available.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // A sequence that can never become valid is emitted lossily.
            Err(e) if e.error_len().is_some() => return self.take_lossy(),
            Err(e) => e.valid_up_to(),
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let text = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(text).ok()
    }

    /// Whatever is left at end of generation
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            self.take_lossy()
        }
    }

    fn take_lossy(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}
