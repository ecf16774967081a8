//! Keepalive multiplexer for long-lived event streams.
//!
//! Proxies and load balancers close connections that stay silent for too
//! long. A turn that is waiting on a slow tool, a long model call, or a human
//! answer can easily be silent for minutes. [`with_keepalive`] wraps the
//! turn's event stream so the consumer never waits longer than `interval`
//! without receiving *something*: either a real event or a synthetic
//! keepalive produced by [`KeepaliveEvent::keepalive`].
//!
//! ```text
//! upstream ──▶ pump task ──▶ bounded FIFO ──▶ Keepalive (consumer) ──▶ client
//!                                                   │
//!                                  interval elapsed, queue empty
//!                                                   ▼
//!                                             keepalive event
//! ```
//!
//! Guarantees:
//! - Real events keep their upstream order. A keepalive is emitted only when
//!   the queue is observed empty, so it never overtakes a buffered event.
//! - The interval is measured from the last item the consumer yielded.
//! - An upstream `Err` is yielded once as `Err` and ends the stream; a failed
//!   producer never looks like a clean end-of-stream.
//! - Dropping the stream aborts the pump task. [`Keepalive::close`] aborts it
//!   and waits for it to finish, so nothing outlives the call.
//! - The queue is bounded: a producer that outruns the consumer blocks.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace};

/// Default quiet period before a keepalive is injected.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default keepalive text.
pub const DEFAULT_KEEPALIVE_TEXT: &str = "still working";

/// Default capacity of the pump queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Event types that have a synthetic keepalive variant.
pub trait KeepaliveEvent {
    fn keepalive(text: &str) -> Self;
}

/// Configuration for [`with_keepalive`].
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Maximum quiet period before a keepalive is emitted.
    pub interval: Duration,
    /// Text carried by each keepalive event.
    pub text: String,
    /// Capacity of the queue between the pump and the consumer.
    pub queue_capacity: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            text: DEFAULT_KEEPALIVE_TEXT.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl KeepaliveConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// What the pump hands to the consumer.
enum Frame<T, E> {
    Event(T),
    Failed(E),
    Done,
}

/// Stream returned by [`with_keepalive`].
pub struct Keepalive<T, E> {
    rx: mpsc::Receiver<Frame<T, E>>,
    pump: Option<JoinHandle<()>>,
    timer: Pin<Box<Sleep>>,
    interval: Duration,
    text: String,
    finished: bool,
    keepalives_sent: u64,
}

// No field is structurally pinned; the timer is boxed.
impl<T, E> Unpin for Keepalive<T, E> {}

/// Wrap `upstream` so that quiet periods longer than `config.interval` are
/// filled with keepalive events.
///
/// Must be called from within a Tokio runtime: the pump runs on a spawned task.
pub fn with_keepalive<S, T, E>(upstream: S, config: KeepaliveConfig) -> Keepalive<T, E>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: KeepaliveEvent + Send + 'static,
    E: Send + 'static,
{
    // A zero interval would fire on every poll.
    let interval = config.interval.max(Duration::from_millis(1));
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let pump = tokio::spawn(pump(upstream, tx));

    Keepalive {
        rx,
        pump: Some(pump),
        timer: Box::pin(tokio::time::sleep(interval)),
        interval,
        text: config.text,
        finished: false,
        keepalives_sent: 0,
    }
}

async fn pump<S, T, E>(upstream: S, tx: mpsc::Sender<Frame<T, E>>)
where
    S: Stream<Item = Result<T, E>>,
{
    let mut upstream = std::pin::pin!(upstream);
    while let Some(item) = upstream.next().await {
        let (frame, last) = match item {
            Ok(event) => (Frame::Event(event), false),
            Err(e) => (Frame::Failed(e), true),
        };
        if tx.send(frame).await.is_err() {
            // Nobody is listening any more.
            trace!("Keepalive consumer gone, pump stopping");
            return;
        }
        if last {
            return;
        }
    }
    let _ = tx.send(Frame::Done).await;
}

impl<T, E> Keepalive<T, E> {
    /// Number of keepalive events emitted so far.
    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives_sent
    }

    /// Stop consuming: abort the pump and wait until it has fully stopped.
    pub async fn close(mut self) {
        self.finished = true;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }

    fn rearm(&mut self) {
        let deadline = Instant::now() + self.interval;
        self.timer.as_mut().reset(deadline);
    }
}

impl<T: KeepaliveEvent, E> Stream for Keepalive<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        // Buffered events always win over the timer.
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Event(event))) => {
                this.rearm();
                return Poll::Ready(Some(Ok(event)));
            }
            Poll::Ready(Some(Frame::Failed(e))) => {
                this.finished = true;
                return Poll::Ready(Some(Err(e)));
            }
            Poll::Ready(Some(Frame::Done)) | Poll::Ready(None) => {
                this.finished = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        match this.timer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.rearm();
                this.keepalives_sent += 1;
                debug!(sent = this.keepalives_sent, "Upstream quiet, emitting keepalive");
                Poll::Ready(Some(Ok(T::keepalive(&this.text))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for Keepalive<T, E> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
