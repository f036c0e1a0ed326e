use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Minimal tick shape carried across the queue: the consume loop rebuilds
/// full `Tick` values with the instrument context it owns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTick {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub volume: f64,
}

/// Result of one consumer poll. Drain detection is an explicit sentinel
/// check (`TimedOut` + `is_finished`), never exception identity.
#[derive(Debug)]
pub enum QueuePoll {
    Tick(RawTick),
    TimedOut,
    /// Producer hung up and the buffer is exhausted.
    Disconnected,
}

/// Bounded FIFO between the fetch stage and the consume stage. The bounded
/// send is the pipeline's only backpressure; `loaded` tells the consumer
/// that production is finished so that (empty, loaded) becomes the sole
/// termination condition.
pub fn tick_queue(capacity: usize, poll_timeout: Duration) -> (TickProducer, TickConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let loaded = Arc::new(AtomicBool::new(false));
    (
        TickProducer {
            tx,
            loaded: loaded.clone(),
        },
        TickConsumer {
            rx,
            loaded,
            poll_timeout,
        },
    )
}

#[derive(Debug)]
pub struct TickProducer {
    tx: mpsc::Sender<RawTick>,
    loaded: Arc<AtomicBool>,
}

impl TickProducer {
    /// Blocks (asynchronously) while the queue is full.
    pub async fn enqueue(&self, tick: RawTick) -> bool {
        self.tx.send(tick).await.is_ok()
    }

    /// Signal that every batch has been enqueued, then hang up. Consuming
    /// `self` makes it impossible to enqueue after the signal.
    pub fn mark_loaded(self) {
        self.loaded.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct TickConsumer {
    rx: mpsc::Receiver<RawTick>,
    loaded: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl TickConsumer {
    pub async fn poll(&mut self) -> QueuePoll {
        match tokio::time::timeout(self.poll_timeout, self.rx.recv()).await {
            Ok(Some(tick)) => QueuePoll::Tick(tick),
            Ok(None) => QueuePoll::Disconnected,
            Err(_) => QueuePoll::TimedOut,
        }
    }

    /// True only when production is finished AND the buffer is drained.
    pub fn is_finished(&self) -> bool {
        self.loaded.load(Ordering::SeqCst) && self.rx.is_empty()
    }
}
