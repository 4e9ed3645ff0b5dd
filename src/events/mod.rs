//! Stage Event Stream
//!
//! Delivers stage transitions to the host. One subscriber at a time: a new
//! subscription replaces the previous one (whose stream then ends), and no
//! history is buffered while nobody is listening.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::Stage;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Stage>,
}

/// Single-subscriber stage broadcaster
#[derive(Default)]
pub struct StageEventBroadcaster {
    subscriber: Mutex<Option<Subscriber>>,
    next_id: Mutex<u64>,
}

impl StageEventBroadcaster {
    /// Broadcaster with no subscriber
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe, replacing (and ending) any previous subscription
    pub fn subscribe(&self) -> StageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };

        if self.subscriber.lock().replace(Subscriber { id, tx }).is_some() {
            debug!("Stage subscriber {} replaced the previous one", id);
        }

        StageStream { id, rx }
    }

    /// End the current subscription gracefully
    pub fn unsubscribe(&self) {
        if self.subscriber.lock().take().is_some() {
            debug!("Stage subscriber removed");
        }
    }

    /// End `stream`'s subscription if it is still the current one
    pub fn unsubscribe_stream(&self, stream: &StageStream) {
        let mut slot = self.subscriber.lock();
        if slot.as_ref().map(|s| s.id) == Some(stream.id) {
            slot.take();
        }
    }

    /// Whether anyone is listening
    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .as_ref()
            .is_some_and(|s| !s.tx.is_closed())
    }

    /// Send `stage` to the subscriber, if any
    pub fn emit(&self, stage: Stage) {
        let mut slot = self.subscriber.lock();
        if let Some(subscriber) = slot.as_ref() {
            if subscriber.tx.send(stage).is_err() {
                debug!("Stage subscriber dropped its stream");
                slot.take();
            }
        }
    }
}

/// Stream of stage transitions
///
/// Ends when the subscription is replaced or removed.
#[derive(Debug)]
pub struct StageStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Stage>,
}

impl StageStream {
    /// Next stage, `None` once the subscription has ended
    pub async fn next_stage(&mut self) -> Option<Stage> {
        self.rx.recv().await
    }
}

impl Stream for StageStream {
    type Item = Stage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Stage>> {
        self.rx.poll_recv(cx)
    }
}
