//! Observer side of a session relay.

use crate::event::StreamEvent;
use crate::session::SessionRelay;
use futures::Stream;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::debug;

/// What an observer sees, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverMessage {
    /// Replay begins. `first_sequence` is the oldest buffered event; if it
    /// is above 0, earlier events were evicted from the buffer.
    HistoryStart { first_sequence: u64, count: usize },
    /// A replayed or live event.
    Event(StreamEvent),
    /// Replay done; live events continue from `next_sequence`.
    HistoryEnd { next_sequence: u64 },
    /// The observer fell too far behind and was detached.
    Dropped,
}

/// A subscription to one session's stream.
///
/// Dropping the handle (or the stream made from it) detaches the observer
/// without affecting the primary stream or other observers.
pub struct ObserverHandle {
    id: u64,
    session_id: String,
    history: Vec<StreamEvent>,
    next_sequence: u64,
    receiver: mpsc::Receiver<StreamEvent>,
    guard: DetachGuard,
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

struct DetachGuard {
    id: u64,
    session_id: String,
    relay: Weak<SessionRelay>,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            if relay.detach(self.id) {
                debug!(session_id = %self.session_id, observer = self.id, "Observer detached");
            }
        }
    }
}

impl ObserverHandle {
    pub(crate) fn new(
        id: u64,
        session_id: String,
        history: Vec<StreamEvent>,
        next_sequence: u64,
        receiver: mpsc::Receiver<StreamEvent>,
        relay: Weak<SessionRelay>,
    ) -> Self {
        Self {
            id,
            session_id: session_id.clone(),
            history,
            next_sequence,
            receiver,
            guard: DetachGuard {
                id,
                session_id,
                relay,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Events buffered at subscription time, oldest first.
    pub fn history(&self) -> &[StreamEvent] {
        &self.history
    }

    /// Sequence of the first live event.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn first_sequence(&self) -> u64 {
        self.history
            .first()
            .map(|e| e.sequence)
            .unwrap_or(self.next_sequence)
    }

    /// Next live event. `None` once the session closed or the observer was
    /// dropped for falling behind.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Replay markers, history, then live events until the terminal event.
    pub fn into_stream(self) -> impl Stream<Item = ObserverMessage> + Send + 'static {
        let first_sequence = self.first_sequence();
        let ObserverHandle {
            history,
            next_sequence,
            mut receiver,
            guard,
            ..
        } = self;

        async_stream::stream! {
            let _guard = guard;

            yield ObserverMessage::HistoryStart {
                first_sequence,
                count: history.len(),
            };
            for event in history {
                yield ObserverMessage::Event(event);
            }
            yield ObserverMessage::HistoryEnd { next_sequence };

            loop {
                match receiver.recv().await {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        yield ObserverMessage::Event(event);
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        yield ObserverMessage::Dropped;
                        break;
                    }
                }
            }
        }
    }
}
