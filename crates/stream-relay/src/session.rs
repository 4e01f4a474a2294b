//! One session's broadcast state and its single writer.

use crate::event::{EventKind, StreamEvent};
use crate::observer::ObserverHandle;
use crate::registry::{remove_session, SessionMap};
use crate::RelayError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Mutable per-session state. Every read and write goes through one lock so
/// that a subscriber's history snapshot and its registration are atomic
/// relative to publishing.
struct Channel {
    next_sequence: u64,
    buffer: VecDeque<StreamEvent>,
    observers: HashMap<u64, mpsc::Sender<StreamEvent>>,
    next_observer_id: u64,
    closed: bool,
}

/// Broadcast hub for one session.
pub(crate) struct SessionRelay {
    pub(crate) session_id: String,
    pub(crate) user_id: String,
    pub(crate) model_id: String,
    pub(crate) started_at: DateTime<Utc>,
    buffer_capacity: usize,
    observer_queue: usize,
    state: Mutex<Channel>,
}

impl SessionRelay {
    pub(crate) fn new(
        session_id: String,
        user_id: String,
        model_id: String,
        buffer_capacity: usize,
        observer_queue: usize,
    ) -> Self {
        Self {
            session_id,
            user_id,
            model_id,
            started_at: Utc::now(),
            buffer_capacity,
            observer_queue,
            state: Mutex::new(Channel {
                next_sequence: 0,
                buffer: VecDeque::with_capacity(buffer_capacity.min(64)),
                observers: HashMap::new(),
                next_observer_id: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number the event, buffer it and hand it to every observer.
    ///
    /// A terminal event also detaches all observers and discards the buffer.
    pub(crate) fn broadcast(&self, kind: EventKind, payload: String) -> StreamEvent {
        let mut channel = self.lock();

        let event = StreamEvent {
            sequence: channel.next_sequence,
            kind,
            payload,
        };
        channel.next_sequence += 1;

        if channel.buffer.len() >= self.buffer_capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(event.clone());

        let terminal = kind.is_terminal();
        let session_id = &self.session_id;
        channel.observers.retain(|id, tx| {
            // The last slot is kept for the terminal event
            if !terminal && tx.capacity() <= 1 {
                warn!(session_id = %session_id, observer = id, "Observer queue overflow, dropping observer");
                return false;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %session_id, observer = id, "Observer queue full at close, dropping observer");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, observer = id, "Observer already gone");
                    false
                }
            }
        });

        if terminal {
            channel.closed = true;
            channel.observers.clear();
            channel.buffer.clear();
        }

        event
    }

    /// Snapshot the buffer and attach a new observer in one critical section.
    ///
    /// Returns `None` once the session has closed.
    pub(crate) fn subscribe(self: &Arc<Self>) -> Option<ObserverHandle> {
        let mut channel = self.lock();
        if channel.closed {
            return None;
        }

        let id = channel.next_observer_id;
        channel.next_observer_id += 1;

        let (tx, rx) = mpsc::channel(self.observer_queue + 1);
        let history: Vec<StreamEvent> = channel.buffer.iter().cloned().collect();
        let next_sequence = channel.next_sequence;
        channel.observers.insert(id, tx);
        let observers = channel.observers.len();
        drop(channel);

        info!(
            session_id = %self.session_id,
            observer = id,
            replayed = history.len(),
            observers,
            "Observer attached"
        );

        Some(ObserverHandle::new(
            id,
            self.session_id.clone(),
            history,
            next_sequence,
            rx,
            Arc::downgrade(self),
        ))
    }

    /// Remove an observer. Returns whether it was still attached.
    pub(crate) fn detach(&self, observer_id: u64) -> bool {
        self.lock().observers.remove(&observer_id).is_some()
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub(crate) fn events_sent(&self) -> u64 {
        self.lock().next_sequence
    }
}

/// Sole writer for a session's stream.
///
/// Created by [`RelayRegistry::open_primary`](crate::RelayRegistry::open_primary)
/// together with the primary consumer's receiver. Not `Clone`: one writer per
/// session. Finish with [`complete`](Self::complete) or [`fail`](Self::fail);
/// dropping an unfinished publisher closes the stream with an error event.
pub struct RelayPublisher {
    relay: Arc<SessionRelay>,
    sessions: SessionMap,
    primary: mpsc::Sender<StreamEvent>,
    /// Token broadcast to observers but not yet queued for the primary.
    pending: Option<StreamEvent>,
    primary_connected: bool,
    closed: bool,
}

impl RelayPublisher {
    pub(crate) fn new(
        relay: Arc<SessionRelay>,
        sessions: SessionMap,
        primary: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            relay,
            sessions,
            primary,
            pending: None,
            primary_connected: true,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.relay.session_id
    }

    /// Sequence number the next event will get.
    pub fn next_sequence(&self) -> u64 {
        self.relay.events_sent()
    }

    pub fn observer_count(&self) -> usize {
        self.relay.observer_count()
    }

    /// Whether the primary consumer is still receiving.
    pub fn primary_connected(&self) -> bool {
        self.primary_connected && !self.primary.is_closed()
    }

    /// Resolves once the primary consumer has gone away.
    pub async fn primary_closed(&self) {
        self.primary.closed().await
    }

    /// Broadcast a token delta to observers and the primary consumer.
    ///
    /// Observers always receive the event. If the primary consumer has
    /// disconnected, returns [`RelayError::PrimaryDisconnected`]; the caller
    /// is expected to stop and [`fail`](Self::fail) the stream.
    ///
    /// Cancel-safe: if the returned future is dropped while waiting for
    /// room in the primary queue, the event is kept and delivered ahead of
    /// the terminal event.
    pub async fn publish(&mut self, text: impl Into<String>) -> Result<u64, RelayError> {
        let event = self.relay.broadcast(EventKind::Token, text.into());
        let sequence = event.sequence;

        if !self.primary_connected {
            return Err(RelayError::PrimaryDisconnected(
                self.relay.session_id.clone(),
            ));
        }

        self.pending = Some(event);
        match self.primary.reserve().await {
            Ok(permit) => {
                if let Some(event) = self.pending.take() {
                    permit.send(event);
                }
                Ok(sequence)
            }
            Err(_) => {
                self.pending = None;
                self.primary_connected = false;
                Err(RelayError::PrimaryDisconnected(
                    self.relay.session_id.clone(),
                ))
            }
        }
    }

    /// Close the stream with a `complete` event.
    pub async fn complete(self, payload: impl Into<String>) -> StreamEvent {
        self.finish(EventKind::Complete, payload.into()).await
    }

    /// Close the stream with an `error` event.
    pub async fn fail(self, message: impl Into<String>) -> StreamEvent {
        self.finish(EventKind::Error, message.into()).await
    }

    async fn finish(mut self, kind: EventKind, payload: String) -> StreamEvent {
        let event = self.close_relay(kind, payload);
        self.deliver_terminal(event.clone());
        event
    }

    /// Queue any pending token and the terminal event for the primary
    /// without waiting on it. A full queue is drained in the background so a
    /// stalled consumer cannot hold the writer.
    fn deliver_terminal(&mut self, event: StreamEvent) {
        let pending = self.pending.take();
        if !self.primary_connected {
            return;
        }

        let mut backlog: VecDeque<StreamEvent> = pending.into_iter().collect();
        backlog.push_back(event);

        while let Some(event) = backlog.pop_front() {
            match self.primary.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %self.relay.session_id, "Primary gone before terminal event");
                    return;
                }
            }
        }
        if backlog.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.relay.session_id, "No runtime to deliver terminal event");
            return;
        };
        debug!(session_id = %self.relay.session_id, "Primary queue full, delivering terminal event in background");
        let primary = self.primary.clone();
        runtime.spawn(async move {
            for event in backlog {
                if primary.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn close_relay(&mut self, kind: EventKind, payload: String) -> StreamEvent {
        self.closed = true;
        let event = self.relay.broadcast(kind, payload);
        remove_session(&self.sessions, &self.relay);

        info!(
            session_id = %self.relay.session_id,
            kind = %kind,
            events = event.sequence + 1,
            "Relay closed"
        );
        event
    }
}

impl Drop for RelayPublisher {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(session_id = %self.relay.session_id, "Publisher dropped without a terminal event");
        let event = self.close_relay(
            EventKind::Error,
            "stream ended unexpectedly".to_string(),
        );
        self.deliver_terminal(event);
    }
}
