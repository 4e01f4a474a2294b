//! Process-wide map of live session relays.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::event::StreamEvent;
use crate::observer::ObserverHandle;
use crate::session::{RelayPublisher, SessionRelay};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, instrument};

pub(crate) type SessionMap = Arc<RwLock<HashMap<String, Arc<SessionRelay>>>>;

/// Remove `relay` from the map if it is still the registered entry.
pub(crate) fn remove_session(sessions: &SessionMap, relay: &Arc<SessionRelay>) {
    let mut map = sessions.write().unwrap_or_else(|p| p.into_inner());
    if map
        .get(&relay.session_id)
        .is_some_and(|current| Arc::ptr_eq(current, relay))
    {
        map.remove(&relay.session_id);
    }
}

/// A live session as seen by supervisors.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySummary {
    pub session_id: String,
    pub user_id: String,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub events_sent: u64,
    pub observers: usize,
}

/// Registry of session relays.
///
/// Created once at startup and shared by cloning. An entry exists from
/// [`open_primary`](Self::open_primary) until its publisher finishes.
#[derive(Clone)]
pub struct RelayRegistry {
    sessions: SessionMap,
    config: RelayConfig,
}

impl RelayRegistry {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        info!(
            "Relay registry initialized (buffer={}, observer_queue={}, primary_queue={})",
            config.buffer_capacity, config.observer_queue, config.primary_queue
        );
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register the sole writer for a session.
    ///
    /// Returns the publisher and the primary consumer's receiving end.
    #[instrument(skip(self))]
    pub fn open_primary(
        &self,
        session_id: &str,
        user_id: &str,
        model_id: &str,
    ) -> Result<(RelayPublisher, mpsc::Receiver<StreamEvent>), RelayError> {
        let mut map = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if map.contains_key(session_id) {
            return Err(RelayError::AlreadyActive(session_id.to_string()));
        }

        let relay = Arc::new(SessionRelay::new(
            session_id.to_string(),
            user_id.to_string(),
            model_id.to_string(),
            self.config.buffer_capacity,
            self.config.observer_queue,
        ));
        map.insert(session_id.to_string(), relay.clone());
        drop(map);

        let (tx, rx) = mpsc::channel(self.config.primary_queue);
        info!("Primary stream registered");

        Ok((RelayPublisher::new(relay, self.sessions.clone(), tx), rx))
    }

    /// Attach an observer to a live session.
    ///
    /// The handle first replays the buffered history, then continues with
    /// live events. Fails with [`RelayError::SessionNotActive`], listing the
    /// live sessions, when `session_id` has no primary stream.
    #[instrument(skip(self))]
    pub fn subscribe_observer(&self, session_id: &str) -> Result<ObserverHandle, RelayError> {
        let relay = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned();

        relay
            .and_then(|relay| relay.subscribe())
            .ok_or_else(|| RelayError::SessionNotActive {
                session_id: session_id.to_string(),
                available: self.active_session_ids(),
            })
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(session_id)
    }

    /// Ids of sessions with a live primary, sorted.
    pub fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Live sessions, oldest first.
    pub fn list_active(&self) -> Vec<RelaySummary> {
        let relays: Vec<Arc<SessionRelay>> = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        let mut summaries: Vec<RelaySummary> = relays
            .iter()
            .map(|relay| RelaySummary {
                session_id: relay.session_id.clone(),
                user_id: relay.user_id.clone(),
                model_id: relay.model_id.clone(),
                started_at: relay.started_at,
                events_sent: relay.events_sent(),
                observers: relay.observer_count(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
