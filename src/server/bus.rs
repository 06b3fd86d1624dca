//! Per-session event sequencing, persistence, and live fan-out.
//!
//! Every frame destined for a session flows through [`EventBus::publish`]:
//! the bus assigns the next sequence number under a per-session entry,
//! persists the event (with bounded retries), then forwards it to the live
//! SSE subscriber if one is attached. The persistent log is the source of
//! truth -- a missing or slow subscriber never affects the task.
//!
//! A session has at most one live subscriber; subscribing again closes the
//! previous stream by dropping its sender.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::store::events::FrameSideEffect;
use super::store::{Store, StoreError};
use crate::types::{EventType, SessionEvent};

/// Buffered events per live subscriber before writes become lossy.
const SUBSCRIBER_BUFFER: usize = 256;

/// Persistence attempts per event.
const PERSIST_ATTEMPTS: u32 = 3;

/// Base backoff between persistence attempts.
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(50);

struct SessionChannel {
    next_seq: i64,
    live: Option<mpsc::Sender<SessionEvent>>,
}

/// The event bus.
pub struct EventBus {
    store: Store,
    sessions: Mutex<HashMap<String, SessionChannel>>,
}

impl EventBus {
    /// Create a bus over the given store.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Assign the next sequence number, persist the event with its side
    /// effects, and forward it to the live subscriber if attached.
    ///
    /// Returns the assigned sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails after all retries; the
    /// event is not delivered in that case.
    pub async fn publish(
        &self,
        session_id: &str,
        event_type: EventType,
        content: Value,
        side: FrameSideEffect,
    ) -> Result<i64, StoreError> {
        let mut sessions = self.sessions.lock().await;

        let next_seq_if_new = if sessions.contains_key(session_id) {
            0
        } else {
            self.store
                .last_seq(session_id)
                .await?
                .map_or(0, |last| last.saturating_add(1))
        };
        let channel = sessions
            .entry(session_id.to_owned())
            .or_insert(SessionChannel {
                next_seq: next_seq_if_new,
                live: None,
            });
        let seq = channel.next_seq;

        let mut last_error: Option<StoreError> = None;
        for attempt in 0..PERSIST_ATTEMPTS {
            if attempt > 0 {
                let exp = attempt.saturating_sub(1).min(4);
                tokio::time::sleep(PERSIST_BASE_DELAY.saturating_mul(1u32 << exp)).await;
            }
            match self
                .store
                .apply_frame(session_id, seq, event_type, &content, &side)
                .await
            {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(err) => {
                    warn!(session_id, seq, attempt, error = %err, "event persist failed");
                    last_error = Some(err);
                }
            }
        }
        if let Some(err) = last_error {
            return Err(err);
        }

        channel.next_seq = seq.saturating_add(1);

        let mut detach = false;
        if let Some(sender) = &channel.live {
            let event = SessionEvent {
                seq,
                event_type,
                content,
            };
            detach = sender.try_send(event).is_err();
        }
        if detach {
            // Subscriber gone or hopelessly behind; it can replay from the
            // store on reconnect.
            debug!(session_id, "detaching stale event subscriber");
            channel.live = None;
        }

        Ok(seq)
    }

    /// Attach a subscriber: returns all persisted events in order plus a
    /// receiver for live events. Any previous subscriber's stream is
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay read fails.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(Vec<SessionEvent>, mpsc::Receiver<SessionEvent>), StoreError> {
        // Hold the lock across the replay read so no event can land
        // between the snapshot and the live attach.
        let mut sessions = self.sessions.lock().await;
        let replay = self.store.events_from(session_id, 0).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let next_seq = replay.last().map_or(0, |e| e.seq.saturating_add(1));
        match sessions.get_mut(session_id) {
            Some(channel) => channel.live = Some(tx),
            None => {
                sessions.insert(
                    session_id.to_owned(),
                    SessionChannel {
                        next_seq,
                        live: Some(tx),
                    },
                );
            }
        }
        Ok((replay, rx))
    }

    /// Drop bus state for a finished or deleted session.
    pub async fn forget(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    /// The backing store.
    pub fn store(&self) -> &Store {
        &self.store
    }
}
