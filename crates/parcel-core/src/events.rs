//! Backend push updates as a closed set of variants.
//!
//! The relay bridge long-polls update batches; [`pump_updates`] forwards them
//! over one `mpsc` channel and [`consume_updates`] reacts to the few that
//! matter to the gateway. Everything else is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::AuthSessionManager;
use crate::backend::{BackendError, BackendResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    /// Direct message to the relay account.
    ShortMessage {
        message_id: i64,
        user_id: i64,
        #[serde(default)]
        text: String,
    },
    /// Message in a group or channel the relay account is part of.
    ShortChatMessage {
        message_id: i64,
        chat_id: i64,
        from_id: i64,
        #[serde(default)]
        text: String,
    },
    /// Several updates delivered together.
    Batch { updates: Vec<UpdateEvent> },
    /// The backend dropped updates; local state must be refetched.
    TooLong,
    /// The relay session was terminated on the backend side.
    AuthorizationRevoked,
    #[serde(other)]
    Unknown,
}

impl UpdateEvent {
    /// Expand nested batches into a flat, ordered list.
    pub fn flatten(self) -> Vec<Self> {
        match self {
            Self::Batch { updates } => updates.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    pub next_offset: i64,
    #[serde(default)]
    pub events: Vec<UpdateEvent>,
}

/// Anything that can be long-polled for update batches.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn next_batch(&self, offset: i64, wait: Duration) -> BackendResult<UpdateBatch>;
}

/// Poll `source` until the receiving side of `tx` is dropped.
pub async fn pump_updates<S>(source: Arc<S>, tx: mpsc::Sender<UpdateEvent>, wait: Duration, retry_delay: Duration)
where
    S: UpdateSource + ?Sized,
{
    let mut offset = 0;
    while !tx.is_closed() {
        match source.next_batch(offset, wait).await {
            Ok(batch) => {
                offset = batch.next_offset.max(offset);
                for event in batch.events.into_iter().flat_map(UpdateEvent::flatten) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(BackendError::Unauthorized(_)) => {
                tracing::debug!("Update feed unavailable until the relay session is authorized");
                tokio::time::sleep(retry_delay).await;
            }
            Err(error) => {
                tracing::warn!(offset, "Update poll failed: {}", error);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Drain `rx`, reacting to session-relevant events.
pub async fn consume_updates(mut rx: mpsc::Receiver<UpdateEvent>, auth: Arc<AuthSessionManager>) {
    while let Some(event) = rx.recv().await {
        handle_update(event, &auth);
    }
}

fn handle_update(event: UpdateEvent, auth: &AuthSessionManager) {
    match event {
        UpdateEvent::ShortMessage {
            message_id,
            user_id,
            ..
        } => {
            tracing::debug!(message_id, user_id, "Ignoring direct message to relay account");
        }
        UpdateEvent::ShortChatMessage {
            message_id,
            chat_id,
            ..
        } => {
            tracing::debug!(message_id, chat_id, "Ignoring chat message");
        }
        UpdateEvent::Batch { updates } => {
            for nested in updates {
                handle_update(nested, auth);
            }
        }
        UpdateEvent::TooLong => {
            tracing::warn!("Backend reported an update gap; pending updates were dropped");
        }
        UpdateEvent::AuthorizationRevoked => {
            auth.invalidate("authorization revoked by backend");
        }
        UpdateEvent::Unknown => {
            tracing::trace!("Ignoring unrecognized update");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::AuthState;
    use crate::testing::FakeBackend;

    #[test]
    fn deserializes_tagged_events_and_unknown_shapes() {
        let batch: UpdateBatch = serde_json::from_str(
            r#"{
                "nextOffset": 12,
                "events": [
                    {"type": "shortMessage", "message_id": 1, "user_id": 7, "text": "hi"},
                    {"type": "tooLong"},
                    {"type": "channelParticipant", "channel_id": 3}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(batch.next_offset, 12);
        assert_eq!(
            batch.events,
            vec![
                UpdateEvent::ShortMessage {
                    message_id: 1,
                    user_id: 7,
                    text: "hi".to_string()
                },
                UpdateEvent::TooLong,
                UpdateEvent::Unknown,
            ]
        );
    }

    #[test]
    fn flatten_expands_nested_batches_in_order() {
        let event = UpdateEvent::Batch {
            updates: vec![
                UpdateEvent::TooLong,
                UpdateEvent::Batch {
                    updates: vec![UpdateEvent::AuthorizationRevoked, UpdateEvent::Unknown],
                },
            ],
        };
        assert_eq!(
            event.flatten(),
            vec![
                UpdateEvent::TooLong,
                UpdateEvent::AuthorizationRevoked,
                UpdateEvent::Unknown
            ]
        );
    }

    struct OneShotSource;

    #[async_trait]
    impl UpdateSource for OneShotSource {
        async fn next_batch(&self, offset: i64, _wait: Duration) -> BackendResult<UpdateBatch> {
            if offset > 0 {
                return Err(BackendError::Unavailable("drained".to_string()));
            }
            Ok(UpdateBatch {
                next_offset: 2,
                events: vec![UpdateEvent::Batch {
                    updates: vec![UpdateEvent::TooLong, UpdateEvent::AuthorizationRevoked],
                }],
            })
        }
    }

    #[tokio::test]
    async fn pump_forwards_flattened_events_and_stops_when_receiver_drops() {
        let (tx, mut rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_updates(
            Arc::new(OneShotSource),
            tx,
            Duration::from_secs(0),
            Duration::from_millis(5),
        ));

        assert_eq!(rx.recv().await, Some(UpdateEvent::TooLong));
        assert_eq!(rx.recv().await, Some(UpdateEvent::AuthorizationRevoked));
        drop(rx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn revoked_authorization_invalidates_session() {
        let backend = Arc::new(FakeBackend::new().with_identity());
        let auth = Arc::new(AuthSessionManager::new(backend));
        auth.check_existing().await.unwrap();
        assert_eq!(auth.snapshot().state, AuthState::Authorized);

        let (tx, rx) = mpsc::channel(4);
        tx.send(UpdateEvent::AuthorizationRevoked).await.unwrap();
        drop(tx);
        consume_updates(rx, auth.clone()).await;

        assert_eq!(auth.snapshot().state, AuthState::Unauthenticated);
    }
}
