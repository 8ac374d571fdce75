//! # Message Reactions
//!
//! Optimistic reaction toggles for chat messages. A toggle updates the local
//! reaction map immediately, queues a `reaction` sync operation and emits
//! `reaction_updated`. Completion commits it, failure rolls it back, and a
//! `reactions_updated` push from the server replaces the local view.

use super::optimistic::{OptimisticEngine, PendingKey, ServerState};
use super::queue::{NewOperation, SyncQueue};
use crate::shared::error::Result;
use crate::shared::event::{EventBus, ReactionEvent, ReactionMap, SyncEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Push event carrying authoritative reactions
pub const REACTIONS_UPDATED_EVENT: &str = "reactions_updated";

/// Sync operation name for reaction toggles
pub const REACTION_OPERATION: &str = "reaction";

/// Result of a local toggle
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionToggle {
    /// Pending marker of the optimistic change
    pub pending_key: PendingKey,
    /// Sync operation delivering it
    pub operation_id: Uuid,
    /// true when the reaction was added
    pub added: bool,
    /// Local reactions after the toggle
    pub reactions: ReactionMap,
}

#[derive(Debug, Deserialize)]
struct ReactionsPush {
    message_id: String,
    reactions: ReactionMap,
    #[serde(default)]
    revision: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReactionPayload<'a> {
    message_id: &'a str,
    actor_id: &'a str,
    emoji: &'a str,
    action: &'static str,
}

fn entity_key(message_id: &str) -> String {
    format!("reactions/{}", message_id)
}

fn message_id_of(entity: &str) -> Option<&str> {
    entity.strip_prefix("reactions/")
}

fn parse_reactions(value: &Value) -> ReactionMap {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn set_reaction(value: &Value, emoji: &str, actor_id: &str, present: bool) -> Value {
    let mut reactions = parse_reactions(value);
    if present {
        reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(actor_id.to_string());
    } else if let Some(actors) = reactions.get_mut(emoji) {
        actors.remove(actor_id);
        if actors.is_empty() {
            reactions.remove(emoji);
        }
    }
    serde_json::to_value(reactions).unwrap_or(Value::Null)
}

/// Reaction toggles on top of the optimistic engine and sync queue
#[derive(Debug)]
pub struct ReactionService {
    engine: Arc<OptimisticEngine>,
    queue: Arc<SyncQueue>,
    events: EventBus<ReactionEvent>,
}

impl ReactionService {
    /// Create the service
    pub fn new(
        engine: Arc<OptimisticEngine>,
        queue: Arc<SyncQueue>,
        events: EventBus<ReactionEvent>,
    ) -> Self {
        Self {
            engine,
            queue,
            events,
        }
    }

    /// Local reactions on a message
    pub async fn reactions(&self, message_id: &str) -> ReactionMap {
        self.engine
            .local_version(&entity_key(message_id))
            .await
            .map(|v| parse_reactions(&v))
            .unwrap_or_default()
    }

    /// Toggle `actor_id`'s `emoji` on a message
    ///
    /// A second toggle of the same emoji by the same actor while the first is
    /// still pending is rejected with `AlreadyPending` and sends nothing.
    pub async fn toggle_reaction(
        &self,
        message_id: &str,
        actor_id: &str,
        emoji: &str,
    ) -> Result<ReactionToggle> {
        let entity = entity_key(message_id);
        let added = !self
            .reactions(message_id)
            .await
            .get(emoji)
            .map_or(false, |actors| actors.contains(actor_id));

        let (emoji_owned, actor_owned) = (emoji.to_string(), actor_id.to_string());
        let pending_key = self
            .engine
            .apply_optimistic(&entity, actor_id, &format!("reaction:{}", emoji), move |value| {
                set_reaction(value, &emoji_owned, &actor_owned, added)
            })
            .await?;

        let payload = serde_json::to_value(ReactionPayload {
            message_id,
            actor_id,
            emoji,
            action: if added { "add" } else { "remove" },
        })?;
        let operation_id = Uuid::new_v4();
        self.engine.attach_operation(&pending_key, operation_id).await;
        let operation =
            NewOperation::custom(REACTION_OPERATION, message_id, payload).with_id(operation_id);
        if let Err(e) = self.queue.enqueue(operation).await {
            self.engine.reject(&pending_key).await;
            return Err(e);
        }

        let reactions = self.reactions(message_id).await;
        tracing::debug!(
            "[Reactions] {} {} {} on {}",
            actor_id,
            if added { "added" } else { "removed" },
            emoji,
            message_id
        );
        self.events.publish(ReactionEvent::Updated {
            message_id: message_id.to_string(),
            actor_id: actor_id.to_string(),
            emoji: emoji.to_string(),
            added,
            reactions: reactions.clone(),
        });

        Ok(ReactionToggle {
            pending_key,
            operation_id,
            added,
            reactions,
        })
    }

    /// Apply authoritative reactions for a message
    pub async fn reconcile(
        &self,
        message_id: &str,
        reactions: ReactionMap,
        revision: Option<u64>,
    ) -> Result<ReactionMap> {
        let value = serde_json::to_value(&reactions)?;
        let local = self
            .engine
            .reconcile(&entity_key(message_id), ServerState::new(value, revision))
            .await;
        let reactions = parse_reactions(&local);
        self.events.publish(ReactionEvent::Reconciled {
            message_id: message_id.to_string(),
            reactions: reactions.clone(),
        });
        Ok(reactions)
    }

    /// Handle a server push; returns true if it was a reactions update
    pub async fn handle_push(&self, event: &str, payload: &Value) -> bool {
        if event != REACTIONS_UPDATED_EVENT {
            return false;
        }
        match serde_json::from_value::<ReactionsPush>(payload.clone()) {
            Ok(push) => {
                if let Err(e) = self
                    .reconcile(&push.message_id, push.reactions, push.revision)
                    .await
                {
                    tracing::warn!("[Reactions] reconcile failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("[Reactions] malformed {} push: {}", event, e),
        }
        true
    }

    /// Confirm or roll back the toggle a sync event refers to
    pub async fn handle_sync_event(&self, event: &SyncEvent) {
        let (operation_id, outcome) = match event {
            SyncEvent::Completed {
                operation_id,
                response,
                ..
            } => (*operation_id, Some(response)),
            SyncEvent::Failed { operation_id, .. } => (*operation_id, None),
            _ => return,
        };
        let Some((entity, key)) = self.engine.find_by_operation(operation_id).await else {
            return;
        };
        let Some(message_id) = message_id_of(&entity) else {
            return;
        };

        let local = match outcome {
            Some(response) => {
                let server = response.get("reactions").map(|reactions| {
                    ServerState::new(
                        reactions.clone(),
                        response.get("revision").and_then(Value::as_u64),
                    )
                });
                let authoritative = server.is_some();
                let local = self.engine.confirm(&key, server).await;
                if !authoritative {
                    return;
                }
                local
            }
            None => {
                tracing::info!("[Reactions] toggle on {} failed, rolling back", message_id);
                self.engine.reject(&key).await
            }
        };

        if let Some(local) = local {
            self.events.publish(ReactionEvent::Reconciled {
                message_id: message_id.to_string(),
                reactions: parse_reactions(&local),
            });
        }
    }

    /// Follow the queue's settlement feed until the queue is dropped
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut settlements = self.queue.settlements();
        tokio::spawn(async move {
            while let Some(event) = settlements.recv().await {
                service.handle_sync_event(&event).await;
            }
        })
    }
}
