//! In-process signaling hub.
//!
//! Fans payloads out to the other subscribers of a scope. Subscribers whose
//! inbox is gone are pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use super::{SignalingChannel, Subscription, SubscriptionId};
use crate::error::SignalingError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub deliveries_dropped: u64,
}

struct Subscriber {
    id: SubscriptionId,
    participant: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct LocalHub {
    scopes: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    duplicate: bool,
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    deliveries_dropped: AtomicU64,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that delivers every payload twice, to exercise idempotent handlers.
    pub fn duplicating() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }

    pub async fn subscriber_count(&self, scope: &str) -> usize {
        self.scopes.read().await.get(scope).map_or(0, Vec::len)
    }

    pub async fn participants(&self, scope: &str) -> Vec<String> {
        self.scopes
            .read()
            .await
            .get(scope)
            .map(|subs| subs.iter().map(|s| s.participant.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalHub {
    async fn subscribe(
        &self,
        scope: &str,
        participant: &str,
    ) -> Result<Subscription, SignalingError> {
        let (tx, inbox) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.scopes
            .write()
            .await
            .entry(scope.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                participant: participant.to_owned(),
                tx,
            });
        Ok(Subscription { id, inbox })
    }

    async fn publish(
        &self,
        from: SubscriptionId,
        scope: &str,
        payload: String,
    ) -> Result<(), SignalingError> {
        let mut scopes = self.scopes.write().await;
        let subscribers = scopes
            .get_mut(scope)
            .ok_or_else(|| SignalingError::NotSubscribed(scope.to_owned()))?;
        if !subscribers.iter().any(|s| s.id == from) {
            return Err(SignalingError::NotSubscribed(scope.to_owned()));
        }

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let copies = if self.duplicate { 2 } else { 1 };
        subscribers.retain(|sub| {
            if sub.id == from {
                return true;
            }
            for _ in 0..copies {
                if sub.tx.send(payload.clone()).is_err() {
                    self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(scope, participant = %sub.participant, "pruning closed subscriber");
                    return false;
                }
                self.deliveries.fetch_add(1, Ordering::Relaxed);
            }
            true
        });
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId, scope: &str) {
        let mut scopes = self.scopes.write().await;
        if let Some(subscribers) = scopes.get_mut(scope) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                scopes.remove(scope);
            }
        }
    }
}
