//! Best-effort pub/sub transport for call control messages.
//!
//! A [`SignalingChannel`] moves opaque JSON payloads between the current
//! subscribers of a scope. [`ChannelClient`] is the typed side: it encodes
//! outgoing [`ChannelMessage`]s and decodes inbound payloads into a dispatch
//! callback. Nothing here orders, deduplicates or retries; callers must be
//! idempotent and timeout-driven.

pub mod hub;
pub mod message;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SignalingError;

pub use hub::{HubStats, LocalHub};
pub use message::{
    ChannelMessage, PresenceEvent, RoomPresence, SignalKind, SignalingMessage,
};

pub type SubscriptionId = u64;

/// Receiving half of a subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub inbox: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn subscribe(&self, scope: &str, participant: &str)
        -> Result<Subscription, SignalingError>;

    /// Delivers `payload` to every subscriber of `scope` except `from`.
    async fn publish(
        &self,
        from: SubscriptionId,
        scope: &str,
        payload: String,
    ) -> Result<(), SignalingError>;

    async fn unsubscribe(&self, id: SubscriptionId, scope: &str);
}

/// A participant's typed membership in one scope.
pub struct ChannelClient {
    channel: Arc<dyn SignalingChannel>,
    id: SubscriptionId,
    scope: String,
    participant: String,
    dispatcher: JoinHandle<()>,
}

impl ChannelClient {
    /// Joins `scope` and routes every decodable inbound message to `dispatch`.
    pub async fn subscribe<F>(
        channel: Arc<dyn SignalingChannel>,
        scope: &str,
        participant: &str,
        dispatch: F,
    ) -> Result<Self, SignalingError>
    where
        F: Fn(ChannelMessage) + Send + Sync + 'static,
    {
        let Subscription { id, mut inbox } = channel.subscribe(scope, participant).await?;

        let label = format!("{participant}@{scope}");
        let dispatcher = tokio::spawn(async move {
            while let Some(payload) = inbox.recv().await {
                match serde_json::from_str::<ChannelMessage>(&payload) {
                    Ok(message) => dispatch(message),
                    Err(err) => warn!(subscriber = %label, %err, "dropping undecodable signaling payload"),
                }
            }
            debug!(subscriber = %label, "signaling inbox closed");
        });

        debug!(participant, scope, id, "subscribed");
        Ok(Self {
            channel,
            id,
            scope: scope.to_owned(),
            participant: participant.to_owned(),
            dispatcher,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub async fn send(&self, message: impl Into<ChannelMessage>) -> Result<(), SignalingError> {
        let payload = serde_json::to_string(&message.into())?;
        self.channel.publish(self.id, &self.scope, payload).await
    }

    pub async fn unsubscribe(self) {
        self.channel.unsubscribe(self.id, &self.scope).await;
        self.dispatcher.abort();
        debug!(participant = %self.participant, scope = %self.scope, "unsubscribed");
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
