use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::events::MediaKind;
use relay_core::presence::TypingState;
use relay_core::{ChannelId, ChatId};

use crate::error::StoreError;
use crate::kv::KvStore;

#[derive(Clone, Debug)]
pub struct TypingConfig {
    /// How long a composing indicator stays valid without a refresh.
    pub ttl: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20),
        }
    }
}

/// "User is composing" indicators, keyed `<channel>:<chat>`.
#[derive(Clone)]
pub struct TypingStore {
    store: Arc<dyn KvStore<TypingState>>,
    config: TypingConfig,
}

impl TypingStore {
    pub fn new(store: Arc<dyn KvStore<TypingState>>, config: TypingConfig) -> Self {
        Self { store, config }
    }

    fn key(channel: &ChannelId, chat: &ChatId) -> String {
        format!("{channel}:{chat}")
    }

    /// Create or refresh the indicator.
    pub async fn set_typing(
        &self,
        channel: &ChannelId,
        chat: &ChatId,
        media: MediaKind,
    ) -> Result<(), StoreError> {
        let state = TypingState {
            media,
            updated_at: Utc::now(),
        };
        self.store
            .save(&Self::key(channel, chat), &state, self.config.ttl)
            .await
    }

    pub async fn get(&self, channel: &ChannelId, chat: &ChatId) -> Result<Option<TypingState>, StoreError> {
        self.store.get(&Self::key(channel, chat)).await
    }

    /// Whether a fresh indicator exists. Stale records that outlived their
    /// TTL on a lagging backend don't count.
    pub async fn is_typing(&self, channel: &ChannelId, chat: &ChatId) -> Result<bool, StoreError> {
        let Some(state) = self.get(channel, chat).await? else {
            return Ok(false);
        };
        let age = Utc::now()
            .signed_duration_since(state.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(age < self.config.ttl)
    }

    pub async fn clear(&self, channel: &ChannelId, chat: &ChatId) -> Result<bool, StoreError> {
        self.store.delete(&Self::key(channel, chat)).await
    }
}
