//! Channel configuration lookups (backed by the relational stores in production).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::{BotId, ChannelId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub channel_id: ChannelId,
    pub bot_id: BotId,
    pub workspace_id: String,
    pub enabled: bool,
    /// When set, only these senders are served.
    #[serde(default)]
    pub allowed_senders: Option<HashSet<String>>,
    #[serde(default)]
    pub blocked_senders: HashSet<String>,
}

impl ChannelProfile {
    pub fn open(channel_id: ChannelId, bot_id: BotId, workspace_id: impl Into<String>) -> Self {
        Self {
            channel_id,
            bot_id,
            workspace_id: workspace_id.into(),
            enabled: true,
            allowed_senders: None,
            blocked_senders: HashSet::new(),
        }
    }

    pub fn admits(&self, sender_id: &str) -> bool {
        if !self.enabled || self.blocked_senders.contains(sender_id) {
            return false;
        }
        match &self.allowed_senders {
            Some(allowed) => allowed.contains(sender_id),
            None => true,
        }
    }
}

#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn lookup(&self, channel: &ChannelId) -> Option<ChannelProfile>;
}

/// Directory held in memory, filled from configuration.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<ChannelId, ChannelProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = ChannelProfile>) -> Self {
        let dir = Self::new();
        for p in profiles {
            dir.upsert(p);
        }
        dir
    }

    pub fn upsert(&self, profile: ChannelProfile) {
        self.profiles
            .write()
            .insert(profile.channel_id.clone(), profile);
    }

    pub fn remove(&self, channel: &ChannelId) -> Option<ChannelProfile> {
        self.profiles.write().remove(channel)
    }
}

#[async_trait]
impl ChannelDirectory for StaticDirectory {
    async fn lookup(&self, channel: &ChannelId) -> Option<ChannelProfile> {
        self.profiles.read().get(channel).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ChannelProfile {
        ChannelProfile::open("c".into(), "b".into(), "ws")
    }

    #[test]
    fn open_profile_admits_everyone() {
        assert!(profile().admits("anyone"));
    }

    #[test]
    fn blocked_sender_rejected() {
        let mut p = profile();
        p.blocked_senders.insert("spam".into());
        assert!(!p.admits("spam"));
        assert!(p.admits("ok"));
    }

    #[test]
    fn allow_list_restricts() {
        let mut p = profile();
        p.allowed_senders = Some(HashSet::from(["vip".to_string()]));
        assert!(p.admits("vip"));
        assert!(!p.admits("other"));
    }

    #[test]
    fn disabled_channel_admits_nobody() {
        let mut p = profile();
        p.enabled = false;
        assert!(!p.admits("vip"));
    }

    #[tokio::test]
    async fn static_directory_lookup() {
        let dir = StaticDirectory::with_profiles([profile()]);
        assert!(dir.lookup(&"c".into()).await.is_some());
        assert!(dir.lookup(&"missing".into()).await.is_none());
        dir.remove(&"c".into());
        assert!(dir.lookup(&"c".into()).await.is_none());
    }
}
