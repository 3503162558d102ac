use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// User account lookup, consulted only when adopting legacy ownership.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Err` means the directory could not answer; callers fail closed.
    async fn is_user_active(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// Fixed set of active users.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    active: DashSet<String>,
    offline: AtomicBool,
}

impl StaticDirectory {
    pub fn new<I, S>(active: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dir = Self::default();
        for user in active {
            dir.active.insert(user.into());
        }
        dir
    }

    pub fn activate(&self, user_id: &str) {
        self.active.insert(user_id.to_string());
    }

    pub fn deactivate(&self, user_id: &str) {
        self.active.remove(user_id);
    }

    /// Simulate the backing service being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn is_user_active(&self, user_id: &str) -> anyhow::Result<bool> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("user directory unavailable");
        }
        Ok(self.active.contains(user_id))
    }
}
