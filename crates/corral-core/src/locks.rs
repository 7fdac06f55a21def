//! Per-tenant run exclusion
//!
//! The live path and the scheduler both take the tenant's guard around a
//! sandbox run, so a tenant never has two sandboxes at once.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct TenantLocks {
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, folder: &str) -> Arc<Mutex<()>> {
        self.slots.entry(folder.to_string()).or_default().clone()
    }

    /// Wait for the tenant's slot; the run is exclusive while the guard lives
    pub async fn acquire(&self, folder: &str) -> OwnedMutexGuard<()> {
        let slot = self.slot(folder);
        if let Ok(guard) = slot.clone().try_lock_owned() {
            return guard;
        }
        debug!("Waiting for in-flight run of {} to finish", folder);
        slot.lock_owned().await
    }

    /// `None` when a run for the tenant is already active
    pub fn try_acquire(&self, folder: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(folder).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_tenant_is_exclusive() {
        let locks = TenantLocks::new();
        let guard = locks.acquire("team").await;
        assert!(locks.try_acquire("team").is_none());
        assert!(locks.try_acquire("other").is_some());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("team").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should get the slot")
            .unwrap();
        assert!(locks.try_acquire("team").is_some());
    }
}
