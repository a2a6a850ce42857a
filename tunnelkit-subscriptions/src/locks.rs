//! Per-account async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tunnelkit_lib::AccountId;

/// Entries are pruned once the map grows past this and nobody holds them.
const PRUNE_AT: usize = 1024;

/// One async mutex per account, held across "read → decide → call panel →
/// commit".
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `account`.
    pub async fn lock(&self, account: AccountId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_AT {
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks.entry(account).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Accounts currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
