//! Per-tenant mutual exclusion.
//!
//! Resolve → gate → send → ledger append must not interleave for two
//! invoices of the same tenant, or both could pass the cooldown and
//! daily-cap checks on the same stale history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle locks are pruned once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// A map of lazily created async locks keyed by tenant id.
#[derive(Default)]
pub struct TenantLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tenant_id`. Released on drop.
    pub async fn lock(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of tracked tenants.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
