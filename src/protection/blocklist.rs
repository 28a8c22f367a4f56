use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::models::block::{BlockEntry, BlockOutcome, UnblockOutcome};
use crate::storage::cache::DecisionCache;
use crate::storage::{BlockStore, StoreResult};

// ---------------------------------------------------------------------------
// BlockRegistry
// ---------------------------------------------------------------------------

/// Authoritative denylist front-end.
///
/// Every mutation drops the `blocked:` cache entry for the address before
/// returning, so a fresh block is never served as "allowed" from a stale
/// cache entry.
///
/// Addresses are keyed in canonical form: `::ffff:a.b.c.d` and `a.b.c.d`
/// name the same entry.
pub struct BlockRegistry {
    store: Arc<dyn BlockStore>,
    cache: Arc<DecisionCache>,
}

impl BlockRegistry {
    pub fn new(store: Arc<dyn BlockStore>, cache: Arc<DecisionCache>) -> Self {
        Self { store, cache }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Block `address`, reactivating an old entry if there is one.
    pub fn block(&self, address: IpAddr, reason: &str) -> StoreResult<BlockOutcome> {
        let address = address.to_canonical();
        let result = self.store.upsert_block(address, reason, Utc::now());
        // Invalidate even on error: the write may have landed.
        self.cache.invalidate_blocked(&address);

        let outcome = result?;
        match outcome {
            BlockOutcome::Created => info!(ip = %address, reason = %reason, "Blocked IP"),
            BlockOutcome::Reactivated => {
                info!(ip = %address, reason = %reason, "Reactivated block for IP")
            }
            BlockOutcome::AlreadyBlocked => warn!(ip = %address, "IP is already blocked"),
        }
        Ok(outcome)
    }

    /// Deactivate the entry for `address`; the row is kept for audit.
    pub fn unblock(&self, address: IpAddr) -> StoreResult<UnblockOutcome> {
        let address = address.to_canonical();
        let result = self.store.deactivate(address);
        self.cache.invalidate_blocked(&address);

        let outcome = result?;
        match outcome {
            UnblockOutcome::Unblocked => info!(ip = %address, "Unblocked IP"),
            UnblockOutcome::NotFound => warn!(ip = %address, "IP is not in the blocklist"),
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Uncached point lookup.
    pub fn is_active(&self, address: IpAddr) -> StoreResult<bool> {
        self.store.is_active(address.to_canonical())
    }

    /// Entries newest first.
    pub fn list(&self, only_active: bool) -> StoreResult<Vec<BlockEntry>> {
        self.store.list_blocks(only_active)
    }
}
