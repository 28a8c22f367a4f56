use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::analytics::alerting::{AlertEvent, AlertManager};
use crate::config::settings::EscalationConfig;
use crate::protection::blocklist::BlockRegistry;
use crate::storage::{window_start, FlagStore, StoreResult};

pub const AUTO_BLOCK_NOTE: &str = "Automatically blocked by system";

/// "24 hours", "90 minutes", "45 seconds".
fn describe_window(secs: u64) -> String {
    let (n, unit) = if secs % 3_600 == 0 {
        (secs / 3_600, "hour")
    } else if secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" })
}

// ---------------------------------------------------------------------------
// AutoEscalator
// ---------------------------------------------------------------------------

/// Turns repeatedly flagged addresses into blocks.
pub struct AutoEscalator {
    flags: Arc<dyn FlagStore>,
    registry: Arc<BlockRegistry>,
    alerting: Option<Arc<AlertManager>>,
    config: EscalationConfig,
}

impl AutoEscalator {
    pub fn new(
        flags: Arc<dyn FlagStore>,
        registry: Arc<BlockRegistry>,
        alerting: Option<Arc<AlertManager>>,
        config: &EscalationConfig,
    ) -> Self {
        info!(
            window_secs = config.window_secs,
            flag_threshold = config.flag_threshold,
            "Auto-escalation initialized"
        );
        Self {
            flags,
            registry,
            alerting,
            config: config.clone(),
        }
    }

    pub fn run(&self) -> StoreResult<u64> {
        self.run_at(Utc::now())
    }

    /// Block every address with at least `flag_threshold` unresolved flags
    /// raised since `now - window`. Returns the number of new blocks.
    pub fn run_at(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let since = window_start(now, self.config.window_secs);
        let counts = self.flags.unresolved_counts_since(since)?;

        let mut candidates: Vec<(IpAddr, u64)> = counts
            .into_iter()
            .filter(|(_, n)| *n >= self.config.flag_threshold)
            .collect();
        candidates.sort();

        let mut blocked_count = 0u64;
        for (address, flag_count) in candidates {
            if self.registry.is_active(address)? {
                debug!(ip = %address, "Already blocked, leaving flags untouched");
                continue;
            }

            let reason = format!(
                "Automatically blocked: Flagged {} times in {}",
                flag_count,
                describe_window(self.config.window_secs)
            );
            let outcome = self.registry.block(address, &reason)?;
            if !outcome.changed() {
                continue;
            }

            let resolved = self.flags.resolve_all(address, now, AUTO_BLOCK_NOTE)?;
            blocked_count += 1;
            warn!(ip = %address, flags = flag_count, resolved = resolved, "Auto-blocked IP");

            self.notify(address, flag_count);
        }

        info!(blocked = blocked_count, "Auto-escalation completed");
        Ok(blocked_count)
    }

    /// Fire-and-forget webhook; skipped outside a runtime.
    fn notify(&self, address: IpAddr, flag_count: u64) {
        let Some(alerting) = self.alerting.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let message = format!("Auto-blocked {} after {} flags", address, flag_count);
        handle.spawn(async move {
            alerting.send_alert(AlertEvent::AutoBlock, &message).await;
        });
    }
}
