use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::settings::DetectionConfig;
use crate::models::flag::{DedupScope, NewFlag, RuleCategory};
use crate::protection::blocklist::BlockRegistry;
use crate::storage::{window_start, FlagStore, LogStore, PathFilter, StoreResult};

/// Summary of one detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub flagged_count: u64,
    pub completed_at: DateTime<Utc>,
}

/// One threshold rule evaluated over the trailing window.
#[derive(Debug, Clone)]
struct Rule {
    category: RuleCategory,
    filter: PathFilter,
    threshold: u64,
    scope: DedupScope,
}

impl Rule {
    fn subject(&self) -> Option<String> {
        match &self.filter {
            PathFilter::Prefix(p) | PathFilter::Exact(p) => Some(p.clone()),
            PathFilter::Any => None,
        }
    }

    fn reason(&self, count: u64) -> String {
        match (&self.category, &self.filter) {
            (RuleCategory::SensitivePath, PathFilter::Prefix(prefix)) => format!(
                "Excessive access to sensitive path '{}': {} requests in the last hour",
                prefix, count
            ),
            (RuleCategory::LoginAttempts, _) => format!(
                "Possible brute force attack: {} login attempts in the last hour",
                count
            ),
            _ => format!("High request volume: {} requests in the last hour", count),
        }
    }
}

/// Scans recent request history and raises suspicion flags.
pub struct AnomalyDetector {
    log: Arc<dyn LogStore>,
    flags: Arc<dyn FlagStore>,
    registry: Arc<BlockRegistry>,
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(
        log: Arc<dyn LogStore>,
        flags: Arc<dyn FlagStore>,
        registry: Arc<BlockRegistry>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            log,
            flags,
            registry,
            config: config.clone(),
        }
    }

    /// Rules in evaluation order: volume, each sensitive prefix, login.
    fn rules(&self) -> Vec<Rule> {
        let mut rules = Vec::with_capacity(self.config.sensitive_paths.len() + 2);
        rules.push(Rule {
            category: RuleCategory::Volume,
            filter: PathFilter::Any,
            threshold: self.config.volume_threshold,
            scope: DedupScope::AnyCategory,
        });
        for prefix in &self.config.sensitive_paths {
            rules.push(Rule {
                category: RuleCategory::SensitivePath,
                filter: PathFilter::Prefix(prefix.clone()),
                threshold: self.config.sensitive_path_threshold,
                scope: DedupScope::AnyCategory,
            });
        }
        rules.push(Rule {
            category: RuleCategory::LoginAttempts,
            filter: PathFilter::Exact(self.config.login_path.clone()),
            threshold: self.config.login_threshold,
            scope: DedupScope::Path {
                category: RuleCategory::LoginAttempts,
                path: self.config.login_path.clone(),
            },
        });
        rules
    }

    pub fn run(&self) -> StoreResult<DetectionReport> {
        self.run_at(Utc::now())
    }

    /// Evaluate every rule over `[now - window, now]`. A store error aborts
    /// the run; flags already written stay.
    pub fn run_at(&self, now: DateTime<Utc>) -> StoreResult<DetectionReport> {
        info!("Starting anomaly detection");

        let since = window_start(now, self.config.window_secs);
        let dedup_since = window_start(now, self.config.dedup_window_secs);
        let mut flagged_count = 0u64;

        for rule in self.rules() {
            let counts = self.log.count_by_address(since, &rule.filter)?;

            let mut offenders: Vec<(IpAddr, u64)> = counts
                .into_iter()
                .filter(|(_, count)| *count > rule.threshold)
                .collect();
            offenders.sort();

            for (address, count) in offenders {
                if self.registry.is_active(address)? {
                    debug!(ip = %address, rule = %rule.category, "Skipping blocked IP");
                    continue;
                }

                let flag = NewFlag {
                    address,
                    category: rule.category,
                    reason: rule.reason(count),
                    subject: rule.subject(),
                    request_count: count,
                    flagged_at: now,
                };

                match self.flags.insert_flag_unless_recent(&flag, dedup_since, &rule.scope)? {
                    Some(id) => {
                        flagged_count += 1;
                        warn!(
                            ip = %address,
                            rule = %rule.category,
                            requests = count,
                            flag_id = id,
                            "Flagged suspicious IP"
                        );
                    }
                    None => {
                        debug!(ip = %address, rule = %rule.category, "Recent unresolved flag exists, skipping");
                    }
                }
            }
        }

        info!(flagged = flagged_count, "Anomaly detection completed");

        Ok(DetectionReport {
            flagged_count,
            completed_at: Utc::now(),
        })
    }
}
