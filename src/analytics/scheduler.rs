use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::analytics::retention::RetentionJob;
use crate::config::settings::{CacheConfig, ScheduleConfig};
use crate::protection::anomaly::{AnomalyDetector, DetectionReport};
use crate::protection::auto_ban::AutoEscalator;
use crate::storage::cache::DecisionCache;
use crate::storage::StoreResult;

// ---------------------------------------------------------------------------
// Job entry points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Detect,
    Escalate,
    Purge,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Detect => "detect",
            JobKind::Escalate => "escalate",
            JobKind::Purge => "purge",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "detect" => Some(Self::Detect),
            "escalate" => Some(Self::Escalate),
            "purge" => Some(Self::Purge),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_name(s)
            .ok_or_else(|| format!("unknown job: {} (expected detect, escalate or purge)", s))
    }
}

/// What a job run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobOutcome {
    Detect(DetectionReport),
    Escalate { blocked_count: u64 },
    Purge { deleted_count: u64 },
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Detect(r) => write!(f, "flagged {} address(es)", r.flagged_count),
            JobOutcome::Escalate { blocked_count } => write!(f, "blocked {} address(es)", blocked_count),
            JobOutcome::Purge { deleted_count } => write!(f, "deleted {} request record(s)", deleted_count),
        }
    }
}

/// The three stateless analysis jobs behind one dispatch point.
pub struct JobRunner {
    detector: AnomalyDetector,
    escalator: AutoEscalator,
    retention: RetentionJob,
}

impl JobRunner {
    pub fn new(detector: AnomalyDetector, escalator: AutoEscalator, retention: RetentionJob) -> Self {
        Self {
            detector,
            escalator,
            retention,
        }
    }

    pub fn run(&self, kind: JobKind) -> StoreResult<JobOutcome> {
        match kind {
            JobKind::Detect => self.detector.run().map(JobOutcome::Detect),
            JobKind::Escalate => self
                .escalator
                .run()
                .map(|blocked_count| JobOutcome::Escalate { blocked_count }),
            JobKind::Purge => self
                .retention
                .purge()
                .map(|deleted_count| JobOutcome::Purge { deleted_count }),
        }
    }

    /// Run `kind` on the blocking pool; the stores are synchronous.
    pub async fn run_blocking(self: &Arc<Self>, kind: JobKind) -> anyhow::Result<JobOutcome> {
        let runner = Arc::clone(self);
        let outcome = tokio::task::spawn_blocking(move || runner.run(kind)).await??;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fires the jobs on their intervals and sweeps expired cache entries.
pub struct Scheduler {
    jobs: Arc<JobRunner>,
    cache: Arc<DecisionCache>,
    schedule: ScheduleConfig,
    cache_cleanup: Duration,
}

fn every(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut iv = interval_at(Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Skip);
    iv
}

impl Scheduler {
    pub fn new(
        jobs: Arc<JobRunner>,
        cache: Arc<DecisionCache>,
        schedule: &ScheduleConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            jobs,
            cache,
            schedule: schedule.clone(),
            cache_cleanup: Duration::from_secs(cache_config.cleanup_interval_secs.max(1)),
        }
    }

    /// Run forever. Jobs are skipped entirely when scheduling is disabled;
    /// cache cleanup always runs.
    pub async fn run(&self) {
        let mut detect = every(self.schedule.detect_interval_secs);
        let mut escalate = every(self.schedule.escalate_interval_secs);
        let mut purge = every(self.schedule.purge_interval_secs);
        let mut cleanup = every(self.cache_cleanup.as_secs());

        if self.schedule.enabled {
            info!(
                detect_secs = self.schedule.detect_interval_secs,
                escalate_secs = self.schedule.escalate_interval_secs,
                purge_secs = self.schedule.purge_interval_secs,
                "Job scheduler started"
            );
        } else {
            info!("Job scheduler disabled; only cache cleanup will run");
        }

        loop {
            tokio::select! {
                _ = detect.tick(), if self.schedule.enabled => {
                    self.dispatch(JobKind::Detect).await;
                }

                _ = escalate.tick(), if self.schedule.enabled => {
                    self.dispatch(JobKind::Escalate).await;
                }

                _ = purge.tick(), if self.schedule.enabled => {
                    self.dispatch(JobKind::Purge).await;
                }

                _ = cleanup.tick() => {
                    let evicted = self.cache.cleanup();
                    if evicted > 0 {
                        debug!(evicted = evicted, remaining = self.cache.len(), "Evicted expired cache entries");
                    }
                }
            }
        }
    }

    /// A failed run is logged; the next tick retries.
    async fn dispatch(&self, kind: JobKind) {
        match self.jobs.run_blocking(kind).await {
            Ok(outcome) => info!(job = %kind, "Scheduled job finished: {}", outcome),
            Err(e) => error!(job = %kind, error = %e, "Scheduled job failed"),
        }
    }
}
