//! Periodic reporting of kubelet device assignments to the inventory.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::assignment::AssignmentMap;
use super::assignment::AssignmentSource;
use super::inventory::ResourceManager;

pub const RECONCILE_PERIOD: Duration = Duration::from_secs(3 * 60);
pub const MAX_STARTUP_DELAY: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_INDIVIDUAL_MARKER: &str = "4J5";

/// Report calls derived from one assignment map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportPlan {
    /// one call per resource whose name contains the marker
    pub individual: Vec<(String, Vec<String>)>,
    /// everything else, reported in a single call
    pub batch: Vec<String>,
}

impl ReportPlan {
    pub fn from_assignments(assignments: &AssignmentMap, marker: &str) -> Self {
        let mut plan = Self::default();
        for (resource_name, device_ids) in assignments {
            if !marker.is_empty() && resource_name.contains(marker) {
                plan.individual
                    .push((resource_name.clone(), device_ids.clone()));
            } else {
                plan.batch.extend(device_ids.iter().cloned());
            }
        }
        plan
    }
}

/// Uniform delay in `[0, max)`.
pub fn startup_delay<R: Rng>(rng: &mut R, max: Duration) -> Duration {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..max_millis))
}

pub struct ReconciliationScheduler {
    source: Arc<dyn AssignmentSource>,
    manager: Arc<dyn ResourceManager>,
    period: Duration,
    max_startup_delay: Duration,
    individual_marker: String,
}

impl ReconciliationScheduler {
    pub fn new(source: Arc<dyn AssignmentSource>, manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            source,
            manager,
            period: RECONCILE_PERIOD,
            max_startup_delay: MAX_STARTUP_DELAY,
            individual_marker: DEFAULT_INDIVIDUAL_MARKER.to_string(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_max_startup_delay(mut self, max_startup_delay: Duration) -> Self {
        self.max_startup_delay = max_startup_delay;
        self
    }

    pub fn with_individual_marker(mut self, marker: impl Into<String>) -> Self {
        self.individual_marker = marker.into();
        self
    }

    /// One reconciliation pass. Returns the plan that was reported, or `None`
    /// when assignments could not be read.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Option<ReportPlan> {
        let assignments = match self.source.current_assignments().await {
            Ok(assignments) => assignments,
            Err(e) => {
                error!("Failed to get device assignments: {e:?}");
                return None;
            }
        };

        let plan = ReportPlan::from_assignments(&assignments, &self.individual_marker);
        for (resource_name, device_ids) in &plan.individual {
            info!(resource = %resource_name, "reporting {} reserved devices", device_ids.len());
            self.manager.report_allocation(device_ids).await;
        }
        if !plan.batch.is_empty() {
            info!("reporting {} reserved devices", plan.batch.len());
            self.manager.report_allocation(&plan.batch).await;
        }
        Some(plan)
    }

    /// Wait a random startup delay, then tick every period until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let delay = startup_delay(&mut rand::rng(), self.max_startup_delay);
        info!("Starting device reservation reconciler after {delay:?}");

        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Device reservation reconciler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::mock::MockAssignmentSource;
    use crate::domain::mock::MockResourceManager;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn assignments() -> AssignmentMap {
        AssignmentMap::from([
            ("carizon/4J5".to_string(), ids(&["10.0.1.1", "10.0.1.2"])),
            ("carizon/J5".to_string(), ids(&["10.0.0.1"])),
            ("carizon/X3".to_string(), ids(&["10.0.2.1"])),
        ])
    }

    #[test]
    fn marker_resources_are_reported_individually() {
        let plan = ReportPlan::from_assignments(&assignments(), DEFAULT_INDIVIDUAL_MARKER);

        assert_eq!(
            plan.individual,
            vec![("carizon/4J5".to_string(), ids(&["10.0.1.1", "10.0.1.2"]))]
        );
        assert_eq!(plan.batch, ids(&["10.0.0.1", "10.0.2.1"]));
    }

    #[test]
    fn startup_delay_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let delay = startup_delay(&mut rng, MAX_STARTUP_DELAY);
            assert!(delay < MAX_STARTUP_DELAY, "delay {delay:?} out of range");
        }
        assert_eq!(startup_delay(&mut rng, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn tick_reports_individual_then_batch() {
        let source = Arc::new(MockAssignmentSource::new(assignments()));
        let manager = Arc::new(MockResourceManager::new());
        let scheduler = ReconciliationScheduler::new(source, manager.clone());

        scheduler.tick().await.expect("tick should produce a plan");

        assert_eq!(
            manager.reports(),
            vec![ids(&["10.0.1.1", "10.0.1.2"]), ids(&["10.0.0.1", "10.0.2.1"])]
        );
    }

    #[tokio::test]
    async fn empty_batch_is_not_reported() {
        let source = Arc::new(MockAssignmentSource::new(AssignmentMap::new()));
        let manager = Arc::new(MockResourceManager::new());
        let scheduler = ReconciliationScheduler::new(source, manager.clone());

        scheduler.tick().await;

        assert!(manager.reports().is_empty());
    }

    #[tokio::test]
    async fn failed_source_skips_reporting() {
        let source = Arc::new(MockAssignmentSource::new(assignments()));
        source.set_error_mode(true);
        let manager = Arc::new(MockResourceManager::new());
        let scheduler = ReconciliationScheduler::new(source, manager.clone());

        assert_eq!(scheduler.tick().await, None);
        assert!(manager.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_three_minutes_after_startup_delay() {
        let source = Arc::new(MockAssignmentSource::new(assignments()));
        let manager = Arc::new(MockResourceManager::new());
        let scheduler = Arc::new(
            ReconciliationScheduler::new(source.clone(), manager)
                .with_max_startup_delay(Duration::ZERO),
        );
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_secs(179)).await;
        assert_eq!(source.calls(), 0, "first tick is one period after start");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(RECONCILE_PERIOD).await;
        assert_eq!(source.calls(), 2);

        token.cancel();
        handle.await.expect("scheduler should stop on cancellation");
    }
}
