//! Periodic health probing of a session's devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::device::Device;
use super::device::DeviceHealth;
use super::device::DeviceSnapshot;
use super::inventory::ResourceManager;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const HEALTH_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: HEALTH_CHECK_INTERVAL,
        }
    }
}

/// One observed health transition of a device.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub device: Arc<Device>,
    pub health: DeviceHealth,
}

impl HealthEvent {
    pub fn new(device: Arc<Device>, health: DeviceHealth) -> Self {
        Self { device, health }
    }
}

pub type HealthEventSender = broadcast::Sender<HealthEvent>;
pub type HealthEventReceiver = broadcast::Receiver<HealthEvent>;

/// Fresh bounded channel for one session.
///
/// Every transition goes through this single channel so the consumer sees
/// them in the order they were observed. Sends never block; a lagging
/// receiver loses the oldest events.
pub fn health_channel() -> (HealthEventSender, HealthEventReceiver) {
    broadcast::channel(HEALTH_EVENT_CAPACITY)
}

/// Edge-triggered prober for one plugin session.
pub struct HealthMonitor {
    manager: Arc<dyn ResourceManager>,
    snapshot: Arc<DeviceSnapshot>,
    interval: Duration,
    last_observed: HashMap<String, DeviceHealth>,
}

impl HealthMonitor {
    /// Seed the last-observed view from the snapshot as it is right now.
    pub async fn new(
        manager: Arc<dyn ResourceManager>,
        snapshot: Arc<DeviceSnapshot>,
        interval: Duration,
    ) -> Self {
        let last_observed = snapshot.health_view().await.into_iter().collect();
        Self {
            manager,
            snapshot,
            interval,
            last_observed,
        }
    }

    /// Probe every device once and emit an event for each transition.
    ///
    /// Returns the devices whose health changed, with their new health.
    pub async fn poll_once(
        &mut self,
        events: &HealthEventSender,
        stop: &CancellationToken,
    ) -> Vec<(String, DeviceHealth)> {
        let mut transitions = Vec::new();
        for device in self.snapshot.devices() {
            if stop.is_cancelled() {
                break;
            }
            let observed = DeviceHealth::from_probe(self.manager.probe_health(device.uuid()).await);
            let previous = self
                .last_observed
                .insert(device.id().to_string(), observed)
                .unwrap_or(DeviceHealth::Healthy);
            if previous == observed {
                continue;
            }

            info!(device_id = device.id(), uuid = device.uuid(), "device became {observed}");
            if events.send(HealthEvent::new(device.clone(), observed)).is_err() {
                debug!(device_id = device.id(), "no health event consumer");
            }
            transitions.push((device.id().to_string(), observed));
        }
        transitions
    }

    /// Probe until the session stop token fires.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, events: HealthEventSender, stop: CancellationToken) {
        info!(
            devices = self.snapshot.len(),
            "starting device health monitor, interval {:?}", self.interval
        );
        loop {
            if stop.is_cancelled() {
                break;
            }
            self.poll_once(&events, &stop).await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("device health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::device::DeviceIdentity;
    use crate::domain::mock::MockResourceManager;

    fn setup() -> (Arc<MockResourceManager>, Arc<DeviceSnapshot>) {
        let manager = Arc::new(MockResourceManager::new());
        let snapshot = Arc::new(DeviceSnapshot::new(vec![
            Device::new(DeviceIdentity::new("10.0.0.1", 1)),
            Device::new(DeviceIdentity::new("10.0.0.2", 2)),
        ]));
        (manager, snapshot)
    }

    #[tokio::test]
    async fn events_fire_only_on_transitions() {
        let (manager, snapshot) = setup();
        let (events, mut receiver) = health_channel();
        let stop = CancellationToken::new();
        let mut monitor =
            HealthMonitor::new(manager.clone(), snapshot, HEALTH_CHECK_INTERVAL).await;

        // healthy -> healthy: nothing
        assert!(monitor.poll_once(&events, &stop).await.is_empty());

        manager.set_health(2, false);
        let transitions = monitor.poll_once(&events, &stop).await;
        assert_eq!(
            transitions,
            vec![("10.0.0.2".to_string(), DeviceHealth::Unhealthy)]
        );

        // still unhealthy: no repeated event
        assert!(monitor.poll_once(&events, &stop).await.is_empty());

        manager.set_health(2, true);
        monitor.poll_once(&events, &stop).await;

        let down = receiver.try_recv().expect("unhealthy event first");
        assert_eq!(down.device.id(), "10.0.0.2");
        assert_eq!(down.health, DeviceHealth::Unhealthy);
        let up = receiver.try_recv().expect("healthy event second");
        assert_eq!(up.device.id(), "10.0.0.2");
        assert_eq!(up.health, DeviceHealth::Healthy);
        assert!(receiver.try_recv().is_err(), "exactly two events");
    }

    #[tokio::test]
    async fn monitor_does_not_touch_device_health() {
        let (manager, snapshot) = setup();
        let (events, _receiver) = health_channel();
        let stop = CancellationToken::new();
        let mut monitor =
            HealthMonitor::new(manager.clone(), snapshot.clone(), HEALTH_CHECK_INTERVAL).await;

        manager.set_health(1, false);
        monitor.poll_once(&events, &stop).await;

        assert_eq!(
            snapshot.devices()[0].health().await,
            DeviceHealth::Healthy,
            "only the stream feeder should mutate device health"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_probes_every_interval_until_stopped() {
        let (manager, snapshot) = setup();
        let (events, _receiver) = health_channel();
        let stop = CancellationToken::new();
        let monitor =
            HealthMonitor::new(manager.clone(), snapshot, Duration::from_secs(10)).await;

        let handle = tokio::spawn(monitor.run(events, stop.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(manager.probe_count(1), 3, "probes at 0s, 10s and 20s");

        stop.cancel();
        handle.await.expect("monitor task should exit cleanly");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.probe_count(1), 3, "no probes after stop");
    }

    #[tokio::test]
    async fn cancelled_token_skips_probing() {
        let (manager, snapshot) = setup();
        let (events, _receiver) = health_channel();
        let stop = CancellationToken::new();
        stop.cancel();
        let mut monitor = HealthMonitor::new(manager.clone(), snapshot, HEALTH_CHECK_INTERVAL).await;

        monitor.poll_once(&events, &stop).await;

        assert_eq!(manager.probe_count(1), 0);
    }
}
