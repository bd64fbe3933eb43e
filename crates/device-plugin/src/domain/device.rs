use std::sync::Arc;

use tokio::sync::RwLock;

/// Health of a device as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DeviceHealth {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

impl DeviceHealth {
    pub const fn from_probe(healthy: bool) -> Self {
        if healthy {
            Self::Healthy
        } else {
            Self::Unhealthy
        }
    }
}

/// Immutable identity of an accelerator.
///
/// `id` is what the kubelet sees and equals the device's network address;
/// `uuid` is the inventory record id used for health probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub uuid: i64,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, uuid: i64) -> Self {
        Self {
            id: address.into(),
            uuid,
        }
    }
}

/// An accelerator known to a plugin session.
///
/// Health is written by the ListAndWatch feeder and read by the Allocate
/// handler, so it lives behind a lock.
#[derive(Debug)]
pub struct Device {
    identity: DeviceIdentity,
    health: RwLock<DeviceHealth>,
}

impl Device {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self::with_health(identity, DeviceHealth::Healthy)
    }

    pub fn with_health(identity: DeviceIdentity, health: DeviceHealth) -> Self {
        Self {
            identity,
            health: RwLock::new(health),
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn uuid(&self) -> i64 {
        self.identity.uuid
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub async fn health(&self) -> DeviceHealth {
        *self.health.read().await
    }

    /// Store a new health value and return the previous one.
    pub async fn set_health(&self, health: DeviceHealth) -> DeviceHealth {
        let mut guard = self.health.write().await;
        std::mem::replace(&mut *guard, health)
    }
}

/// The device list of one plugin session.
///
/// Membership is fixed for the lifetime of the session. Only the health of
/// the contained devices changes.
#[derive(Debug, Default, Clone)]
pub struct DeviceSnapshot {
    devices: Vec<Arc<Device>>,
}

impl DeviceSnapshot {
    /// Build a snapshot, keeping the first device seen for any duplicated id.
    pub fn new(devices: Vec<Device>) -> Self {
        let mut kept: Vec<Arc<Device>> = Vec::with_capacity(devices.len());
        for device in devices {
            if kept.iter().any(|d| d.id() == device.id()) {
                tracing::warn!(device_id = device.id(), "duplicate device ignored");
                continue;
            }
            kept.push(Arc::new(device));
        }
        Self { devices: kept }
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// Current `(id, health)` of every device, in snapshot order.
    pub async fn health_view(&self) -> Vec<(String, DeviceHealth)> {
        let mut view = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            view.push((device.id().to_string(), device.health().await));
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn device(address: &str, uuid: i64) -> Device {
        Device::new(DeviceIdentity::new(address, uuid))
    }

    #[test]
    fn identity_id_is_the_address() {
        let identity = DeviceIdentity::new("10.0.0.1", 7);
        assert_eq!(identity.id, "10.0.0.1");
        assert_eq!(identity.uuid, 7);
    }

    #[tokio::test]
    async fn new_devices_start_healthy() {
        let device = device("10.0.0.1", 1);
        assert_eq!(device.health().await, DeviceHealth::Healthy);
    }

    #[tokio::test]
    async fn set_health_returns_previous_value() {
        let device = device("10.0.0.1", 1);

        let previous = device.set_health(DeviceHealth::Unhealthy).await;

        assert_eq!(previous, DeviceHealth::Healthy);
        assert_eq!(device.health().await, DeviceHealth::Unhealthy);
    }

    #[test]
    fn snapshot_drops_duplicate_ids() {
        let snapshot = DeviceSnapshot::new(vec![
            device("10.0.0.1", 1),
            device("10.0.0.2", 2),
            device("10.0.0.1", 3),
        ]);

        assert_eq!(snapshot.ids(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(snapshot.get("10.0.0.1").map(|d| d.uuid()), Some(1));
        assert!(!snapshot.contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn health_view_follows_snapshot_order() {
        let snapshot = DeviceSnapshot::new(vec![device("10.0.0.2", 2), device("10.0.0.1", 1)]);
        snapshot.devices()[1]
            .set_health(DeviceHealth::Unhealthy)
            .await;

        assert_eq!(
            snapshot.health_view().await,
            vec![
                ("10.0.0.2".to_string(), DeviceHealth::Healthy),
                ("10.0.0.1".to_string(), DeviceHealth::Unhealthy),
            ]
        );
    }

    #[test]
    fn health_strings_match_kubelet_values() {
        assert_eq!(DeviceHealth::Healthy.to_string(), "Healthy");
        assert_eq!(DeviceHealth::Unhealthy.to_string(), "Unhealthy");
        assert_eq!(DeviceHealth::from_probe(false), DeviceHealth::Unhealthy);
    }
}
