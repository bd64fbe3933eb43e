//! Test adapters implementing the domain traits
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::PcieAddressInfo;
use error_stack::Report;

use super::assignment::AssignmentError;
use super::assignment::AssignmentMap;
use super::assignment::AssignmentSource;
use super::device::Device;
use super::device::DeviceIdentity;
use super::inventory::InventoryError;
use super::inventory::ResourceManager;
use super::lifecycle::PluginError;
use super::lifecycle::PluginLifecycle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory inventory
#[derive(Default)]
pub struct MockResourceManager {
    devices: Mutex<HashMap<String, Vec<DeviceIdentity>>>,
    health: Mutex<HashMap<i64, bool>>,
    probes: Mutex<Vec<i64>>,
    addressing: Mutex<HashMap<String, PcieAddressInfo>>,
    addressing_error: AtomicBool,
    reports: Mutex<Vec<Vec<String>>>,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the devices returned for `device_type`
    pub fn with_devices(self, device_type: &str, devices: Vec<DeviceIdentity>) -> Self {
        lock(&self.devices).insert(device_type.to_string(), devices);
        self
    }

    /// Set the probe result of a device; unknown devices probe healthy
    pub fn set_health(&self, uuid: i64, healthy: bool) {
        lock(&self.health).insert(uuid, healthy);
    }

    pub fn set_addressing(&self, info: PcieAddressInfo) {
        lock(&self.addressing).insert(info.ip.clone(), info);
    }

    /// Make every addressing lookup fail
    pub fn set_addressing_error(&self, enabled: bool) {
        self.addressing_error.store(enabled, Ordering::SeqCst);
    }

    /// Allocation reports received so far, in call order
    pub fn reports(&self) -> Vec<Vec<String>> {
        lock(&self.reports).clone()
    }

    pub fn probe_count(&self, uuid: i64) -> usize {
        lock(&self.probes).iter().filter(|u| **u == uuid).count()
    }
}

#[async_trait::async_trait]
impl ResourceManager for MockResourceManager {
    async fn list_devices(&self, _node_name: &str, device_type: &str) -> Vec<Device> {
        lock(&self.devices)
            .get(device_type)
            .map(|identities| identities.iter().cloned().map(Device::new).collect())
            .unwrap_or_default()
    }

    async fn probe_health(&self, uuid: i64) -> bool {
        lock(&self.probes).push(uuid);
        lock(&self.health).get(&uuid).copied().unwrap_or(true)
    }

    async fn report_allocation(&self, device_ids: &[String]) {
        lock(&self.reports).push(device_ids.to_vec());
    }

    async fn fetch_addressing_info(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<PcieAddressInfo>, Report<InventoryError>> {
        if self.addressing_error.load(Ordering::SeqCst) {
            return Err(Report::new(InventoryError::Request {
                message: "mock addressing failure".to_string(),
            }));
        }
        let addressing = lock(&self.addressing);
        Ok(device_ids
            .iter()
            .filter_map(|id| addressing.get(id).cloned())
            .collect())
    }
}

/// Assignment source returning a preset map
#[derive(Default)]
pub struct MockAssignmentSource {
    assignments: Mutex<AssignmentMap>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockAssignmentSource {
    pub fn new(assignments: AssignmentMap) -> Self {
        Self {
            assignments: Mutex::new(assignments),
            ..Default::default()
        }
    }

    pub fn set_error_mode(&self, enabled: bool) {
        self.fail.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AssignmentSource for MockAssignmentSource {
    async fn current_assignments(&self) -> Result<AssignmentMap, Report<AssignmentError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Report::new(AssignmentError::Unavailable {
                message: "mock assignment failure".to_string(),
            }));
        }
        Ok(lock(&self.assignments).clone())
    }
}

/// Plugin recording its start/stop calls into a shared journal
pub struct MockPlugin {
    resource_name: String,
    fail_start: AtomicBool,
    journal: Arc<Mutex<Vec<String>>>,
}

impl MockPlugin {
    pub fn new(resource_name: &str, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            fail_start: AtomicBool::new(false),
            journal,
        }
    }

    pub fn set_fail_start(&self, enabled: bool) {
        self.fail_start.store(enabled, Ordering::SeqCst);
    }

    /// Snapshot of a journal shared by several plugins
    pub fn entries(journal: &Mutex<Vec<String>>) -> Vec<String> {
        lock(journal).clone()
    }
}

#[async_trait::async_trait]
impl PluginLifecycle for MockPlugin {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    async fn start(&self) -> Result<(), Report<PluginError>> {
        lock(&self.journal).push(format!("start {}", self.resource_name));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Report::new(PluginError::Bind {
                path: format!("/tmp/{}.sock", self.resource_name),
            }));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), Report<PluginError>> {
        lock(&self.journal).push(format!("stop {}", self.resource_name));
        Ok(())
    }
}
