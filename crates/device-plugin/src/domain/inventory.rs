//! Contract of the device inventory the plugins depend on.

use api_types::PcieAddressInfo;
use error_stack::Report;
use thiserror::Error;

use super::device::Device;

/// Errors surfaced by inventory calls.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Failed to build inventory client: {message}")]
    Configuration { message: String },
    #[error("Inventory request failed: {message}")]
    Request { message: String },
    #[error("Inventory answered with HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("Failed to decode inventory response: {message}")]
    Decode { message: String },
    #[error("Inventory returned code {code}: {message}")]
    Service { code: i32, message: String },
}

/// Access to the inventory service.
///
/// Only [`ResourceManager::fetch_addressing_info`] reports failures. The
/// other calls degrade: listing yields no devices, a failed probe counts as
/// healthy and a failed report is logged and dropped.
#[async_trait::async_trait]
pub trait ResourceManager: Send + Sync {
    /// Online devices of `device_type` bound to `node_name`.
    async fn list_devices(&self, node_name: &str, device_type: &str) -> Vec<Device>;

    /// Health of the device with inventory id `uuid`.
    async fn probe_health(&self, uuid: i64) -> bool;

    /// Mark the devices as allocated/reserved.
    async fn report_allocation(&self, device_ids: &[String]);

    /// PCIe addressing records of the devices.
    async fn fetch_addressing_info(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<PcieAddressInfo>, Report<InventoryError>>;
}
