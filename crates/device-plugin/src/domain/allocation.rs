//! Allocate request validation and container environment building.

use std::collections::HashMap;

use api_types::PcieAddressInfo;
use api_types::PodDeviceInfo;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use super::device::DeviceHealth;
use super::device::DeviceSnapshot;
use super::inventory::ResourceManager;
use super::resource::AddressingMode;
use super::resource::ResourceClass;

pub const PCIE_INFO_ENV: &str = "PCIE_INFO";
pub const PCIE_FLAG_ENV: &str = "PCIE_FLAG";

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Invalid allocation request for {resource_name}: unknown device {device_id}")]
    UnknownDevice {
        resource_name: String,
        device_id: String,
    },
    #[error("Failed to fetch addressing info for {resource_name}")]
    AddressingInfo { resource_name: String },
    #[error("Failed to encode addressing info: {message}")]
    Encode { message: String },
}

/// Reject the whole request if any container asks for a device outside the
/// snapshot.
pub fn validate_request(
    class: &ResourceClass,
    snapshot: &DeviceSnapshot,
    container_requests: &[Vec<String>],
) -> Result<(), Report<AllocationError>> {
    for device_id in container_requests.iter().flatten() {
        if !snapshot.contains(device_id) {
            return Err(Report::new(AllocationError::UnknownDevice {
                resource_name: class.resource_name.clone(),
                device_id: device_id.clone(),
            }));
        }
    }
    Ok(())
}

/// Environment handed to one container.
pub fn container_envs(
    class: &ResourceClass,
    device_ids: &[String],
    pcie_info: Vec<PcieAddressInfo>,
) -> Result<HashMap<String, String>, Report<AllocationError>> {
    let joined = device_ids.join(",");
    let mut envs = HashMap::new();

    if class.addressing == AddressingMode::Fetch {
        let info = PodDeviceInfo {
            device: joined.clone(),
            pcie_info,
        };
        let encoded = serde_json::to_string(&info).map_err(|e| {
            Report::new(AllocationError::Encode {
                message: e.to_string(),
            })
        })?;
        envs.insert(PCIE_INFO_ENV.to_string(), encoded);
    }
    envs.insert(
        PCIE_FLAG_ENV.to_string(),
        class.addressing.pcie_flag().to_string(),
    );
    envs.insert(class.device_list_env.clone(), joined);

    Ok(envs)
}

/// Serve one Allocate call: validate everything, then per container look up
/// addressing when the class needs it, report the allocation and build the
/// envs. Returns one env map per container request.
pub async fn allocate(
    class: &ResourceClass,
    snapshot: &DeviceSnapshot,
    manager: &dyn ResourceManager,
    container_requests: &[Vec<String>],
) -> Result<Vec<HashMap<String, String>>, Report<AllocationError>> {
    validate_request(class, snapshot, container_requests)?;

    let mut responses = Vec::with_capacity(container_requests.len());
    for device_ids in container_requests {
        info!(
            resource = %class.resource_name,
            "allocating devices to container, device IDs: {:?}", device_ids
        );
        for id in device_ids {
            if let Some(device) = snapshot.get(id) {
                if device.health().await == DeviceHealth::Unhealthy {
                    warn!(device_id = %id, "allocating a device currently marked unhealthy");
                }
            }
        }

        let pcie_info = if class.addressing == AddressingMode::Fetch {
            manager
                .fetch_addressing_info(device_ids)
                .await
                .change_context(AllocationError::AddressingInfo {
                    resource_name: class.resource_name.clone(),
                })?
        } else {
            Vec::new()
        };

        manager.report_allocation(device_ids).await;
        responses.push(container_envs(class, device_ids, pcie_info)?);
    }

    Ok(responses)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::device::Device;
    use crate::domain::device::DeviceIdentity;
    use crate::domain::mock::MockResourceManager;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot::new(vec![
            Device::new(DeviceIdentity::new("10.0.0.1", 1)),
            Device::new(DeviceIdentity::new("10.0.0.2", 2)),
        ])
    }

    fn request(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn unknown_device_rejects_whole_request_without_side_effects() {
        let class = ResourceClass::new("carizon", "J5", AddressingMode::Fetch);
        let manager = MockResourceManager::new();

        let result = allocate(
            &class,
            &snapshot(),
            &manager,
            &[request(&["10.0.0.1"]), request(&["10.0.0.9"])],
        )
        .await;

        let err = result.expect_err("request should be rejected");
        assert!(matches!(
            err.current_context(),
            AllocationError::UnknownDevice { device_id, .. } if device_id == "10.0.0.9"
        ));
        assert!(
            manager.reports().is_empty(),
            "no container should be reported when validation fails"
        );
    }

    #[tokio::test]
    async fn plain_class_sets_device_list_and_flag() {
        let class = ResourceClass::new("carizon", "X3", AddressingMode::None);
        let manager = MockResourceManager::new();

        let envs = allocate(&class, &snapshot(), &manager, &[request(&["10.0.0.1", "10.0.0.2"])])
            .await
            .expect("should allocate");

        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0]["CARIZON_DEVICE_X3_IP_LIST"], "10.0.0.1,10.0.0.2");
        assert_eq!(envs[0][PCIE_FLAG_ENV], "false");
        assert!(!envs[0].contains_key(PCIE_INFO_ENV));
        assert_eq!(manager.reports(), vec![request(&["10.0.0.1", "10.0.0.2"])]);
    }

    #[tokio::test]
    async fn flag_only_class_skips_lookup() {
        let class = ResourceClass::new("carizon", "2J5", AddressingMode::FlagOnly);
        let manager = MockResourceManager::new();
        manager.set_addressing_error(true);

        let envs = allocate(&class, &snapshot(), &manager, &[request(&["10.0.0.2"])])
            .await
            .expect("flag-only allocation should not look up addressing");

        assert_eq!(envs[0][PCIE_FLAG_ENV], "true");
        assert!(!envs[0].contains_key(PCIE_INFO_ENV));
    }

    #[tokio::test]
    async fn fetch_class_embeds_addressing_info() {
        let class = ResourceClass::new("carizon", "J5", AddressingMode::Fetch);
        let manager = MockResourceManager::new();
        manager.set_addressing(PcieAddressInfo {
            ip: "10.0.0.1".to_string(),
            vnet_ip: "192.168.10.1".to_string(),
        });

        let envs = allocate(&class, &snapshot(), &manager, &[request(&["10.0.0.1"])])
            .await
            .expect("should allocate");

        assert_eq!(
            envs[0][PCIE_INFO_ENV],
            r#"{"device":"10.0.0.1","pcie_info":[{"ip":"10.0.0.1","vnet_ip":"192.168.10.1"}]}"#
        );
        assert_eq!(envs[0][PCIE_FLAG_ENV], "true");
    }

    #[tokio::test]
    async fn addressing_failure_fails_the_call() {
        let class = ResourceClass::new("carizon", "J5", AddressingMode::Fetch);
        let manager = MockResourceManager::new();
        manager.set_addressing_error(true);

        let err = allocate(&class, &snapshot(), &manager, &[request(&["10.0.0.1"])])
            .await
            .expect_err("addressing failure should propagate");

        assert!(matches!(
            err.current_context(),
            AllocationError::AddressingInfo { .. }
        ));
    }

    #[test]
    fn validation_accepts_empty_container_requests() {
        let class = ResourceClass::new("carizon", "J5", AddressingMode::None);
        assert!(validate_request(&class, &snapshot(), &[Vec::new()]).is_ok());
    }
}
