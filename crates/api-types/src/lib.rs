//! Shared API type definitions
//!
//! This crate contains the wire types exchanged with the device inventory
//! service (device listing, health, allocation reporting and PCIe addressing
//! lookups) and the JSON payload handed to containers through the
//! `PCIE_INFO` environment variable.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Inventory status value marking a device as offline.
pub const DEVICE_STATUS_OFFLINE: i8 = 1;

/// Inventory return code for a successful call.
pub const CODE_SUCCESS: i32 = 0;

/// Common envelope of every inventory response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResponse<T> {
    /// Service return code, `0` on success
    #[serde(default)]
    pub code: i32,
    /// Error message for operators
    #[serde(default)]
    pub err_msg: String,
    /// Error message for end users
    #[serde(default)]
    pub err_user_msg: String,
    /// Payload (absent on failure)
    pub data: Option<T>,
}

impl<T> InventoryResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: CODE_SUCCESS,
            err_msg: String::new(),
            err_user_msg: String::new(),
            data: Some(data),
        }
    }

    pub fn failure(code: i32, err_msg: impl Into<String>) -> Self {
        Self {
            code,
            err_msg: err_msg.into(),
            err_user_msg: String::new(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Device record as stored by the inventory service
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DeviceInfo {
    pub id: i64,
    pub ip: String,
    #[serde(default)]
    pub chip_type: String,
    #[serde(default)]
    pub chip_num: i8,
    #[serde(default)]
    pub status: i8,
    #[serde(default)]
    pub queue_name: String,
    #[serde(default)]
    pub bind_node: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub system_version: String,
    #[serde(default)]
    pub register_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_alive_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_reserved: i8,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tags: String,
}

impl DeviceInfo {
    pub fn is_online(&self) -> bool {
        self.status != DEVICE_STATUS_OFFLINE
    }
}

/// Devices bound to a node, keyed by device type.
pub type DeviceListData = HashMap<String, Vec<DeviceInfo>>;

/// Query for the devices bound to one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListDevicesRequest {
    pub node: String,
    pub device_type: String,
}

/// One entry of an allocation/reservation report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocateDeviceReq {
    #[serde(rename = "ip")]
    pub device_ip: String,
    pub allocated: bool,
}

/// Query for PCIe addressing information of a set of devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressInfoRequest {
    pub ips: Vec<String>,
}

/// PCIe addressing information of one device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PcieAddressInfo {
    pub ip: String,
    pub vnet_ip: String,
}

/// Payload of the `PCIE_INFO` container environment variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PodDeviceInfo {
    /// Comma separated device IDs
    pub device: String,
    pub pcie_info: Vec<PcieAddressInfo>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn device_list_response_parses_with_sparse_records() {
        let body = r#"{
            "code": 0,
            "err_msg": "",
            "data": {
                "J5": [
                    {"id": 1, "ip": "10.0.0.1", "status": 0, "register_time": "2024-03-01T08:00:00Z"},
                    {"id": 2, "ip": "10.0.0.2", "status": 1}
                ]
            }
        }"#;

        let resp: InventoryResponse<DeviceListData> =
            serde_json::from_str(body).expect("should parse device list");

        assert!(resp.is_success());
        let devices = &resp.data.expect("data present")["J5"];
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online(), "status 1 means offline");
        assert!(devices[0].register_time.is_some());
    }

    #[test]
    fn failure_envelope_without_data() {
        let resp: InventoryResponse<bool> =
            serde_json::from_str(r#"{"code": 1199006, "err_msg": "bad params"}"#)
                .expect("should parse failure envelope");

        assert!(!resp.is_success());
        assert_eq!(resp.data, None);
        assert_eq!(resp.err_msg, "bad params");
    }

    #[test]
    fn allocation_report_uses_ip_field() {
        let req = AllocateDeviceReq {
            device_ip: "10.0.0.1".to_string(),
            allocated: true,
        };

        let json = serde_json::to_string(&req).expect("should serialize");
        assert_eq!(json, r#"{"ip":"10.0.0.1","allocated":true}"#);
    }

    #[test]
    fn pod_device_info_layout() {
        let info = PodDeviceInfo {
            device: "10.0.0.1,10.0.0.2".to_string(),
            pcie_info: vec![PcieAddressInfo {
                ip: "10.0.0.1".to_string(),
                vnet_ip: "192.168.0.1".to_string(),
            }],
        };

        let json = serde_json::to_string(&info).expect("should serialize");
        assert_eq!(
            json,
            r#"{"device":"10.0.0.1,10.0.0.2","pcie_info":[{"ip":"10.0.0.1","vnet_ip":"192.168.0.1"}]}"#
        );
    }
}
