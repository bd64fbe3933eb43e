//! HTTP client of the device inventory service.

use std::time::Duration;

use api_types::AddressInfoRequest;
use api_types::AllocateDeviceReq;
use api_types::DeviceListData;
use api_types::InventoryResponse;
use api_types::ListDevicesRequest;
use api_types::PcieAddressInfo;
use error_stack::Report;
use error_stack::ResultExt;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::ACCEPT;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::device::Device;
use crate::domain::device::DeviceIdentity;
use crate::domain::inventory::InventoryError;
use crate::domain::inventory::ResourceManager;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const FORWARDED_USER_HEADER: &str = "X-Forwarded-User";
const FORWARDED_UID_HEADER: &str = "X-Forwarded-Uid";

/// Inventory API paths. `{uuid}` in `health_path` is replaced by the device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryEndpoints {
    pub list_devices_path: String,
    pub health_path: String,
    pub report_allocation_path: String,
    pub addressing_path: String,
}

impl Default for InventoryEndpoints {
    fn default() -> Self {
        Self {
            list_devices_path: "/api/v3/list/node/devices".to_string(),
            health_path: "/api/v3/device/{uuid}/healthy".to_string(),
            report_allocation_path: "/api/v3/updatemany/devices/allocated".to_string(),
            addressing_path: "/api/v3/list/devices".to_string(),
        }
    }
}

/// Normalize the inventory address taken from the environment.
///
/// Service links injected as `tcp://host:port` become `http://host:port`,
/// and a bare `host:port` gets an `http://` scheme.
pub fn normalize_server_addr(raw: &str) -> String {
    let addr = raw.trim().to_lowercase();
    let addr = match addr.strip_prefix("tcp://") {
        Some(rest) => format!("http://{rest}"),
        None if addr.starts_with("http://") || addr.starts_with("https://") => addr,
        None => format!("http://{addr}"),
    };
    addr.trim_end_matches('/').to_string()
}

/// [`ResourceManager`] talking to the inventory over HTTP.
#[derive(Debug, Clone)]
pub struct HttpResourceManager {
    client: reqwest::Client,
    server: String,
    endpoints: InventoryEndpoints,
}

impl HttpResourceManager {
    pub fn new(
        server: &str,
        endpoints: InventoryEndpoints,
        request_timeout: Duration,
    ) -> Result<Self, Report<InventoryError>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(FORWARDED_USER_HEADER, HeaderValue::from_static(""));
        headers.insert(FORWARDED_UID_HEADER, HeaderValue::from_static(""));

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .change_context(InventoryError::Configuration {
                message: "Failed to create HTTP client for the inventory".into(),
            })?;

        let server = normalize_server_addr(server);
        info!(server = %server, "inventory client created");

        Ok(Self {
            client,
            server,
            endpoints,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    /// Check the HTTP status and the envelope code, then hand out the payload.
    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, Report<InventoryError>> {
        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(InventoryError::HttpStatus {
                status: status.as_u16(),
            }));
        }

        let envelope: InventoryResponse<T> =
            response.json().await.map_err(|e| InventoryError::Decode {
                message: e.to_string(),
            })?;
        if !envelope.is_success() {
            return Err(Report::new(InventoryError::Service {
                code: envelope.code,
                message: envelope.err_msg,
            }));
        }
        Ok(envelope.data)
    }

    fn request_error(e: reqwest::Error) -> InventoryError {
        InventoryError::Request {
            message: e.to_string(),
        }
    }

    pub async fn try_list_devices(
        &self,
        node_name: &str,
        device_type: &str,
    ) -> Result<Vec<Device>, Report<InventoryError>> {
        let body = ListDevicesRequest {
            node: node_name.to_string(),
            device_type: device_type.to_string(),
        };
        let response = self
            .client
            .post(self.url(&self.endpoints.list_devices_path))
            .json(&body)
            .send()
            .await
            .map_err(Self::request_error)?;

        let mut data: DeviceListData = Self::read_envelope(response).await?.unwrap_or_default();
        let records = data.remove(device_type).unwrap_or_default();

        Ok(records
            .into_iter()
            .filter(|info| {
                if !info.is_online() {
                    debug!(device_ip = %info.ip, "skipping offline device");
                }
                info.is_online()
            })
            .map(|info| Device::new(DeviceIdentity::new(info.ip, info.id)))
            .collect())
    }

    pub async fn try_probe_health(&self, uuid: i64) -> Result<bool, Report<InventoryError>> {
        let path = self
            .endpoints
            .health_path
            .replace("{uuid}", &uuid.to_string());
        let response = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(Self::request_error)?;

        Self::read_envelope::<bool>(response)
            .await?
            .ok_or_else(|| {
                Report::new(InventoryError::Decode {
                    message: "health response without data".into(),
                })
            })
    }

    pub async fn try_report_allocation(
        &self,
        device_ids: &[String],
    ) -> Result<(), Report<InventoryError>> {
        let body: Vec<AllocateDeviceReq> = device_ids
            .iter()
            .map(|ip| AllocateDeviceReq {
                device_ip: ip.clone(),
                allocated: true,
            })
            .collect();
        let response = self
            .client
            .put(self.url(&self.endpoints.report_allocation_path))
            .json(&body)
            .send()
            .await
            .map_err(Self::request_error)?;

        Self::read_envelope::<serde_json::Value>(response).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceManager for HttpResourceManager {
    async fn list_devices(&self, node_name: &str, device_type: &str) -> Vec<Device> {
        match self.try_list_devices(node_name, device_type).await {
            Ok(devices) => devices,
            Err(e) => {
                error!(node = node_name, device_type, "Failed to list devices: {e:?}");
                Vec::new()
            }
        }
    }

    async fn probe_health(&self, uuid: i64) -> bool {
        match self.try_probe_health(uuid).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(uuid, "Health probe failed, keeping device healthy: {e:?}");
                true
            }
        }
    }

    async fn report_allocation(&self, device_ids: &[String]) {
        if let Err(e) = self.try_report_allocation(device_ids).await {
            error!("Failed to report allocated devices {device_ids:?}: {e:?}");
        }
    }

    async fn fetch_addressing_info(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<PcieAddressInfo>, Report<InventoryError>> {
        let body = AddressInfoRequest {
            ips: device_ids.to_vec(),
        };
        let response = self
            .client
            .post(self.url(&self.endpoints.addressing_path))
            .json(&body)
            .send()
            .await
            .map_err(Self::request_error)?;

        Ok(Self::read_envelope(response).await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_normalize_server_addr() {
        assert_eq!(
            normalize_server_addr(" TCP://10.96.0.12:80 "),
            "http://10.96.0.12:80"
        );
        assert_eq!(normalize_server_addr("cmdb:8080"), "http://cmdb:8080");
        assert_eq!(
            normalize_server_addr("https://cmdb.example/"),
            "https://cmdb.example"
        );
    }

    #[test]
    fn test_endpoint_overrides_keep_defaults() {
        let endpoints: InventoryEndpoints =
            serde_yaml::from_str("health_path: /v4/device/{uuid}/health").expect("should parse");

        assert_eq!(endpoints.health_path, "/v4/device/{uuid}/health");
        assert_eq!(
            endpoints.list_devices_path,
            InventoryEndpoints::default().list_devices_path
        );
    }

    #[tokio::test]
    async fn test_unreachable_inventory_degrades() {
        // nothing listens on port 9 of localhost
        let manager = HttpResourceManager::new(
            "127.0.0.1:9",
            InventoryEndpoints::default(),
            Duration::from_secs(2),
        )
        .expect("should build client");

        assert!(manager.list_devices("node-1", "J5").await.is_empty());
        assert!(manager.probe_health(1).await, "probe failures are fail-open");
        manager.report_allocation(&["10.0.0.1".to_string()]).await;
        assert!(manager
            .fetch_addressing_info(&["10.0.0.1".to_string()])
            .await
            .is_err());
    }
}
