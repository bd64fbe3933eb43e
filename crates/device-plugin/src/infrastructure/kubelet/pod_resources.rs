//! Client for the kubelet pod-resources API.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use super::connect_uds;
use super::pod_resources_api::pod_resources_lister_client::PodResourcesListerClient;
use super::pod_resources_api::ListPodResourcesRequest;
use super::pod_resources_api::ListPodResourcesResponse;
use crate::domain::assignment::aggregate;
use crate::domain::assignment::AssignmentError;
use crate::domain::assignment::AssignmentMap;
use crate::domain::assignment::AssignmentSource;

pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";
pub const POD_RESOURCES_TIMEOUT: Duration = Duration::from_secs(10);
const POD_RESOURCES_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PodResourcesClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl PodResourcesClient {
    pub fn new<P: Into<PathBuf>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: POD_RESOURCES_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn socket_exists(&self) -> bool {
        tokio::fs::metadata(&self.socket_path).await.is_ok()
    }

    /// List pod resources; connecting and the call share one deadline.
    pub async fn list(&self) -> Result<ListPodResourcesResponse, Report<AssignmentError>> {
        debug!(
            "Connecting to kubelet pod-resources API at {:?}",
            self.socket_path
        );

        let call = async {
            let channel = connect_uds(&self.socket_path, self.timeout)
                .await
                .map_err(|e| AssignmentError::Unavailable {
                    message: format!("Failed to connect to kubelet socket, pod-resource kubelet API may not enabled or not accessible: {e}"),
                })?;
            let mut client = PodResourcesListerClient::new(channel)
                .max_decoding_message_size(POD_RESOURCES_MAX_MESSAGE_SIZE);

            client
                .list(tonic::Request::new(ListPodResourcesRequest {}))
                .await
                .map(tonic::Response::into_inner)
                .map_err(|e| AssignmentError::Unavailable {
                    message: format!("Failed to list pod resources: {e}"),
                })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Report::new),
            Err(_) => Err(Report::new(AssignmentError::Timeout {
                seconds: self.timeout.as_secs(),
            })),
        }
    }
}

/// Flatten pods -> containers -> devices into one map per resource name.
pub fn flatten(response: ListPodResourcesResponse) -> AssignmentMap {
    aggregate(
        response
            .pod_resources
            .into_iter()
            .flat_map(|pod| pod.containers)
            .flat_map(|container| container.devices)
            .map(|devices| (devices.resource_name, devices.device_ids)),
    )
}

#[async_trait::async_trait]
impl AssignmentSource for PodResourcesClient {
    async fn current_assignments(&self) -> Result<AssignmentMap, Report<AssignmentError>> {
        let response = self.list().await?;
        debug!(
            "Processing {} pods for allocated devices",
            response.pod_resources.len()
        );
        let map = flatten(response);
        info!(
            "Retrieved allocated devices from pod-resources API: {} resources",
            map.len()
        );
        Ok(map)
    }
}
