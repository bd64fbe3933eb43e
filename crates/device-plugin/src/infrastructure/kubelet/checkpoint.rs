//! Reader for the kubelet device manager checkpoint file.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::domain::assignment::aggregate;
use crate::domain::assignment::AssignmentError;
use crate::domain::assignment::AssignmentMap;
use crate::domain::assignment::AssignmentSource;

pub const KUBELET_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KubeletCheckpoint {
    pub data: CheckpointData,
    #[serde(default)]
    pub checksum: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointData {
    #[serde(default)]
    pub pod_device_entries: Option<Vec<PodDevicesEntry>>,
    #[serde(default)]
    pub registered_devices: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodDevicesEntry {
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    pub container_name: String,
    pub resource_name: String,
    #[serde(rename = "DeviceIDs", default)]
    pub device_ids: Option<CheckpointDeviceIds>,
    #[serde(rename = "AllocResp", default)]
    pub alloc_resp: Option<String>,
}

/// `DeviceIDs` is a flat list in older kubelets and a NUMA node -> ids map
/// in newer ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointDeviceIds {
    Flat(Vec<String>),
    ByNumaNode(BTreeMap<String, Vec<String>>),
}

impl CheckpointDeviceIds {
    pub fn into_ids(self) -> Vec<String> {
        match self {
            Self::Flat(ids) => ids,
            Self::ByNumaNode(nodes) => nodes.into_values().flatten().collect(),
        }
    }
}

impl KubeletCheckpoint {
    /// Assigned device ids per resource name.
    pub fn assignments(self) -> AssignmentMap {
        let entries = self.data.pod_device_entries.unwrap_or_default();
        aggregate(entries.into_iter().map(|entry| {
            let ids = entry
                .device_ids
                .map(CheckpointDeviceIds::into_ids)
                .unwrap_or_default();
            (entry.resource_name, ids)
        }))
    }
}

/// Assignment source backed by the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointReader {
    path: PathBuf,
}

impl CheckpointReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub async fn read(&self) -> Result<KubeletCheckpoint, Report<AssignmentError>> {
        let path = self.path.display().to_string();
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .change_context(AssignmentError::ReadCheckpoint { path: path.clone() })?;

        serde_json::from_str(&content).change_context(AssignmentError::ParseCheckpoint { path })
    }
}

#[async_trait::async_trait]
impl AssignmentSource for CheckpointReader {
    async fn current_assignments(&self) -> Result<AssignmentMap, Report<AssignmentError>> {
        debug!("reading device assignments from {:?}", self.path);
        Ok(self.read().await?.assignments())
    }
}
