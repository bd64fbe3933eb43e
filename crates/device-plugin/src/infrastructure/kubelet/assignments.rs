use error_stack::Report;
use tracing::debug;
use tracing::warn;

use super::checkpoint::CheckpointReader;
use super::pod_resources::PodResourcesClient;
use crate::domain::assignment::AssignmentError;
use crate::domain::assignment::AssignmentMap;
use crate::domain::assignment::AssignmentSource;

/// Prefers the live pod-resources API and falls back to the checkpoint file.
///
/// The choice is made again on every call.
#[derive(Debug, Clone)]
pub struct KubeletAssignmentSource {
    live: PodResourcesClient,
    checkpoint: CheckpointReader,
}

impl KubeletAssignmentSource {
    pub fn new(live: PodResourcesClient, checkpoint: CheckpointReader) -> Self {
        Self { live, checkpoint }
    }
}

#[async_trait::async_trait]
impl AssignmentSource for KubeletAssignmentSource {
    async fn current_assignments(&self) -> Result<AssignmentMap, Report<AssignmentError>> {
        if self.live.socket_exists().await {
            match self.live.current_assignments().await {
                Ok(map) => return Ok(map),
                Err(e) => {
                    warn!("pod-resources API not usable, falling back to checkpoint file: {e:?}")
                }
            }
        } else {
            debug!(
                "pod-resources socket {:?} not found, using checkpoint file",
                self.live.socket_path()
            );
        }
        self.checkpoint.current_assignments().await
    }
}
