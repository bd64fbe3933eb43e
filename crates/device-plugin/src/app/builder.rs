use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::config::KubeletStateArgs;
use crate::config::ResourceConfig;
use crate::domain::inventory::ResourceManager;
use crate::domain::reconcile::ReconciliationScheduler;
use crate::infrastructure::inventory_client::HttpResourceManager;
use crate::infrastructure::kubelet::assignments::KubeletAssignmentSource;
use crate::infrastructure::kubelet::checkpoint::CheckpointReader;
use crate::infrastructure::kubelet::device_plugin::AcceleratorDevicePlugin;
use crate::infrastructure::kubelet::device_plugin::DevicePluginConfig;
use crate::infrastructure::kubelet::pod_resources::PodResourcesClient;

/// Assignment source reading the kubelet state described by `args`.
pub fn assignment_source(args: &KubeletStateArgs) -> KubeletAssignmentSource {
    KubeletAssignmentSource::new(
        PodResourcesClient::new(&args.pod_resources_socket),
        CheckpointReader::new(&args.checkpoint_path),
    )
}

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let node_name = args
            .node_name()
            .context("node name not configured and host name unavailable")?;

        let resource_config = ResourceConfig::load(&args.resource_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load resource config: {e:?}"))?;

        let resource_manager: Arc<dyn ResourceManager> = Arc::new(
            HttpResourceManager::new(
                &args.inventory_server,
                resource_config.inventory.clone(),
                args.inventory_timeout(),
            )
            .map_err(|e| anyhow::anyhow!("Failed to create inventory client: {e:?}"))?,
        );

        let plugin_config = DevicePluginConfig {
            plugin_dir: args.device_plugin_path.clone(),
            kubelet_socket: args.kubelet_socket(),
            node_name: node_name.clone(),
            health_check: args.health_check(),
        };
        let plugins: Vec<Arc<AcceleratorDevicePlugin>> = resource_config
            .classes(&args.vendor)
            .into_iter()
            .map(|class| {
                tracing::info!(
                    resource = %class.resource_name,
                    addressing = %class.addressing,
                    "configured device plugin"
                );
                Arc::new(AcceleratorDevicePlugin::new(
                    class,
                    plugin_config.clone(),
                    resource_manager.clone(),
                ))
            })
            .collect();

        let reconciler = ReconciliationScheduler::new(
            Arc::new(assignment_source(&args.kubelet_state)),
            resource_manager,
        )
        .with_individual_marker(args.individual_report_marker.clone());

        tracing::info!(
            node = %node_name,
            plugins = plugins.len(),
            "application components built"
        );

        let services = ApplicationServices {
            plugins,
            reconciler: Arc::new(reconciler),
        };
        Ok(Application::new(services, self.daemon_args))
    }
}
