use std::sync::Arc;

use crate::domain::lifecycle::PluginLifecycle;
use crate::domain::reconcile::ReconciliationScheduler;
use crate::infrastructure::kubelet::device_plugin::AcceleratorDevicePlugin;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub plugins: Vec<Arc<AcceleratorDevicePlugin>>,
    pub reconciler: Arc<ReconciliationScheduler>,
}

impl ApplicationServices {
    /// The plugins as driven by the supervisor.
    pub fn lifecycles(&self) -> Vec<Arc<dyn PluginLifecycle>> {
        self.plugins
            .iter()
            .map(|plugin| plugin.clone() as Arc<dyn PluginLifecycle>)
            .collect()
    }
}
