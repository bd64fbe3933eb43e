use anyhow::Result;
use tokio::sync::mpsc;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;
use crate::domain::supervisor::Supervisor;
use crate::infrastructure::watchers;

const SUPERVISOR_EVENT_BUFFER: usize = 16;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Serve the configured plugins until a terminating signal arrives.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let (events_tx, events_rx) = mpsc::channel(SUPERVISOR_EVENT_BUFFER);
        let _watcher =
            watchers::watch_kubelet_socket(self.daemon_args.kubelet_socket(), events_tx.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create FS watcher: {e:?}"))?;
        let signal_listener = watchers::spawn_signal_listener(events_tx)
            .map_err(|e| anyhow::anyhow!("Failed to install signal handlers: {e:?}"))?;

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        Supervisor::new(self.services.lifecycles())
            .run(events_rx)
            .await;

        signal_listener.abort();
        tasks.shutdown().await;

        tracing::info!("Application run completed");
        Ok(())
    }
}
