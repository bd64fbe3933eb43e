//! Keeps the configured device plugins registered with the kubelet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::lifecycle::PluginLifecycle;

pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SupervisorState {
    Idle,
    Starting,
    Serving,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SupervisorEvent {
    /// retry after a failed start pass
    #[display("start failed")]
    StartFailed,
    /// the kubelet registration socket was recreated
    #[display("kubelet restarted")]
    KubeletRestarted,
    /// SIGHUP
    #[display("reconfigure requested")]
    Reconfigure,
    #[display("terminate requested")]
    Terminate,
}

/// Result of one restart pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub started: usize,
    /// resource name of the plugin that failed, if any
    pub failed: Option<String>,
}

pub struct Supervisor {
    plugins: Vec<Arc<dyn PluginLifecycle>>,
    state: SupervisorState,
    restart_backoff: Duration,
}

impl Supervisor {
    pub fn new(plugins: Vec<Arc<dyn PluginLifecycle>>) -> Self {
        Self {
            plugins,
            state: SupervisorState::Idle,
            restart_backoff: RESTART_BACKOFF,
        }
    }

    pub fn with_restart_backoff(mut self, restart_backoff: Duration) -> Self {
        self.restart_backoff = restart_backoff;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub async fn stop_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.stop().await {
                warn!(resource = plugin.resource_name(), "Failed to stop device plugin: {e:?}");
            }
        }
    }

    /// Stop every plugin, then start them in order until the first failure.
    pub async fn restart_all(&mut self) -> RestartOutcome {
        self.state = SupervisorState::Starting;
        self.stop_all().await;

        let mut started = 0;
        for plugin in &self.plugins {
            if let Err(e) = plugin.start().await {
                error!(
                    resource = plugin.resource_name(),
                    "Failed to start device plugin, retrying in {:?}: {e:?}", self.restart_backoff
                );
                self.state = SupervisorState::Failed;
                return RestartOutcome {
                    started,
                    failed: Some(plugin.resource_name().to_string()),
                };
            }
            started += 1;
        }

        if started == 0 {
            info!("No device found. Waiting indefinitely.");
        } else {
            info!("{started} device plugins serving");
        }
        self.state = SupervisorState::Serving;
        RestartOutcome {
            started,
            failed: None,
        }
    }

    /// Drive the plugins until a terminate event arrives or every event
    /// sender is gone. Plugins are stopped before returning.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, mut events: mpsc::Receiver<SupervisorEvent>) {
        self.restart_all().await;

        loop {
            let event = if self.state == SupervisorState::Failed {
                tokio::select! {
                    event = events.recv() => event,
                    _ = tokio::time::sleep(self.restart_backoff) => Some(SupervisorEvent::StartFailed),
                }
            } else {
                events.recv().await
            };

            match event {
                Some(SupervisorEvent::Terminate) | None => {
                    info!("Shutting down device plugins");
                    break;
                }
                Some(event) => {
                    info!("{event}, restarting device plugins");
                    self.restart_all().await;
                }
            }
        }

        self.stop_all().await;
        self.state = SupervisorState::Idle;
    }
}
