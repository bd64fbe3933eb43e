use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        if app.daemon_args().disable_reconcile {
            tracing::info!("Device reservation reconciler disabled");
        } else {
            let reconcile_task = self.spawn_reconcile_task(app);
            self.tasks.push(reconcile_task);
        }
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_reconcile_task(&self, app: &Application) -> JoinHandle<()> {
        let reconciler = app.services().reconciler.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting device reservation reconciler task");
            reconciler.run(token).await;
            tracing::info!("Device reservation reconciler task completed");
        })
    }
}
