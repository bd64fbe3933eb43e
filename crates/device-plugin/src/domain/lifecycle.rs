use error_stack::Report;
use thiserror::Error;

/// State of one device plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Idle,
    Initializing,
    Serving,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to bind device plugin socket {path}")]
    Bind { path: String },
    #[error("Device plugin server for {resource_name} did not come up")]
    Serve { resource_name: String },
    #[error("Failed to register {resource_name} with kubelet: {message}")]
    Registration {
        resource_name: String,
        message: String,
    },
    #[error("Failed to remove device plugin socket {path}")]
    Teardown { path: String },
}

/// Start/stop contract the supervisor drives plugins through.
#[async_trait::async_trait]
pub trait PluginLifecycle: Send + Sync {
    fn resource_name(&self) -> &str;

    /// Discover devices, serve the plugin API, register with the kubelet and
    /// begin health monitoring. A failed start leaves nothing running.
    async fn start(&self) -> Result<(), Report<PluginError>>;

    /// Tear the running session down. Stopping twice is a no-op.
    async fn stop(&self) -> Result<(), Report<PluginError>>;
}
