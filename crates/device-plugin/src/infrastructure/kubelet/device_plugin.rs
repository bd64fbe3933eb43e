//! Per-class device plugin: gRPC service, unix socket endpoint and kubelet
//! registration.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::api::RegisterRequest;
use super::connect_uds;
use super::DEVICE_PLUGIN_API_VERSION;
use crate::domain::allocation;
use crate::domain::allocation::AllocationError;
use crate::domain::device::DeviceSnapshot;
use crate::domain::health::health_channel;
use crate::domain::health::HealthCheckConfig;
use crate::domain::health::HealthEvent;
use crate::domain::health::HealthEventReceiver;
use crate::domain::health::HealthEventSender;
use crate::domain::health::HealthMonitor;
use crate::domain::inventory::ResourceManager;
use crate::domain::lifecycle::PluginError;
use crate::domain::lifecycle::PluginLifecycle;
use crate::domain::lifecycle::PluginState;
use crate::domain::resource::ResourceClass;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_AND_WATCH_BUFFER: usize = 16;

/// Node-level settings shared by every plugin instance.
#[derive(Debug, Clone)]
pub struct DevicePluginConfig {
    pub plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub node_name: String,
    pub health_check: HealthCheckConfig,
}

struct PluginSession {
    snapshot: Arc<DeviceSnapshot>,
    stop: CancellationToken,
    server: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
    // keeps the health channel open for the whole session
    _health_events: HealthEventSender,
}

struct PluginInner {
    state: PluginState,
    session: Option<PluginSession>,
}

/// Device plugin for one resource class.
pub struct AcceleratorDevicePlugin {
    class: Arc<ResourceClass>,
    config: DevicePluginConfig,
    socket_path: PathBuf,
    manager: Arc<dyn ResourceManager>,
    inner: Mutex<PluginInner>,
}

impl AcceleratorDevicePlugin {
    pub fn new(
        class: ResourceClass,
        config: DevicePluginConfig,
        manager: Arc<dyn ResourceManager>,
    ) -> Self {
        let socket_path = config.plugin_dir.join(class.socket_name());
        Self {
            class: Arc::new(class),
            config,
            socket_path,
            manager,
            inner: Mutex::new(PluginInner {
                state: PluginState::Idle,
                session: None,
            }),
        }
    }

    pub fn class(&self) -> &ResourceClass {
        &self.class
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn state(&self) -> PluginState {
        self.inner.lock().await.state
    }

    /// Devices of the running session.
    pub async fn snapshot(&self) -> Option<Arc<DeviceSnapshot>> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.snapshot.clone())
    }

    #[tracing::instrument(skip(self), fields(resource = %self.class.resource_name))]
    async fn start_session(&self) -> Result<PluginSession, Report<PluginError>> {
        let devices = self
            .manager
            .list_devices(&self.config.node_name, &self.class.device_type)
            .await;
        let snapshot = Arc::new(DeviceSnapshot::new(devices));
        info!("discovered {} devices: {:?}", snapshot.len(), snapshot.ids());

        let (events, receiver) = health_channel();
        let stop = CancellationToken::new();

        let server = self
            .serve(snapshot.clone(), receiver, stop.clone())
            .await
            .inspect_err(|_| stop.cancel())?;

        let mut session = PluginSession {
            snapshot,
            stop,
            server,
            monitor: None,
            _health_events: events.clone(),
        };

        if let Err(e) = self.register().await {
            if let Err(teardown) = self.teardown(session) {
                warn!("Failed to clean up after registration failure: {teardown:?}");
            }
            return Err(e);
        }
        info!(
            "Registered device plugin for '{}' with Kubelet",
            self.class.resource_name
        );

        if self.config.health_check.enabled {
            let monitor = HealthMonitor::new(
                self.manager.clone(),
                session.snapshot.clone(),
                self.config.health_check.interval,
            )
            .await;
            session.monitor = Some(tokio::spawn(monitor.run(events, session.stop.clone())));
        } else {
            info!("device health checks disabled");
        }

        Ok(session)
    }

    /// Bind the plugin socket, spawn the gRPC server and wait until it answers.
    async fn serve(
        &self,
        snapshot: Arc<DeviceSnapshot>,
        events: HealthEventReceiver,
        stop: CancellationToken,
    ) -> Result<JoinHandle<()>, Report<PluginError>> {
        let bind_error = || PluginError::Bind {
            path: self.socket_path.display().to_string(),
        };
        remove_socket(&self.socket_path).change_context_lazy(bind_error)?;
        let listener = UnixListener::bind(&self.socket_path).change_context_lazy(bind_error)?;

        let service = DevicePluginService::new(
            self.class.clone(),
            snapshot,
            self.manager.clone(),
            events,
            stop.clone(),
        );
        let resource_name = self.class.resource_name.clone();
        let server = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    stop.cancelled().await;
                    info!("shutting down gRPC server for '{resource_name}'");
                })
                .await;
            if let Err(e) = result {
                error!("device plugin gRPC server exited: {e}");
            }
        });

        if let Err(e) = connect_uds(&self.socket_path, DIAL_TIMEOUT).await {
            server.abort();
            let _ = remove_socket(&self.socket_path);
            return Err(Report::new(PluginError::Serve {
                resource_name: self.class.resource_name.clone(),
            })
            .attach_printable(e.to_string()));
        }
        info!(
            "Starting to serve '{}' on {}",
            self.class.resource_name,
            self.socket_path.display()
        );
        Ok(server)
    }

    /// Register this plugin's endpoint with the kubelet.
    async fn register(&self) -> Result<(), Report<PluginError>> {
        let registration_error = |message: String| PluginError::Registration {
            resource_name: self.class.resource_name.clone(),
            message,
        };

        let channel = connect_uds(&self.config.kubelet_socket, DIAL_TIMEOUT)
            .await
            .map_err(|e| {
                registration_error(format!(
                    "cannot dial {}: {e}",
                    self.config.kubelet_socket.display()
                ))
            })?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: DEVICE_PLUGIN_API_VERSION.to_string(),
            endpoint: self.class.socket_name(),
            resource_name: self.class.resource_name.clone(),
            options: Some(DevicePluginOptions::default()),
        };

        tokio::time::timeout(DIAL_TIMEOUT, client.register(Request::new(request)))
            .await
            .map_err(|_| registration_error("registration timed out".to_string()))?
            .map_err(|status| registration_error(status.message().to_string()))?;
        Ok(())
    }

    fn teardown(&self, session: PluginSession) -> Result<(), Report<PluginError>> {
        session.stop.cancel();
        session.server.abort();
        if let Some(monitor) = session.monitor {
            monitor.abort();
        }
        remove_socket(&self.socket_path).change_context(PluginError::Teardown {
            path: self.socket_path.display().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl PluginLifecycle for AcceleratorDevicePlugin {
    fn resource_name(&self) -> &str {
        &self.class.resource_name
    }

    async fn start(&self) -> Result<(), Report<PluginError>> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.take() {
            self.teardown(session)?;
        }

        inner.state = PluginState::Initializing;
        match self.start_session().await {
            Ok(session) => {
                inner.session = Some(session);
                inner.state = PluginState::Serving;
                Ok(())
            }
            Err(e) => {
                inner.state = PluginState::Idle;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), Report<PluginError>> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.take() else {
            return Ok(());
        };
        info!(
            "Stopping to serve '{}' on {}",
            self.class.resource_name,
            self.socket_path.display()
        );
        inner.state = PluginState::Stopped;
        self.teardown(session)
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn list_response(snapshot: &DeviceSnapshot) -> ListAndWatchResponse {
    let devices = snapshot
        .health_view()
        .await
        .into_iter()
        .map(|(id, health)| api::Device {
            id,
            health: health.to_string(),
            topology: None,
        })
        .collect();
    ListAndWatchResponse { devices }
}

/// DevicePlugin gRPC service of one session
pub struct DevicePluginService {
    class: Arc<ResourceClass>,
    snapshot: Arc<DeviceSnapshot>,
    manager: Arc<dyn ResourceManager>,
    /// one ListAndWatch stream consumes health events at a time
    events: Arc<Mutex<HealthEventReceiver>>,
    stop: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        class: Arc<ResourceClass>,
        snapshot: Arc<DeviceSnapshot>,
        manager: Arc<dyn ResourceManager>,
        events: HealthEventReceiver,
        stop: CancellationToken,
    ) -> Self {
        Self {
            class,
            snapshot,
            manager,
            events: Arc::new(Mutex::new(events)),
            stop,
        }
    }
}

/// Push the device list once, then again after every health transition,
/// until the session stops or the kubelet hangs up.
async fn feed_device_list(
    snapshot: Arc<DeviceSnapshot>,
    events: Arc<Mutex<HealthEventReceiver>>,
    stop: CancellationToken,
    tx: mpsc::Sender<Result<ListAndWatchResponse, Status>>,
) {
    let mut sent = list_response(&snapshot).await;
    if tx.send(Ok(sent.clone())).await.is_err() {
        return;
    }

    // an older stream may still own the receiver
    let mut events = tokio::select! {
        _ = stop.cancelled() => return,
        _ = tx.closed() => return,
        events = events.lock() => events,
    };

    let current = list_response(&snapshot).await;
    if current != sent {
        sent = current;
        if tx.send(Ok(sent.clone())).await.is_err() {
            return;
        }
    }

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => {
                info!("device watch task stopped");
                break;
            }
            _ = tx.closed() => {
                info!("kubelet closed the ListAndWatch stream");
                break;
            }
            event = events.recv() => event,
        };

        let HealthEvent { device, health } = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("health event consumer lagged, {skipped} events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        device.set_health(health).await;
        info!(device_id = device.id(), "'{}' device marked {health}", device.id());

        sent = list_response(&snapshot).await;
        if tx.send(Ok(sent.clone())).await.is_err() {
            break;
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(resource = %self.class.resource_name, "starting to watch device list");

        let (tx, rx) = mpsc::channel(LIST_AND_WATCH_BUFFER);
        tokio::spawn(feed_device_list(
            self.snapshot.clone(),
            self.events.clone(),
            self.stop.clone(),
            tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.into_inner());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices: {:?}", req);

        let container_requests: Vec<Vec<String>> = req
            .container_requests
            .into_iter()
            .map(|c| c.devices_ids)
            .collect();

        let envs = allocation::allocate(
            &self.class,
            &self.snapshot,
            self.manager.as_ref(),
            &container_requests,
        )
        .await
        .map_err(|report| {
            error!("allocation failed: {report:?}");
            match report.current_context() {
                AllocationError::UnknownDevice { .. } => {
                    Status::invalid_argument(report.current_context().to_string())
                }
                _ => Status::internal(report.current_context().to_string()),
            }
        })?;

        Ok(Response::new(AllocateResponse {
            container_responses: envs
                .into_iter()
                .map(|envs| ContainerAllocateResponse {
                    envs,
                    ..Default::default()
                })
                .collect(),
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
