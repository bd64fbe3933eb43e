//! Kubelet-facing protocols: the device plugin API, the pod-resources API and
//! the device manager checkpoint file.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod pod_resources_api {
    tonic::include_proto!("v1");
}

pub mod assignments;
pub mod checkpoint;
pub mod device_plugin;
pub mod pod_resources;

use std::io;
use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
pub const DEVICE_PLUGIN_API_VERSION: &str = "v1beta1";

/// Create a gRPC channel over a unix socket, giving up after `timeout`.
///
/// The URL is a placeholder, the connector always dials `socket_path`.
pub async fn connect_uds(socket_path: &Path, timeout: Duration) -> Result<Channel, io::Error> {
    let path = socket_path.to_path_buf();
    let endpoint = Endpoint::from_static("http://[::]:50051");
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { tokio::net::UnixStream::connect(path).await.map(TokioIo::new) }
    }));

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out dialing {}", socket_path.display()),
            )
        })?
        .map_err(|e| io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::pod_resources::tests::container;
    use super::pod_resources::tests::response;
    use super::pod_resources::tests::spawn_fake_lister;
    use super::pod_resources_api::pod_resources_lister_client::PodResourcesListerClient;
    use super::pod_resources_api::ListPodResourcesRequest;
    use super::*;

    #[tokio::test]
    async fn test_connect_uds_reaches_server() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let socket = dir.path().join("kubelet.sock");
        let server = spawn_fake_lister(
            &socket,
            response(vec![vec![container("a", &[("carizon/J5", &["10.0.0.1"])])]]),
        );

        let channel = connect_uds(&socket, Duration::from_secs(5))
            .await
            .expect("should dial the socket");
        let listed = PodResourcesListerClient::new(channel)
            .list(ListPodResourcesRequest {})
            .await
            .expect("call should succeed")
            .into_inner();

        assert_eq!(listed.pod_resources.len(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_uds_missing_socket_fails() {
        let dir = tempfile::tempdir().expect("should create temp dir");

        let result = connect_uds(&dir.path().join("absent.sock"), Duration::from_secs(1)).await;

        assert!(result.is_err());
    }
}
