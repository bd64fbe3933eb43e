//! Event sources feeding the supervisor: kubelet socket recreation and
//! process signals.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use thiserror::Error;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::supervisor::SupervisorEvent;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch directory {path}")]
    Filesystem { path: String },
    #[error("Failed to install signal handler: {message}")]
    Signal { message: String },
}

fn is_socket_created(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == kubelet_socket)
}

/// Watch the directory holding the kubelet socket and emit
/// [`SupervisorEvent::KubeletRestarted`] whenever the socket is created.
///
/// Events are only delivered while the returned watcher is alive.
pub fn watch_kubelet_socket(
    kubelet_socket: PathBuf,
    events: mpsc::Sender<SupervisorEvent>,
) -> Result<RecommendedWatcher, Report<WatchError>> {
    let socket_dir = kubelet_socket
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let watch_error = || WatchError::Filesystem {
        path: socket_dir.display().to_string(),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                debug!("Filesystem event: {:?}", event);
                if !is_socket_created(&event, &kubelet_socket) {
                    return;
                }
                info!("inotify: {} created, restarting", kubelet_socket.display());
                if let Err(e) = events.try_send(SupervisorEvent::KubeletRestarted) {
                    warn!("Failed to queue kubelet restart event: {e}");
                }
            }
            Err(e) => {
                error!("Filesystem watch error: {:?}", e);
            }
        },
        Config::default(),
    )
    .change_context_lazy(watch_error)?;

    watcher
        .watch(&socket_dir, RecursiveMode::NonRecursive)
        .change_context_lazy(watch_error)?;
    info!("watching {} for kubelet restarts", socket_dir.display());

    Ok(watcher)
}

/// Translate process signals into supervisor events.
///
/// SIGHUP asks for a restart; SIGINT, SIGTERM and SIGQUIT terminate. The task
/// ends after forwarding a terminate event.
pub fn spawn_signal_listener(
    events: mpsc::Sender<SupervisorEvent>,
) -> Result<JoinHandle<()>, Report<WatchError>> {
    let install = |kind: SignalKind| {
        signal(kind).map_err(|e| WatchError::Signal {
            message: e.to_string(),
        })
    };
    let mut hangup = install(SignalKind::hangup())?;
    let mut interrupt = install(SignalKind::interrupt())?;
    let mut terminate = install(SignalKind::terminate())?;
    let mut quit = install(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, restarting");
                    SupervisorEvent::Reconfigure
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT, shutting down");
                    SupervisorEvent::Terminate
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    SupervisorEvent::Terminate
                }
                _ = quit.recv() => {
                    info!("Received SIGQUIT, shutting down");
                    SupervisorEvent::Terminate
                }
            };

            let done = event == SupervisorEvent::Terminate;
            if events.send(event).await.is_err() || done {
                break;
            }
        }
    }))
}
