//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable pointing at the log file; stderr is used when unset.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

const DEFAULT_LOG_FILE_PREFIX: &str = "device-plugin.log";
const MAX_LOG_FILES: usize = 7;

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Build the formatting layer.
///
/// With a `log_path` the layer writes to a daily rotated file through a
/// non-blocking writer, and the returned guard must be kept alive for the
/// lifetime of the process so buffered lines get flushed.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> (BoxedLayer<S>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path else {
        return (stderr_layer(), None);
    };

    let log_path = Path::new(&log_path);
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(DEFAULT_LOG_FILE_PREFIX);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (layer, Some(guard))
        }
        Err(e) => {
            // the subscriber is not installed yet, stderr is all we have
            eprintln!(
                "failed to create rolling log file in {}: {e}, falling back to stderr",
                dir.display()
            );
            (stderr_layer(), None)
        }
    }
}

fn stderr_layer<S>() -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

/// initiate the global tracing subscriber
pub fn init(log_path: Option<String>) -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let (fmt_layer, guard) = get_fmt_layer(log_path);

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
