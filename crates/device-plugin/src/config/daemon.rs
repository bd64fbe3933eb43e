use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;

use crate::domain::health::HealthCheckConfig;
use crate::domain::health::HEALTH_CHECK_INTERVAL;
use crate::domain::reconcile::DEFAULT_INDIVIDUAL_MARKER;
use crate::infrastructure::kubelet::KUBELET_SOCKET_NAME;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Node the advertised devices are bound to in the inventory (defaults to the host name)"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "BK_CMDB_CHART_PORT",
        help = "Inventory service address, e.g. tcp://10.96.0.12:80 or http://cmdb:8080"
    )]
    pub inventory_server: String,

    #[arg(
        long,
        env = "RESOURCE_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/device-plugin/resources.yaml",
        help = "YAML file listing the device classes to advertise"
    )]
    pub resource_config: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_VENDOR",
        default_value = "carizon",
        help = "Vendor domain of the extended resources, e.g. carizon/J5"
    )]
    pub vendor: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/device-plugins/",
        help = "Directory holding the kubelet and device plugin sockets"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket (defaults to kubelet.sock in the device plugin directory)"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[command(flatten)]
    pub kubelet_state: KubeletStateArgs,

    #[arg(
        long,
        env = "DEVICE_HEALTH_CHECK",
        default_value = "true",
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set,
        help = "Probe device health every 10 seconds"
    )]
    pub health_check: bool,

    #[arg(
        long,
        default_value = DEFAULT_INDIVIDUAL_MARKER,
        help = "Resources whose name contains this marker are reported one call per resource"
    )]
    pub individual_report_marker: String,

    #[arg(long, help = "Do not report device reservations to the inventory")]
    pub disable_reconcile: bool,

    #[arg(
        long,
        default_value = "10",
        help = "Timeout in seconds of every inventory request"
    )]
    pub inventory_timeout_secs: u64,
}

impl DaemonArgs {
    /// Configured node name, falling back to the host name.
    pub fn node_name(&self) -> Option<String> {
        self.node_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(host_name)
    }

    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.device_plugin_path.join(KUBELET_SOCKET_NAME))
    }

    pub fn health_check(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: self.health_check,
            interval: HEALTH_CHECK_INTERVAL,
        }
    }

    pub fn inventory_timeout(&self) -> Duration {
        Duration::from_secs(self.inventory_timeout_secs)
    }
}

/// Where the kubelet publishes device assignments.
#[derive(Parser, Debug, Clone)]
pub struct KubeletStateArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        help = "Kubelet pod-resources API socket"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint",
        help = "Kubelet device manager checkpoint file, used when the pod-resources API is unavailable"
    )]
    pub checkpoint_path: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct ShowAssignmentsArgs {
    #[command(flatten)]
    pub kubelet_state: KubeletStateArgs,
}

impl std::ops::Deref for ShowAssignmentsArgs {
    type Target = KubeletStateArgs;

    fn deref(&self) -> &Self::Target {
        &self.kubelet_state
    }
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: DaemonArgs,
    }

    fn parse(extra: &[&str]) -> DaemonArgs {
        let mut argv = vec!["test", "--inventory-server", "tcp://10.0.0.10:80"];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv)
            .expect("should parse daemon args")
            .args
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--node-name", "node-1"]);

        assert_eq!(args.node_name(), Some("node-1".to_string()));
        assert_eq!(args.vendor, "carizon");
        assert_eq!(
            args.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert!(args.health_check);
        assert!(!args.disable_reconcile);
        assert_eq!(args.individual_report_marker, "4J5");
        assert_eq!(args.inventory_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_health_check_accepts_boolish_values() {
        assert!(!parse(&["--health-check", "false"]).health_check().enabled);
        assert!(!parse(&["--health-check", "FALSE"]).health_check);
        assert!(parse(&["--health-check", "yes"]).health_check);
    }
}
