use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::daemon::ShowAssignmentsArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Print the device assignments currently known to the kubelet
    #[command(name = "show-assignments")]
    ShowAssignments(ShowAssignmentsArgs),
}
