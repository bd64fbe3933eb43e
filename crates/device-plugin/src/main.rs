use anyhow::Result;
use clap::Parser;
use device_plugin::app::builder::assignment_source;
use device_plugin::app::ApplicationBuilder;
use device_plugin::config::Cli;
use device_plugin::config::Commands;
use device_plugin::config::DaemonArgs;
use device_plugin::config::ShowAssignmentsArgs;
use device_plugin::domain::assignment::AssignmentSource;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowAssignments(args) => run_show_assignments(args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(std::env::var(logging::LOG_PATH_ENV_VAR).ok());

    tracing::info!("Starting device plugin daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;

    Ok(())
}

async fn run_show_assignments(args: ShowAssignmentsArgs) -> Result<()> {
    let _guard = logging::init(None);

    let assignments = assignment_source(&args)
        .current_assignments()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read device assignments: {e:?}"))?;

    println!("{}", serde_json::to_string_pretty(&assignments)?);
    Ok(())
}
