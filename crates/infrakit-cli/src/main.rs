//! infrakit CLI tool.

use clap::{Parser, Subcommand};
use infrakit_config::LogFormat;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "infrakit")]
#[command(about = "Declare infrastructure apps, synthesize them and run their pipelines", long_about = None)]
struct Cli {
    /// Settings file (defaults to infrakit.settings.kdl next to the app)
    #[arg(long, global = true, env = "INFRAKIT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log output format (text or json)
    #[arg(long, global = true, env = "INFRAKIT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an app and check its references
    Validate {
        /// Path to the app definition
        #[arg(default_value = "infrakit.kdl")]
        app: PathBuf,
    },
    /// Print the construct tree with logical ids
    Ls {
        #[arg(default_value = "infrakit.kdl")]
        app: PathBuf,
    },
    /// Write the cloud assembly
    Synth {
        #[arg(default_value = "infrakit.kdl")]
        app: PathBuf,
        /// Output directory (defaults to the configured output-dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the app's pipeline locally
    Pipeline {
        #[arg(default_value = "infrakit.kdl")]
        app: PathBuf,
        /// Use this directory instead of fetching the declared source
        #[arg(long)]
        source: Option<PathBuf>,
        /// Pipeline to run when the app declares several
        #[arg(long)]
        name: Option<String>,
    },
    /// Synthesize and deploy stacks directly
    Deploy {
        #[arg(default_value = "infrakit.kdl")]
        app: PathBuf,
        /// Construct path of a single stack to deploy
        #[arg(long)]
        stack: Option<String>,
    },
}

impl Commands {
    fn app(&self) -> &Path {
        match self {
            Commands::Validate { app }
            | Commands::Ls { app }
            | Commands::Synth { app, .. }
            | Commands::Pipeline { app, .. }
            | Commands::Deploy { app, .. } => app,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env("INFRAKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = commands::project_settings(cli.settings.as_deref(), cli.command.app())?;
    init_tracing(cli.log_format.unwrap_or(settings.log_format));

    match cli.command {
        Commands::Validate { app } => {
            let project = commands::Project::open(&app, settings)?;
            commands::validate::validate(&project)?;
        }
        Commands::Ls { app } => {
            let project = commands::Project::open(&app, settings)?;
            commands::ls::list(&project)?;
        }
        Commands::Synth { app, out } => {
            let project = commands::Project::open(&app, settings)?;
            commands::synth::synth(&project, out).await?;
        }
        Commands::Pipeline { app, source, name } => {
            let project = commands::Project::open(&app, settings)?;
            commands::pipeline::run(&project, source, name).await?;
        }
        Commands::Deploy { app, stack } => {
            let project = commands::Project::open(&app, settings)?;
            commands::deploy::deploy(&project, stack).await?;
        }
    }

    Ok(())
}
