mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    action::ActionSubcommand, catalog::CatalogSubcommand, config::ConfigSubcommand,
    plugin::PluginSubcommand, run::RunArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cds",
    about = "Run pipelines built from reusable actions, chained by trigger links",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .cds/)
    #[arg(long, global = true, env = "CDS_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize cds in the current project
    Init,

    /// Run a pipeline and stream its log
    Run(RunArgs),

    /// Manage actions
    Action {
        #[command(subcommand)]
        subcommand: ActionSubcommand,
    },

    /// Import and inspect projects, pipelines and trigger links
    Catalog {
        #[command(subcommand)]
        subcommand: CatalogSubcommand,
    },

    /// Inspect installed plugins
    Plugin {
        #[command(subcommand)]
        subcommand: PluginSubcommand,
    },

    /// Inspect the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Run(args) => cmd::run::run(&root, args, cli.json),
        Commands::Action { subcommand } => cmd::action::run(&root, subcommand, cli.json),
        Commands::Catalog { subcommand } => cmd::catalog::run(&root, subcommand, cli.json),
        Commands::Plugin { subcommand } => cmd::plugin::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
