#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::path::PathBuf;

use clap::{
    builder::{styling::AnsiColor, Styles},
    Parser,
};
use color_eyre::eyre::{Context, Result};
use pallet_core::{driver, FsArchiveSource, Selection};
use tap::Pipe;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{self, prelude::*};

#[derive(Debug, Parser)]
#[command(version, about, styles = style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser)]
enum Commands {
    /// Slice a set of packages into a target root, printing the report to stdout.
    Run(RunArgs),

    /// Slice a set of packages into a target root, writing the report to a file.
    Report(ReportArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Directory to write the sliced filesystem into. Must already exist.
    #[arg(long)]
    root: PathBuf,

    /// Path to a plan JSON file (a serialized `Selection`).
    #[arg(long)]
    plan: PathBuf,

    /// Directory containing one `<package>.deb` file per package referenced by the plan.
    #[arg(long = "archive-dir")]
    archive_dir: PathBuf,
}

#[derive(Debug, Parser)]
struct ReportArgs {
    #[command(flatten)]
    run: RunArgs,

    /// File to write the resulting report to, as pretty JSON.
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Cli::parse().command {
        Commands::Run(args) => {
            let report = slice(&args)?;
            println!("{}", report.render()?);
            Ok(())
        }
        Commands::Report(args) => {
            let report = slice(&args.run)?;
            std::fs::write(&args.output, report.render()?)
                .wrap_err_with(|| format!("write report to {}", args.output.display()))?;
            Ok(())
        }
    }
}

fn slice(args: &RunArgs) -> Result<pallet_core::Report> {
    let plan = std::fs::read_to_string(&args.plan).wrap_err_with(|| format!("read plan from {}", args.plan.display()))?;
    let selection: Selection = serde_json::from_str(&plan).wrap_err_with(|| format!("parse plan at {}", args.plan.display()))?;

    if !args.root.exists() {
        std::fs::create_dir_all(&args.root).wrap_err_with(|| format!("create root at {}", args.root.display()))?;
    }
    let root = args.root.canonicalize().wrap_err_with(|| format!("resolve root at {}", args.root.display()))?;

    let architecture = std::env::var("PALLET_ARCHITECTURE").unwrap_or_else(|_| "amd64".to_string());
    let source = FsArchiveSource::new(args.archive_dir.clone(), architecture);

    driver::run(&selection, &source, &root)
        .wrap_err("slice selection")?
        .pipe(Ok)
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}
