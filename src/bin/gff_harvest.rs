use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use gff_harvest::app::{App, FetchResult, ProgressSinkKind, RetryOptions, RetryResult};
use gff_harvest::command::SystemCommandRunner;
use gff_harvest::config::{ConfigLoader, ReleaseRange, ResolvedConfig, ShardSelection};
use gff_harvest::domain::Organism;
use gff_harvest::error::HarvestError;
use gff_harvest::listing::HttpListingClient;
use gff_harvest::organisms::source_from_config;
use gff_harvest::output::{JsonOutput, LogProgress, OutputMode, TextOutput};
use gff_harvest::report::coverage;
use gff_harvest::tui::Tui;

type HarvestApp = App<SystemCommandRunner, HttpListingClient>;

#[derive(Parser)]
#[command(name = "gff-harvest")]
#[command(about = "Sharded, resumable RNAcentral GFF3 downloader for Slurm job arrays")]
#[command(version, author)]
struct Cli {
    /// Print JSON instead of drawing the dashboard.
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (default: ./gff-harvest.json, built-in defaults if absent).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Release range override, `START-END` or a single release (e.g. 20-25).
    #[arg(long, global = true)]
    releases: Option<ReleaseRange>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show the work set and its partition into shards")]
    Plan(ShardArgs),
    #[command(about = "Download and decompress one shard's units, or every release with --all")]
    Fetch(FetchArgs),
    #[command(about = "Merge shard summaries into the global summary")]
    Merge(MergeArgs),
    #[command(about = "Coverage report from the merged summary")]
    Report,
    #[command(about = "Re-attempt failed units of the merged summary")]
    Retry(RetryArgs),
    #[command(about = "Convert one shard's decompressed GFF3 files to gene records")]
    Convert(ShardArgs),
    #[command(about = "Scan the data directory")]
    Status,
}

#[derive(Args, Clone, Copy)]
struct ShardArgs {
    /// Overrides SLURM_ARRAY_TASK_ID.
    #[arg(long)]
    task_index: Option<usize>,

    /// Overrides SLURM_ARRAY_TASK_COUNT.
    #[arg(long)]
    task_count: Option<usize>,
}

#[derive(Args, Clone, Copy)]
struct FetchArgs {
    #[command(flatten)]
    shard: ShardArgs,

    /// Run every release in this process, one shard after another.
    #[arg(long, conflicts_with_all = ["task_index", "task_count"])]
    all: bool,
}

#[derive(Args)]
struct MergeArgs {
    /// Defaults to the number of releases in the configured range.
    #[arg(long)]
    expected_shards: Option<usize>,

    /// Load the organism list so units of shards without a summary file are
    /// listed as missing. Otherwise the expected organisms come only from the
    /// shard files found, and a merge with none itemizes nothing.
    #[arg(long)]
    with_organisms: bool,
}

#[derive(Args)]
struct RetryArgs {
    #[arg(long)]
    include_not_found: bool,

    #[arg(long)]
    list_only: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    if error.is_configuration() {
        return 2;
    }
    match error {
        HarvestError::MergeIncomplete { .. } => 4,
        HarvestError::OrganismQuery(_)
        | HarvestError::ListingHttp(_)
        | HarvestError::ListingStatus { .. }
        | HarvestError::MissingTool(_)
        | HarvestError::CommandSpawn { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(releases) = cli.releases {
        config.releases = releases;
    }
    let runner = Arc::new(SystemCommandRunner::new());
    let listing = HttpListingClient::new(config.base_url.clone())?;
    let app = App::new(config, runner, listing);

    match cli.command {
        Commands::Plan(args) => run_plan(&app, args),
        Commands::Fetch(args) => run_fetch(app, args, output_mode),
        Commands::Merge(args) => run_merge(&app, args, output_mode),
        Commands::Report => run_report(&app, output_mode),
        Commands::Retry(args) => run_retry(app, args, output_mode),
        Commands::Convert(args) => run_convert(app, args, output_mode),
        Commands::Status => run_status(&app, output_mode),
    }
}

fn load_organisms(config: &ResolvedConfig) -> Result<Vec<Organism>, HarvestError> {
    let source = source_from_config(
        &config.organisms,
        Arc::new(SystemCommandRunner::new()),
        |key| std::env::var(key).ok(),
    )?;
    source.organisms()
}

fn shard_selection(args: ShardArgs) -> Result<ShardSelection, HarvestError> {
    ShardSelection::from_env(args.task_index, args.task_count)
}

fn run_plan(app: &HarvestApp, args: ShardArgs) -> miette::Result<()> {
    let organisms = load_organisms(app.config())?;
    let selection = match (args.task_index, args.task_count) {
        (None, None) => None,
        _ => Some(shard_selection(args)?),
    };
    let plan = app.plan(&organisms, selection)?;
    JsonOutput::print_plan(&plan).into_diagnostic()
}

fn run_fetch(app: HarvestApp, args: FetchArgs, output_mode: OutputMode) -> miette::Result<()> {
    if args.all {
        return run_fetch_all(app, output_mode);
    }
    let selection = shard_selection(args.shard)?;
    let organisms = load_organisms(app.config())?;

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch(organisms, selection, &LogProgress)?;
            JsonOutput::print_fetch(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Fetch);
            let result = tui.run(move |sink| app.fetch(organisms, selection, sink))?;
            print_fetch_summary(&result);
            Ok(())
        }
    }
}

fn run_fetch_all(app: HarvestApp, output_mode: OutputMode) -> miette::Result<()> {
    let organisms = load_organisms(app.config())?;
    match output_mode {
        OutputMode::NonInteractive => {
            let results = app.fetch_all(organisms, &LogProgress)?;
            JsonOutput::print_fetch_all(&results).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Fetch);
            let results = tui.run(move |sink| app.fetch_all(organisms, sink))?;
            for result in &results {
                print_fetch_summary(result);
            }
            Ok(())
        }
    }
}

fn run_merge(
    app: &HarvestApp,
    args: MergeArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = if args.with_organisms {
        let organisms = load_organisms(app.config())?;
        app.merge_with_organisms(args.expected_shards, &organisms)?
    } else {
        app.merge(args.expected_shards)?
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_merge(&result).into_diagnostic(),
        OutputMode::Interactive => TextOutput::print(&format!(
            "Merged {} of {} shards into {}: {} success, {} not found, {} failed",
            result.shards_found,
            result.expected_shards,
            result.summary_path,
            result.statistics.success,
            result.statistics.not_found,
            result.statistics.failed
        ))
        .into_diagnostic(),
    }
}

fn run_report(app: &HarvestApp, output_mode: OutputMode) -> miette::Result<()> {
    let merged = app.load_merged()?;
    let report = coverage(&merged);
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic(),
        OutputMode::Interactive => TextOutput::print(&report.render_text()).into_diagnostic(),
    }
}

fn run_retry(app: HarvestApp, args: RetryArgs, output_mode: OutputMode) -> miette::Result<()> {
    let options = RetryOptions {
        include_not_found: args.include_not_found,
        list_only: args.list_only,
    };
    let result = match output_mode {
        OutputMode::Interactive if !options.list_only => {
            let mut tui = Tui::new(ProgressSinkKind::Retry);
            tui.run(move |sink| app.retry(options, sink))?
        }
        _ => app.retry(options, &LogProgress)?,
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_retry(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_retry_summary(&result);
            Ok(())
        }
    }
}

fn run_convert(app: HarvestApp, args: ShardArgs, output_mode: OutputMode) -> miette::Result<()> {
    let selection = shard_selection(args)?;
    let organisms = load_organisms(app.config())?;

    let result = match output_mode {
        OutputMode::NonInteractive => app.convert(&organisms, selection, &LogProgress)?,
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Convert);
            tui.run(move |sink| app.convert(&organisms, selection, sink))?
        }
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_convert(&result).into_diagnostic(),
        OutputMode::Interactive => {
            let stats = &result.summary.statistics;
            TextOutput::print(&format!(
                "Release {}: {} converted, {} skipped, {} failed, {} timed out ({})",
                result.summary.release,
                stats.converted,
                stats.skipped,
                stats.failed,
                stats.timed_out,
                result.summary_path
            ))
            .into_diagnostic()
        }
    }
}

fn run_status(app: &HarvestApp, output_mode: OutputMode) -> miette::Result<()> {
    let status = app.status()?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic(),
        OutputMode::Interactive => TextOutput::print(&status.render_text()).into_diagnostic(),
    }
}

fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";
    let stats = &result.statistics;

    println!(
        "{cyan}shard {} (release {}){reset}",
        result.shard_id, result.release
    );
    println!(
        "{green}success: {}{reset} ({} resumed)",
        stats.success, stats.resumed
    );
    println!("{yellow}not found: {}{reset}", stats.not_found);
    println!("{red}failed: {}{reset}", stats.failed);
    if stats.decompression_failed > 0 {
        println!("{red}decompression failed: {}{reset}", stats.decompression_failed);
    }
    println!("summary: {}", result.summary_path);
}

fn print_retry_summary(result: &RetryResult) {
    match &result.summary {
        None => {
            println!("{} retry candidates", result.candidates.len());
            for key in &result.candidates {
                println!("  {key}");
            }
        }
        Some(summary) => {
            println!(
                "recovered {} of {} units",
                summary.recovered, summary.candidates
            );
            for (key, record) in &summary.results {
                println!(
                    "  {key}: {} -> {} ({} attempts)",
                    record.previous_status, record.final_status, record.attempts
                );
            }
        }
    }
}
