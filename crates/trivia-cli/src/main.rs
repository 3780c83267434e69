use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trivia_adapters::EventTarget;
use trivia_core::Conference;
use trivia_sync::{SyncConfig, SyncRunSummary};

#[derive(Debug, Parser)]
#[command(name = "trivia-cli")]
#[command(about = "Conference trivia sync command-line interface")]
struct Cli {
    /// Reconcile and write reports, but leave change-sets and photos untouched.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Workspace holding rules/, fixtures/, data/ and reports/.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one conference edition against the curated store.
    Load(LoadArgs),
    /// Reconcile the CMS event-type list.
    EventTypes,
    /// Check the curated store for identity and reference problems.
    Validate,
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(long, value_parser = parse_conference)]
    conference: Conference,
    #[arg(long)]
    start_date: NaiveDate,
}

fn parse_conference(input: &str) -> Result<Conference, String> {
    Conference::parse(input).ok_or_else(|| format!("unknown conference `{input}`"))
}

fn print_summary(label: &str, summary: &SyncRunSummary) {
    println!(
        "{label} complete: run_id={} created={} updated={} deleted={} photos={}/{} dry_run={} reports={}",
        summary.run_id,
        summary.created,
        summary.updated,
        summary.deleted,
        summary.photos_downloaded,
        summary.photos_scheduled,
        summary.dry_run,
        summary.reports_dir
    );
    if summary.photos_failed > 0 {
        eprintln!("{} photo downloads failed; rerun to retry", summary.photos_failed);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match cli.workspace {
        Some(root) => SyncConfig::for_workspace(root),
        None => SyncConfig::from_env(),
    };
    config.dry_run |= cli.dry_run;

    match cli.command.unwrap_or(Commands::Validate) {
        Commands::Load(args) => {
            let target = EventTarget {
                conference: args.conference,
                start_date: args.start_date,
            };
            let summary = trivia_sync::pipeline_from_config(config)?
                .run_load(target)
                .await?;
            print_summary("load", &summary);
        }
        Commands::EventTypes => {
            let summary = trivia_sync::pipeline_from_config(config)?
                .run_event_types()
                .await?;
            print_summary("event-types", &summary);
        }
        Commands::Validate => {
            let counts = trivia_sync::pipeline_from_config(config)?.validate()?;
            println!(
                "curated store ok: organizers={} event_types={} events={} places={} talks={} speakers={} companies={}",
                counts.organizers,
                counts.event_types,
                counts.events,
                counts.places,
                counts.talks,
                counts.speakers,
                counts.companies
            );
        }
        Commands::Report { runs } => {
            let markdown = trivia_sync::report_recent_markdown(runs, Some(config.workspace_root))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
