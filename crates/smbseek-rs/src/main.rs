use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use smbseek::{
    api::{self, AppState},
    collect,
    config::AppConfig,
    db::{Ledger, MAX_WINDOW_DAYS, MAX_WINDOW_HOURS},
    discovery::{DiscoveryFeed, ShodanFeed, StaticFeed},
    filter::ScanFlags,
    probe::{ListingLimits, SmbclientProber},
    report,
    workflow::{AccessOptions, CancelFlag, DiscoverOptions, DiscoverSummary, Workflow},
};

#[derive(Parser)]
#[command(name = "smbseek")]
#[command(about = "Find and verify SMB servers that allow anonymous or guest access")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to $SMBSEEK_CONFIG, then conf/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Query the discovery feed and test authentication on new hosts
    Discover(DiscoverArgs),

    /// Enumerate and test shares on authenticated hosts
    Access(AccessArgs),

    /// Discover, test share access on the hosts that discovery contacted, then print the summary
    Run {
        #[command(flatten)]
        discover: DiscoverArgs,

        /// Also list files on accessible shares
        #[arg(long)]
        list_files: bool,
    },

    /// Re-list accessible shares and plan file collection within the configured limits
    Collect {
        /// Manifest path (defaults to file_manifest_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Group logged failures by type, reason and country
    Analyze {
        /// Also save the analysis as JSON (a timestamped file name is used with `--output -`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Executive summary of the ledger
    Report {
        /// Restrict the summary to one session
        #[arg(long)]
        session: Option<i64>,

        /// Save the summary as JSON (a timestamped file name is used with `--output -`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include auth method, share and activity breakdowns
        #[arg(long)]
        detailed: bool,
    },

    /// Ledger inspection and maintenance
    Db {
        #[command(subcommand)]
        action: DbCommand,
    },

    /// Serve the read-only JSON API
    Serve,
}

#[derive(Args)]
struct DiscoverArgs {
    /// Comma-separated country codes, e.g. US,GB
    #[arg(long)]
    country: Option<String>,

    /// Rescan every host regardless of history
    #[arg(long)]
    rescan_all: bool,

    /// Retry hosts whose last contact failed
    #[arg(long)]
    rescan_failed: bool,

    /// Read candidates from a JSON file instead of the Shodan API
    #[arg(long)]
    feed_file: Option<PathBuf>,
}

#[derive(Args)]
struct AccessArgs {
    /// Only hosts discovered within this many hours
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_HOURS))]
    recent: Option<i64>,

    /// Also list files on accessible shares
    #[arg(long)]
    list_files: bool,
}

#[derive(Subcommand)]
enum DbCommand {
    /// Counts, recent activity and unfinished sessions
    Status,
    /// Country, auth method and share distributions
    Summary,
    /// Hosts whose latest contact failed
    Failures,
    /// Age out old sessions and deactivate stale servers
    Cleanup {
        #[arg(long, default_value = "90", value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_DAYS))]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate()?;
    let config = Arc::new(config);

    let ledger = Ledger::open(&config.database.path)
        .await
        .context("failed to open ledger")?;

    let result = dispatch(cli.command, &ledger, config).await;
    ledger.close().await;
    result
}

async fn dispatch(command: Command, ledger: &Ledger, config: Arc<AppConfig>) -> anyhow::Result<()> {
    match command {
        Command::Discover(args) => {
            let workflow = build_workflow(ledger, &config);
            run_discover(&workflow, &config, &args).await?;
            Ok(())
        }
        Command::Access(args) => {
            let workflow = build_workflow(ledger, &config);
            let summary = workflow
                .access(&AccessOptions {
                    recent_hours: args.recent,
                    list_files: args.list_files,
                    ..Default::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Run { discover, list_files } => {
            let workflow = build_workflow(ledger, &config);
            let discovered = run_discover(&workflow, &config, &discover).await?;
            if discovered.cancelled {
                warn!("discovery was interrupted, skipping share testing");
            } else {
                workflow
                    .access(&AccessOptions {
                        session_id: Some(discovered.session_id),
                        list_files,
                        ..Default::default()
                    })
                    .await?;
            }
            let summary = report::generate_summary(ledger, None).await?;
            print!("{}", report::render_text(&summary));
            Ok(())
        }
        Command::Collect { output } => {
            let workflow = build_workflow(ledger, &config);
            let manifest = workflow.collect().await?;
            println!(
                "Planned {} files ({} bytes) from {} hosts",
                manifest.total_files,
                manifest.total_size_bytes,
                manifest.hosts.len()
            );
            let saved = collect::save_manifest(&manifest, output.as_deref())?;
            println!("Manifest saved: {}", saved.display());
            Ok(())
        }
        Command::Analyze { output } => {
            let analysis = report::analyze_failures(ledger).await?;
            print!("{}", report::render_failure_analysis(&analysis));
            if let Some(path) = output {
                let target = (path.as_os_str() != "-").then_some(path.as_path());
                let saved = report::save_failure_analysis(&analysis, target)?;
                println!("Analysis saved: {}", saved.display());
            }
            Ok(())
        }
        Command::Report {
            session,
            output,
            detailed,
        } => {
            let mut summary = report::generate_summary(ledger, session).await?;
            if detailed {
                summary = report::with_breakdown(ledger, summary).await?;
            }
            print!("{}", report::render_text(&summary));
            if let Some(path) = output {
                let target = (path.as_os_str() != "-").then_some(path.as_path());
                let saved = report::save_report(&summary, target)?;
                println!("Report saved: {}", saved.display());
            }
            Ok(())
        }
        Command::Db { action } => run_db(ledger, action).await,
        Command::Serve => serve(ledger.clone(), &config).await,
    }
}

fn build_workflow(ledger: &Ledger, config: &Arc<AppConfig>) -> Workflow {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current host");
            flag.cancel();
        }
    });

    let prober = SmbclientProber::new(
        &config.connection,
        ListingLimits::from_config(&config.collection),
        config.security.ransomware_indicators.clone(),
    );
    Workflow::new(ledger.clone(), config.clone(), Arc::new(prober), cancel)
}

async fn run_discover(workflow: &Workflow, config: &AppConfig, args: &DiscoverArgs) -> anyhow::Result<DiscoverSummary> {
    let feed: Box<dyn DiscoveryFeed> = match &args.feed_file {
        Some(path) => Box::new(
            StaticFeed::load(path).with_context(|| format!("failed to load feed file {}", path.display()))?,
        ),
        None => Box::new(ShodanFeed::new(&config.shodan)?),
    };

    let countries = config.resolve_target_countries(args.country.as_deref());
    if countries.is_empty() {
        info!("no country filter, searching globally");
    }
    let summary = workflow
        .discover(
            feed.as_ref(),
            &DiscoverOptions {
                countries,
                flags: ScanFlags {
                    rescan_all: args.rescan_all,
                    rescan_failed: args.rescan_failed,
                },
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary)
}

async fn run_db(ledger: &Ledger, action: DbCommand) -> anyhow::Result<()> {
    match action {
        DbCommand::Status => {
            let servers = ledger.server_count().await?;
            let activity = ledger.recent_activity(7).await?;
            println!("Servers in ledger: {servers}");
            println!(
                "Last {} days: {} sessions, {} targets, {} successful, {} servers updated",
                activity.days,
                activity.scan_sessions,
                activity.targets_found,
                activity.successful_connections,
                activity.updated_servers
            );
            let running = ledger.running_sessions().await?;
            if !running.is_empty() {
                println!("Unfinished sessions:");
                for s in running {
                    println!("  #{} {} started {}", s.id, s.tool_name, s.timestamp);
                }
            }
        }
        DbCommand::Summary => {
            println!("Countries:");
            for c in ledger.country_distribution().await? {
                println!("  {:<10} {}", c.country, c.count);
            }
            println!("Authentication methods:");
            for m in ledger.auth_method_distribution().await? {
                println!("  {:<24} {} servers, avg {:.1} scans", m.auth_method, m.server_count, m.avg_scans);
            }
            println!("Accessible shares:");
            for s in ledger.top_shares(15).await? {
                println!("  {:<24} {} hits on {} servers", s.share_name, s.occurrence_count, s.server_count);
            }
        }
        DbCommand::Failures => {
            for f in ledger.get_failed_connections().await? {
                println!(
                    "{:<16} {:<8} {:?} last seen {}",
                    f.ip_address,
                    f.country.as_deref().unwrap_or("-"),
                    f.status,
                    f.last_seen
                );
            }
        }
        DbCommand::Cleanup { days } => {
            let stats = ledger.cleanup_old_data(days).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn serve(ledger: Ledger, config: &AppConfig) -> anyhow::Result<()> {
    let app = api::router(AppState { ledger });
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "smbseek API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "smbseek=debug" } else { "smbseek=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("smbseek").chain(args.iter().copied()))
    }

    #[test]
    fn recent_window_must_be_positive_and_bounded() {
        for bad in ["0", "-1", "9223372036854775807"] {
            assert!(parse(&["access", "--recent", bad]).is_err(), "--recent {bad}");
        }
        let cli = parse(&["access", "--recent", "48"]).unwrap();
        assert!(matches!(cli.command, Command::Access(AccessArgs { recent: Some(48), .. })));
    }

    #[test]
    fn cleanup_days_must_be_positive_and_bounded() {
        for bad in ["0", "-5", "1000000000000"] {
            assert!(parse(&["db", "cleanup", "--days", bad]).is_err(), "--days {bad}");
        }
        let cli = parse(&["db", "cleanup"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Db {
                action: DbCommand::Cleanup { days: 90 }
            }
        ));
    }

    #[test]
    fn collect_and_analyze_accept_output_paths() {
        let cli = parse(&["collect", "-o", "plan.json"]).unwrap();
        assert!(matches!(cli.command, Command::Collect { output: Some(_) }));
        let cli = parse(&["analyze"]).unwrap();
        assert!(matches!(cli.command, Command::Analyze { output: None }));
    }
}
